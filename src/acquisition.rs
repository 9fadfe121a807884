//! Acquisition orchestrator.
//!
//! Drives one full run across the three board services:
//!
//! 1. event count into the instrument configuration, output directory and
//!    run name into the sink configuration
//! 2. `configure` the sink, then the instrument
//! 3. `start` the sink, then the instrument
//! 4. poll the instrument until the run is complete
//! 5. `stop` the sink, then the instrument
//! 6. wait for the sink to finish writing
//! 7. decode `<output_dir>/<run_name>.raw`
//!
//! Once step 3 has been attempted, any failure stops both fast-control
//! clients before the error is returned. Failures of those stops are logged
//! and otherwise ignored.

use crate::client::{Connector, FastControlClient, Interrupt, PollPolicy, SlowControlClient};
use crate::config_tree::ConfigTree;
use crate::decoder::{self, DecodedEvent};
use crate::error::{AppResult, DaqError};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Default wait between sink stop and decoding.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);

/// Where one board service lives and the document it is configured with.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardSettings {
    /// Host name or IP address
    pub host: String,
    /// Service port
    pub port: u16,
    /// Initial working configuration
    pub document: ConfigTree,
}

/// Everything needed to connect an [`Acquisition`].
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Instrument-side fast-control server
    pub instrument: BoardSettings,
    /// Data sink
    pub sink: BoardSettings,
    /// Slow-control server
    pub slow_control: BoardSettings,
    /// Directory the sink writes raw files into
    pub output_dir: PathBuf,
    /// Raw file stem
    pub run_name: String,
    /// Completion polling
    pub poll: PollPolicy,
    /// Polling of `start` acknowledgements
    pub start_poll: PollPolicy,
    /// Wait after stopping the sink
    pub settle: Duration,
}

/// Which `stop` requests a run has already attempted.
#[derive(Debug, Clone, Copy, Default)]
struct StopsSent {
    sink: bool,
    instrument: bool,
}

/// Orchestrates runs over an instrument, a data sink and a slow-control board.
pub struct Acquisition {
    instrument: FastControlClient,
    sink: FastControlClient,
    slow_control: SlowControlClient,
    output_dir: PathBuf,
    run_name: String,
    poll: PollPolicy,
    settle: Duration,
    interrupt: Option<Arc<dyn Interrupt>>,
}

impl Acquisition {
    /// Connect all three clients through `connector`.
    ///
    /// The slow-control board is initialized and brought up as part of this.
    #[instrument(skip_all, err)]
    pub fn connect(settings: &AcquisitionSettings, connector: Arc<dyn Connector>) -> AppResult<Self> {
        let mut instrument = FastControlClient::new(connector.clone());
        instrument.client_mut().set_poll_policy(settings.start_poll);
        instrument.connect(
            &settings.instrument.host,
            settings.instrument.port,
            settings.instrument.document.clone(),
        )?;

        let mut sink = FastControlClient::new(connector.clone());
        sink.client_mut().set_poll_policy(settings.start_poll);
        sink.connect(
            &settings.sink.host,
            settings.sink.port,
            settings.sink.document.clone(),
        )?;

        let mut slow_control = SlowControlClient::new(connector);
        slow_control.connect(
            &settings.slow_control.host,
            settings.slow_control.port,
            settings.slow_control.document.clone(),
        )?;

        info!(
            instrument = %settings.instrument.host,
            output_dir = %settings.output_dir.display(),
            "acquisition connected"
        );
        Ok(Self {
            instrument,
            sink,
            slow_control,
            output_dir: settings.output_dir.clone(),
            run_name: settings.run_name.clone(),
            poll: settings.poll,
            settle: settings.settle,
            interrupt: None,
        })
    }

    /// Make every blocking wait abandon with `Interrupted` once `interrupt`
    /// is raised.
    pub fn with_interrupt(mut self, interrupt: Arc<dyn Interrupt>) -> Self {
        self.instrument.client_mut().set_interrupt(interrupt.clone());
        self.sink.client_mut().set_interrupt(interrupt.clone());
        self.slow_control.client_mut().set_interrupt(interrupt.clone());
        self.interrupt = Some(interrupt);
        self
    }

    /// Raw file the sink writes for this run.
    pub fn run_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.raw", self.run_name))
    }

    /// Record `n_events` and return the decoded table.
    #[instrument(skip(self), fields(run = %self.run_name), err)]
    pub fn acquire(&mut self, n_events: u64) -> AppResult<DecodedEvent> {
        self.instrument.set_event_count(n_events)?;
        let output_dir = self.output_dir.display().to_string();
        self.sink.set_output(&output_dir, &self.run_name)?;

        self.sink.configure(None)?;
        self.instrument.configure(None)?;

        let mut stopped = StopsSent::default();
        if let Err(err) = self.run(&mut stopped) {
            warn!(error = %err, "run failed, stopping both fast-control clients");
            self.stop_all(&err, stopped);
            return Err(err);
        }

        std::thread::sleep(self.settle);
        let path = self.run_path();
        info!(path = %path.display(), "decoding run");
        decoder::decode_file(path)
    }

    fn run(&mut self, stopped: &mut StopsSent) -> AppResult<()> {
        self.sink.start()?;
        self.instrument.start()?;

        let instrument = &mut self.instrument;
        let polls = self.poll.wait_until("run completion", self.interrupt.as_deref(), || {
            instrument.is_complete()
        })?;
        info!(polls, "run complete");

        stopped.sink = true;
        self.sink.stop()?;
        stopped.instrument = true;
        self.instrument.stop()?;
        Ok(())
    }

    /// Stop every client whose `stop` was not already attempted. A REQ socket
    /// left mid-request refuses further sends, so after a transport-level
    /// failure each client is reconnected first.
    fn stop_all(&mut self, cause: &DaqError, stopped: StopsSent) {
        let pending = [
            ("sink", &mut self.sink, stopped.sink),
            ("instrument", &mut self.instrument, stopped.instrument),
        ];
        for (role, client, already_stopped) in pending {
            if already_stopped {
                continue;
            }
            if cause.requires_reconnect() {
                if let Err(err) = client.client_mut().reconnect() {
                    warn!(role, error = %err, "cleanup reconnect failed");
                }
            }
            if let Err(err) = client.stop() {
                warn!(role, error = %err, "cleanup stop failed");
            }
        }
    }

    /// Instrument-side fast-control client.
    pub fn instrument(&self) -> &FastControlClient {
        &self.instrument
    }

    /// Mutable instrument-side client, e.g. to set trigger generators.
    pub fn instrument_mut(&mut self) -> &mut FastControlClient {
        &mut self.instrument
    }

    /// Data-sink fast-control client.
    pub fn sink(&self) -> &FastControlClient {
        &self.sink
    }

    /// Slow-control client.
    pub fn slow_control(&self) -> &SlowControlClient {
        &self.slow_control
    }

    /// Mutable slow-control client.
    pub fn slow_control_mut(&mut self) -> &mut SlowControlClient {
        &mut self.slow_control
    }
}

impl fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acquisition")
            .field("instrument", &self.instrument)
            .field("sink", &self.sink)
            .field("slow_control", &self.slow_control)
            .field("run_path", &self.run_path())
            .field("poll", &self.poll)
            .field("interruptible", &self.interrupt.is_some())
            .finish()
    }
}
