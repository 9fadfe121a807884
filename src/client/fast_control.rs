//! Fast-control client: trigger generators, acquisition windows and run state.
//!
//! Used for both the instrument-side fast-control server and the data-sink
//! server; both speak the same run protocol (`start`, `run_done`, `stop`).
//!
//! ```text
//!            start() acknowledged         is_complete() == true
//!   Idle  ------------------------>  Running  ------------------> Idle
//!     ^                                 |
//!     +------------- stop() ------------+
//! ```
//!
//! There is no internal timer; callers poll [`FastControlClient::is_complete`]
//! at their own pace.

use super::{Connector, MessageClient};
use crate::config_tree::ConfigTree;
use crate::error::AppResult;
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Event count requested from the instrument.
pub const EVENT_COUNT_KEY: &str = "daq.NEvents";
/// Section holding the fast-command enable flags.
pub const L1A_ENABLES_KEY: &str = "daq.l1a_enables";
/// List of trigger generator descriptors.
pub const GENERATORS_KEY: &str = "daq.l1a_generator_settings";
/// Global L1A timing settings.
pub const L1A_SETTINGS_KEY: &str = "daq.l1a_settings";
/// Directory the data sink writes into.
pub const OUTPUT_DIRECTORY_KEY: &str = "client.outputDirectory";
/// Run name the data sink uses for its output file.
pub const RUN_TYPE_KEY: &str = "client.run_type";

/// Observed run state of a fast-control server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// Not acquiring
    #[default]
    Idle,
    /// `start` acknowledged, run not yet complete
    Running,
}

/// Fast-command sources. Any flag left at its default is written as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FastCommandFlags {
    /// Random L1A generator
    pub random: bool,
    /// External trigger input
    pub external: bool,
    /// Block sequencer
    pub sequencer: bool,
    /// Periodic ancillary generator
    pub ancillary: bool,
}

/// Window/type/prescale/follow-mode fields of one trigger generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorSettings {
    /// Whether the generator fires
    pub enable: bool,
    /// Bunch crossing the window opens at
    pub bx: u32,
    /// Window length in bunch crossings
    pub length: u32,
    /// Fast-command flavor (`L1A`, `CALPULINT`, ...)
    pub flavor: String,
    /// Fire once every `prescale + 1` orbits
    pub prescale: u32,
    /// Name of the generator this one follows, or `DISABLE`
    pub follow_mode: String,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            enable: false,
            bx: 0x10,
            length: 43,
            flavor: "L1A".into(),
            prescale: 0,
            follow_mode: "DISABLE".into(),
        }
    }
}

/// Global L1A timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1aSettings {
    /// Minimum spacing between two L1As in bunch crossings
    pub bx_spacing: u32,
    /// Debounce the external trigger input
    pub external_debounced: bool,
    /// Delay applied to external triggers
    pub ext_delay: u32,
    /// External trigger prescale
    pub prescale: u32,
    /// log2 of the random generator period
    pub log2_rand_bx_period: u32,
}

impl Default for L1aSettings {
    fn default() -> Self {
        Self {
            bx_spacing: 43,
            external_debounced: false,
            ext_delay: 0,
            prescale: 0,
            log2_rand_bx_period: 0,
        }
    }
}

/// Fast-control client.
#[derive(Debug)]
pub struct FastControlClient {
    client: MessageClient,
    state: RunState,
}

impl FastControlClient {
    /// Create an unconnected client.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            client: MessageClient::new(connector),
            state: RunState::Idle,
        }
    }

    /// (Re)connect and load `document` as the working configuration.
    pub fn connect(&mut self, address: &str, port: u16, document: ConfigTree) -> AppResult<()> {
        self.client.connect(address, port, document)?;
        self.state = RunState::Idle;
        Ok(())
    }

    /// Write the fast-command enable flags.
    pub fn enable_fast_commands(&mut self, flags: FastCommandFlags) -> AppResult<()> {
        let mut enables = Mapping::new();
        for (key, on) in [
            ("random_l1a", flags.random),
            ("external_l1a", flags.external),
            ("block_sequencer", flags.sequencer),
            ("periodic_ancillary", flags.ancillary),
        ] {
            enables.insert(key.into(), Value::from(u8::from(on)));
        }
        self.client
            .config_mut()
            .set_path(L1A_ENABLES_KEY, Value::Mapping(enables))
    }

    /// Overwrite the settings of the generator called `name`.
    ///
    /// Returns false (and changes nothing) when no such generator exists.
    pub fn configure_trigger_generator(&mut self, name: &str, settings: &GeneratorSettings) -> bool {
        let generator = self
            .client
            .config_mut()
            .get_path_mut(GENERATORS_KEY)
            .and_then(Value::as_sequence_mut)
            .and_then(|generators| {
                generators.iter_mut().find(|entry| {
                    entry.get("name").and_then(Value::as_str) == Some(name)
                })
            })
            .and_then(Value::as_mapping_mut);

        let Some(generator) = generator else {
            debug!(name, "no trigger generator with this name");
            return false;
        };

        generator.insert("enable".into(), Value::from(u8::from(settings.enable)));
        generator.insert("BX".into(), Value::from(settings.bx));
        generator.insert("length".into(), Value::from(settings.length));
        generator.insert("flavor".into(), Value::from(settings.flavor.as_str()));
        generator.insert("prescale".into(), Value::from(settings.prescale));
        generator.insert("followMode".into(), Value::from(settings.follow_mode.as_str()));
        true
    }

    /// Write the global L1A timing settings.
    pub fn set_l1a_settings(&mut self, settings: &L1aSettings) -> AppResult<()> {
        let config = self.client.config_mut();
        let key = |field: &str| format!("{L1A_SETTINGS_KEY}.{field}");
        config.set_path(&key("bx_spacing"), settings.bx_spacing)?;
        config.set_path(
            &key("external_debounced"),
            u8::from(settings.external_debounced),
        )?;
        config.set_path(&key("ext_delay"), settings.ext_delay)?;
        config.set_path(&key("prescale"), settings.prescale)?;
        config.set_path(&key("log2_rand_bx_period"), settings.log2_rand_bx_period)
    }

    /// Number of events the instrument should trigger.
    pub fn set_event_count(&mut self, n_events: u64) -> AppResult<()> {
        self.client.config_mut().set_path(EVENT_COUNT_KEY, n_events)
    }

    /// Output directory and run name used by the data sink.
    pub fn set_output(&mut self, directory: &str, run_type: &str) -> AppResult<()> {
        let config = self.client.config_mut();
        config.set_path(OUTPUT_DIRECTORY_KEY, directory)?;
        config.set_path(RUN_TYPE_KEY, run_type)
    }

    /// Push the working configuration; see [`MessageClient::configure`].
    pub fn configure(&mut self, fragment: Option<&ConfigTree>) -> AppResult<String> {
        self.client.configure(fragment)
    }

    /// Block until the server acknowledges `start` with "running".
    ///
    /// Returns the number of `start` requests sent.
    #[instrument(skip(self), fields(endpoint = ?self.client.endpoint()), err)]
    pub fn start(&mut self) -> AppResult<u32> {
        let attempts = self.client.poll_for("start", "running")?;
        self.state = RunState::Running;
        info!(attempts, "run started");
        Ok(attempts)
    }

    /// True once the server no longer reports "notdone".
    pub fn is_complete(&mut self) -> AppResult<bool> {
        let complete = !self.client.check("run_done", "notdone")?;
        if complete {
            self.state = RunState::Idle;
        }
        Ok(complete)
    }

    /// Send `stop` once.
    pub fn stop(&mut self) -> AppResult<String> {
        if self.state == RunState::Idle {
            warn!(endpoint = ?self.client.endpoint(), "stop sent while idle");
        }
        let reply = self.client.send("stop")?;
        self.state = RunState::Idle;
        Ok(reply)
    }

    /// Last observed run state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Underlying message client.
    pub fn client(&self) -> &MessageClient {
        &self.client
    }

    /// Mutable underlying message client.
    pub fn client_mut(&mut self) -> &mut MessageClient {
        &mut self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{always_ready, ScriptedConnector, SentLog};
    use crate::client::PollPolicy;
    use std::time::Duration;

    const DAQ_DOC: &str = "\
daq:
  NEvents: 1000
  l1a_enables:
    random_l1a: 1
    external_l1a: 1
    block_sequencer: 1
    periodic_ancillary: 1
  l1a_generator_settings:
    - {name: A, enable: 0, BX: 16, length: 1, flavor: L1A, prescale: 0, followMode: DISABLE}
    - {name: B, enable: 0, BX: 16, length: 1, flavor: L1A, prescale: 0, followMode: DISABLE}
client:
  outputDirectory: data
  run_type: default
";

    fn connected(connector: ScriptedConnector) -> (FastControlClient, SentLog) {
        let sent = connector.sent();
        let mut client = FastControlClient::new(Arc::new(connector));
        client
            .connect("tileboard", 6000, ConfigTree::from_yaml_str(DAQ_DOC).unwrap())
            .unwrap();
        client
            .client_mut()
            .set_poll_policy(PollPolicy::every(Duration::from_millis(1)));
        (client, sent)
    }

    fn get_u64(client: &FastControlClient, path: &str) -> Option<u64> {
        client.client().config().get_path(path).and_then(Value::as_u64)
    }

    #[test]
    fn unspecified_fast_command_flags_fall_back_to_zero() {
        let (mut client, _) = connected(ScriptedConnector::new(always_ready));
        client
            .enable_fast_commands(FastCommandFlags {
                random: true,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(get_u64(&client, "daq.l1a_enables.random_l1a"), Some(1));
        assert_eq!(get_u64(&client, "daq.l1a_enables.external_l1a"), Some(0));
        assert_eq!(get_u64(&client, "daq.l1a_enables.block_sequencer"), Some(0));
        assert_eq!(get_u64(&client, "daq.l1a_enables.periodic_ancillary"), Some(0));
    }

    #[test]
    fn trigger_generator_is_updated_by_name() {
        let (mut client, _) = connected(ScriptedConnector::new(always_ready));
        let settings = GeneratorSettings {
            enable: true,
            bx: 0x20,
            length: 8,
            flavor: "CALPULINT".into(),
            prescale: 3,
            follow_mode: "A".into(),
        };

        assert!(client.configure_trigger_generator("B", &settings));

        let generators = client
            .client()
            .config()
            .get_path(GENERATORS_KEY)
            .and_then(Value::as_sequence)
            .unwrap();
        let b = &generators[1];
        assert_eq!(b.get("BX").and_then(Value::as_u64), Some(0x20));
        assert_eq!(b.get("flavor").and_then(Value::as_str), Some("CALPULINT"));
        assert_eq!(b.get("followMode").and_then(Value::as_str), Some("A"));
        assert_eq!(b.get("enable").and_then(Value::as_u64), Some(1));
        // Generator A untouched.
        assert_eq!(generators[0].get("BX").and_then(Value::as_u64), Some(16));
    }

    #[test]
    fn unknown_trigger_generator_is_a_no_op() {
        let (mut client, _) = connected(ScriptedConnector::new(always_ready));
        let before = client.client().config().clone();
        assert!(!client.configure_trigger_generator("Z", &GeneratorSettings::default()));
        assert_eq!(client.client().config(), &before);
    }

    #[test]
    fn start_polls_until_running() {
        let connector =
            ScriptedConnector::new(always_ready).with_replies(&["configuring", "wait", "Running"]);
        let (mut client, sent) = connected(connector);

        assert_eq!(client.start().unwrap(), 3);
        assert_eq!(client.state(), RunState::Running);
        assert!(sent.lock().iter().all(|m| m == "start"));
    }

    #[test]
    fn completion_and_stop_drive_the_state_machine() {
        let connector = ScriptedConnector::new(always_ready).with_replies(&["running", "notdone"]);
        let (mut client, sent) = connected(connector);

        client.start().unwrap();
        assert!(!client.is_complete().unwrap());
        assert_eq!(client.state(), RunState::Running);
        assert!(client.is_complete().unwrap());
        assert_eq!(client.state(), RunState::Idle);

        client.stop().unwrap();
        let stops = sent.lock().iter().filter(|m| *m == "stop").count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn run_settings_land_in_working_config() {
        let (mut client, _) = connected(ScriptedConnector::new(always_ready));
        client.set_event_count(100).unwrap();
        client.set_output("/tmp/runs", "pedestal").unwrap();
        client
            .set_l1a_settings(&L1aSettings {
                bx_spacing: 45,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(get_u64(&client, EVENT_COUNT_KEY), Some(100));
        assert_eq!(get_u64(&client, "daq.l1a_settings.bx_spacing"), Some(45));
        assert_eq!(
            client
                .client()
                .config()
                .get_path(RUN_TYPE_KEY)
                .and_then(Value::as_str),
            Some("pedestal")
        );
    }
}
