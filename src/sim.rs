//! In-process simulated tileboard.
//!
//! [`SimulatedTileboard`] implements [`Connector`] and answers the three
//! board services by port:
//!
//! - instrument (fast control): acknowledges `start` after a configurable
//!   number of requests and reports `notdone` for a configurable number of
//!   `run_done` polls
//! - data sink (fast control): writes `<outputDirectory>/<run_type>.raw` on
//!   `stop`, with as many events as the instrument was configured for
//! - slow control: answers `initialize` and every procedure in the RPC table,
//!   tracking GPIO and calibration DAC state
//!
//! Every request is appended to a shared call log so tests can assert the
//! ordering of operations across clients.

use crate::acquisition::{AcquisitionSettings, BoardSettings};
use crate::client::fast_control::{EVENT_COUNT_KEY, OUTPUT_DIRECTORY_KEY, RUN_TYPE_KEY};
use crate::client::slow_control::lookup;
use crate::client::{Connector, Endpoint, PollPolicy, Transport};
use crate::config_tree::ConfigTree;
use crate::decoder::{ColumnData, RawMetadata, RawWriter};
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default instrument fast-control port.
pub const INSTRUMENT_PORT: u16 = 6000;
/// Default data-sink port.
pub const SINK_PORT: u16 = 6001;
/// Default slow-control port.
pub const SLOW_CONTROL_PORT: u16 = 5555;

/// Default instrument configuration document.
pub const DAQ_DOCUMENT: &str = include_str!("../config/daq.yaml");
/// Default data-sink configuration document.
pub const CLIENT_DOCUMENT: &str = include_str!("../config/client.yaml");
/// Default slow-control configuration document.
pub const SLOW_CONTROL_DOCUMENT: &str = include_str!("../config/slow_control.yaml");

/// Which board service a request went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Instrument fast-control server
    Instrument,
    /// Data sink
    Sink,
    /// Slow-control server
    SlowControl,
}

/// One request as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Service that received the request
    pub role: Role,
    /// Request text
    pub message: String,
}

/// Behaviour and geometry of the simulated board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Instrument port
    pub instrument_port: u16,
    /// Data-sink port
    pub sink_port: u16,
    /// Slow-control port
    pub slow_control_port: u16,
    /// `start` requests needed before "running" is returned
    pub start_after: u32,
    /// `run_done` polls answered with "notdone" after each start
    pub busy_polls: u32,
    /// ASIC halves in generated raw files
    pub n_halves: u32,
    /// Channels per half in generated raw files
    pub channels_per_half: u32,
    /// Trigger links in generated raw files
    pub n_links: u32,
    /// Seed for generated event data
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            instrument_port: INSTRUMENT_PORT,
            sink_port: SINK_PORT,
            slow_control_port: SLOW_CONTROL_PORT,
            start_after: 2,
            busy_polls: 3,
            n_halves: 2,
            // 36 signal channels, the calibration channel and two common-mode channels
            channels_per_half: 39,
            n_links: 4,
            seed: 0,
        }
    }
}

#[derive(Debug, Default)]
struct FastServer {
    awaiting_config: bool,
    config: Option<ConfigTree>,
    start_requests: u32,
    running: bool,
    busy_remaining: u32,
}

#[derive(Debug, Default)]
struct SlowServer {
    awaiting_config: bool,
    config: Option<ConfigTree>,
    gpio_direction: i64,
    gpio_values: i64,
    calib_dac: HashMap<i64, i64>,
}

#[derive(Debug)]
struct Board {
    config: SimConfig,
    calls: Vec<Call>,
    instrument: FastServer,
    sink: FastServer,
    slow: SlowServer,
    written: Vec<PathBuf>,
}

/// Shared simulated board; clones observe the same state.
#[derive(Debug, Clone)]
pub struct SimulatedTileboard {
    board: Arc<Mutex<Board>>,
}

impl SimulatedTileboard {
    /// Create a board in its power-on state.
    pub fn new(config: SimConfig) -> Self {
        info!(?config, "simulated tileboard created");
        Self {
            board: Arc::new(Mutex::new(Board {
                config,
                calls: Vec::new(),
                instrument: FastServer::default(),
                sink: FastServer::default(),
                slow: SlowServer::default(),
                written: Vec::new(),
            })),
        }
    }

    /// Every request received so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.board.lock().calls.clone()
    }

    /// Requests received by one service, in order.
    pub fn messages(&self, role: Role) -> Vec<String> {
        self.board
            .lock()
            .calls
            .iter()
            .filter(|c| c.role == role)
            .map(|c| c.message.clone())
            .collect()
    }

    /// Last configuration document a service received.
    pub fn configuration(&self, role: Role) -> Option<ConfigTree> {
        let board = self.board.lock();
        match role {
            Role::Instrument => board.instrument.config.clone(),
            Role::Sink => board.sink.config.clone(),
            Role::SlowControl => board.slow.config.clone(),
        }
    }

    /// GPIO `(direction, values)` of the slow-control board.
    pub fn gpio(&self) -> (i64, i64) {
        let board = self.board.lock();
        (board.slow.gpio_direction, board.slow.gpio_values)
    }

    /// Raw files written by the sink.
    pub fn written_files(&self) -> Vec<PathBuf> {
        self.board.lock().written.clone()
    }

    /// Acquisition settings pointing at this board with the default
    /// documents and millisecond polling.
    pub fn settings(&self, output_dir: impl Into<PathBuf>, run_name: &str) -> AppResult<AcquisitionSettings> {
        let config = self.board.lock().config.clone();
        let board = |port, document: &str| -> AppResult<BoardSettings> {
            Ok(BoardSettings {
                host: "localhost".into(),
                port,
                document: ConfigTree::from_yaml_str(document)?,
            })
        };
        Ok(AcquisitionSettings {
            instrument: board(config.instrument_port, DAQ_DOCUMENT)?,
            sink: board(config.sink_port, CLIENT_DOCUMENT)?,
            slow_control: board(config.slow_control_port, SLOW_CONTROL_DOCUMENT)?,
            output_dir: output_dir.into(),
            run_name: run_name.to_owned(),
            poll: PollPolicy::every(Duration::from_millis(1)),
            start_poll: PollPolicy::every(Duration::from_millis(1)),
            settle: Duration::ZERO,
        })
    }
}

impl Default for SimulatedTileboard {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl Connector for SimulatedTileboard {
    fn open(&self, endpoint: &Endpoint) -> AppResult<Box<dyn Transport>> {
        let board = self.board.lock();
        let role = match endpoint.port {
            p if p == board.config.instrument_port => Role::Instrument,
            p if p == board.config.sink_port => Role::Sink,
            p if p == board.config.slow_control_port => Role::SlowControl,
            _ => return Err(DaqError::Transport(zmq::Error::ECONNREFUSED)),
        };
        debug!(%endpoint, ?role, "simulated connection opened");
        Ok(Box::new(SimTransport {
            role,
            board: self.board.clone(),
        }))
    }
}

struct SimTransport {
    role: Role,
    board: Arc<Mutex<Board>>,
}

impl Transport for SimTransport {
    fn request(&mut self, message: &str) -> AppResult<String> {
        let mut board = self.board.lock();
        board.calls.push(Call {
            role: self.role,
            message: message.to_owned(),
        });
        Ok(match self.role {
            Role::Instrument | Role::Sink => board.fast_request(self.role, message),
            Role::SlowControl => board.slow_request(message),
        })
    }
}

impl Board {
    fn fast(&mut self, role: Role) -> &mut FastServer {
        match role {
            Role::Sink => &mut self.sink,
            _ => &mut self.instrument,
        }
    }

    fn fast_request(&mut self, role: Role, message: &str) -> String {
        let start_after = self.config.start_after.max(1);
        let busy_polls = self.config.busy_polls;
        let server = self.fast(role);

        if server.awaiting_config {
            server.awaiting_config = false;
            return match ConfigTree::from_yaml_str(message) {
                Ok(tree) => {
                    server.config = Some(tree);
                    "configured".into()
                }
                Err(err) => format!("error: {err}"),
            };
        }

        match message.trim() {
            "configure" => {
                server.awaiting_config = true;
                "ready".into()
            }
            "start" => {
                server.start_requests += 1;
                if server.start_requests >= start_after {
                    server.running = true;
                    server.busy_remaining = busy_polls;
                    "running".into()
                } else {
                    "starting".into()
                }
            }
            "run_done" => {
                if server.running && server.busy_remaining > 0 {
                    server.busy_remaining -= 1;
                    "notdone".into()
                } else {
                    "done".into()
                }
            }
            "stop" => {
                server.running = false;
                server.start_requests = 0;
                if role == Role::Sink {
                    match self.write_run() {
                        Ok(path) => info!(path = %path.display(), "simulated sink wrote run"),
                        Err(err) => {
                            warn!(error = %err, "simulated sink could not write run");
                            return format!("error: {err}");
                        }
                    }
                }
                "stopped".into()
            }
            other => format!("unknown command: {other}"),
        }
    }

    fn write_run(&mut self) -> AppResult<PathBuf> {
        let sink = self
            .sink
            .config
            .as_ref()
            .ok_or_else(|| DaqError::Configuration("sink was never configured".into()))?;
        let text = |key: &str| {
            sink.get_path(key)
                .and_then(|v| v.as_str())
                .map(str::to_owned)
                .ok_or_else(|| DaqError::Configuration(format!("sink configuration lacks {key}")))
        };
        let directory = text(OUTPUT_DIRECTORY_KEY)?;
        let run = text(RUN_TYPE_KEY)?;
        let n_events = self
            .instrument
            .config
            .as_ref()
            .and_then(|c| c.get_path(EVENT_COUNT_KEY))
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        let metadata = RawMetadata {
            n_halves: self.config.n_halves,
            channels_per_half: self.config.channels_per_half,
            n_links: self.config.n_links,
            n_events,
        };
        std::fs::create_dir_all(&directory)?;
        let path = Path::new(&directory).join(format!("{run}.raw"));
        synthetic_run(metadata, self.config.seed).write_to(&path)?;
        self.written.push(path.clone());
        Ok(path)
    }

    fn slow_request(&mut self, message: &str) -> String {
        let server = &mut self.slow;
        if server.awaiting_config {
            server.awaiting_config = false;
            return match ConfigTree::from_yaml_str(message) {
                Ok(tree) => {
                    server.config = Some(tree);
                    "configured".into()
                }
                Err(err) => format!("error: {err}"),
            };
        }

        let mut words = message.split_whitespace();
        let name = words.next().unwrap_or_default();
        if name == "initialize" || name == "configure" {
            server.awaiting_config = true;
            return "ready".into();
        }
        let Some(spec) = lookup(name) else {
            return format!("unknown command: {name}");
        };
        let args = match words.map(str::parse::<i64>).collect::<Result<Vec<_>, _>>() {
            Ok(args) => args,
            Err(err) => return format!("error: {err}"),
        };
        if args.len() != spec.arity {
            return format!("error: {name} takes {} argument(s)", spec.arity);
        }

        match (name, args.as_slice()) {
            ("read_calib_dac", [channel]) => server.calib_dac.get(channel).copied().unwrap_or(0).to_string(),
            ("set_calib_dac", [channel, value]) => {
                server.calib_dac.insert(*channel, *value);
                "ok".into()
            }
            // mid-scale on every monitoring channel
            ("read_adc", [_]) => "2048".into(),
            ("read_bias_current", [_]) => "0.0125".into(),
            ("read_led_voltage", []) => "3.3".into(),
            ("read_led_current", []) => "0.02".into(),
            ("read_gpio_direction", []) => server.gpio_direction.to_string(),
            ("set_gpio_direction", [mask]) => {
                server.gpio_direction = *mask;
                "ok".into()
            }
            ("read_gpio_values", []) => server.gpio_values.to_string(),
            ("set_gpio_values", [values]) => {
                server.gpio_values = *values;
                "ok".into()
            }
            ("set_gpio", [mask, direction, level]) => {
                if *direction != 0 {
                    server.gpio_direction |= mask;
                }
                if *level != 0 {
                    server.gpio_values |= mask;
                } else {
                    server.gpio_values &= !mask;
                }
                "ok".into()
            }
            _ => "ok".into(),
        }
    }
}

/// Raw run with plausible event data: ascending event numbers, raw channel
/// indices `0..channels_per_half` in every half, pedestal-like ADC values and
/// per-half counters.
pub fn synthetic_run(metadata: RawMetadata, seed: u64) -> RawWriter {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = metadata.n_events as usize;
    let halves = metadata.n_halves as usize;
    let per_half = metadata.channels_per_half as usize;
    let channels = metadata.n_channels();
    let links = metadata.n_links as usize;

    let half: Vec<u8> = (0..n)
        .flat_map(|_| (0..halves).flat_map(move |h| std::iter::repeat(h as u8).take(per_half)))
        .collect();
    let channel: Vec<u16> = (0..n * halves)
        .flat_map(|_| (0..per_half).map(|c| c as u16))
        .collect();
    let adc: Vec<u16> = (0..n * channels).map(|_| rng.gen_range(80..400)).collect();
    let adcm: Vec<u16> = (0..n * channels).map(|_| rng.gen_range(80..400)).collect();
    let toa: Vec<u16> = (0..n * channels)
        .map(|_| if rng.gen_bool(0.1) { rng.gen_range(1..1024) } else { 0 })
        .collect();
    let bxcounter: Vec<u16> = (0..n)
        .flat_map(|_| {
            let bx = rng.gen_range(0..3564u16);
            std::iter::repeat(bx).take(halves)
        })
        .collect();
    let eventcounter: Vec<u8> = (0..n * halves).map(|i| ((i / halves) % 64) as u8).collect();
    let orbitcounter: Vec<u8> = (0..n * halves).map(|i| ((i / halves) % 8) as u8).collect();
    let trigtime: Vec<u32> = (0..n).map(|_| rng.gen_range(0..1 << 20)).collect();
    let trigsum: Vec<u32> = (0..n * links).map(|_| rng.gen_range(0..256)).collect();

    RawWriter::new(metadata)
        .field("event", ColumnData::U32((0..n as u32).collect()))
        .field("chip", ColumnData::U16(vec![0; n]))
        .field("trigtime", ColumnData::U32(trigtime))
        .field("trigwidth", ColumnData::U32(vec![1; n]))
        .field("half", ColumnData::U8(half))
        .field("channel", ColumnData::U16(channel))
        .field("adc", ColumnData::U16(adc))
        .field("adcm", ColumnData::U16(adcm))
        .field("toa", ColumnData::U16(toa))
        .field("tot", ColumnData::U16(vec![0; n * channels]))
        .field("totflag", ColumnData::U8(vec![0; n * channels]))
        .field("corruption", ColumnData::U8(vec![0; n * halves]))
        .field("bxcounter", ColumnData::U16(bxcounter))
        .field("eventcounter", ColumnData::U8(eventcounter))
        .field("orbitcounter", ColumnData::U8(orbitcounter))
        .field("trigsum", ColumnData::U32(trigsum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FastControlClient, SlowControlClient};
    use crate::decoder::{self, ChannelType, RawContainer};

    #[test]
    fn default_documents_parse() {
        for doc in [DAQ_DOCUMENT, CLIENT_DOCUMENT, SLOW_CONTROL_DOCUMENT] {
            assert!(!ConfigTree::from_yaml_str(doc).unwrap().is_empty());
        }
    }

    #[test]
    fn unknown_port_is_refused() {
        let board = SimulatedTileboard::default();
        let err = board.open(&Endpoint::new("localhost", 1)).err().unwrap();
        assert!(matches!(err, DaqError::Transport(_)));
    }

    #[test]
    fn start_is_acknowledged_after_configured_polls() {
        let board = SimulatedTileboard::new(SimConfig {
            start_after: 3,
            busy_polls: 2,
            ..SimConfig::default()
        });
        let mut client = FastControlClient::new(Arc::new(board.clone()));
        client
            .connect("localhost", INSTRUMENT_PORT, ConfigTree::new())
            .unwrap();

        assert_eq!(client.start().unwrap(), 3);
        assert!(!client.is_complete().unwrap());
        assert!(!client.is_complete().unwrap());
        assert!(client.is_complete().unwrap());
        assert_eq!(board.messages(Role::Instrument).len(), 6);
    }

    #[test]
    fn slow_control_bring_up_sets_gpio() {
        let board = SimulatedTileboard::default();
        let mut client = SlowControlClient::new(Arc::new(board.clone()));
        client
            .connect(
                "localhost",
                SLOW_CONTROL_PORT,
                ConfigTree::from_yaml_str(SLOW_CONTROL_DOCUMENT).unwrap(),
            )
            .unwrap();

        // bias and LED master on, LED disables cleared
        assert_eq!(board.gpio(), (0b1111, 0b0011));
        assert!(board.configuration(Role::SlowControl).is_some());

        client.set_calib_dac(3, 700).unwrap();
        assert_eq!(client.read_calib_dac(3).unwrap(), 700);
        let volts = client.bias_voltage(1).unwrap();
        let expected = crate::client::slow_control::bias_adc_to_volts(2048.0);
        assert!((volts - expected).abs() < 1e-9);
    }

    #[test]
    fn synthetic_run_decodes() {
        let metadata = RawMetadata {
            n_halves: 2,
            channels_per_half: 39,
            n_links: 4,
            n_events: 5,
        };
        let bytes = synthetic_run(metadata, 7).to_bytes().unwrap();
        let table = decoder::to_table(&RawContainer::parse(&bytes).unwrap()).unwrap();

        assert_eq!(table.n_events(), 5);
        let types = table.channel_types(0).unwrap();
        assert_eq!(types[36], ChannelType::Calibration);
        assert_eq!(types[39 + 36], ChannelType::Calibration);
        assert_eq!(types[38], ChannelType::CommonMode);
        assert_eq!(types[0], ChannelType::Normal);
    }
}
