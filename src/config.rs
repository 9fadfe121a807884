//! Application configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/tileboard.toml` (base configuration)
//! 2. Environment variables prefixed with `TILEBOARD_`, nested with `__`
//!    (e.g. `TILEBOARD_ACQUISITION__RUN_NAME=pedestal`)
//!
//! The board documents themselves (`daq.yaml`, `client.yaml`,
//! `slow_control.yaml`) are YAML files referenced by path; they are read when
//! the configuration is turned into [`AcquisitionSettings`].
//!
//! # Example
//! ```no_run
//! use tileboard_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Instrument: {}:{}", config.instrument.host, config.instrument.port);
//! # Ok::<(), tileboard_daq::error::DaqError>(())
//! ```

use crate::acquisition::{AcquisitionSettings, BoardSettings};
use crate::client::{PollPolicy, SocketOptions};
use crate::config_tree::ConfigTree;
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/tileboard.toml";
/// Environment override prefix.
pub const ENV_PREFIX: &str = "TILEBOARD_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument fast-control server
    pub instrument: BoardConfig,
    /// Data sink
    pub sink: BoardConfig,
    /// Slow-control server
    pub slow_control: BoardConfig,
    /// Run parameters
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// ZeroMQ socket options
    #[serde(default)]
    pub transport: TransportConfig,
    /// Remote server control; absent when servers are managed by hand
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// One board service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardConfig {
    /// Host name or IP address
    pub host: String,
    /// Service port
    pub port: u16,
    /// YAML document loaded as the initial working configuration
    pub document: PathBuf,
}

/// Run parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcquisitionConfig {
    /// Directory the sink writes raw files into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Raw file stem
    #[serde(default = "default_run_name")]
    pub run_name: String,
    /// Completion poll interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// `start` acknowledgement poll interval
    #[serde(default = "default_poll_interval")]
    pub start_poll_interval_ms: u64,
    /// Wait between stopping the sink and decoding
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Give up waiting after this long (unbounded when absent)
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

/// ZeroMQ socket options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TransportConfig {
    /// Receive timeout (blocking when absent)
    #[serde(default)]
    pub recv_timeout_ms: Option<u64>,
    /// Send timeout (blocking when absent)
    #[serde(default)]
    pub send_timeout_ms: Option<u64>,
    /// Linger on close
    #[serde(default)]
    pub linger_ms: u64,
}

/// Remote server control over ssh
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Board host
    pub host: String,
    /// Login user
    #[serde(default)]
    pub user: Option<String>,
    /// Command starting the board servers
    pub start_command: String,
    /// Command stopping the board servers
    pub stop_command: String,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_run_name() -> String {
    "run".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_settle() -> u64 {
    500
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            run_name: default_run_name(),
            poll_interval_ms: default_poll_interval(),
            start_poll_interval_ms: default_poll_interval(),
            settle_ms: default_settle(),
            max_wait_ms: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/tileboard.toml` and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack used by [`AppConfig::load_from`].
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        for (role, board) in self.boards() {
            if board.port == 0 {
                return Err(DaqError::Configuration(format!("{role}: port must be non-zero")));
            }
            if board.host.trim().is_empty() {
                return Err(DaqError::Configuration(format!("{role}: host is empty")));
            }
        }
        let boards = self.boards();
        for (i, (role, board)) in boards.iter().enumerate() {
            for (other_role, other) in &boards[i + 1..] {
                if board.host == other.host && board.port == other.port {
                    return Err(DaqError::Configuration(format!(
                        "{role} and {other_role} both use {}:{}",
                        board.host, board.port
                    )));
                }
            }
        }

        let acq = &self.acquisition;
        if acq.poll_interval_ms == 0 || acq.start_poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "Poll intervals must be at least 1 ms".into(),
            ));
        }
        if acq.run_name.is_empty() || acq.run_name.contains(['/', '\\']) {
            return Err(DaqError::Configuration(format!(
                "Invalid run_name '{}'",
                acq.run_name
            )));
        }
        if acq.max_wait_ms == Some(0) {
            return Err(DaqError::Configuration("max_wait_ms must be positive".into()));
        }

        Ok(())
    }

    fn boards(&self) -> [(&'static str, &BoardConfig); 3] {
        [
            ("instrument", &self.instrument),
            ("sink", &self.sink),
            ("slow_control", &self.slow_control),
        ]
    }

    /// Completion polling policy.
    pub fn poll_policy(&self) -> PollPolicy {
        self.policy(self.acquisition.poll_interval_ms)
    }

    /// `start` acknowledgement polling policy.
    pub fn start_poll_policy(&self) -> PollPolicy {
        self.policy(self.acquisition.start_poll_interval_ms)
    }

    fn policy(&self, interval_ms: u64) -> PollPolicy {
        let policy = PollPolicy::every(Duration::from_millis(interval_ms));
        match self.acquisition.max_wait_ms {
            Some(ms) => policy.with_max_wait(Duration::from_millis(ms)),
            None => policy,
        }
    }

    /// ZeroMQ socket options.
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            recv_timeout: self.transport.recv_timeout_ms.map(Duration::from_millis),
            send_timeout: self.transport.send_timeout_ms.map(Duration::from_millis),
            linger: Some(Duration::from_millis(self.transport.linger_ms)),
        }
    }

    /// Read the board documents and assemble run settings.
    ///
    /// Relative document paths are resolved against `base_dir`.
    pub fn acquisition_settings(&self, base_dir: impl AsRef<Path>) -> AppResult<AcquisitionSettings> {
        let base_dir = base_dir.as_ref();
        let board = |config: &BoardConfig| -> AppResult<BoardSettings> {
            Ok(BoardSettings {
                host: config.host.clone(),
                port: config.port,
                document: ConfigTree::from_path(base_dir.join(&config.document))?,
            })
        };
        Ok(AcquisitionSettings {
            instrument: board(&self.instrument)?,
            sink: board(&self.sink)?,
            slow_control: board(&self.slow_control)?,
            output_dir: self.acquisition.output_dir.clone(),
            run_name: self.acquisition.run_name.clone(),
            poll: self.poll_policy(),
            start_poll: self.start_poll_policy(),
            settle: Duration::from_millis(self.acquisition.settle_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[application]
name = "Test"
log_level = "info"

[instrument]
host = "10.0.0.2"
port = 6000
document = "daq.yaml"

[sink]
host = "localhost"
port = 6001
document = "client.yaml"

[slow_control]
host = "10.0.0.2"
port = 5555
document = "slow_control.yaml"
"#;

    fn parse(toml: &str) -> AppConfig {
        Figment::new().merge(Toml::string(toml)).extract().unwrap()
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let config = parse(MINIMAL);
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.acquisition, AcquisitionConfig::default());
        assert_eq!(config.transport, TransportConfig::default());
        assert!(config.remote.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config: AppConfig = Figment::new().merge(Toml::file(path)).extract().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.instrument.port, 6000);
        assert!(config.remote.is_some());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = parse(MINIMAL);
        config.application.log_level = "loud".into();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_invalid_intervals_and_run_name() {
        let mut config = parse(MINIMAL);
        config.acquisition.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.acquisition.run_name = "../escape".into();
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.sink.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shared_endpoint_is_rejected() {
        let mut config = parse(MINIMAL);
        config.slow_control.port = config.instrument.port;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("instrument and slow_control"), "{err}");

        // same port on different hosts is fine
        let mut config = parse(MINIMAL);
        config.sink.port = config.instrument.port;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policies_and_socket_options() {
        let mut config = parse(MINIMAL);
        config.acquisition.max_wait_ms = Some(2000);
        config.transport.recv_timeout_ms = Some(250);

        let poll = config.poll_policy();
        assert_eq!(poll.interval, Duration::from_millis(10));
        assert_eq!(poll.max_wait, Some(Duration::from_secs(2)));

        let options = config.socket_options();
        assert_eq!(options.recv_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.send_timeout, None);
        assert_eq!(options.linger, Some(Duration::ZERO));
    }

    #[test]
    fn test_acquisition_settings_read_documents() {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in [
            ("daq.yaml", "daq:\n  NEvents: 5\n"),
            ("client.yaml", "client:\n  run_type: x\n"),
            ("slow_control.yaml", "roc_s0: {}\n"),
        ] {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(body.as_bytes()).unwrap();
        }

        let settings = parse(MINIMAL).acquisition_settings(dir.path()).unwrap();
        assert_eq!(settings.instrument.host, "10.0.0.2");
        assert_eq!(
            settings
                .instrument
                .document
                .get_path("daq.NEvents")
                .and_then(|v| v.as_u64()),
            Some(5)
        );
        assert_eq!(settings.settle, Duration::from_millis(500));

        let missing = parse(MINIMAL).acquisition_settings(dir.path().join("nowhere"));
        assert!(matches!(missing, Err(DaqError::Io(_))));
    }

    #[test]
    fn test_load_from_reports_missing_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[application]\nname = \"x\"\nlog_level = \"info\"\n")
            .unwrap();
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }
}
