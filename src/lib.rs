//! # Tileboard DAQ Library
//!
//! Host-side acquisition for a tileboard readout. The library drives the
//! board's fast-control, data-sink and slow-control servers over ZeroMQ,
//! turns the raw record files they produce into a decoded per-event table,
//! and persists that table as an Arrow IPC file. The `tileboard-daq` binary
//! (`main.rs`) is a thin CLI over these modules.
//!
//! ## Crate Structure
//!
//! - **`config_tree`**: Nested YAML configuration documents with an atomic
//!   recursive merge. Every configuration payload sent to a board is one of
//!   these, dumped in full.
//! - **`client`**: The request/reply message client, its transport seam and
//!   the two board-specific clients built on it (`slow_control`,
//!   `fast_control`). Polling loops share one `PollPolicy` and an optional
//!   interrupt flag.
//! - **`decoder`**: Reading raw record files, validating their cardinality
//!   metadata, unfolding channel numbers per half and saving/loading the
//!   decoded table.
//! - **`acquisition`**: The orchestrator that configures, starts, polls and
//!   stops the instrument and the sink in the required order, then decodes
//!   the run.
//! - **`sim`**: An in-process simulated tileboard that speaks the same
//!   protocol, used by the tests and the CLI's `--simulate` mode.
//! - **`remote`**: Starting and stopping the board servers over ssh.
//! - **`config`** / **`logging`**: Application configuration (figment) and
//!   tracing initialization.
//! - **`error`**: The crate-wide `DaqError` enum.

pub mod acquisition;
pub mod client;
pub mod config;
pub mod config_tree;
pub mod decoder;
pub mod error;
pub mod logging;
pub mod remote;
pub mod sim;

pub use acquisition::{Acquisition, AcquisitionSettings};
pub use config_tree::ConfigTree;
pub use decoder::{decode_file, DecodedEvent};
pub use error::{AppResult, DaqError};
