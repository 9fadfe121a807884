//! CLI entry point for tileboard-daq
//!
//! Subcommands:
//! - `acquire`: configure the board, record a run and decode it
//! - `decode`: decode an existing raw record file
//! - `inspect`: summarize a saved decoded table
//! - `server`: start or stop the board-side servers over ssh
//!
//! # Usage
//!
//! ```bash
//! tileboard-daq acquire --events 1000 --save run.arrow
//! tileboard-daq acquire --events 100 --simulate
//! tileboard-daq decode data/run.raw --save run.arrow
//! tileboard-daq inspect run.arrow --field adc
//! tileboard-daq server start
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tileboard_daq::client::{Connector, Interrupt, ZmqConnector};
use tileboard_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use tileboard_daq::decoder::{self, DecodedEvent};
use tileboard_daq::logging::{self, TracingConfig};
use tileboard_daq::remote::ServerControl;
use tileboard_daq::sim::SimulatedTileboard;
use tileboard_daq::Acquisition;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tileboard-daq")]
#[command(about = "Tileboard acquisition and raw record decoding", long_about = None)]
struct Cli {
    /// Application configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a run and decode it
    Acquire {
        /// Number of events to record
        #[arg(long)]
        events: u64,

        /// Run against the in-process simulated tileboard
        #[arg(long)]
        simulate: bool,

        /// Save the decoded table as an Arrow IPC file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Decode a raw record file
    Decode {
        /// Raw record file written by the sink
        raw: PathBuf,

        /// Save the decoded table as an Arrow IPC file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Summarize a saved decoded table
    Inspect {
        /// Arrow IPC file written by `--save`
        table: PathBuf,

        /// Print the rows of one field as JSON
        #[arg(long)]
        field: Option<String>,
    },

    /// Control the board-side servers
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum ServerAction {
    /// Start the servers
    Start,
    /// Stop the servers
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only real hardware needs a configuration file
    let config = match load_config(&cli.config) {
        Ok(config) => Some(config),
        Err(err) if !needs_config(&cli.command) => {
            logging::init(TracingConfig::default())?;
            warn!(error = %err, "no usable configuration, using defaults");
            None
        }
        Err(err) => return Err(err),
    };
    if let Some(config) = &config {
        logging::init_from_config(config)?;
    }

    match cli.command {
        Commands::Acquire {
            events,
            simulate,
            save,
        } => acquire(config, &cli.config, events, simulate, save).await,
        Commands::Decode { raw, save } => {
            let table = decoder::decode_file(&raw)?;
            print_summary(&table);
            save_table(&table, save.as_deref())
        }
        Commands::Inspect { table, field } => inspect(&table, field.as_deref()),
        Commands::Server { action } => {
            let config = config.ok_or_else(|| anyhow!("configuration required"))?;
            server(&config, action)
        }
    }
}

fn needs_config(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Acquire { simulate: false, .. } | Commands::Server { .. }
    )
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn acquire(
    config: Option<AppConfig>,
    config_path: &Path,
    events: u64,
    simulate: bool,
    save: Option<PathBuf>,
) -> Result<()> {
    let (settings, connector) = if simulate {
        let board = SimulatedTileboard::default();
        let (output_dir, run_name) = match &config {
            Some(config) => (
                config.acquisition.output_dir.clone(),
                config.acquisition.run_name.clone(),
            ),
            None => (PathBuf::from("data"), "run".to_string()),
        };
        std::fs::create_dir_all(&output_dir)?;
        let settings = board.settings(output_dir, &run_name)?;
        let connector: Arc<dyn Connector> = Arc::new(board);
        (settings, connector)
    } else {
        let config = config.ok_or_else(|| anyhow!("configuration required"))?;
        let base_dir = config_path.parent().unwrap_or(Path::new("."));
        let connector: Arc<dyn Connector> = Arc::new(ZmqConnector::new(config.socket_options()));
        (config.acquisition_settings(base_dir)?, connector)
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, abandoning run");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let table = tokio::task::spawn_blocking(move || -> Result<DecodedEvent> {
        let interrupt: Arc<dyn Interrupt> = interrupt;
        let mut acquisition = Acquisition::connect(&settings, connector)?.with_interrupt(interrupt);
        Ok(acquisition.acquire(events)?)
    })
    .await??;

    info!(events = table.n_events(), "acquisition finished");
    print_summary(&table);
    save_table(&table, save.as_deref())
}

fn save_table(table: &DecodedEvent, path: Option<&Path>) -> Result<()> {
    if let Some(path) = path {
        decoder::save(table, path)?;
        println!("saved {}", path.display());
    }
    Ok(())
}

fn print_summary(table: &DecodedEvent) {
    println!("{} events", table.n_events());
    for (name, column) in table.columns() {
        println!(
            "  {:<16} {:?} x{}",
            name,
            column.data().dtype(),
            column.width()
        );
    }
}

fn inspect(path: &Path, field: Option<&str>) -> Result<()> {
    match field {
        None => {
            let table = decoder::load(path)?;
            print_summary(&table);
        }
        Some(name) => {
            let column = decoder::load_field(path, name)?;
            let rows = column.rows().unwrap_or(0);
            for row in 0..rows {
                let values = column.row(row).unwrap_or_default();
                println!("{}", serde_json::to_string(&values)?);
            }
        }
    }
    Ok(())
}

fn server(config: &AppConfig, action: ServerAction) -> Result<()> {
    let remote = config
        .remote
        .as_ref()
        .ok_or_else(|| anyhow!("no [remote] section in configuration"))?;
    let control = ServerControl::from_config(remote);
    let output = match action {
        ServerAction::Start => control.start()?,
        ServerAction::Stop => control.stop()?,
    };
    print!("{}", output);
    Ok(())
}
