//! Parses the command line arguments the daemon starts with.
//!
//! Basic usage, logging to a file:
//!
//! ```cargo run -- --config ./dinocd.toml --log```
//!
//! For logging to stdout instead:
//!
//! ```cargo run -- --config ./dinocd.toml --stdout```

use std::{
    fs::{create_dir_all, OpenOptions},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use tracing::Subscriber;
use tracing_subscriber::{fmt, prelude::*, Registry};

/// Command line arguments for `dinocd`.
#[derive(Parser)]
pub struct Args {
    /// Path to the daemon's TOML configuration file.
    #[arg(short, long, default_value = "dinocd.toml")]
    pub config: PathBuf,
    /// Should logging to a file be enabled.
    #[arg(short, long)]
    pub log: bool,
    /// Should logging to stdout be enabled.
    #[arg(short, long)]
    pub stdout: bool,
    /// Hex-encoded 32-byte pre-shared AEAD key. Overrides the key in the
    /// config file, if any; generating and distributing this key to agents
    /// out of band is the operator's job, not this daemon's.
    #[arg(short = 'k', long)]
    pub shared_key: Option<String>,
}

/// Parses command line arguments.
pub fn parse_arguments() -> Args {
    let args = Args::parse();
    if args.log || args.stdout {
        initialize_logging(args.stdout, args.log);
    }
    args
}

/// Initializes the global tracing subscriber. Only should be called once,
/// before anything else logs. During tests no subscriber is installed.
fn initialize_logging(stdout: bool, file: bool) {
    let subscriber: Box<dyn Subscriber + Send + Sync> = match (stdout, file) {
        (true, true) => {
            let file = open_log_file();
            Box::new(
                Registry::default()
                    .with(tracing_subscriber::EnvFilter::from_default_env())
                    .with(fmt::Layer::default().json().with_writer(Arc::new(file)))
                    .with(fmt::Layer::default().pretty().without_time().with_file(false).with_writer(std::io::stdout)),
            )
        }
        (true, false) => Box::new(
            Registry::default()
                .with(tracing_subscriber::EnvFilter::from_default_env())
                .with(fmt::Layer::default().pretty().without_time().with_file(false).with_writer(std::io::stdout)),
        ),
        (false, true) => {
            let file = open_log_file();
            Box::new(
                Registry::default()
                    .with(tracing_subscriber::EnvFilter::from_default_env())
                    .with(fmt::Layer::default().json().with_writer(Arc::new(file))),
            )
        }
        _ => Box::new(Registry::default()),
    };
    tracing::subscriber::set_global_default(subscriber).expect("a global subscriber is only installed once");
}

fn open_log_file() -> std::fs::File {
    let main_path = "./logs";
    create_dir_all(main_path).expect("failed to create log directory");
    let file_path = format!(
        "{}/dinocd-{}.log",
        main_path,
        chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
    );
    OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)
        .expect("failed to open log file")
}
