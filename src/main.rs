//! `alice` administrative tool.
//!
//! Usage:
//! ```bash
//! # Apply migrations and create the default tenant
//! alice init
//!
//! # Scan watched folders, then process up to five pending items
//! alice scan
//! alice process --limit 5
//!
//! # Run the background worker
//! alice worker
//!
//! # Show how every task type resolves to a model
//! alice models
//! ```

use clap::Parser;
use tracing_subscriber::EnvFilter;

use alice::cli::{self, Cli};
use alice::config::{LogFormat, Settings};

fn init_tracing(cli: &Cli) {
    // Settings may be unreadable at this point; the command reports that.
    let logging = Settings::load(&cli.loader())
        .map(|s| s.logging)
        .unwrap_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    if cli.json_logs || logging.format == LogFormat::Json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = cli::run(cli).await {
        let code = cli::exit_code(&e);
        tracing::error!(exit_code = code, "{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(code);
    }
}
