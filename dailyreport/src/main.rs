/*
dailyreport - single-binary main.rs
Generates (or serves from cache) the daily AI news report, either once or
from a line-oriented trigger loop on stdin.
*/

use anyhow::Result;
use clap::{Parser, ValueEnum};
use common::{Config, ReportConfig, ScopeMode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dailyreport::app::App;
use dailyreport::orchestrator::{Delivery, Orchestrator};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ScopeArg {
    Global,
    Session,
}

#[derive(Parser, Debug)]
#[command(name = "dailyreport", about = "Daily AI news report generator")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override report scoping from the configuration
    #[arg(long, value_enum)]
    scope: Option<ScopeArg>,

    /// Session the report is requested for
    #[arg(long)]
    session: Option<String>,

    /// Read `generate_report [session]` commands from stdin
    #[arg(long)]
    interactive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config.clone() {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    // Load configuration with defaults
    let mut config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    if let Some(scope) = args.scope {
        let report = config.report.get_or_insert_with(ReportConfig::default);
        report.scope = Some(match scope {
            ScopeArg::Global => ScopeMode::Global,
            ScopeArg::Session => ScopeMode::Session,
        });
    }

    let app = match App::build(&config).await {
        Ok(app) => app,
        Err(e) => {
            error!("failed to start: {:#}", e);
            return Err(e);
        }
    };

    if args.interactive {
        return run_interactive(app.orchestrator).await;
    }

    let ticket = app.orchestrator.trigger(args.session.as_deref());
    println!("Generating report {} ...", ticket.key());
    let delivery = ticket.delivery().await;
    if let Delivery::Failure(notice) = delivery {
        return Err(anyhow::anyhow!("{}", notice));
    }
    print_report(&delivery);
    Ok(())
}

fn print_report(delivery: &Delivery) {
    match delivery {
        Delivery::Report(receipt) => println!(
            "Report ready ({:?}): {} (valid until {})",
            receipt.origin, receipt.entry.artifact.uri, receipt.entry.expires_at
        ),
        Delivery::Failure(notice) => println!("{}", notice),
    }
}

/// Chat-style front end: each `generate_report` line is acknowledged at once
/// and answered when its report is ready.
async fn run_interactive(orchestrator: Arc<Orchestrator>) -> Result<()> {
    info!("interactive mode, type `generate_report [session]` or `quit`");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, exiting");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };

        let mut words = line.split_whitespace();
        match words.next() {
            Some("generate_report") => {
                let session = words.next().map(str::to_string);
                let ticket = orchestrator.trigger(session.as_deref());
                println!("Generating report {} ...", ticket.key());
                tokio::spawn(async move {
                    print_report(&ticket.delivery().await);
                });
            }
            Some("quit") | Some("exit") => break,
            Some(other) => warn!("unknown command: {}", other),
            None => {}
        }
    }

    Ok(())
}
