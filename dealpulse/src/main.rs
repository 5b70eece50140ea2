//! dealpulse - visitor tracking and form autosave host
//!
//! Embeds the dealpulse pipeline the way a page would and exposes it as
//! subcommands:
//! - `status`: configuration, storage health and the visitor id
//! - `track`: emit one event and wait for it to settle
//! - `autosave`: feed `field=value` lines from stdin into an autosave session
//!
//! Uses XDG Base Directory specification for file locations:
//! - Storage: $XDG_DATA_HOME/dealpulse/storage.db (~/.local/share/dealpulse/storage.db)
//! - Config: $XDG_CONFIG_HOME/dealpulse/config.toml (~/.config/dealpulse/config.toml)
//! - Logs: $XDG_STATE_HOME/dealpulse/ (~/.local/state/dealpulse/)

mod host;
mod input;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealpulse_core::autosave::session::{self, Restored};
use dealpulse_core::emitter::{
    CALCULATOR_STARTED_POINTS, CTA_CLICK_POINTS, PAGE_VIEW_POINTS, REPORT_DOWNLOAD_POINTS,
    VALUATION_COMPLETED_POINTS,
};
use dealpulse_core::{AutosaveManager, Config, EventData};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::host::Host;
use crate::input::Line;

#[derive(Parser)]
#[command(name = "dealpulse")]
#[command(about = "Fire-and-forget visitor tracking and form autosave")]
#[command(version)]
struct Args {
    /// Verbose output (write logs to the state directory)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/dealpulse/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Referrer reported for the simulated page
    #[arg(long, global = true, value_name = "URL")]
    referrer: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, storage health and identity
    Status,

    /// Emit one event and wait for it to settle
    Track {
        /// Event type (page_view, cta_click, report_download, ...)
        event_type: String,

        /// Page path the event happened on
        #[arg(long, default_value = "/")]
        path: String,

        /// Event data entry, repeatable
        #[arg(long = "data", value_name = "KEY=VALUE")]
        data: Vec<String>,

        /// Engagement weight (default: the weight of known event types)
        #[arg(long)]
        points: Option<u32>,

        /// Page URL, source of UTM attribution
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Autosave `field=value` lines from stdin (`:step N`, `:flush`, `:finalize`, `:clear`)
    Autosave {
        /// Page path of the form
        #[arg(long, default_value = "/valuation")]
        path: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);
    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(
            dealpulse_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    tracing::info!("dealpulse starting up");

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let result = runtime.block_on(run(args, config, &config_path));
    // A pending stdin read must not hold the process open
    runtime.shutdown_timeout(Duration::from_millis(250));

    tracing::info!("dealpulse shutting down");
    result
}

async fn run(args: Args, config: Config, config_path: &Path) -> Result<()> {
    let host = Host::new(config, args.referrer)?;

    match args.command {
        Command::Status => cmd_status(&host, config_path),
        Command::Track {
            event_type,
            path,
            data,
            points,
            url,
        } => cmd_track(&host, &event_type, &path, &data, points, url.as_deref()).await,
        Command::Autosave { path } => cmd_autosave(&host, &path).await,
    }
}

fn cmd_status(host: &Host, config_path: &Path) -> Result<()> {
    let config = &host.config;

    println!("dealpulse Configuration");
    println!("=======================");
    println!();
    println!("Config file:     {}", config_path.display());

    let ingest = &config.ingest;
    if ingest.is_ready() {
        println!("Ingest:          enabled");
        println!(
            "Base URL:        {}",
            ingest.base_url.as_deref().unwrap_or("<not set>")
        );
        println!(
            "API Key:         {}",
            if ingest.api_key.is_some() {
                "<set>"
            } else {
                "<not set>"
            }
        );
        println!("Timeout:         {}ms", ingest.timeout_ms);
    } else {
        println!("Ingest:          disabled");
    }

    println!(
        "Breaker:         trips after {} failures, disables after {}",
        config.breaker.trip_threshold, config.breaker.disable_threshold
    );
    println!("Debounce:        {}ms", config.autosave.debounce_ms);
    println!("Token TTL:       {}h", config.autosave.token_ttl_hours);
    println!(
        "Logs:            {}",
        dealpulse_core::logging::log_file_path().display()
    );

    println!();
    println!(
        "Storage:         {}",
        config.storage.resolved_path().display()
    );
    let available = host.identity.storage_available();
    println!(
        "Storage status:  {}",
        if available { "available" } else { "unavailable" }
    );
    println!(
        "Visitor ID:      {}",
        host.identity.get_or_create_visitor_id()
    );
    if let Some(domain) = host.identity.detect_company_domain() {
        println!("Company domain:  {}", domain);
    }

    if available {
        let now = chrono::Utc::now();
        match session::load(host.storage.as_ref(), now, config.autosave.token_ttl())
            .context("failed to read saved draft")?
        {
            Restored::Fresh(saved) => println!(
                "Saved draft:     {} ({}s spent)",
                saved.token, saved.time_spent_seconds
            ),
            Restored::Stale | Restored::Missing => println!("Saved draft:     none"),
        }
    }

    Ok(())
}

async fn cmd_track(
    host: &Host,
    event_type: &str,
    path: &str,
    data: &[String],
    points: Option<u32>,
    url: Option<&str>,
) -> Result<()> {
    let data = input::parse_pairs(data)?;
    if let Some(url) = url {
        host.emitter.set_location(url);
    }
    let points = points.unwrap_or_else(|| default_points(event_type));

    host.emitter.track_event(event_type, path, data, points);
    let settled = host.emitter.settle(host.settle_limit()).await;

    let breaker = host.emitter.breaker_state();
    if !host.identity.storage_available() {
        println!("Tracking disabled: storage unavailable");
    } else if breaker.failure_count > 0 {
        println!(
            "Delivery failed ({} consecutive failures)",
            breaker.failure_count
        );
    } else if !host.config.ingest.is_ready() {
        println!("Ingest disabled: {} accepted locally", event_type);
    } else if settled {
        println!("Delivered {} ({} points)", event_type, points);
    } else {
        println!("Still sending {} at exit", event_type);
    }

    Ok(())
}

async fn cmd_autosave(host: &Host, path: &str) -> Result<()> {
    let manager = host.autosave(path);
    host.emitter.attach_time_on_page(&host.lifecycle, path);

    match manager.initialize_token() {
        Some(token) => println!("Resumed draft {}", token),
        None => println!("No saved draft; enter field=value lines"),
    }
    host.emitter.track_calculator_started(path);

    let (exit_tx, mut exit_rx) = tokio::sync::mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = exit_tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut form = EventData::new();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = exit_rx.recv() => None,
        };
        let Some(line) = line else {
            break;
        };

        match input::parse_line(&line) {
            Ok(Line::Blank) => {}
            Ok(Line::Field { name, value }) => apply_field(&manager, &mut form, name, value),
            Ok(Line::Step(step)) => manager.update_step(step),
            Ok(Line::Flush) => manager.flush_pending_updates(),
            Ok(Line::Finalize) => {
                manager.finalize_valuation(form.clone());
                break;
            }
            Ok(Line::Clear) => {
                manager.clear_autosave();
                manager.initialize_token();
                form.clear();
                println!("Draft cleared");
            }
            Err(e) => eprintln!("error: {:#}", e),
        }
    }

    // Let a finalize land before the page goes away
    manager.settle(host.settle_limit()).await;
    host.lifecycle.notify_hidden();
    manager.settle(host.settle_limit()).await;
    host.emitter.settle(host.settle_limit()).await;

    let session = manager.session();
    println!();
    println!("Phase:           {}", session.phase.as_str());
    if let Some(token) = &session.token {
        println!("Draft:           {}", token);
    }
    println!("Time spent:      {}s", session.time_spent_seconds);
    if let Some(saved) = session.last_saved {
        println!("Last saved:      {}", saved.to_rfc3339());
    }
    let breaker = manager.breaker_state();
    if breaker.failure_count > 0 {
        println!("Failures:        {}", breaker.failure_count);
    }

    Ok(())
}

fn apply_field(
    manager: &AutosaveManager,
    form: &mut EventData,
    name: String,
    value: serde_json::Value,
) {
    form.insert(name.clone(), value.clone());

    if manager.token().is_none() {
        match manager.create_initial_valuation_on_first_field(&name, value, form) {
            Some(token) => println!("Draft {}", token),
            None => println!("Not saved yet ({})", name),
        }
        return;
    }

    let mut partial = EventData::new();
    partial.insert(name.clone(), value);
    manager.update_valuation(partial, &name);
}

/// Weight of the event types the library knows about
fn default_points(event_type: &str) -> u32 {
    match event_type {
        "page_view" => PAGE_VIEW_POINTS,
        "cta_click" => CTA_CLICK_POINTS,
        "valuation_started" => CALCULATOR_STARTED_POINTS,
        "report_download" => REPORT_DOWNLOAD_POINTS,
        "valuation_completed" => VALUATION_COMPLETED_POINTS,
        _ => 0,
    }
}
