//! Water Usage Agent CLI
//!
//! Event segmentation and usage analytics for household water meters.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;
use water_usage_agent::{
    adapter_from_config,
    config::Config,
    core::format::format_local_time,
    diagnostics::create_shared_log_with_persistence,
    readings::{io::parse_json_line, read_file, InputFormat},
    EventFilter, Granularity, IngestOutcome, MeterId, Reading, SettingsPatch, UsageReport,
    WaterEvent, WaterUsageEngine, VERSION,
};

/// How often `watch` persists the store while running.
const WATCH_SAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "water-usage")]
#[command(version = VERSION)]
#[command(about = "Water meter event segmentation and usage analytics", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a CSV or JSON Lines reading file through ingestion
    Ingest {
        /// Reading file (`timestamp,value` CSV or JSON Lines)
        file: PathBuf,

        /// Meter the readings belong to
        #[arg(long, short)]
        meter: String,

        /// File format (csv or jsonl); guessed from the extension if omitted
        #[arg(long)]
        format: Option<String>,
    },

    /// Ingest JSON Lines readings from stdin until Ctrl+C
    Watch {
        #[arg(long, short)]
        meter: String,
    },

    /// Show a usage summary for a time range
    Usage {
        #[arg(long, short)]
        meter: String,

        /// Time range preset (day, week, month or year)
        #[arg(long, default_value = "week")]
        range: String,

        /// Window start (RFC3339); requires --end
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Window end (RFC3339); defaults to now
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List a meter's events, newest first
    Events {
        #[arg(long, short)]
        meter: String,

        #[arg(long)]
        start: Option<DateTime<Utc>>,

        #[arg(long)]
        end: Option<DateTime<Utc>>,

        #[arg(long)]
        category: Option<String>,
    },

    /// Show one event as JSON
    Event { id: u64 },

    /// Set an event's category
    Categorize { id: u64, category: String },

    /// Flag an event as anomalous, or clear the flag
    Flag {
        id: u64,

        /// Clear the flag instead of setting it
        #[arg(long)]
        clear: bool,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Show or change a meter's settings
    Settings {
        #[arg(long, short)]
        meter: String,

        /// Restore the defaults
        #[arg(long)]
        reset: bool,

        /// Retention period in days
        #[arg(long)]
        retention: Option<u32>,

        #[arg(long)]
        store_raw_data: Option<bool>,

        #[arg(long)]
        allow_ai_analysis: Option<bool>,

        #[arg(long)]
        share_anonymized_data: Option<bool>,

        #[arg(long)]
        share_with_utility: Option<bool>,

        #[arg(long)]
        participate_in_community: Option<bool>,

        /// Delete every reading, event and setting of the meter
        #[arg(long, conflicts_with = "reset")]
        delete_all_data: bool,
    },

    /// Drop readings and events older than the meter's retention period
    Purge {
        #[arg(long, short)]
        meter: String,
    },

    /// Show diagnostics counters
    Status,

    /// Show configuration
    Config,

    /// Serve the HTTP API
    #[cfg(feature = "server")]
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("water_usage_agent=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ingest {
            file,
            meter,
            format,
        } => cmd_ingest(&config, &file, &meter, format.as_deref()),
        Commands::Watch { meter } => cmd_watch(&config, &meter),
        Commands::Usage {
            meter,
            range,
            start,
            end,
            json,
        } => cmd_usage(&config, &meter, &range, start, end, json),
        Commands::Events {
            meter,
            start,
            end,
            category,
        } => cmd_events(
            &config,
            &meter,
            EventFilter {
                start_date: start,
                end_date: end,
                category,
            },
        ),
        Commands::Event { id } => cmd_event(&config, id),
        Commands::Categorize { id, category } => cmd_categorize(&config, id, &category),
        Commands::Flag { id, clear, reason } => cmd_flag(&config, id, !clear, reason.as_deref()),
        Commands::Settings {
            meter,
            reset,
            retention,
            store_raw_data,
            allow_ai_analysis,
            share_anonymized_data,
            share_with_utility,
            participate_in_community,
            delete_all_data,
        } => {
            let patch = SettingsPatch {
                data_retention_days: retention,
                store_raw_data,
                allow_ai_analysis,
                share_anonymized_data,
                share_with_utility,
                participate_in_community,
            };
            cmd_settings(&config, &meter, reset, delete_all_data, &patch)
        }
        Commands::Purge { meter } => cmd_purge(&config, &meter),
        Commands::Status => cmd_status(&config),
        Commands::Config => cmd_config(&config),
        #[cfg(feature = "server")]
        Commands::Serve { port } => cmd_serve(&config, port),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(Config::config_path);
    Config::load_from(&path).with_context(|| format!("loading config from {}", path.display()))
}

/// Open the persistent engine described by the configuration.
fn open_engine(config: &Config) -> anyhow::Result<WaterUsageEngine> {
    config
        .ensure_directories()
        .context("creating data directory")?;
    let classifier = adapter_from_config(&config.classifier)?;
    let diagnostics = create_shared_log_with_persistence(config.diagnostics_path());
    Ok(WaterUsageEngine::open(config, classifier, diagnostics)?)
}

fn runtime() -> anyhow::Result<Runtime> {
    Runtime::new().context("starting async runtime")
}

fn cmd_ingest(
    config: &Config,
    file: &Path,
    meter: &str,
    format: Option<&str>,
) -> anyhow::Result<()> {
    let format = match format {
        Some(f) => match InputFormat::parse(f) {
            Some(format) => format,
            None => bail!("unknown format '{f}' (expected csv or jsonl)"),
        },
        None => InputFormat::from_path(file),
    };
    let readings = read_file(file, format)
        .with_context(|| format!("reading {}", file.display()))?;

    let rt = runtime()?;
    let engine = open_engine(config)?;
    let meter = MeterId::new(meter);

    rt.block_on(async {
        let mut closed = 0usize;
        let mut dropped = 0usize;
        for reading in &readings {
            let outcome = engine
                .ingest_reading(&meter, reading.timestamp, reading.value)
                .await?;
            match outcome {
                IngestOutcome::EventClosed { ref event } => {
                    closed += 1;
                    print_event_line(&engine, event);
                }
                IngestOutcome::Dropped { .. } => dropped += 1,
                _ => {}
            }
        }
        engine.save().await?;

        println!();
        println!(
            "Ingested {} readings for meter {}: {} events closed, {} dropped",
            readings.len(),
            meter,
            closed,
            dropped
        );
        anyhow::Ok(())
    })
}

fn cmd_watch(config: &Config, meter: &str) -> anyhow::Result<()> {
    println!("Water Usage Agent v{VERSION}");
    println!();
    println!("Reading JSON Lines from stdin for meter {meter}");
    println!("Press Ctrl+C to stop");
    println!();

    let rt = runtime()?;
    let engine = open_engine(config)?;
    let meter = MeterId::new(meter);

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("setting Ctrl+C handler")?;

    let receiver = spawn_stdin_reader();
    let mut last_save = Instant::now();

    while running.load(Ordering::SeqCst) {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(reading) => {
                let outcome =
                    rt.block_on(engine.ingest_reading(&meter, reading.timestamp, reading.value))?;
                if let IngestOutcome::EventClosed { ref event } = outcome {
                    print_event_line(&engine, event);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                println!("Input closed");
                break;
            }
        }

        if last_save.elapsed() >= WATCH_SAVE_INTERVAL {
            if let Err(e) = rt.block_on(engine.save()) {
                tracing::warn!("Failed to save store: {}", e);
            }
            last_save = Instant::now();
        }
    }

    println!();
    println!("Stopping...");
    rt.block_on(engine.save())?;

    // Final stats
    println!();
    println!("{}", engine.diagnostics_log().summary());
    Ok(())
}

/// Parse readings from stdin on a background thread.
///
/// Lines that fail to parse are logged and skipped.
fn spawn_stdin_reader() -> crossbeam_channel::Receiver<Reading> {
    let (sender, receiver) = crossbeam_channel::unbounded();

    thread::spawn(move || {
        let stdin = std::io::stdin();
        for (idx, line) in stdin.lock().lines().enumerate() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_json_line(&line) {
                Ok(reading) => {
                    if sender.send(reading).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(line = idx + 1, "Skipping invalid reading: {}", e),
            }
        }
    });

    receiver
}

fn print_event_line(engine: &WaterUsageEngine, event: &WaterEvent) {
    println!(
        "[{}] Event #{} closed: {} | {:.1} L over {}s | {}{}",
        event
            .end_time
            .with_timezone(&engine.timezone())
            .format("%H:%M:%S"),
        event.id,
        event.category,
        event.volume_ml as f64 / 1000.0,
        event.duration_seconds,
        event.confidence,
        if event.anomaly { "% | ANOMALY" } else { "%" }
    );
}

fn cmd_usage(
    config: &Config,
    meter: &str,
    range: &str,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    json: bool,
) -> anyhow::Result<()> {
    let granularity: Granularity = range.parse()?;
    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => (start, end),
        (Some(_), None) => bail!("--start requires --end"),
        (None, end) => {
            let window = granularity.window_ending(end.unwrap_or_else(Utc::now));
            (window.start(), window.end())
        }
    };

    let rt = runtime()?;
    let engine = open_engine(config)?;
    let meter = MeterId::new(meter);
    let report = rt.block_on(engine.usage_report(&meter, start, end, granularity))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&engine, &meter, &report);
    }
    Ok(())
}

fn print_report(engine: &WaterUsageEngine, meter: &MeterId, report: &UsageReport) {
    let summary = &report.summary;
    let tz = engine.timezone();

    println!("Water Usage - meter {meter}");
    println!("==========================");
    println!();
    println!(
        "Window: {} to {} ({})",
        format_local_time(summary.start_date, tz, summary.time_range),
        format_local_time(summary.end_date, tz, summary.time_range),
        summary.time_range
    );
    println!(
        "  Total usage: {} L ({:+}% vs previous period)",
        summary.total_usage, summary.usage_comparison
    );
    match summary.peak_flow_category {
        Some(ref category) => println!(
            "  Peak flow: {} L at {} ({})",
            summary.peak_flow, summary.peak_flow_time, category
        ),
        None => println!("  Peak flow: {} L", summary.peak_flow),
    }
    println!(
        "  Events: {} in {} categories",
        summary.event_count, summary.category_count
    );
    if summary.anomaly_count > 0 {
        println!(
            "  Anomalies: {} ({})",
            summary.anomaly_count,
            summary.anomaly_description.as_deref().unwrap_or("")
        );
    }

    if !summary.categories.is_empty() {
        println!();
        println!("Categories:");
        for category in &summary.categories {
            println!(
                "  {:<16} {:>10} {:>6.1}%  ({} events)",
                category.name, category.volume, category.percentage, category.event_count
            );
        }
    }

    if !report.recommendations.is_empty() {
        println!();
        println!("Tips:");
        for tip in &report.recommendations {
            println!("  {}. {}", tip.priority, tip.title);
            println!("     {}", tip.description);
        }
    }
}

fn cmd_events(config: &Config, meter: &str, filter: EventFilter) -> anyhow::Result<()> {
    let rt = runtime()?;
    let engine = open_engine(config)?;
    let events = rt.block_on(engine.list_events(&MeterId::new(meter), &filter))?;

    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    let tz = engine.timezone();
    for event in &events {
        println!(
            "#{:<6} {}  {:<16} {:>8.1} L  {:>6}s  {:>3}%{}",
            event.id,
            event.start_time.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
            event.category,
            event.volume_ml as f64 / 1000.0,
            event.duration_seconds,
            event.confidence,
            if event.anomaly { "  ANOMALY" } else { "" }
        );
    }
    println!();
    println!("{} event(s)", events.len());
    Ok(())
}

fn cmd_event(config: &Config, id: u64) -> anyhow::Result<()> {
    let rt = runtime()?;
    let engine = open_engine(config)?;
    let event = rt.block_on(engine.get_event(id))?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

fn cmd_categorize(config: &Config, id: u64, category: &str) -> anyhow::Result<()> {
    let category = category.trim();
    if category.is_empty() {
        bail!("category must not be empty");
    }

    let rt = runtime()?;
    let engine = open_engine(config)?;
    rt.block_on(async {
        let event = engine.set_category(id, category).await?;
        engine.save().await?;
        println!("Event #{} categorized as {}", event.id, event.category);
        anyhow::Ok(())
    })
}

fn cmd_flag(config: &Config, id: u64, anomaly: bool, reason: Option<&str>) -> anyhow::Result<()> {
    let rt = runtime()?;
    let engine = open_engine(config)?;
    rt.block_on(async {
        let event = engine.set_anomaly_flag(id, anomaly, reason).await?;
        engine.save().await?;
        match event.anomaly_description {
            Some(ref description) if event.anomaly => {
                println!("Event #{} flagged: {}", event.id, description)
            }
            _ => println!("Event #{} flag cleared", event.id),
        }
        anyhow::Ok(())
    })
}

fn cmd_settings(
    config: &Config,
    meter: &str,
    reset: bool,
    delete_all_data: bool,
    patch: &SettingsPatch,
) -> anyhow::Result<()> {
    let rt = runtime()?;
    let engine = open_engine(config)?;
    let meter = MeterId::new(meter);

    rt.block_on(async {
        if delete_all_data {
            let removed = engine.delete_all_user_data(&meter).await;
            engine.save().await?;
            println!(
                "Deleted all data of meter {}: {} readings, {} events",
                meter, removed.readings, removed.events
            );
            return Ok(());
        }

        let settings = if reset {
            engine.reset_settings(&meter).await
        } else if *patch != SettingsPatch::default() {
            engine.update_settings(&meter, patch).await
        } else {
            engine.settings(&meter).await
        };
        engine.save().await?;

        println!("{}", serde_json::to_string_pretty(&settings)?);
        anyhow::Ok(())
    })
}

fn cmd_purge(config: &Config, meter: &str) -> anyhow::Result<()> {
    let rt = runtime()?;
    let engine = open_engine(config)?;
    let meter = MeterId::new(meter);

    rt.block_on(async {
        let removed = engine.purge_expired(&meter, Utc::now()).await?;
        engine.save().await?;
        println!(
            "Purged {} readings and {} events of meter {}",
            removed.readings, removed.events, meter
        );
        anyhow::Ok(())
    })
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("Water Usage Agent Status");
    println!("========================");
    println!();
    println!("Data directory: {:?}", config.data_path);
    println!(
        "Classifier: {}",
        match config.classifier.endpoint {
            Some(ref endpoint) => format!("remote ({}:{})", endpoint.host, endpoint.port),
            None => "local rules".to_string(),
        }
    );
    println!();

    let stats_path = config.diagnostics_path();
    if stats_path.exists() {
        let log = water_usage_agent::DiagnosticsLog::with_persistence(stats_path);
        println!("{}", log.summary());
    } else {
        println!("No diagnostics recorded yet.");
    }
    Ok(())
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

#[cfg(feature = "server")]
fn cmd_serve(config: &Config, port: Option<u16>) -> anyhow::Result<()> {
    use water_usage_agent::server::{self, ServerConfig};

    let rt = runtime()?;
    let engine = Arc::new(open_engine(config)?);
    let server_config = ServerConfig::new(port.unwrap_or(config.server_port));

    rt.block_on(async {
        let (addr, shutdown) = server::run(server_config, engine.clone()).await?;
        println!("Water Usage Agent v{VERSION} listening on http://{addr}");
        println!("Press Ctrl+C to stop");

        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl+C")?;
        let _ = shutdown.send(());

        engine.save().await?;
        println!();
        println!("{}", engine.diagnostics_log().summary());
        anyhow::Ok(())
    })
}
