//! uplift-report: computes incremental revenue, iROAS and significance per
//! partition from local marks-and-spend and attribution feeds.
//!
//! Configuration comes from an optional TOML file, `UPLIFT_REPORT__*`
//! environment variables and the flags below, in increasing precedence.

use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uplift_core::ReportConfig;
use uplift_ingest::JsonLinesSource;
use uplift_reporting::{generate_report, UpliftReport};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "uplift-report")]
#[command(about = "Incremental revenue and iROAS from A/B marks and attributed events")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "UPLIFT_REPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Root of the `<customer>/<audience>/<feed>/<YYYYMMDD>.jsonl` tree
    #[arg(long, env = "UPLIFT_REPORT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Customer (overrides config)
    #[arg(long)]
    customer: Option<String>,

    /// Audience to include; repeat for several (overrides config)
    #[arg(long = "audience")]
    audiences: Vec<String>,

    /// Event type counted as a conversion (overrides config)
    #[arg(long)]
    revenue_event: Option<String>,

    /// First day of marks, YYYY-MM-DD (overrides config)
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day of marks, inclusive; defaults to --start
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,

    /// Last day of attributed events, inclusive
    #[arg(long, requires = "start")]
    attribution_end: Option<NaiveDate>,

    /// Also report every campaign separately
    #[arg(long, default_value_t = false)]
    per_campaign: bool,

    /// Test significance on converters instead of conversions
    #[arg(long, default_value_t = false)]
    converters: bool,

    /// Collapse duplicate conversions
    #[arg(long, default_value_t = false)]
    dedup: bool,

    /// Bootstrap resamples for confidence intervals
    #[arg(long)]
    bootstrap_size: Option<usize>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Print a Prometheus snapshot of the run metrics to stderr
    #[arg(long, default_value_t = false)]
    metrics: bool,
}

/// What gets written out: the report plus run metadata.
#[derive(Serialize)]
struct ReportEnvelope<'a> {
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    engine_version: &'static str,
    report: &'a UpliftReport,
}

fn load_config(cli: &Cli) -> anyhow::Result<ReportConfig> {
    let mut builder = ReportConfig::source_builder(cli.config.as_deref())
        .set_override_option("customer", cli.customer.clone())?
        .set_override_option("revenue_event", cli.revenue_event.clone())?;

    if !cli.audiences.is_empty() {
        builder = builder.set_override("audiences", cli.audiences.clone())?;
    }
    if let Some(start) = cli.start {
        let end = cli.end.unwrap_or(start);
        builder = builder
            .set_override("dates.start", start.to_string())?
            .set_override("dates.end", end.to_string())?;
        if let Some(attribution_end) = cli.attribution_end {
            builder = builder
                .set_override("attribution_dates.start", start.to_string())?
                .set_override("attribution_dates.end", attribution_end.to_string())?;
        }
    }
    if cli.per_campaign {
        builder = builder.set_override("per_campaign_results", true)?;
    }
    if cli.converters {
        builder = builder.set_override("use_converters_for_significance", true)?;
    }
    if cli.dedup {
        builder = builder.set_override("use_deduplication", true)?;
    }
    builder =
        builder.set_override_option("bootstrap.size", cli.bootstrap_size.map(|s| s as i64))?;

    Ok(builder.build()?.try_deserialize()?)
}

fn write_report(envelope: &ReportEnvelope<'_>, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, envelope)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
            info!(path = %path.display(), "Report written");
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            serde_json::to_writer_pretty(&mut lock, envelope)?;
            lock.write_all(b"\n")?;
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "uplift_report=info,uplift_reporting=info,uplift_ingest=info".into()
            }),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let metrics = if cli.metrics {
        Some(metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    let config = load_config(&cli)?;
    info!(
        customer = %config.customer,
        audiences = ?config.audiences,
        revenue_event = %config.revenue_event,
        start = %config.dates.start,
        end = %config.dates.end,
        per_campaign = config.per_campaign_results,
        named_groups = config.groups.len(),
        "Configuration loaded"
    );

    let source = JsonLinesSource::new(&cli.data_dir);
    let report = generate_report(&config, &source)?;

    for row in &report.rows {
        if row.is_valid() {
            info!(
                partition = %row.label,
                test_users = row.test.n_users,
                control_users = row.control.n_users,
                incremental_revenue = row.uplift.incremental_revenue,
                iroas = row.uplift.iroas,
                p_value = row.significance.p_value,
                significant = row.significance.significant,
                "Partition result"
            );
        } else {
            warn!(partition = %row.label, flags = ?row.flags, "Partition result is undefined");
        }
    }

    let envelope = ReportEnvelope {
        run_id: Uuid::new_v4(),
        generated_at: Utc::now(),
        engine_version: env!("CARGO_PKG_VERSION"),
        report: &report,
    };
    write_report(&envelope, cli.output.as_deref())?;

    if let Some(handle) = metrics {
        eprintln!("{}", handle.render());
    }

    Ok(())
}
