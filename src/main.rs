use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use humantime_serde::re::humantime;
use querier::query::promql::leaf::{InMemoryLeafNodes, RawSeries};
use querier::query::promql::query::Query;
use querier::query::promql::response::ErrorResponse;
use querier::{EngineSettings, PromqlService, QueryError, SeriesRequest};

#[derive(Parser)]
#[command(name = "promsearch")]
#[command(about = "promsearch - PromQL queries over search-index samples")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: PromsearchCommands,
}

#[derive(Args, Debug)]
struct DataArgs {
    /// JSON fixture: `[{"metric": {...}, "points": [[ms, value], ...]}, ...]`
    #[arg(long)]
    data: PathBuf,
}

#[derive(Subcommand, Debug)]
enum PromsearchCommands {
    /// Evaluate an instant query
    Query {
        #[command(flatten)]
        data: DataArgs,
        query: String,
        /// Evaluation time in unix seconds, defaults to now
        #[arg(long)]
        time: Option<f64>,
    },
    /// Evaluate a range query
    QueryRange {
        #[command(flatten)]
        data: DataArgs,
        query: String,
        /// Unix seconds
        #[arg(long)]
        start: f64,
        /// Unix seconds
        #[arg(long)]
        end: f64,
        /// Step such as `30s` or `5m`, defaults to the configured step
        #[arg(long)]
        step: Option<String>,
        /// Calendar step (`day`, `week`, `month`, ...) instead of a fixed one
        #[arg(long, conflicts_with = "step")]
        calendar: Option<String>,
    },
    /// List the series matching `match[]` selectors
    Series {
        #[command(flatten)]
        data: DataArgs,
        #[arg(long = "match", required = true)]
        matchers: Vec<String>,
    },
    /// Label names carried by the result of a query
    Labels {
        #[command(flatten)]
        data: DataArgs,
        query: String,
    },
    #[command(flatten)]
    Common(CommonCommands),
}

fn seconds_to_ms(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn load_fixture(path: &Path, lookback: Duration) -> Result<InMemoryLeafNodes> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read fixture {}", path.display()))?;
    let series: Vec<RawSeries> = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse fixture {}", path.display()))?;
    log::info!("Loaded {} series from {}", series.len(), path.display());
    Ok(InMemoryLeafNodes::from_raw(lookback.as_millis() as i64, series))
}

fn build_service(config: &Configuration, data: &DataArgs) -> Result<PromqlService> {
    let settings = EngineSettings::from_config(&config.promql)
        .map_err(|err| anyhow::anyhow!("Invalid timezone {:?}: {err}", config.promql.timezone))?;
    let leaf = load_fixture(&data.data, config.promql.lookback_delta)?;
    Ok(PromqlService::new(Arc::new(leaf)).with_settings(settings))
}

/// Prints the Prometheus error envelope and turns the error into a failure.
fn report(err: QueryError) -> anyhow::Error {
    match serde_json::to_string(&ErrorResponse::from(&err)) {
        Ok(body) => println!("{body}"),
        Err(e) => log::error!("Failed to serialize error response: {e}"),
    }
    anyhow::anyhow!("query failed with status {}: {}", err.status(), err)
}

fn print_body(body: &[u8]) {
    println!("{}", String::from_utf8_lossy(body));
}

fn print_set(set: &BTreeSet<String>) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(set).context("Failed to serialize result")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load application configuration
    let config = utils::load_config(cli.common.config.as_ref())?;

    // Initialize logging based on CLI arguments and configuration
    utils::init_logging(&cli.common, &config);

    match cli.command {
        PromsearchCommands::Common(ref command) => utils::handle_common_command(command, &config),
        PromsearchCommands::Query { data, query, time } => {
            let service = build_service(&config, &data)?;
            let time = time.map(seconds_to_ms).unwrap_or_else(now_ms);
            let response = service
                .exec(Query::instant(query, time))
                .await
                .map_err(report)?;
            if let Some(body) = response.body {
                print_body(&body);
            }
            Ok(())
        }
        PromsearchCommands::QueryRange {
            data,
            query,
            start,
            end,
            step,
            calendar,
        } => {
            let service = build_service(&config, &data)?;
            let step = match step {
                Some(step) => humantime::parse_duration(&step)
                    .with_context(|| format!("Invalid step {step:?}"))?,
                None => config.promql.default_step,
            };
            let mut query = Query::range(
                query,
                seconds_to_ms(start),
                seconds_to_ms(end),
                step.as_millis() as i64,
            );
            if let Some(calendar) = calendar {
                query = query.with_calendar_interval(calendar);
            }
            let response = service.exec(query).await.map_err(report)?;
            if let Some(total) = response.response.series_total {
                log::info!("Result truncated to a page of {total} series");
            }
            if let Some(body) = response.body {
                print_body(&body);
            }
            Ok(())
        }
        PromsearchCommands::Series { data, matchers } => {
            let service = build_service(&config, &data)?;
            let (_, body) = service
                .series(&SeriesRequest {
                    matchers,
                    ..SeriesRequest::default()
                })
                .await
                .map_err(report)?;
            print_body(&body);
            Ok(())
        }
        PromsearchCommands::Labels { data, query } => {
            let service = build_service(&config, &data)?;
            let labels = service
                .get_labels(Query::instant(query, now_ms()))
                .await
                .map_err(report)?;
            print_set(&labels)
        }
    }
}
