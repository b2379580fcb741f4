mod clock;
mod collector;
mod config;
mod exporter;
mod fetcher;
mod logging;
mod params;
mod query;
mod signals;
mod source;
mod template;
mod value;

use clap::Parser;
use collector::{Collector, CollectorConfig};
use config::{Config, Overrides};
use fetcher::Registry;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Runs templated SQL queries against a database and posts each result row
/// as service metrics.
#[derive(Parser, Debug)]
#[command(name = "sql-metric-collector", version, about)]
pub struct Cli {
    /// Config file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data source name, e.g. sqlite:///var/lib/app.db
    #[arg(long, env = "DSN")]
    dsn: Option<String>,

    /// Service that receives metrics of queries without their own
    #[arg(long, env = "DEFAULT_SERVICE", value_name = "NAME")]
    default_service: Option<String>,

    /// Maximum number of concurrent queries
    #[arg(long, env = "MAX_CONCURRENCY", value_name = "NUMBER")]
    max_concurrency: Option<usize>,

    /// Query YAML file (default: stdin)
    #[arg(long, env = "QUERY_FILE", value_name = "FILENAME")]
    query_file: Option<String>,

    /// Mackerel API key
    #[arg(long = "mackerel-apikey", env = "MACKEREL_APIKEY", value_name = "APIKEY", hide_env_values = true)]
    mackerel_apikey: Option<String>,

    /// Mackerel API base URL
    #[arg(long = "mackerel-apibase", env = "MACKEREL_APIBASE", value_name = "URL")]
    mackerel_apibase: Option<String>,

    /// Exporter backend [mackerel, stdout]
    #[arg(long, env = "EXPORTER", value_name = "BACKEND")]
    exporter: Option<String>,

    /// Log format [console, json]
    #[arg(long, env = "LOG_FORMAT", value_name = "FORMAT")]
    log_format: Option<String>,

    /// Log level [trace, debug, info, warn, error]
    #[arg(long, env = "LOG_LEVEL", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate config and queries, print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            dsn: self.dsn.clone(),
            default_service: self.default_service.clone(),
            max_concurrency: self.max_concurrency,
            query_file: self.query_file.clone(),
            mackerel_apikey: self.mackerel_apikey.clone(),
            mackerel_apibase: self.mackerel_apibase.clone(),
            exporter: self.exporter.clone(),
            log_format: self.log_format.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        if tracing::dispatcher::has_been_set() {
            tracing::error!(error = %e, "failed to execute");
        } else {
            eprintln!("sql-metric-collector: {e}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.merge(cli.overrides());
    config.validate()?;

    logging::init(&config.log_format, &config.log_level).map_err(|e| e.to_string())?;
    tracing::debug!(?cli, "parsed CLI arguments");

    let registry = Registry::builtin()?;
    config.load(&registry).await?;

    let queries = load_queries(&registry, &config.query_file).await?;

    if cli.dry_run {
        println!("sql-metric-collector v{}", env!("CARGO_PKG_VERSION"));
        println!("exporter:        {}", config.exporter);
        println!("default service: {}", config.default_service);
        println!("max concurrency: {}", config.max_concurrency);
        println!("queries:         {}", queries.len());
        println!("Dry run mode, config validated, not running.");
        return Ok(());
    }

    let exporter = exporter::build(
        &config.exporter,
        &config.mackerel_apikey,
        &config.mackerel_apibase,
    )?;
    let source = source::open(&config.dsn, config.max_concurrency).await?;

    let cancel = CancellationToken::new();
    signals::install(cancel.clone())?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        queries = queries.len(),
        "start sql-metric-collector"
    );

    let collector = Collector::new(
        CollectorConfig {
            max_concurrency: config.max_concurrency,
            default_service: config.default_service.clone(),
        },
        source,
        exporter,
    )
    .with_cancel(cancel);
    collector.run(queries).await?;

    Ok(())
}

/// Read the query YAML from `location`, or from stdin when it is empty.
async fn load_queries(
    registry: &Registry,
    location: &str,
) -> Result<Vec<query::QuerySpec>, Box<dyn std::error::Error>> {
    let yaml = if location.is_empty() {
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        String::from_utf8(registry.read_location(location).await?)?
    };
    Ok(query::parse_queries(&yaml)?)
}
