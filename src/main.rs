//! # ip-annotate
//!
//! Reads access logs (files or standard input), annotates every line with
//! geo and whois data for its client address, and writes `<name>_out.csv`
//! plus a `<name>_summary.txt` count report per input.
//!
//! Usage:
//!   ip-annotate [OPTIONS] [INPUTS]...
//!   ip-annotate access.log other.log.gz
//!   zcat access.log.gz | ip-annotate --no-geo > annotated.csv

use clap::Parser;
use flate2::read::MultiGzDecoder;
use ip_annotate::lookup::{
    GeoDatabase, GeoField, GeoLookup, MaxMindDatabase, SharedWhois, WhoisClient, WhoisConfig,
    WhoisField, WhoisLookup,
};
use ip_annotate::{
    Annotator, CacheConfig, ExcludedLineOutput, FailurePolicy, MemoCache, NamedLookup,
    PipelineConfig, RunSummary,
};
use log::{info, warn};
use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ip-annotate")]
#[command(about = "Annotate access-log lines with whois and geo data", long_about = None)]
struct Cli {
    /// Input log files (`.gz` accepted); none or `-` reads standard input
    inputs: Vec<PathBuf>,

    /// Directory holding persisted lookup caches
    #[arg(long, default_value = ".")]
    cache_dir: PathBuf,

    /// New cache entries between automatic cache flushes
    #[arg(long, default_value_t = 25)]
    flush_interval: usize,

    /// Move a corrupt cache file aside and start empty instead of failing
    #[arg(long)]
    recover_corrupt_cache: bool,

    /// MaxMind city database (plain or gzip-compressed)
    #[arg(long, default_value = "GeoLite2-City.mmdb")]
    geo_db: PathBuf,

    /// Skip geo lookups
    #[arg(long)]
    no_geo: bool,

    /// Skip whois lookups
    #[arg(long)]
    no_whois: bool,

    /// Persist geo lookups in the cache directory as well
    #[arg(long)]
    persist_geo: bool,

    /// One combined `geo` column and one `whois` owner column instead of
    /// per-part country/state/city and customer/organization columns
    #[arg(long)]
    combined_columns: bool,

    /// Exclude lines containing MARKER (repeatable, replaces the defaults
    /// spider/bot/crawl; pass an empty marker to exclude nothing)
    #[arg(long = "exclude", value_name = "MARKER")]
    exclude: Vec<String>,

    /// Emit an empty row for excluded lines instead of dropping them
    #[arg(long)]
    keep_excluded: bool,

    /// Record the sentinel for failed lookups instead of aborting
    #[arg(long)]
    keep_going: bool,

    /// Value recorded when no result is available
    #[arg(long, default_value = "absent")]
    sentinel: String,

    /// Whois REST base URL
    #[arg(long, env = "IP_ANNOTATE_WHOIS_URL", default_value = "https://whois.arin.net/rest")]
    whois_url: String,

    /// Whois request timeout in seconds
    #[arg(long, default_value_t = 30)]
    whois_timeout: u64,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let lookups = build_lookups(&cli)?;
    if lookups.is_empty() {
        warn!("All lookups disabled; output carries extracted fields only");
    }

    let mut annotator = Annotator::new(pipeline_config(&cli), lookups);
    let outcome = run_inputs(&cli, &mut annotator);

    // Caches are flushed whether or not the run succeeded.
    annotator.close();
    outcome
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn pipeline_config(cli: &Cli) -> PipelineConfig {
    let defaults = PipelineConfig::default();
    PipelineConfig {
        exclusion_markers: if cli.exclude.is_empty() {
            defaults.exclusion_markers
        } else {
            cli.exclude.clone()
        },
        excluded_output: if cli.keep_excluded {
            ExcludedLineOutput::Blank
        } else {
            ExcludedLineOutput::Omit
        },
        failure_policy: if cli.keep_going {
            FailurePolicy::Degrade
        } else {
            FailurePolicy::Abort
        },
        sentinel: cli.sentinel.clone(),
    }
}

fn cache_config(cli: &Cli, name: &str) -> CacheConfig {
    CacheConfig::persistent(cli.cache_dir.join(format!("{}.cache.json", name)))
        .with_flush_interval(cli.flush_interval)
        .with_recover_corrupt(cli.recover_corrupt_cache)
}

/// Where a lookup column's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Geo(GeoField),
    Whois(WhoisField),
}

/// Lookup columns in output order.
fn column_layout(combined: bool) -> Vec<(&'static str, Column)> {
    if combined {
        vec![
            ("geo", Column::Geo(GeoField::Location)),
            ("whois", Column::Whois(WhoisField::Owner)),
            ("postal", Column::Geo(GeoField::Postal)),
        ]
    } else {
        vec![
            ("country", Column::Geo(GeoField::Country)),
            ("state", Column::Geo(GeoField::Region)),
            ("city", Column::Geo(GeoField::City)),
            ("postal", Column::Geo(GeoField::Postal)),
            ("customer", Column::Whois(WhoisField::Customer)),
            ("organization", Column::Whois(WhoisField::Organization)),
        ]
    }
}

/// One lookup per enabled column, each with its own cache. Whois caches are
/// always persisted; geo caches only with `--persist-geo`.
fn build_lookups(cli: &Cli) -> Result<Vec<NamedLookup>, Box<dyn Error>> {
    let geo_db: Option<Arc<dyn GeoDatabase>> = if cli.no_geo {
        None
    } else {
        Some(Arc::new(MaxMindDatabase::open(&cli.geo_db)?))
    };

    let whois: Option<Rc<SharedWhois>> = if cli.no_whois {
        None
    } else {
        let client = WhoisClient::new(WhoisConfig {
            base_url: cli.whois_url.clone(),
            timeout: Duration::from_secs(cli.whois_timeout),
            ..Default::default()
        })?;
        Some(SharedWhois::new(client))
    };

    let mut lookups = Vec::new();
    for (name, column) in column_layout(cli.combined_columns) {
        match column {
            Column::Geo(field) => {
                let Some(db) = &geo_db else { continue };
                let cache = if cli.persist_geo {
                    MemoCache::open(cache_config(cli, name))?
                } else {
                    MemoCache::in_memory()
                };
                lookups.push(NamedLookup::new(name, GeoLookup::new(db.clone(), field), cache));
            }
            Column::Whois(field) => {
                let Some(shared) = &whois else { continue };
                let cache = MemoCache::open(cache_config(cli, name))?;
                lookups.push(NamedLookup::new(
                    name,
                    WhoisLookup::new(shared.clone(), field),
                    cache,
                ));
            }
        }
    }

    Ok(lookups)
}

fn run_inputs(cli: &Cli, annotator: &mut Annotator) -> Result<(), Box<dyn Error>> {
    let stdin_only = [PathBuf::from("-")];
    let inputs: &[PathBuf] = if cli.inputs.is_empty() {
        &stdin_only
    } else {
        &cli.inputs
    };

    for input in inputs {
        if input.as_os_str() == "-" {
            let stdout = BufWriter::new(io::stdout().lock());
            let summary = annotator.process_stream(io::stdin().lock(), stdout)?;
            log_summary("<stdin>", &summary);
            summary.write_report(io::stderr().lock())?;
            continue;
        }

        let reader = open_input(input)?;
        let (out_path, summary_path) = output_paths(input);
        let writer = BufWriter::new(create_output(&out_path)?);

        let summary = annotator.process_stream(reader, writer)?;
        summary.write_report(BufWriter::new(create_output(&summary_path)?))?;

        log_summary(&input.display().to_string(), &summary);
        info!(
            "Wrote {} and {}",
            out_path.display(),
            summary_path.display()
        );
    }

    Ok(())
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>, String> {
    let file =
        File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;

    if path.extension().map_or(false, |ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn create_output(path: &Path) -> Result<File, String> {
    File::create(path).map_err(|e| format!("Failed to create {}: {}", path.display(), e))
}

/// `logs/access.log.gz` → (`logs/access_out.csv`, `logs/access_summary.txt`)
fn output_paths(input: &Path) -> (PathBuf, PathBuf) {
    let mut base = input.to_path_buf();
    if base.extension().map_or(false, |ext| ext == "gz") {
        base.set_extension("");
    }
    base.set_extension("");

    let with_suffix = |suffix: &str| {
        let mut name = base.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    };

    (with_suffix("_out.csv"), with_suffix("_summary.txt"))
}

fn log_summary(input: &str, summary: &RunSummary) {
    let totals = &summary.totals;
    info!(
        "{}: {} lines read, {} excluded, {} with IP, {} without IP, {} degraded lookups, {} records written",
        input,
        totals.lines_read,
        totals.excluded,
        totals.with_ip,
        totals.without_ip,
        totals.degraded_failures,
        totals.records_emitted
    );

    for (name, counters) in &summary.counters {
        info!("{}: {} distinct values", name, counters.len());
    }
}
