use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use registry_ingest::query::{lookup, table_counts};
use registry_ingest::{
    discover_xml_files, IngestConfig, LogProgress, Pipeline, SamplingConfig, SqliteStore, VERSION,
};

const DEFAULT_DB_PATH: &str = "abn.db";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_tracing(verbose);

    match args.first().map(String::as_str) {
        Some("import") => run_import(&args[1..]),
        Some("stats") => run_stats(&args[1..]),
        Some("lookup") => run_lookup(&args[1..]),
        Some("--version") => {
            println!("registry-ingest {}", VERSION);
            Ok(())
        }
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .init();
}

fn print_usage() {
    println!("registry-ingest {}", VERSION);
    println!();
    println!("USAGE:");
    println!("  registry-ingest import <file.xml|dir>... [--db PATH] [--batch-size N]");
    println!("                         [--sample-size N | --full] [--continue-on-failure] [--verbose]");
    println!("  registry-ingest stats [--db PATH]");
    println!("  registry-ingest lookup <ABN> [--db PATH]");
}

/// Flags shared by every subcommand, plus positional arguments
struct CliArgs {
    db_path: PathBuf,
    batch_size: Option<usize>,
    sample_size: Option<usize>,
    full: bool,
    continue_on_failure: bool,
    positional: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut cli = CliArgs {
        db_path: PathBuf::from(DEFAULT_DB_PATH),
        batch_size: None,
        sample_size: None,
        full: false,
        continue_on_failure: false,
        positional: Vec::new(),
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--db" => cli.db_path = PathBuf::from(iter.next().context("--db needs a path")?),
            "--batch-size" => {
                let value = iter.next().context("--batch-size needs a number")?;
                cli.batch_size = Some(value.parse().with_context(|| format!("invalid batch size '{}'", value))?);
            }
            "--sample-size" => {
                let value = iter.next().context("--sample-size needs a number")?;
                cli.sample_size = Some(value.parse().with_context(|| format!("invalid sample size '{}'", value))?);
            }
            "--full" => cli.full = true,
            "--continue-on-failure" => cli.continue_on_failure = true,
            "--verbose" | "-v" => {}
            flag if flag.starts_with("--") => bail!("unknown flag {}", flag),
            value => cli.positional.push(value.to_string()),
        }
    }

    Ok(cli)
}

fn ingest_config(cli: &CliArgs) -> IngestConfig {
    let sampling = if cli.full {
        SamplingConfig::unlimited()
    } else {
        cli.sample_size
            .map(SamplingConfig::limited)
            .unwrap_or_default()
    };

    let mut config = IngestConfig::default()
        .with_sampling(sampling)
        .with_halt_on_batch_failure(!cli.continue_on_failure);
    if let Some(batch_size) = cli.batch_size {
        config = config.with_batch_size(batch_size);
    }
    config
}

fn run_import(args: &[String]) -> Result<()> {
    let cli = parse_args(args)?;
    if cli.positional.is_empty() {
        bail!("import needs at least one XML file or directory");
    }
    let config = ingest_config(&cli);

    println!("🗄️  ABR Import - XML → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Collect files
    println!("\n📂 Collecting XML files...");
    let mut files = Vec::new();
    for input in &cli.positional {
        let path = Path::new(input);
        if path.is_dir() {
            files.extend(discover_xml_files(path)?);
        } else {
            files.push(path.to_path_buf());
        }
    }
    if files.is_empty() {
        bail!("no XML files found");
    }
    println!("✓ Found {} XML files", files.len());
    if config.sampling.limited {
        println!("  Limited mode: stopping after {} records (use --full for everything)", config.sampling.sample_size);
    }

    // 2. Open database
    println!("\n🔧 Setting up database...");
    let store = SqliteStore::open(&cli.db_path, config.call_timeout)
        .with_context(|| format!("Failed to open database {}", cli.db_path.display()))?;
    println!("✓ Database initialized with WAL mode: {}", cli.db_path.display());

    // 3. Ingest
    println!("\n💾 Ingesting records...");
    let mut pipeline = Pipeline::new(config, store)?;
    let summary = pipeline.run(&files, &mut LogProgress)?;

    // 4. Report
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Run {}", summary.run_id);
    println!("✓ Files processed:   {}", summary.files_processed);
    println!("✓ Records accepted:  {}", summary.records_accepted);
    println!("✓ Records skipped:   {}", summary.records_skipped);
    println!("✓ Records persisted: {} in {} batches", summary.records_persisted, summary.batches_persisted);
    if let Some(ms) = summary.duration_ms() {
        println!("✓ Duration:          {:.1}s", Duration::from_millis(ms.max(0) as u64).as_secs_f64());
    }
    if summary.sample_reached {
        println!("ℹ️  Sample size reached, remaining input was not read");
    }

    for failure in &summary.document_failures {
        eprintln!("❌ {}: {}", failure.source_name, failure.error);
    }
    for failure in &summary.batch_failures {
        eprintln!("❌ Batch at offset {}: {}", failure.offset, failure.error);
    }

    if summary.is_success() {
        println!("🎉 Import complete!");
        Ok(())
    } else if summary.halted {
        bail!("import halted after a failed batch");
    } else {
        bail!(
            "import finished with {} document failures and {} batch failures",
            summary.document_failures.len(),
            summary.batch_failures.len()
        );
    }
}

fn open_existing(cli: &CliArgs) -> Result<SqliteStore> {
    if !cli.db_path.exists() {
        eprintln!("❌ Database not found!");
        eprintln!("   Run: registry-ingest import <dir> --db {}", cli.db_path.display());
        std::process::exit(1);
    }
    SqliteStore::open(&cli.db_path, IngestConfig::default().call_timeout)
        .with_context(|| format!("Failed to open database {}", cli.db_path.display()))
}

fn run_stats(args: &[String]) -> Result<()> {
    let cli = parse_args(args)?;
    let store = open_existing(&cli)?;

    println!("📊 {}", cli.db_path.display());
    for count in table_counts(store.connection())? {
        println!("  {:<20} {:>12}", count.table, count.rows);
    }
    Ok(())
}

fn run_lookup(args: &[String]) -> Result<()> {
    let cli = parse_args(args)?;
    let abn = cli.positional.first().context("lookup needs an ABN")?;
    let store = open_existing(&cli)?;

    match lookup(store.connection(), abn)? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => bail!("ABN {} not found", abn),
    }
}
