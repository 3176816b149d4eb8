use anyhow::{Context, Result};
use citypipe::config::PipelineConfig;
use citypipe::db::{DatabaseAdapter, SqliteAdapter};
use citypipe::events::{CounterKind, Event, EventType};
use citypipe::models::TypeTag;
use citypipe::pipeline::Pipeline;
use citypipe::records::{
    CityObjectSource, ImportedObject, JsonLinesSource, RecordExporter, RecordImporter,
};
use citypipe::sink::JsonLinesSink;
use citypipe::stats::{RunReport, RunStatus};
use citypipe::xlink::{LocalAssetFetcher, ResolverRegistry};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "citypipe")]
#[command(about = "Import and export 3D city models between JSON lines and SQLite")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a JSON-lines file into the database
    Import(ImportArgs),
    /// Export stored city objects as JSON lines
    Export(ExportArgs),
}

#[derive(Args)]
struct RunArgs {
    /// SQLite database file
    #[arg(short, long)]
    database: PathBuf,

    /// JSON pipeline configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of primary workers (overrides the config file)
    #[arg(long)]
    workers: Option<usize>,

    /// Number of xlink workers (overrides the config file)
    #[arg(long)]
    xlink_workers: Option<usize>,
}

#[derive(Args)]
struct ImportArgs {
    /// Input JSON-lines file
    #[arg(short, long)]
    input: PathBuf,

    /// Directory relative asset URIs are resolved against (defaults to the
    /// input file's directory)
    #[arg(long)]
    assets_dir: Option<PathBuf>,

    /// Write one line per stored object to this file
    #[arg(long)]
    log: Option<PathBuf>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct ExportArgs {
    /// Output JSON-lines file
    #[arg(short, long)]
    output: PathBuf,

    /// Only export objects of this type
    #[arg(long = "type")]
    type_tag: Option<TypeTag>,

    #[command(flatten)]
    run: RunArgs,
}

fn load_config(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(xlink_workers) = args.xlink_workers {
        config.xlink_workers = xlink_workers;
    }
    config.validate()?;
    Ok(config)
}

fn adapter(args: &RunArgs, config: &PipelineConfig) -> Arc<dyn DatabaseAdapter> {
    Arc::new(
        SqliteAdapter::new(&args.database)
            .with_batch_size(config.max_batch_size)
            .with_busy_timeout(Duration::from_millis(config.busy_timeout_ms)),
    )
}

fn make_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} {pos} units ({per_sec})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(msg.to_string());
    pb
}

/// Advances `pb` from the run's counter events.
fn with_progress(pipeline: Pipeline, pb: &ProgressBar) -> Pipeline {
    let pb = pb.clone();
    pipeline.on_event(EventType::Counter, move |event| {
        if let Event::Counter {
            kind: CounterKind::Units,
            delta,
        } = event
        {
            pb.inc(*delta);
        }
    })
}

fn run_import(args: ImportArgs) -> Result<RunReport> {
    let config = load_config(&args.run)?;
    let adapter = adapter(&args.run, &config);
    let assets_dir = match args.assets_dir {
        Some(dir) => dir,
        None => args
            .input
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    info!(input = %args.input.display(), assets = %assets_dir.display(), "Importing");

    let mut source = JsonLinesSource::new(&args.input).with_first_sequence(config.first_sequence);
    let pb = make_spinner("Importing");
    let pipeline = Pipeline::new(config, adapter)?
        .with_resolvers(ResolverRegistry::with_defaults(LocalAssetFetcher::new(assets_dir)));
    let pipeline = with_progress(pipeline, &pb);

    let out: Box<dyn Write + Send> = match &args.log {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(io::sink()),
    };
    let sink = JsonLinesSink::<_, ImportedObject>::new(out);
    let (report, _sink) = pipeline.run(&mut source, |_| RecordImporter::new(), sink)?;
    pb.finish_and_clear();
    Ok(report)
}

fn run_export(args: ExportArgs) -> Result<RunReport> {
    let config = load_config(&args.run)?;
    let adapter = adapter(&args.run, &config);
    info!(output = %args.output.display(), "Exporting");

    let mut source = CityObjectSource::new(Arc::clone(&adapter))
        .with_type(args.type_tag)
        .with_first_sequence(config.first_sequence);
    let out = File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;

    let pb = make_spinner("Exporting");
    let pipeline = with_progress(Pipeline::new(config, adapter)?, &pb);
    let (report, sink) = pipeline.run(&mut source, |_| RecordExporter::new(), JsonLinesSink::new(out))?;
    sink.into_inner()?.sync_all()?;
    pb.finish_and_clear();
    Ok(report)
}

fn print_summary(report: &RunReport) {
    let stats = &report.stats;
    println!();
    println!("=== Summary ===");
    println!("Total time:           {:.2}s", report.elapsed.as_secs_f64());
    println!();
    println!("Units processed:      {}", stats.units_processed);
    println!("Objects written:      {}", stats.objects_written);
    println!("Units filtered:       {}", stats.units_filtered);
    println!("Units failed:         {}", stats.units_failed);
    println!("Geometries:           {}", stats.geometries);
    println!("References deferred:  {}", stats.references_deferred);
    println!("References resolved:  {}", stats.references_resolved);
    println!("References skipped:   {}", stats.references_skipped);
    println!("Ids drained to disk:  {}", report.ids_drained);
    for (type_tag, count) in &stats.objects_by_type {
        println!("  {:<20}{count}", format!("{type_tag}:"));
    }
    if let RunStatus::Aborted { cause } = &report.status {
        println!();
        println!("Run ABORTED: {cause}");
        println!(
            "The operation did not complete; {} buffered results after the last contiguous one were discarded.",
            report.discarded
        );
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let result = match cli.command {
        Commands::Import(args) => run_import(args),
        Commands::Export(args) => run_export(args),
    };

    match result {
        Ok(report) => {
            print_summary(&report);
            if report.is_completed() {
                info!("Completed successfully");
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
