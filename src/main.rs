//! vvtest CLI - dependency-aware test harness.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vvtest::command::{ExecMode, RecordCommandBuilder};
use vvtest::config::{self, Config};
use vvtest::depend::WordExpression;
use vvtest::orchestrator::{
    ExecOptions, ExecutionDriver, ExecutionHandler, InfoPrinter, TestExecutionList,
};
use vvtest::platform::{LocalPlatform, ResourceManager};
use vvtest::report::{ConsoleReporter, JUnitReporter, MultiReporter, ResultsLog, TestReport};
use vvtest::testlist::TestList;

#[derive(Parser)]
#[command(name = "vvtest")]
#[command(about = "Verification and validation test harness", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, default_value = "vvtest.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tests of a manifest
    Run {
        /// Test manifest (TOML)
        manifest: PathBuf,

        /// Number of processors to use
        #[arg(short = 'j', long)]
        num_procs: Option<u32>,

        /// Keyword expression selecting tests, e.g. "fast and not long"
        #[arg(short, long)]
        keywords: Option<String>,

        /// Keyword group, e.g. "key1/key2" or "!long"; repeated groups must all hold
        #[arg(short = 'K', long = "keyword-group", action = ArgAction::Append)]
        keyword_groups: Vec<String>,

        /// Regenerate baselines instead of running tests
        #[arg(long)]
        baseline: bool,

        /// Run only the analysis sections of tests
        #[arg(short, long)]
        analyze: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// List the tests of a manifest without running them
    List {
        /// Test manifest (TOML)
        manifest: PathBuf,

        /// Keyword expression selecting tests
        #[arg(short, long)]
        keywords: Option<String>,

        /// Keyword group; repeated groups must all hold
        #[arg(short = 'K', long = "keyword-group", action = ArgAction::Append)]
        keyword_groups: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            manifest,
            num_procs,
            keywords,
            keyword_groups,
            baseline,
            analyze,
            junit,
        } => {
            let opts = RunArgs {
                manifest,
                num_procs,
                filter: KeywordFilter {
                    expression: keywords,
                    groups: keyword_groups,
                },
                baseline,
                analyze,
                junit,
            };
            run_tests(&cli.config, opts, cli.verbose).await
        }
        Commands::List {
            manifest,
            keywords,
            keyword_groups,
            format,
        } => {
            let filter = KeywordFilter {
                expression: keywords,
                groups: keyword_groups,
            };
            list_tests(&cli.config, &manifest, &filter, format)
        }
        Commands::Validate => validate_config(&cli.config),
    }
}

struct RunArgs {
    manifest: PathBuf,
    num_procs: Option<u32>,
    filter: KeywordFilter,
    baseline: bool,
    analyze: bool,
    junit: Option<PathBuf>,
}

/// Loads the configuration; a missing file means all defaults.
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        debug!("{} not found, using defaults", path.display());
        return Ok(Config::default());
    }
    let config = config::load_config(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Keyword selection from `-k` and `-K`; both must hold when given.
struct KeywordFilter {
    expression: Option<String>,
    groups: Vec<String>,
}

fn load_tests(manifest: &Path, filter: &KeywordFilter) -> Result<TestList> {
    let mut tlist = TestList::load_manifest(manifest)
        .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
    if let Some(expr) = &filter.expression {
        let expr = WordExpression::parse(expr)
            .with_context(|| format!("Invalid keyword expression: {}", expr))?;
        tlist.apply_keyword_filter(&expr);
    }
    if !filter.groups.is_empty() {
        let expr = WordExpression::from_keyword_groups(&filter.groups)
            .with_context(|| format!("Invalid keyword groups: {}", filter.groups.join(" ")))?;
        tlist.apply_keyword_filter(&expr);
    }
    Ok(tlist)
}

async fn run_tests(config_path: &Path, args: RunArgs, verbose: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    if args.analyze {
        config.vvtest.analyze_only = true;
    }
    if config.vvtest.test_dir.is_relative() {
        config.vvtest.test_dir = std::env::current_dir()?.join(&config.vvtest.test_dir);
    }

    let mut tlist = load_tests(&args.manifest, &args.filter)?;
    let platform = LocalPlatform::from_config(&config.platform, args.num_procs);
    tlist.apply_max_procs(platform.max_procs());

    let mode = if args.baseline {
        ExecMode::Baseline
    } else {
        ExecMode::Normal
    };
    let handler = ExecutionHandler::new(
        ExecOptions::from_config(&config.vvtest, mode),
        Arc::new(RecordCommandBuilder),
    );
    let xlist = TestExecutionList::new(tlist, handler)?;

    let reporter = create_reporter(&config, args.junit, mode, verbose);
    let driver = ExecutionDriver::new(xlist, Box::new(platform), reporter)
        .with_tick(Duration::from_millis(config.vvtest.tick_millis.max(1)))
        .with_info_printer(InfoPrinter::from_stdin())
        .with_signal_handling();

    let mut log = ResultsLog::new();
    let result = driver.run(&mut log).await?;

    if let Some(name) = &config.report.results_json {
        log.write_json(&config.report.output_dir.join(name))?;
    }

    std::process::exit(result.exit_code());
}

fn list_tests(config_path: &Path, manifest: &Path, filter: &KeywordFilter, format: Format) -> Result<()> {
    let config = load_config(config_path)?;
    let mut tlist = load_tests(manifest, filter)?;
    tlist.apply_max_procs(LocalPlatform::from_config(&config.platform, None).max_procs());

    match format {
        Format::Json => {
            let reports: Vec<TestReport> = tlist.cases().iter().map(TestReport::from_case).collect();
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Format::Text => {
            println!("Found {} tests:", tlist.len());
            for case in tlist.cases() {
                let status = case.status();
                let note = match status.skip_reason() {
                    Some(reason) => format!(" (skipped: {})", reason),
                    None => String::new(),
                };
                println!(
                    "  {:<8} {}{}",
                    status.result_status().as_str(),
                    case.record().execute_directory(),
                    note
                );
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Test directory: {}", config.vvtest.test_dir.display());
            println!("  Tick: {}ms", config.vvtest.tick_millis);
            println!("  Interrupt to kill: {}s", config.vvtest.interrupt_to_kill_secs);
            println!("  Baseline timeout: {}s", config.vvtest.baseline_timeout_secs);
            println!("  Post-clean: {}", config.vvtest.postclean);
            println!("  Platform: {}", config.platform.name());

            let platform = LocalPlatform::from_config(&config.platform, None);
            println!("  Processors: {} (max {} per test)", platform.num_procs(), platform.max_procs());

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn create_reporter(
    config: &Config,
    junit_override: Option<PathBuf>,
    mode: ExecMode,
    verbose: bool,
) -> MultiReporter {
    let mut multi = MultiReporter::new();

    multi = multi.with_reporter(ConsoleReporter::new(verbose));

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(
            JUnitReporter::new(junit_path, config.vvtest.test_dir.clone())
                .with_log_file(mode.log_file_name()),
        );
    }

    multi
}
