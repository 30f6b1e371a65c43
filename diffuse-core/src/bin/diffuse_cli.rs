//! Diffuse CLI - Preset resolution for the generation scheduler
//!
//! Commands: templates, resolve, select
//! Outputs JSON to stdout, logs to stderr
//! Returns 1 when configuration fails to load, 2 when resolution fails

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing::error;

use diffuse_core::{
    config::{DiffuseConfig, DEFAULT_CONFIG_PATH},
    telemetry::{self, LogFormat},
    GenerationJob, PresetCollection, PresetResolver, ResolveError,
};

#[derive(Parser)]
#[command(name = "diffuse-cli")]
#[command(about = "Diffuse CLI - Preset Composition Engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the default configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override configuration file, used instead of the default when it exists
    #[arg(long, env = "DIFFUSE_CONFIG_PATH")]
    override_config: Option<PathBuf>,

    /// Seed for reproducible output
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// List templates and the tag index
    Templates,

    /// Resolve one preset by name
    Resolve {
        /// Preset name
        #[arg(short, long)]
        preset: String,
    },

    /// Select presets by weight and resolve each
    Select {
        /// Number of payloads to produce
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init(LevelFilter::INFO, cli.log_format) {
        eprintln!("{e}");
    }

    let config = match DiffuseConfig::load(&cli.config, cli.override_config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            println!("{}", serde_json::json!({ "success": false, "error": e.to_string() }));
            return ExitCode::FAILURE;
        }
    };

    let collection = match PresetCollection::from_config(&config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            println!("{}", serde_json::json!({ "success": false, "error": e.to_string() }));
            return ExitCode::FAILURE;
        }
    };

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    match cli.command {
        Commands::Templates => {
            let registry = collection.engine().registry();
            let output = serde_json::json!({
                "templates": registry.names().collect::<Vec<_>>(),
                "tags": registry.tags(),
            });
            print_json(&output)
        }

        Commands::Resolve { preset } => {
            let Some(spec) = collection.find(&preset) else {
                let output = serde_json::json!({
                    "success": false,
                    "error": format!("Preset not found: {preset}"),
                });
                println!("{output}");
                return ExitCode::from(2);
            };

            let result = GenerationJob::resolve(PresetResolver::new(spec), collection.engine(), &mut rng);
            match result {
                Ok(job) => print_json(&serde_json::json!({ "success": true, "job": job })),
                Err(e) => report_failure(&e),
            }
        }

        Commands::Select { count } => {
            let jobs = match collection.resolve_batch(count, &mut rng) {
                Ok(jobs) => jobs,
                Err(e) => return report_failure(&e),
            };

            let mut failed = false;
            let results: Vec<_> = jobs
                .into_iter()
                .map(|job| match job {
                    Ok(job) => serde_json::json!({ "success": true, "job": job }),
                    Err(e) => {
                        failed = true;
                        error!(error = %e, "preset resolution failed");
                        serde_json::json!({ "success": false, "error": e.to_string() })
                    }
                })
                .collect();

            let code = print_json(&results);
            if failed {
                ExitCode::from(2)
            } else {
                code
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to serialize output");
            ExitCode::FAILURE
        }
    }
}

fn report_failure(e: &ResolveError) -> ExitCode {
    error!(error = %e, "resolution failed");
    let output = serde_json::json!({
        "success": false,
        "error": e.to_string(),
    });
    println!("{output}");
    ExitCode::from(2)
}
