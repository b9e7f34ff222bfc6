use siderail_cli::config::ShowmapConfig;
use siderail_cli::executor::ForkServerExecutor;
use siderail_cli::report::{ExtractReport, TraceReport};

use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Target command line, split on whitespace. Overrides the config.
    #[clap(long)]
    target_command: Option<String>,
    #[clap(short, long)]
    timeout_ms: Option<u64>,
    #[clap(long)]
    persistent: bool,
    /// Report the operands of this comparison id instead of the coverage map.
    #[clap(long)]
    extract_branch: Option<i32>,
    #[clap(long)]
    json: bool,
    /// Input files. Reads a single input from stdin when none are given.
    inputs: Vec<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<ShowmapConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            ShowmapConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("siderail.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                ShowmapConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file specified and default 'siderail.toml' not found, using built-in defaults.");
                ShowmapConfig::for_command(Vec::new())
            }
        }
    };

    if let Some(target_cmd_str) = &cli.target_command {
        config.executor.command = target_cmd_str.split_whitespace().map(str::to_string).collect();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.executor.timeout_ms = timeout_ms;
    }
    if cli.persistent {
        config.runtime.persistent = true;
    }
    if cli.extract_branch.is_some() && config.runtime.persistent {
        anyhow::bail!("--extract-branch needs a fresh child per input; disable persistent mode");
    }

    config.validate()?;
    Ok(config)
}

fn read_inputs(paths: &[PathBuf]) -> Result<Vec<(String, Vec<u8>)>, anyhow::Error> {
    if paths.is_empty() {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        return Ok(vec![("<stdin>".to_string(), data)]);
    }
    paths
        .iter()
        .map(|path| {
            let data = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read input {:?}: {}", path, e))?;
            Ok((path.display().to_string(), data))
        })
        .collect()
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!("Effective configuration: {config:?}");

    let inputs = read_inputs(&cli.inputs)?;
    let mut executor = ForkServerExecutor::spawn(&config)?;

    for (name, data) in &inputs {
        let rendered = match cli.extract_branch {
            Some(branch) => {
                let (run, capture) = executor.run_extract(data, branch)?;
                let report = ExtractReport::new(name.as_str(), branch, &run, capture);
                if cli.json {
                    serde_json::to_string(&report)?
                } else {
                    report.render_text()
                }
            }
            None => {
                let run = executor.run(data)?;
                let report = TraceReport::new(name.as_str(), &run, executor.map());
                if cli.json {
                    serde_json::to_string(&report)?
                } else {
                    format!(
                        "# {} status={:?} tuples={} md5={}\n{}",
                        report.input,
                        report.status,
                        report.tuples.len(),
                        report.digest,
                        report.render_text()
                    )
                }
            }
        };
        println!("{}", rendered.trim_end());
    }

    Ok(())
}
