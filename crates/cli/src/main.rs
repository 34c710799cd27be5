use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use platboot_core::PipelineConfig;
use platboot_kubehub::KubeStore;
use platboot_package::HelmInstaller;
use platboot_pipeline::{Collaborators, PipelineError, RunReport, StepOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

const EXIT_STEP_FAILED: u8 = 1;
const EXIT_INVALID_CONFIG: u8 = 2;
const EXIT_CANCELED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "platbootctl", version, about = "Bootstrap a cluster's app-delivery subsystem")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bootstrap pipeline against a cluster
    Bootstrap(BootstrapArgs),
    /// Print the effective configuration and exit
    Config(BootstrapArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct BootstrapArgs {
    /// Kubeconfig file (default: in-cluster or KUBECONFIG)
    #[arg(long, env = "PLATBOOT_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
    /// YAML pipeline config; flags override it
    #[arg(long = "config", env = "PLATBOOT_CONFIG")]
    config_file: Option<PathBuf>,
    /// Install the control operators
    #[arg(long, env = "PLATBOOT_INSTALL_OPERATORS")]
    install_operators: Option<bool>,
    /// Wait for the workload to become ready
    #[arg(long = "wait", env = "PLATBOOT_WAIT")]
    wait_for_readiness: Option<bool>,
    /// Target namespace
    #[arg(long, env = "PLATBOOT_NAMESPACE")]
    namespace: Option<String>,
    /// Operator to install, as name=version (repeatable; replaces the configured set)
    #[arg(long = "operator", value_parser = config::parse_kv)]
    operators: Vec<(String, String)>,
    /// Repository index entry, as name=url (repeatable; replaces the configured set)
    #[arg(long = "catalog", value_parser = config::parse_kv)]
    catalogs: Vec<(String, String)>,
    /// Directory of schema manifests (YAML, multi-document)
    #[arg(long, env = "PLATBOOT_SCHEMAS_DIR")]
    schemas_dir: Option<PathBuf>,
    /// Cancel the run after this many seconds
    #[arg(long = "deadline", env = "PLATBOOT_DEADLINE_SECS")]
    deadline_secs: Option<u64>,
}

impl BootstrapArgs {
    fn effective_config(&self) -> Result<PipelineConfig> {
        let mut cfg = match &self.config_file {
            Some(path) => config::load_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(v) = self.install_operators {
            cfg.install_operators = v;
        }
        if let Some(v) = self.wait_for_readiness {
            cfg.wait_for_readiness = v;
        }
        if let Some(ns) = &self.namespace {
            cfg.namespace = ns.clone();
        }
        if !self.operators.is_empty() {
            cfg.operator_versions = self.operators.iter().cloned().collect();
        }
        if !self.catalogs.is_empty() {
            cfg.repository_entries = self.catalogs.iter().cloned().collect();
        }
        if let Some(dir) = &self.schemas_dir {
            cfg.schemas = config::load_schemas(dir)?;
        }
        Ok(cfg)
    }
}

fn init_tracing() {
    let env = std::env::var("PLATBOOT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PLATBOOT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PLATBOOT_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancel `token` on Ctrl-C and, when set, once the deadline passes.
fn spawn_cancellers(token: &CancellationToken, deadline: Option<Duration>) {
    let t = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; canceling bootstrap");
            t.cancel();
        }
    });
    if let Some(d) = deadline {
        let t = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(d) => {
                    warn!(deadline = ?d, "deadline reached; canceling bootstrap");
                    t.cancel();
                }
                _ = t.cancelled() => {}
            }
        });
    }
}

fn print_report(output: Output, report: &RunReport) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Output::Human => {
            for s in &report.steps {
                let status = match &s.outcome {
                    StepOutcome::Succeeded => "ok".to_string(),
                    StepOutcome::Skipped => "skipped".to_string(),
                    StepOutcome::Failed { error } => format!("FAILED: {}", error),
                };
                println!("{:<28} {:>8}ms  {}", s.step, s.duration_ms, status);
            }
        }
    }
    Ok(())
}

async fn bootstrap(output: Output, args: BootstrapArgs) -> Result<ExitCode> {
    let cfg = match args.effective_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("invalid config: {:#}", e);
            return Ok(ExitCode::from(EXIT_INVALID_CONFIG));
        }
    };
    let store = Arc::new(KubeStore::connect(args.kubeconfig.as_deref()).await?);
    let installer = Arc::new(HelmInstaller::new(args.kubeconfig.clone())?);
    let collab = Collaborators { store: store.clone(), installer, workloads: store };

    let cancel = CancellationToken::new();
    spawn_cancellers(&cancel, args.deadline_secs.map(Duration::from_secs));

    info!(namespace = %cfg.namespace, install_operators = cfg.install_operators, wait = cfg.wait_for_readiness, "bootstrap invoked");
    let (report, res) = platboot_pipeline::run_with_report(cfg, collab, cancel).await;
    print_report(output, &report)?;
    let code = match res {
        Ok(()) => {
            info!(run_id = %report.run_id, "bootstrap complete");
            ExitCode::SUCCESS
        }
        Err(e @ PipelineError::InvalidConfig(_)) => {
            eprintln!("{}", e);
            ExitCode::from(EXIT_INVALID_CONFIG)
        }
        Err(e) if e.is_canceled() => {
            eprintln!("{}", e);
            ExitCode::from(EXIT_CANCELED)
        }
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            eprintln!("{}", e);
            ExitCode::from(EXIT_STEP_FAILED)
        }
    };
    Ok(code)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Bootstrap(args) => bootstrap(cli.output, args).await,
        Commands::Config(args) => {
            let cfg = args.effective_config()?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
                Output::Human => print!("{}", serde_yaml::to_string(&cfg)?),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
