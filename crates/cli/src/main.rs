use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use converge_apply::parse_manifests;
use converge_controller::{ControllerConfig, KustomizeCommand, Reconciler, Scheduler};
use converge_health::ReadinessTable;
use converge_kubehub::{discover_into, watch_units, ArtifactSource, KubeCluster, KubeCredentials, KubeStatusWriter};
use converge_postbuild::{DataKey, Options, Vars};
use converge_schema::TypeRegistry;
use converge_store::spawn_ingest;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "converge", version, about = "Kustomization controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch Kustomizations and reconcile them until interrupted
    Run(RunArgs),
    /// Decrypt and substitute a local manifest file, then print it
    Build(BuildArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Only watch units in this namespace (default: all namespaces)
    #[arg(long = "namespace", env = "CONVERGE_NAMESPACE")]
    namespace: Option<String>,
    #[arg(long = "field-manager", env = "CONVERGE_FIELD_MANAGER")]
    field_manager: Option<String>,
    /// Directory source artifacts are unpacked under
    #[arg(long = "storage-root", env = "CONVERGE_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,
    #[arg(long = "kustomize-bin", env = "CONVERGE_KUSTOMIZE_BIN")]
    kustomize_bin: Option<PathBuf>,
    /// Fail substitution on variables without a value or default
    #[arg(long = "strict", action = ArgAction::SetTrue)]
    strict: bool,
}

impl RunArgs {
    fn merge(&self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(fm) = &self.field_manager {
            config.field_manager = fm.clone();
        }
        if let Some(root) = &self.storage_root {
            config.storage_root = root.clone();
        }
        if let Some(bin) = &self.kustomize_bin {
            config.kustomize_bin = bin.clone();
        }
        if self.strict {
            config.strict_substitution = true;
        }
        config
    }
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Multi-document YAML file
    file: PathBuf,
    /// Substitution variable, repeatable
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    vars: Vec<(String, String)>,
    /// File holding a sops data key (32 raw bytes or base64), repeatable
    #[arg(long = "key-file")]
    key_files: Vec<PathBuf>,
    #[arg(long = "strict", action = ArgAction::SetTrue)]
    strict: bool,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (k, v) = raw.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if !converge_postbuild::subst::is_valid_name(k) {
        return Err(format!("invalid variable name '{}'", k));
    }
    Ok((k.to_string(), v.to_string()))
}

fn init_tracing() {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            run_controller(args).await
        }
        Commands::Build(args) => build(args, cli.output),
    }
}

async fn run_controller(args: RunArgs) -> Result<()> {
    let config = args.merge(ControllerConfig::from_env());
    info!(ns = ?args.namespace, field_manager = %config.field_manager, storage = %config.storage_root.display(), "starting controller");

    let kube_config = kube::Config::infer().await.context("loading cluster configuration")?;
    let client = kube::Client::try_from(kube_config.clone()).context("building cluster client")?;

    let registry = Arc::new(TypeRegistry::with_builtins());
    match discover_into(client.clone(), &registry).await {
        Ok(n) => info!(types = n, "API discovery complete"),
        Err(e) => warn!(error = %e, "API discovery failed; continuing with built-in types"),
    }

    let local = KubeCluster::new(client.clone(), Arc::clone(&registry), config.field_manager.clone());
    let source = ArtifactSource::new(local.clone(), config.storage_root.clone());
    let renderer = KustomizeCommand::new(config.kustomize_bin.clone());
    let credentials =
        KubeCredentials::new(client.clone(), kube_config, Arc::clone(&registry), config.field_manager.clone());
    let status = KubeStatusWriter::new(client.clone());
    let cap = config.queue_capacity;

    let reconciler = Arc::new(Reconciler::new(
        config,
        Arc::new(local),
        Arc::new(source),
        Arc::new(renderer),
        Arc::new(credentials),
        Arc::new(status),
        registry,
        Arc::new(ReadinessTable::with_builtins()),
    ));

    let (ingest_tx, store) = spawn_ingest(cap);
    let mut watcher = tokio::spawn({
        let tx = ingest_tx.clone();
        let ns = args.namespace.clone();
        async move { watch_units(client, ns.as_deref(), tx).await }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(reconciler, store).with_feedback(ingest_tx.clone());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            Ok(())
        }
        res = &mut watcher => match res {
            Ok(Ok(())) => Err(anyhow!("unit watch ended")),
            Ok(Err(e)) => {
                error!(error = ?e, "unit watcher failed");
                Err(e)
            }
            Err(e) => Err(anyhow!("unit watcher task aborted: {}", e)),
        },
    };

    let _ = shutdown_tx.send(true);
    watcher.abort();
    drop(ingest_tx);
    if let Err(e) = scheduler_task.await {
        warn!(error = %e, "scheduler task did not stop cleanly");
    }
    outcome
}

fn build(args: BuildArgs, output: Output) -> Result<()> {
    let manifests = std::fs::read(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    let vars: Vars = args.vars.into_iter().collect();
    let keys = args
        .key_files
        .iter()
        .map(|p| {
            let raw = std::fs::read(p).with_context(|| format!("reading {}", p.display()))?;
            DataKey::from_bytes(&raw).with_context(|| format!("loading data key {}", p.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let opts = Options {
        keys: if keys.is_empty() { None } else { Some(keys.as_slice()) },
        vars: if vars.is_empty() && !args.strict { None } else { Some(&vars) },
        strict: args.strict,
    };
    let out = converge_postbuild::process(&manifests, &opts).with_context(|| format!("building {}", args.file.display()))?;

    match output {
        Output::Human => print!("{}", String::from_utf8_lossy(&out)),
        Output::Json => {
            let objects = parse_manifests(&out, &converge_apply::ManifestLimits::from_env())?;
            println!("{}", serde_json::to_string_pretty(&objects)?);
        }
    }
    Ok(())
}
