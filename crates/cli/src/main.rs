use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tollgate_core::ServerConfig;
use tollgate_kubehub::{ClusterApi, KubeCluster};
use tollgate_render::{RateLimitRender, Render, ResourceRender};
use tollgate_runner::RunnerManager;
use tracing::{error, info, warn};

mod pipeline;
mod provider;

#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about = "Tollgate proxy infrastructure controller")]
struct Cli {
    /// Server configuration (YAML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Desired proxy infrastructure, one YAML document per proxy
    #[arg(long, global = true, default_value = "infra.yaml")]
    infra: PathBuf,

    /// Log filter, e.g. "info" or "tollgate_infra=debug"
    #[arg(long, global = true, env = "TOLLGATE_LOG", default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on host:port
    #[arg(long = "metrics-addr", global = true, env = "TOLLGATE_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Controller namespace (overrides the config file)
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline until interrupted; SIGHUP reloads config and desired state
    Run,
    /// Print the managed objects for every proxy and the rate-limit service as YAML without touching the cluster
    Render,
    /// Start the pipeline, print the runner tree as JSON, and stop
    Status {
        /// How long to let runners settle before reporting
        #[arg(long = "settle-ms", default_value_t = 500)]
        settle_ms: u64,
    },
}

fn init_tracing(filter: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(addr) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

fn load_config(path: Option<&Path>, namespace: Option<&str>) -> Result<ServerConfig> {
    let mut config = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Some(ns) = namespace {
        config.controller_namespace = ns.to_string();
    }
    Ok(config)
}

async fn connect() -> Result<Arc<dyn ClusterApi>> {
    let cluster = KubeCluster::try_default().await.context("connecting to the cluster")?;
    Ok(Arc::new(cluster))
}

async fn start(cli: &Cli, config: &ServerConfig, cancel: &CancellationToken) -> Result<(RunnerManager, pipeline::Stores)> {
    let stores = pipeline::Stores::new();
    let manager = pipeline::build(connect().await?, config, cli.infra.clone(), &stores).await?;
    if let Err(e) = manager.start_all(cancel).await {
        error!(error = %e, "pipeline failed to start");
        manager.shut_down_all().await;
        return Err(anyhow::Error::new(e).context("starting runners"));
    }
    Ok((manager, stores))
}

#[cfg(unix)]
async fn hangup(signal: &mut Option<tokio::signal::unix::Signal>) {
    match signal {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

async fn run(cli: &Cli, config: ServerConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let (manager, stores) = start(cli, &config, &cancel).await?;
    info!(runners = ?manager.list_names().await, "pipeline running");

    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .map_err(|e| warn!(error = %e, "SIGHUP reload unavailable"))
        .ok();
    loop {
        #[cfg(unix)]
        let reload = hangup(&mut sighup);
        #[cfg(not(unix))]
        let reload = std::future::pending::<()>();
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!(error = %e, "waiting for ctrl-c failed");
                }
                break;
            }
            _ = reload => {
                info!("reloading configuration");
                match load_config(cli.config.as_deref(), cli.namespace.as_deref()) {
                    Ok(next) => {
                        if let Err(e) = manager.reload_all(&next).await {
                            warn!(error = %e, "reload incomplete");
                        }
                    }
                    Err(e) => warn!(error = %format!("{e:#}"), "keeping previous configuration"),
                }
            }
        }
    }

    info!("shutting down");
    cancel.cancel();
    manager.shut_down_all().await;
    stores.close();
    Ok(())
}

fn render(cli: &Cli, config: &ServerConfig) -> Result<()> {
    let entries = provider::read_documents(&cli.infra)?;
    for ir in pipeline::default_infra(&entries, config).values() {
        let owners = match ir.metadata.owner_reference.as_ref() {
            Some(o) if o.uid.is_some() => vec![o.clone()],
            Some(o) => {
                warn!(infra = %ir.name, owner = %o.name, "owner UID unknown without a cluster; omitting owner reference");
                Vec::new()
            }
            None => Vec::new(),
        };
        print_objects(&ResourceRender::new(ir, owners, config))?;
    }
    for rl in provider::rate_limit_infra(config)?.values() {
        print_objects(&RateLimitRender::new(rl, Vec::new(), config))?;
    }
    Ok(())
}

fn print_objects(render: &dyn Render) -> Result<()> {
    let set = render.render_all().with_context(|| format!("rendering {}", render.name()))?;
    for obj in set.iter() {
        println!("---\n{}", serde_yaml::to_string(obj)?.trim_end());
    }
    Ok(())
}

async fn status(cli: &Cli, config: ServerConfig, settle: Duration) -> Result<()> {
    let cancel = CancellationToken::new();
    let (manager, stores) = start(cli, &config, &cancel).await?;
    tokio::time::sleep(settle).await;
    println!("{}", serde_json::to_string_pretty(&manager.status().await)?);
    cancel.cancel();
    manager.shut_down_all().await;
    stores.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);
    init_metrics(cli.metrics_addr);
    let config = load_config(cli.config.as_deref(), cli.namespace.as_deref())?;

    match &cli.command {
        Commands::Run => run(&cli, config).await,
        Commands::Render => render(&cli, &config),
        Commands::Status { settle_ms } => status(&cli, config, Duration::from_millis(*settle_ms)).await,
    }
}
