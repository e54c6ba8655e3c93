use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use opsjob_core::{ActionProgress, ObjectKey, OperationJob, OpsCandidate, OpsStatus, PodStore, StoreError};
use opsjob_kubehub::{
    field_manager, get_kube_client, prime_list, start_pod_watcher, KubeEventSink, KubeStore, KubeWatchRegistrar,
};
use opsjob_ops::{replace::replace_triggered, ActionHandler, ActionRegistry, SharedContext, ACTION_REPLACE};
use opsjob_store::{queue_cap, spawn_ingest, BackendHandle, CachedStore, ExpectationCache};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "opsjobctl", version, about = "opsjob CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace pods and follow them until every one settles
    Replace {
        /// Operation job name events are recorded against
        #[arg(long = "job")]
        job: String,
        /// Give up following after this many seconds
        #[arg(long = "timeout-secs", default_value_t = 600)]
        timeout_secs: u64,
        /// Origin pod names
        #[arg(required = true)]
        pods: Vec<String>,
    },
    /// Undo a replace that has not settled yet
    Release {
        #[arg(long = "job")]
        job: String,
        #[arg(required = true)]
        pods: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("OPSJOB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OPSJOB_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OPSJOB_METRICS_ADDR; expected host:port");
        }
    }
}

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}

/// Per-target state carried across reconcile passes; stands in for persisted job status.
#[derive(Debug, Clone, serde::Serialize)]
struct Tracked {
    pod: String,
    progress: ActionProgress,
    #[serde(flatten)]
    status: OpsStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Tracked {
    fn new(pod: String) -> Self {
        Self { pod, progress: ActionProgress::Processing, status: OpsStatus::default(), error: None }
    }
}

fn all_settled(tracked: &[Tracked]) -> bool {
    tracked.iter().all(|t| t.progress.is_terminal())
}

fn unsuccessful(tracked: &[Tracked]) -> usize {
    tracked.iter().filter(|t| t.progress != ActionProgress::Succeeded || t.error.is_some()).count()
}

fn print_results(output: Output, tracked: &[Tracked]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<32} {:<11} {:<17} MESSAGE", "POD", "PROGRESS", "REASON");
            for t in tracked {
                let reason = t.status.reason.as_ref().map(|r| r.as_str()).unwrap_or("-");
                let message = t.error.as_deref().or(t.status.message.as_deref()).unwrap_or("-");
                println!("{:<32} {:<11} {:<17} {}", t.pod, t.progress.to_string(), reason, message);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(tracked)?),
    }
    Ok(())
}

async fn wait_first_epoch(backend: &BackendHandle, wait_secs: u64) {
    let mut rx = backend.subscribe_epoch();
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    while *rx.borrow() == 0 {
        let now = Instant::now();
        if now >= deadline { break; }
        let rem = deadline.duration_since(now).min(Duration::from_secs(2));
        if tokio::time::timeout(rem, rx.changed()).await.is_err() { break; }
    }
}

/// Whether the cached view of `key` can be trusted for a progress check. A pod gone from
/// the cache while a write is still expected is confirmed with a live read.
async fn cache_caught_up<S: PodStore>(
    ctx: &CancellationToken,
    store: &CachedStore<S>,
    expectations: &ExpectationCache,
    key: &ObjectKey,
) -> bool {
    if store.is_synced(key, expectations) {
        return true;
    }
    if store.backend().current().get(key).is_some() {
        return false;
    }
    match store.get_live(ctx, key).await {
        Ok(None) => {
            expectations.delete_expectations(&key.to_string());
            true
        }
        Ok(Some(_)) => false,
        Err(e) => {
            debug!(pod = %key, error = %e, "live confirmation failed");
            false
        }
    }
}

fn cancel_on_ctrl_c(ctx: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; shutting down");
            ctx.cancel();
        }
    });
}

async fn run_replace(client: Client, output: Output, job: OperationJob, timeout_secs: u64) -> Result<()> {
    let cap = queue_cap();
    let (ingest_tx, backend) = spawn_ingest(cap);
    let live = Arc::new(KubeStore::new(client.clone()));
    let store = Arc::new(CachedStore::new(backend.clone(), live));
    let events = Arc::new(KubeEventSink::new(client.clone(), &field_manager()));
    let shared = SharedContext::new(store.clone(), events);

    let (trigger_tx, mut trigger_rx) = mpsc::channel::<ObjectKey>(cap);
    let mut registrar = KubeWatchRegistrar::new(trigger_tx);
    let mut registry = ActionRegistry::with_builtin();
    registry.set_up_all(&mut registrar, &shared)?;
    let handler = registry.get(ACTION_REPLACE)?;

    // Start watcher
    let watcher_handle = tokio::spawn({
        let client = client.clone();
        let ns = job.namespace.clone();
        let tx = ingest_tx.clone();
        async move {
            if let Err(e) = start_pod_watcher(client, Some(&ns), tx, registrar).await {
                error!(error = ?e, "pod watcher failed");
            }
        }
    });
    // Prime initial list for faster first snapshot
    if let Err(e) = prime_list(client.clone(), Some(&job.namespace), &ingest_tx).await {
        warn!(error = %e, "initial pod list failed; waiting for watcher");
    }
    wait_first_epoch(&backend, env_secs("OPSJOB_WAIT_SECS", 8)).await;

    let ctx = CancellationToken::new();
    cancel_on_ctrl_c(ctx.clone());
    let expectations = ExpectationCache::new();
    let mut tracked: Vec<Tracked> = job.targets.iter().cloned().map(Tracked::new).collect();

    let poll = Duration::from_secs(env_secs("OPSJOB_POLL_SECS", 2).max(1));
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    'follow: while !ctx.is_cancelled() {
        for t in tracked.iter_mut().filter(|t| !t.progress.is_terminal()) {
            let key = job.target_key(&t.pod);
            if !cache_caught_up(&ctx, &store, &expectations, &key).await {
                debug!(pod = %key, "cache behind last write; skipping");
                continue;
            }
            let pod: Option<Pod> = match store.get(&ctx, &key).await {
                Ok(pod) => pod,
                Err(StoreError::Cancelled) => break 'follow,
                Err(e) => {
                    debug!(pod = %key, error = %e, "pod read failed; retrying");
                    t.error = Some(e.to_string());
                    continue;
                }
            };
            let rv = pod
                .as_ref()
                .filter(|p| !replace_triggered(p))
                .and_then(|p| p.metadata.resource_version.clone());
            if let Some(rv) = rv {
                if let Err(e) = expectations.expect_update(&key.to_string(), &rv) {
                    warn!(pod = %key, error = %e, "cannot record expectation");
                }
            }
            let mut candidate = OpsCandidate::new(key.clone(), pod, t.status.clone());
            // Re-driven every pass; a no-op once triggered.
            if let Err(e) = handler.operate_target(&ctx, &mut candidate, &job).await {
                if e.is_cancelled() {
                    break 'follow;
                }
                warn!(pod = %key, error = %e, "replace trigger failed");
                expectations.delete_expectations(&key.to_string());
                t.error = Some(e.to_string());
                continue;
            }
            match handler.get_ops_progress(&ctx, &mut candidate, &job).await {
                Ok(progress) => {
                    if progress != t.progress {
                        info!(pod = %key, progress = %progress, "progress changed");
                    }
                    t.progress = progress;
                    t.error = None;
                }
                Err(e) if e.is_cancelled() => break 'follow,
                Err(e) => {
                    debug!(pod = %key, error = %e, "progress check failed; retrying");
                    t.error = Some(e.to_string());
                }
            }
            t.status = candidate.status;
        }
        if all_settled(&tracked) {
            break;
        }
        if Instant::now() >= deadline {
            warn!(timeout_secs, "gave up following replace");
            break;
        }
        tokio::select! {
            _ = ctx.cancelled() => break,
            Some(key) = trigger_rx.recv() => {
                debug!(origin = %key, "replacement changed");
                while trigger_rx.try_recv().is_ok() {}
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }

    print_results(output, &tracked)?;

    // Graceful shutdown: drop last sender and abort watcher to close ingest
    drop(ingest_tx);
    watcher_handle.abort();

    match unsuccessful(&tracked) {
        0 => Ok(()),
        n => Err(anyhow!("{} of {} pods did not finish replacing", n, tracked.len())),
    }
}

async fn run_release(client: Client, output: Output, job: OperationJob) -> Result<()> {
    let store = Arc::new(KubeStore::new(client.clone()));
    let events = Arc::new(KubeEventSink::new(client, &field_manager()));
    let shared = SharedContext::new(store.clone(), events);
    let mut registry = ActionRegistry::with_builtin();
    registry.set_up_all(&mut KubeWatchRegistrar::default(), &shared)?;
    let handler = registry.get(ACTION_REPLACE)?;

    let ctx = CancellationToken::new();
    cancel_on_ctrl_c(ctx.clone());
    let mut tracked: Vec<Tracked> = Vec::with_capacity(job.targets.len());
    for name in &job.targets {
        let key = job.target_key(name);
        let mut t = Tracked::new(name.clone());
        let pod = match store.get_live(&ctx, &key).await {
            Ok(pod) => pod,
            Err(StoreError::Cancelled) => break,
            Err(e) => {
                warn!(pod = %key, error = %e, "cannot read pod");
                t.progress = ActionProgress::Failed;
                t.error = Some(e.to_string());
                tracked.push(t);
                continue;
            }
        };
        let mut candidate = OpsCandidate::new(key.clone(), pod, OpsStatus::default());
        match handler.release_target(&ctx, &mut candidate, &job).await {
            Ok(()) => t.progress = ActionProgress::Succeeded,
            Err(e) => {
                warn!(pod = %key, error = %e, "release failed");
                t.progress = ActionProgress::Failed;
                t.error = Some(e.to_string());
            }
        }
        tracked.push(t);
    }
    print_results(output, &tracked)?;
    match unsuccessful(&tracked) {
        0 => Ok(()),
        n => Err(anyhow!("{} of {} pods could not be released", n, tracked.len())),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = get_kube_client().await?;
    let ns = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());

    match cli.command {
        Commands::Replace { job, timeout_secs, pods } => {
            info!(job = %job, ns = %ns, pods = pods.len(), "replace invoked");
            let job = OperationJob::new(&ns, job).with_targets(pods);
            run_replace(client, cli.output, job, timeout_secs).await
        }
        Commands::Release { job, pods } => {
            info!(job = %job, ns = %ns, pods = pods.len(), "release invoked");
            let job = OperationJob::new(&ns, job).with_targets(pods);
            run_release(client, cli.output, job).await
        }
    }
}
