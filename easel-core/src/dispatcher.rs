//! Dispatcher: binds pending jobs to backends and supervises monitors.
//!
//! One supervisory task re-reads the registry and keeps exactly one loop
//! task per known backend alias.  A backend loop is the per-alias token:
//! while it awaits a monitor it cannot claim, so at most one job per
//! backend is ever `processing`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::catalog::CatalogStore;
use crate::client::BackendClient;
use crate::job::Job;
use crate::monitor::{signalled, Monitor, MonitorConfig, MonitorExit};
use crate::queue::QueueStore;
use crate::registry::{Backend, RegistryStore};

/// Tunables for the dispatcher.  Defaults match production behaviour.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sleep between empty claim attempts.
    pub idle_poll: Duration,
    /// How often the backend set is re-read from the registry.
    pub registry_refresh: Duration,
    /// How long a pending job may target an unknown alias before it is
    /// failed (tolerates admin races during registry edits).
    pub unknown_backend_grace: Duration,
    /// Where monitors write images and previews.
    pub output_dir: PathBuf,
    pub monitor: MonitorConfig,
}

impl DispatcherConfig {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            idle_poll: Duration::from_millis(500),
            registry_refresh: Duration::from_secs(5),
            unknown_backend_grace: Duration::from_secs(30),
            output_dir,
            monitor: MonitorConfig::default(),
        }
    }
}

/// Cancellation signals for active monitors, keyed by job id.
///
/// The cancel route flips the flag; the owning monitor observes it at its
/// next tick.  Entries live exactly as long as their monitor.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, job_id: &str) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        if let Ok(mut map) = self.inner.lock() {
            map.insert(job_id.to_owned(), tx);
        }
        rx
    }

    /// Signal the monitor owning `job_id`, if any.  Returns whether a
    /// monitor was listening.
    pub fn cancel(&self, job_id: &str) -> bool {
        if let Ok(map) = self.inner.lock() {
            if let Some(tx) = map.get(job_id) {
                let _ = tx.send(true);
                return true;
            }
        }
        false
    }

    fn remove(&self, job_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(job_id);
        }
    }

    /// Number of monitors currently registered.
    pub fn active_count(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Everything a backend loop needs; cheap to clone per loop.
#[derive(Clone)]
struct LoopCtx {
    queue: QueueStore,
    catalog: CatalogStore,
    bus: EventBus,
    cancels: CancelRegistry,
    cfg: DispatcherConfig,
    shutdown_rx: watch::Receiver<bool>,
}

struct BackendLoop {
    backend: Backend,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Process-wide scheduler; run via [`Dispatcher::run`] on its own task.
pub struct Dispatcher {
    queue: QueueStore,
    registry: RegistryStore,
    catalog: CatalogStore,
    bus: EventBus,
    cancels: CancelRegistry,
    cfg: DispatcherConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        queue: QueueStore,
        registry: RegistryStore,
        catalog: CatalogStore,
        bus: EventBus,
        cfg: DispatcherConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            registry,
            catalog,
            bus,
            cancels: CancelRegistry::new(),
            cfg,
            shutdown_rx,
        }
    }

    /// Handle used by the cancel route to signal active monitors.
    pub fn cancels(&self) -> CancelRegistry {
        self.cancels.clone()
    }

    /// Supervisory loop.  Returns after shutdown once every backend loop
    /// (and thus every monitor) has exited.
    pub async fn run(self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.cfg.output_dir).await {
            warn!(dir = %self.cfg.output_dir.display(), error = %e, "could not create output directory");
        }
        match self.queue.list_orphaned_processing().await {
            Ok(orphans) if !orphans.is_empty() => {
                // Adoption happens inside each backend loop, which checks
                // for an in-flight job before claiming.
                info!(count = orphans.len(), "found orphaned processing jobs to adopt");
            }
            Err(e) => warn!(error = %e, "could not list orphaned jobs"),
            _ => {}
        }

        let ctx = LoopCtx {
            queue: self.queue.clone(),
            catalog: self.catalog.clone(),
            bus: self.bus.clone(),
            cancels: self.cancels.clone(),
            cfg: self.cfg.clone(),
            shutdown_rx: self.shutdown_rx.clone(),
        };

        let mut loops: HashMap<String, BackendLoop> = HashMap::new();
        let mut draining: Vec<(String, JoinHandle<()>)> = Vec::new();
        let mut unknown_since: HashMap<String, tokio::time::Instant> = HashMap::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if let Some(known) = self.refresh_backends(&ctx, &mut loops, &mut draining).await {
                self.sweep_unknown_pending(&known, &mut unknown_since).await;
            }
            debug!(
                backends = loops.len(),
                active_monitors = self.cancels.active_count(),
                bus = ?self.bus.stats(),
                "dispatcher heartbeat"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.registry_refresh) => {}
                _ = signalled(&mut shutdown_rx) => break,
            }
        }

        info!("dispatcher stopping; waiting for backend loops");
        for lp in loops.values() {
            let _ = lp.stop_tx.send(true);
        }
        let tasks: Vec<JoinHandle<()>> = loops
            .into_values()
            .map(|lp| lp.task)
            .chain(draining.into_iter().map(|(_, t)| t))
            .collect();
        join_all(tasks).await;
        info!("dispatcher stopped");
    }

    /// Reconcile backend loops against the registry.  Returns the set of
    /// registered aliases, or `None` when the registry could not be read.
    async fn refresh_backends(
        &self,
        ctx: &LoopCtx,
        loops: &mut HashMap<String, BackendLoop>,
        draining: &mut Vec<(String, JoinHandle<()>)>,
    ) -> Option<HashSet<String>> {
        let backends = match self.registry.list().await {
            Ok(list) => list,
            Err(e) => {
                // Transient per the error policy: keep the current set.
                warn!(error = %e, "registry read failed");
                return None;
            }
        };

        draining.retain(|(_, task)| !task.is_finished());
        let known: HashSet<String> = backends.iter().map(|b| b.alias.clone()).collect();

        // Stop loops for removed backends; an in-flight monitor finishes.
        let removed: Vec<String> = loops
            .keys()
            .filter(|alias| !known.contains(alias.as_str()))
            .cloned()
            .collect();
        for alias in removed {
            if let Some(lp) = loops.remove(&alias) {
                info!(backend = %alias, "backend removed; stopping its loop");
                let _ = lp.stop_tx.send(true);
                draining.push((alias, lp.task));
            }
        }

        for backend in backends {
            // A reconfigured backend gets a fresh loop once the old one
            // drains; same-alias loops never overlap.
            let changed = loops
                .get(&backend.alias)
                .is_some_and(|lp| lp.backend != backend);
            if changed {
                if let Some(lp) = loops.remove(&backend.alias) {
                    info!(backend = %backend.alias, "backend changed; restarting its loop");
                    let _ = lp.stop_tx.send(true);
                    draining.push((backend.alias.clone(), lp.task));
                }
            }

            let occupied = loops.contains_key(&backend.alias)
                || draining.iter().any(|(alias, _)| alias == &backend.alias);
            if !occupied {
                debug!(backend = %backend.alias, "starting backend loop");
                let (stop_tx, stop_rx) = watch::channel(false);
                let task = tokio::spawn(backend_loop(backend.clone(), ctx.clone(), stop_rx));
                loops.insert(
                    backend.alias.clone(),
                    BackendLoop {
                        backend,
                        stop_tx,
                        task,
                    },
                );
            }
        }
        Some(known)
    }

    /// Fail pending jobs whose alias has been continuously unregistered
    /// for the whole grace period.  A backend deleted and re-added within
    /// the window costs its jobs nothing.
    async fn sweep_unknown_pending(
        &self,
        known: &HashSet<String>,
        unknown_since: &mut HashMap<String, tokio::time::Instant>,
    ) {
        let pending = match self.queue.list_pending_older_than(Utc::now()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "pending sweep read failed");
                return;
            }
        };

        let now = tokio::time::Instant::now();
        let mut still_unknown: HashSet<String> = HashSet::new();
        for job in pending {
            if known.contains(&job.target_backend) {
                continue;
            }
            let since = *unknown_since.entry(job.id.clone()).or_insert(now);
            still_unknown.insert(job.id.clone());
            if now.duration_since(since) < self.cfg.unknown_backend_grace {
                continue;
            }

            warn!(job_id = %job.id, backend = %job.target_backend, "failing job for unknown backend");
            let message = format!("unknown backend '{}'", job.target_backend);
            if let Err(e) = self.queue.fail(&job.id, "bad_request", &message, false).await {
                // Lost a race with a cancel or a concurrent registry add.
                debug!(job_id = %job.id, error = %e, "unknown-backend fail skipped");
            }
            still_unknown.remove(&job.id);
        }
        // Forget jobs whose backend reappeared or that left `pending`.
        unknown_since.retain(|job_id, _| still_unknown.contains(job_id));
    }
}

/// One claim-and-monitor loop per backend alias.
async fn backend_loop(backend: Backend, ctx: LoopCtx, mut stop_rx: watch::Receiver<bool>) {
    debug!(backend = %backend.alias, "backend loop started");
    let mut shutdown_rx = ctx.shutdown_rx.clone();

    // Adopt an in-flight job left over from a previous process before
    // claiming anything new.
    match ctx.queue.get_processing_for_backend(&backend.alias).await {
        Ok(Some(job)) => {
            info!(job_id = %job.id, backend = %backend.alias, "adopting orphaned job");
            run_monitor(job, &backend, &ctx).await;
        }
        Ok(None) => {}
        Err(e) => warn!(backend = %backend.alias, error = %e, "orphan lookup failed"),
    }

    loop {
        if *stop_rx.borrow() || *shutdown_rx.borrow() {
            break;
        }
        match ctx.queue.claim_next_for_backend(&backend.alias).await {
            Ok(Some(job)) => {
                run_monitor(job, &backend, &ctx).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(ctx.cfg.idle_poll) => {}
                    _ = signalled(&mut stop_rx) => {}
                    _ = signalled(&mut shutdown_rx) => {}
                }
            }
            Err(e) => {
                // Treated as transient: sleep, then retry the loop.
                warn!(backend = %backend.alias, error = %e, "claim failed");
                tokio::select! {
                    _ = tokio::time::sleep(ctx.cfg.idle_poll) => {}
                    _ = signalled(&mut stop_rx) => {}
                    _ = signalled(&mut shutdown_rx) => {}
                }
            }
        }
    }
    debug!(backend = %backend.alias, "backend loop stopped");
}

async fn run_monitor(job: Job, backend: &Backend, ctx: &LoopCtx) {
    let job_id = job.id.clone();
    let cancel_rx = ctx.cancels.register(&job_id);
    let client = BackendClient::new(backend, job.app_type);

    let exit = Monitor::new(
        job,
        client,
        ctx.queue.clone(),
        ctx.catalog.clone(),
        ctx.bus.clone(),
        ctx.cfg.output_dir.clone(),
        ctx.cfg.monitor.clone(),
        cancel_rx,
        ctx.shutdown_rx.clone(),
    )
    .run()
    .await;

    ctx.cancels.remove(&job_id);
    match exit {
        MonitorExit::Completed | MonitorExit::Failed | MonitorExit::Cancelled => {
            debug!(job_id = %job_id, ?exit, "monitor finished");
        }
        MonitorExit::Suspended => {
            info!(job_id = %job_id, "monitor suspended for shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_registry_signals_registered_jobs_only() {
        let cancels = CancelRegistry::new();
        let mut rx = cancels.register("j1");
        assert_eq!(cancels.active_count(), 1);

        assert!(!cancels.cancel("ghost"));
        assert!(cancels.cancel("j1"));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());

        cancels.remove("j1");
        assert_eq!(cancels.active_count(), 0);
        assert!(!cancels.cancel("j1"));
    }
}
