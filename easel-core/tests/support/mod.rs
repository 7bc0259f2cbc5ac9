//! Shared harness for lifecycle tests: real stores on temp files, a real
//! dispatcher, and wiremock standing in for forge backends.

// Each test binary uses a different subset of the harness.
#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use easel_core::{
    AppType, CancelRegistry, CatalogStore, Dispatcher, DispatcherConfig, EventBus, Job, JobStatus,
    QueueStore, RegistryStore, Submission,
};

pub struct TestSystem {
    pub queue: QueueStore,
    pub registry: RegistryStore,
    pub catalog: CatalogStore,
    pub bus: EventBus,
    pub cancels: CancelRegistry,
    pub output_dir: PathBuf,
    pub cfg: DispatcherConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    dispatcher_task: Option<JoinHandle<()>>,
    _tmp: tempfile::TempDir,
}

/// Stores only; call [`TestSystem::start_dispatcher`] when the scene is
/// set (lets tests pre-seed state the way a previous process would have).
pub async fn build(tune: impl FnOnce(&mut DispatcherConfig)) -> TestSystem {
    let tmp = tempfile::tempdir().unwrap();
    let output_dir = tmp.path().join("output");
    let bus = EventBus::new();
    let queue = QueueStore::open(&tmp.path().join("queue.db"), bus.clone())
        .await
        .unwrap();
    let registry = RegistryStore::open(&tmp.path().join("registry.db"))
        .await
        .unwrap();
    let catalog = CatalogStore::open(&tmp.path().join("catalog.db"))
        .await
        .unwrap();

    let mut cfg = DispatcherConfig::new(output_dir.clone());
    cfg.idle_poll = Duration::from_millis(20);
    cfg.registry_refresh = Duration::from_millis(40);
    cfg.monitor.poll_interval = Duration::from_millis(20);
    cfg.monitor.backoff_base = Duration::from_millis(10);
    cfg.monitor.backoff_cap = Duration::from_millis(40);
    tune(&mut cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    TestSystem {
        queue,
        registry,
        catalog,
        bus,
        cancels: CancelRegistry::new(),
        output_dir,
        cfg,
        shutdown_tx,
        shutdown_rx,
        dispatcher_task: None,
        _tmp: tmp,
    }
}

/// Build and immediately start the dispatcher.
pub async fn start(tune: impl FnOnce(&mut DispatcherConfig)) -> TestSystem {
    let mut sys = build(tune).await;
    sys.start_dispatcher();
    sys
}

impl TestSystem {
    pub fn start_dispatcher(&mut self) {
        assert!(self.dispatcher_task.is_none(), "dispatcher already running");
        let dispatcher = Dispatcher::new(
            self.queue.clone(),
            self.registry.clone(),
            self.catalog.clone(),
            self.bus.clone(),
            self.cfg.clone(),
            self.shutdown_rx.clone(),
        );
        self.cancels = dispatcher.cancels();
        self.dispatcher_task = Some(tokio::spawn(dispatcher.run()));
    }

    pub async fn register_backend(&self, alias: &str, base_url: &str) {
        self.registry
            .upsert(easel_core::BackendSpec {
                alias: alias.to_owned(),
                base_url: base_url.to_owned(),
                auth: None,
                model_root_path: None,
            })
            .await
            .unwrap();
    }

    pub async fn admit(&self, backend: &str) -> String {
        self.admit_params(
            backend,
            serde_json::json!({
                "prompt": "x",
                "checkpoint_name": "m.safetensors",
                "steps": 1,
                "width": 64,
                "height": 64,
                "seed": 0,
            }),
        )
        .await
    }

    pub async fn admit_params(&self, backend: &str, params: serde_json::Value) -> String {
        easel_core::admit(
            &self.queue,
            &self.registry,
            Submission {
                target_backend: backend.to_owned(),
                generation_params: params,
                app_type: AppType::Forge,
                source_info: Some("test".to_owned()),
                api_key_ref: None,
            },
        )
        .await
        .unwrap()
        .job_id
    }

    /// Poll until the job reaches `status` (5 s budget).
    pub async fn wait_for_status(&self, job_id: &str, status: JobStatus) -> Job {
        self.wait_until(job_id, |job| job.status == status).await
    }

    pub async fn wait_until(&self, job_id: &str, pred: impl Fn(&Job) -> bool) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(job) = self.queue.get(job_id).await.unwrap() {
                if pred(&job) {
                    return job;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!("timed out waiting on job {job_id}; last seen {:?}", job.status);
                }
            } else if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting on job {job_id}; job missing");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Signal shutdown and wait for the dispatcher (and its monitors).
    /// The stores stay usable and the dispatcher can be started again,
    /// standing in for a process restart.
    pub async fn stop_dispatcher(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.dispatcher_task.take() {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("dispatcher did not stop in time")
                .unwrap();
        }
        let (tx, rx) = watch::channel(false);
        self.shutdown_tx = tx;
        self.shutdown_rx = rx;
    }

    pub async fn shutdown(mut self) {
        self.stop_dispatcher().await;
    }
}
