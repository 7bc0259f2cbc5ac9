//! Monitor: drives one `processing` job from submission to a terminal
//! state.
//!
//! Phases: `Submitting -> Polling -> Collecting`, each with its own
//! bounded retry budget, all under a single wall-clock deadline.  The
//! monitor is the only writer of non-administrative transitions out of
//! `processing`; cancellation and shutdown are observed cooperatively at
//! the next tick.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, QueueEvent};
use crate::catalog::CatalogStore;
use crate::client::{BackendClient, BackendError};
use crate::error::CoreError;
use crate::job::{Job, ProgressFrame};
use crate::queue::QueueStore;

/// Tunables for a monitor run.  Defaults match production behaviour;
/// tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub max_submit_retries: u32,
    pub max_poll_failures: u32,
    pub max_collect_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Floor for the whole-lifetime deadline.
    pub min_deadline: Duration,
    /// Per-sampling-step contribution to the generation-time estimate.
    pub step_estimate: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_submit_retries: 5,
            max_poll_failures: 10,
            max_collect_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            min_deadline: Duration::from_secs(600),
            step_estimate: Duration::from_secs(2),
        }
    }
}

/// How a monitor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Completed,
    Failed,
    Cancelled,
    /// Shutdown was requested; the job stays `processing` for adoption on
    /// the next start.
    Suspended,
}

/// One monitor, owning one `processing` job.
pub struct Monitor {
    job: Job,
    client: BackendClient,
    queue: QueueStore,
    catalog: CatalogStore,
    bus: EventBus,
    output_dir: PathBuf,
    cfg: MonitorConfig,
    cancel_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Catalog entry the checkpoint reference resolved to, if any.
    resolved_entry: Option<i64>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: Job,
        client: BackendClient,
        queue: QueueStore,
        catalog: CatalogStore,
        bus: EventBus,
        output_dir: PathBuf,
        cfg: MonitorConfig,
        cancel_rx: watch::Receiver<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job,
            client,
            queue,
            catalog,
            bus,
            output_dir,
            cfg,
            cancel_rx,
            shutdown_rx,
            resolved_entry: None,
        }
    }

    /// Drive the job to a terminal state (or suspend on shutdown).
    pub async fn run(mut self) -> MonitorExit {
        let mut cancel_rx = self.cancel_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let deadline = Instant::now() + self.generation_deadline();
        info!(
            job_id = %self.job.id,
            backend = %self.job.target_backend,
            adopted_session = self.job.backend_session.is_some(),
            "monitor started"
        );

        // Orphans with a persisted session resume in the polling phase;
        // everything else starts from submission.
        let session = match self.job.backend_session.clone() {
            Some(s) if !s.is_empty() => s,
            _ => match self.submit(&mut cancel_rx, &mut shutdown_rx, deadline).await {
                Ok(s) => s,
                Err(exit) => return exit,
            },
        };

        if let Err(exit) = self
            .poll(&session, &mut cancel_rx, &mut shutdown_rx, deadline)
            .await
        {
            return exit;
        }
        self.collect(&session, &mut cancel_rx, deadline).await
    }

    fn generation_deadline(&self) -> Duration {
        generation_deadline(&self.cfg, &self.job.generation_params)
    }

    async fn submit(
        &mut self,
        cancel_rx: &mut watch::Receiver<bool>,
        shutdown_rx: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<String, MonitorExit> {
        // Normalize the checkpoint reference against the local catalog
        // before anything reaches the backend.
        match self.catalog.resolve_checkpoint(&self.job.generation_params).await {
            Ok(Some(entry)) => {
                self.resolved_entry = Some(entry.id);
                let canonical = format!("{}/{}", entry.local_dir.trim_end_matches('/'), entry.filename);
                if let Some(obj) = self.job.generation_params.as_object_mut() {
                    obj.insert(
                        "checkpoint_name".to_owned(),
                        serde_json::Value::String(canonical),
                    );
                }
                if let Err(e) = self
                    .queue
                    .set_generation_params(&self.job.id, &self.job.generation_params)
                    .await
                {
                    if matches!(e, CoreError::InvalidTransition { .. }) {
                        return Err(self.finish_cancelled(None).await);
                    }
                    warn!(job_id = %self.job.id, error = %e, "failed to persist normalized params");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(job_id = %self.job.id, error = %e, "checkpoint resolution failed"),
        }

        let mut attempt: u32 = 0;
        loop {
            if *shutdown_rx.borrow() {
                let _ = self.queue.touch(&self.job.id).await;
                return Err(MonitorExit::Suspended);
            }
            if *cancel_rx.borrow() {
                return Err(self.finish_cancelled(None).await);
            }
            if Instant::now() >= deadline {
                return Err(self
                    .finish_failed("backend_transport", "deadline exceeded before submission")
                    .await);
            }

            match self.client.submit(&self.job.generation_params).await {
                Ok(session) => {
                    match self.queue.set_backend_session(&self.job.id, &session).await {
                        Ok(()) => {
                            debug!(job_id = %self.job.id, %session, "submitted to backend");
                            // Acceptance proves the backend has the file.
                            if let Some(entry_id) = self.resolved_entry {
                                if let Err(e) = self
                                    .catalog
                                    .mark_available_on(entry_id, &self.job.target_backend)
                                    .await
                                {
                                    debug!(entry_id, error = %e, "could not record backend availability");
                                }
                            }
                            return Ok(session);
                        }
                        Err(CoreError::InvalidTransition { .. }) => {
                            // Cancelled between submit and the write-back.
                            return Err(self.finish_cancelled(Some(&session)).await);
                        }
                        Err(e) => {
                            return Err(self
                                .finish_failed("storage_error", &e.to_string())
                                .await);
                        }
                    }
                }
                Err(e @ BackendError::BadRequest(_)) => {
                    return Err(self.finish_failed("backend_rejected", &e.to_string()).await);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.cfg.max_submit_retries {
                        return Err(self.finish_failed(error_kind(&e), &e.to_string()).await);
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        job_id = %self.job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "submit failed; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signalled(cancel_rx) => {}
                        _ = signalled(shutdown_rx) => {}
                    }
                }
            }
        }
    }

    async fn poll(
        &mut self,
        session: &str,
        cancel_rx: &mut watch::Receiver<bool>,
        shutdown_rx: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<(), MonitorExit> {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        let mut consecutive_failures: u32 = 0;
        let mut last_percent = self.job.result.progress_percent.unwrap_or(0.0);
        let mut preview_filename = self.job.result.preview_filename.clone();
        let mut last_preview_digest: Option<[u8; 32]> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = signalled(cancel_rx) => {}
                _ = signalled(shutdown_rx) => {}
            }
            if *shutdown_rx.borrow() {
                let _ = self.queue.touch(&self.job.id).await;
                return Err(MonitorExit::Suspended);
            }
            if *cancel_rx.borrow() {
                return Err(self.finish_cancelled(Some(session)).await);
            }
            if Instant::now() >= deadline {
                return Err(self
                    .finish_failed("backend_transport", "generation deadline exceeded")
                    .await);
            }

            match self.client.poll_progress(session).await {
                Ok(poll) => {
                    consecutive_failures = 0;
                    // Percent never goes backward within one generation.
                    let percent = last_percent.max(poll.percent);
                    last_percent = percent;

                    if let Some(bytes) = &poll.preview {
                        let digest: [u8; 32] = Sha256::digest(bytes).into();
                        if last_preview_digest != Some(digest) {
                            match self.write_preview(bytes).await {
                                Ok(name) => {
                                    last_preview_digest = Some(digest);
                                    preview_filename = Some(name);
                                }
                                Err(e) => {
                                    warn!(job_id = %self.job.id, error = %e, "preview write failed");
                                }
                            }
                        }
                    }

                    match self
                        .queue
                        .update_progress(
                            &self.job.id,
                            percent,
                            preview_filename.as_deref(),
                            poll.current_step,
                            poll.total_steps,
                        )
                        .await
                    {
                        Ok(()) => {}
                        Err(CoreError::InvalidTransition { .. }) => {
                            // The job left `processing` under us; the only
                            // non-monitor writer is cancel.
                            return Err(self.finish_cancelled(Some(session)).await);
                        }
                        Err(e) => {
                            warn!(job_id = %self.job.id, error = %e, "progress persist failed");
                        }
                    }

                    self.publish_frame(percent, preview_filename.clone(), poll.current_step, poll.total_steps);

                    if !poll.active {
                        debug!(job_id = %self.job.id, "backend reports generation finished");
                        return Ok(());
                    }
                }
                Err(e @ BackendError::BadRequest(_)) => {
                    return Err(self.finish_failed("backend_rejected", &e.to_string()).await);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(
                        job_id = %self.job.id,
                        consecutive_failures,
                        error = %e,
                        "progress poll failed"
                    );
                    if consecutive_failures > self.cfg.max_poll_failures {
                        return Err(self.finish_failed(error_kind(&e), &e.to_string()).await);
                    }
                }
            }
        }
    }

    async fn collect(
        &mut self,
        session: &str,
        cancel_rx: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> MonitorExit {
        let mut attempt: u32 = 0;
        loop {
            if *cancel_rx.borrow() {
                return self.finish_cancelled(Some(session)).await;
            }
            if Instant::now() >= deadline {
                return self
                    .finish_failed("backend_transport", "deadline exceeded while collecting results")
                    .await;
            }

            match self.client.fetch_results(session).await {
                Ok(results) => return self.save_results(results).await,
                Err(e @ BackendError::BadRequest(_)) => {
                    return self.finish_failed("backend_rejected", &e.to_string()).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.cfg.max_collect_retries {
                        return self
                            .finish_failed(
                                error_kind(&e),
                                &format!("results unrecoverable: {e}"),
                            )
                            .await;
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        job_id = %self.job.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "result fetch failed; backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signalled(cancel_rx) => {}
                    }
                }
            }
        }
    }

    async fn save_results(&mut self, results: crate::client::GenerationResults) -> MonitorExit {
        let mut filenames = Vec::with_capacity(results.images.len());
        for (seq, img) in results.images.iter().enumerate() {
            let name = format!("{}_{:03}.{}", self.job.id, seq, img.ext);
            if let Err(e) = tokio::fs::write(self.output_dir.join(&name), &img.bytes).await {
                return self
                    .finish_failed("storage_error", &format!("could not save {name}: {e}"))
                    .await;
            }
            filenames.push(name);
        }

        match self.queue.complete(&self.job.id, &filenames, &results.info).await {
            Ok(_) => {
                let total = self.job.result.total_steps.unwrap_or(0);
                self.publish_frame(100.0, self.job.result.preview_filename.clone(), total, total);
                info!(job_id = %self.job.id, images = filenames.len(), "job completed");
                MonitorExit::Completed
            }
            // Cancelled during collection: images stay on disk but are not
            // recorded in the result.
            Err(CoreError::InvalidTransition { .. }) => {
                info!(job_id = %self.job.id, "cancelled during collection; artifacts retained unrecorded");
                self.publish_last_frame();
                MonitorExit::Cancelled
            }
            Err(e) => {
                self.finish_failed("storage_error", &e.to_string()).await
            }
        }
    }

    async fn write_preview(&self, bytes: &[u8]) -> Result<String, std::io::Error> {
        let ext = match image::guess_format(bytes) {
            Ok(image::ImageFormat::Jpeg) => "jpg",
            _ => "png",
        };
        let name = format!("{}_preview.{ext}", self.job.id);
        tokio::fs::write(self.output_dir.join(&name), bytes).await?;
        Ok(name)
    }

    async fn finish_failed(&mut self, kind: &str, message: &str) -> MonitorExit {
        match self.queue.fail(&self.job.id, kind, message, false).await {
            Ok(_) => {
                warn!(job_id = %self.job.id, kind, message, "job failed");
                self.publish_last_frame();
                MonitorExit::Failed
            }
            Err(CoreError::InvalidTransition { .. }) => {
                self.publish_last_frame();
                MonitorExit::Cancelled
            }
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "could not record failure");
                MonitorExit::Failed
            }
        }
    }

    async fn finish_cancelled(&mut self, session: Option<&str>) -> MonitorExit {
        if let Some(session) = session {
            self.client.cancel(session).await;
        }
        // Usually a no-op: the cancel request already moved the job.
        match self.queue.cancel(&self.job.id).await {
            Ok(_) | Err(CoreError::InvalidTransition { .. }) => {}
            Err(e) => warn!(job_id = %self.job.id, error = %e, "could not record cancellation"),
        }
        info!(job_id = %self.job.id, "job cancelled");
        self.publish_last_frame();
        MonitorExit::Cancelled
    }

    /// Terminal frame: repeats the last observed progress.
    fn publish_last_frame(&self) {
        let percent = self.job.result.progress_percent.unwrap_or(0.0);
        self.publish_frame(
            percent,
            self.job.result.preview_filename.clone(),
            self.job.result.current_step.unwrap_or(0),
            self.job.result.total_steps.unwrap_or(0),
        );
    }

    fn publish_frame(
        &self,
        percent: f64,
        preview_filename: Option<String>,
        current_step: i64,
        total_steps: i64,
    ) {
        self.bus.publish(QueueEvent::JobProgress {
            frame: ProgressFrame {
                job_id: self.job.id.clone(),
                percent,
                preview_filename,
                current_step,
                total_steps,
                timestamp: Utc::now(),
            },
        });
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(&self.cfg, attempt)
    }
}

/// Deadline: twice the estimated generation time, floored at the
/// configured minimum.  The estimate is steps-based (20 when absent).
fn generation_deadline(cfg: &MonitorConfig, params: &serde_json::Value) -> Duration {
    let steps = params.get("steps").and_then(|v| v.as_u64()).unwrap_or(20);
    let estimate = cfg.step_estimate.saturating_mul(steps.min(10_000) as u32);
    (estimate * 2).max(cfg.min_deadline)
}

/// Exponential backoff with +/-20% jitter, capped.
fn backoff_delay(cfg: &MonitorConfig, attempt: u32) -> Duration {
    let exp = cfg
        .backoff_base
        .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(cfg.backoff_cap);
    let jitter: f64 = rand::rng().random_range(0.8..=1.2);
    capped.mul_f64(jitter)
}

fn error_kind(e: &BackendError) -> &'static str {
    match e {
        BackendError::Transport(_) | BackendError::Busy(_) => "backend_transport",
        BackendError::BadRequest(_) | BackendError::Remote(_) => "backend_rejected",
    }
}

/// Resolve when the watch flag is (or becomes) set.  A closed channel can
/// never signal, so it parks forever instead of busy-looping the caller's
/// select.
pub(crate) async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_has_a_ten_minute_floor() {
        let cfg = MonitorConfig::default();
        // 20 steps * 2 s * 2 = 80 s, below the floor.
        assert_eq!(
            generation_deadline(&cfg, &serde_json::json!({"steps": 20})),
            cfg.min_deadline
        );
        // Absent steps estimate like 20 steps.
        assert_eq!(
            generation_deadline(&cfg, &serde_json::json!({})),
            cfg.min_deadline
        );
        // 600 steps * 2 s * 2 = 2400 s, above the floor.
        assert_eq!(
            generation_deadline(&cfg, &serde_json::json!({"steps": 600})),
            Duration::from_secs(2400)
        );
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        let cfg = MonitorConfig::default();
        for attempt in 1..=10 {
            let d = backoff_delay(&cfg, attempt);
            // cap * 1.2 is the absolute ceiling.
            assert!(d <= Duration::from_secs(36), "attempt {attempt}: {d:?}");
            assert!(d >= Duration::from_millis(800), "attempt {attempt}: {d:?}");
        }
        // Attempt 1 stays near the base even with jitter.
        assert!(backoff_delay(&cfg, 1) <= Duration::from_millis(1200));
    }
}
