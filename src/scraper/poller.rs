use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::db::CaptureStore;
use crate::error::{AppError, Result};
use crate::models::NewCapture;

use super::client::TimingSource;

/// What the poller does when a fetch or insert fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop polling and report the error from `join`.
    #[default]
    Abort,
    /// Log the error, store nothing for that cycle and keep going.
    Skip,
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub db_path: PathBuf,
    pub interval: Duration,
    pub failure_policy: FailurePolicy,
}

/// Timed fetch-and-store loop. `start` consumes the poller, so a poller
/// can only ever be started once.
pub struct Poller<S> {
    settings: PollerSettings,
    source: S,
}

impl<S: TimingSource> Poller<S> {
    pub fn new(settings: PollerSettings, source: S) -> Self {
        Self { settings, source }
    }

    /// Spawns the loop onto the runtime and returns immediately.
    pub fn start(self) -> PollerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let requests = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(self.run(stop_rx, cancel_rx, Arc::clone(&requests)));

        PollerHandle {
            stop_tx,
            cancel_tx,
            requests,
            task,
        }
    }

    async fn run(
        self,
        mut stop_rx: watch::Receiver<bool>,
        mut cancel_rx: watch::Receiver<bool>,
        requests: Arc<AtomicU64>,
    ) -> Result<u64> {
        // The loop owns this connection for its whole life
        let store = CaptureStore::open(&self.settings.db_path).await?;
        tracing::info!(
            "Polling every {:?} into {}",
            self.settings.interval,
            self.settings.db_path.display()
        );

        // Cancelling drops an in-flight cycle, but the close below still
        // waits for any statement already queued on the connection.
        let outcome = tokio::select! {
            outcome = self.poll_until_stopped(&store, &mut stop_rx, &requests) => outcome,
            _ = signalled(&mut cancel_rx) => {
                tracing::warn!("Poller cancelled mid-cycle");
                Ok(requests.load(Ordering::Relaxed))
            }
        };
        let closed = store.close().await;

        let count = outcome?;
        closed?;
        tracing::info!("Poller stopped after {} requests", count);
        Ok(count)
    }

    async fn poll_until_stopped(
        &self,
        store: &CaptureStore,
        stop_rx: &mut watch::Receiver<bool>,
        requests: &AtomicU64,
    ) -> Result<u64> {
        loop {
            tokio::select! {
                biased;
                _ = signalled(stop_rx) => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
            if *stop_rx.borrow() {
                break;
            }

            match self.capture_once(store).await {
                Ok(id) => {
                    let count = requests.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!("Stored frame {} (request #{})", id, count);
                }
                Err(e) => match self.settings.failure_policy {
                    FailurePolicy::Abort => {
                        tracing::error!("Poll cycle failed, stopping: {}", e);
                        return Err(e);
                    }
                    FailurePolicy::Skip => {
                        tracing::warn!("Poll cycle failed, skipping: {}", e);
                    }
                },
            }
        }

        Ok(requests.load(Ordering::Relaxed))
    }

    async fn capture_once(&self, store: &CaptureStore) -> Result<i64> {
        let payload = self.source.fetch().await?;
        store.insert_capture(NewCapture::now(payload)).await
    }
}

async fn signalled(rx: &mut watch::Receiver<bool>) {
    // A dropped handle counts as the signal too
    let _ = rx.wait_for(|set| *set).await;
}

/// Controls a running poller.
pub struct PollerHandle {
    stop_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    requests: Arc<AtomicU64>,
    task: JoinHandle<Result<u64>>,
}

impl PollerHandle {
    /// Asks the loop to exit before its next fetch. Never blocks; calling it
    /// again has no further effect.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Number of completed fetch-and-store cycles so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit and its connection to close. Returns the
    /// number of stored frames, or the error that ended the loop.
    pub async fn join(self) -> Result<u64> {
        self.task.await?
    }

    /// `join` with a deadline. If the loop overruns, its current cycle is
    /// cancelled and this still waits for the poller's connection to close,
    /// so no write lands after it returns.
    pub async fn join_within(mut self, grace: Duration) -> Result<u64> {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(joined) => joined?,
            Err(_) => {
                self.cancel_tx.send_replace(true);
                if let Err(e) = self.task.await? {
                    tracing::warn!("Cancelled poller reported: {}", e);
                }
                Err(AppError::ShutdownTimeout(grace))
            }
        }
    }

    pub async fn shutdown(self) -> Result<u64> {
        self.stop();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::io;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct CallLog {
        calls: AtomicUsize,
        started: Mutex<Vec<Instant>>,
    }

    struct ScriptedSource {
        log: Arc<CallLog>,
        failing_calls: Vec<usize>,
        hang_from: Option<usize>,
    }

    impl ScriptedSource {
        fn new() -> (Self, Arc<CallLog>) {
            let log = Arc::new(CallLog::default());
            let source = Self {
                log: Arc::clone(&log),
                failing_calls: Vec::new(),
                hang_from: None,
            };
            (source, log)
        }

        fn failing_on(mut self, calls: &[usize]) -> Self {
            self.failing_calls = calls.to_vec();
            self
        }

        fn hanging(self) -> Self {
            self.hanging_from(1)
        }

        fn hanging_from(mut self, call: usize) -> Self {
            self.hang_from = Some(call);
            self
        }
    }

    impl TimingSource for ScriptedSource {
        fn fetch(&self) -> impl Future<Output = Result<String>> + Send {
            let call = self.log.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.started.lock().unwrap().push(Instant::now());
            let fail = self.failing_calls.contains(&call);
            let hang = self.hang_from.is_some_and(|from| call >= from);

            async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                if fail {
                    return Err(AppError::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )));
                }
                Ok(format!("{{\"frame\":{}}}", call))
            }
        }
    }

    async fn prepared_db(dir: &Path) -> PathBuf {
        let path = dir.join("captures.db");
        let store = CaptureStore::open(&path).await.unwrap();
        store.prepare_schema(false).await.unwrap();
        store.close().await.unwrap();
        path
    }

    fn settings(db_path: PathBuf, interval: Duration, failure_policy: FailurePolicy) -> PollerSettings {
        PollerSettings {
            db_path,
            interval,
            failure_policy,
        }
    }

    async fn stored(path: &Path) -> Vec<crate::models::CaptureRecord> {
        let store = CaptureStore::open(path).await.unwrap();
        let captures = store.get_all_captures().await.unwrap();
        store.close().await.unwrap();
        captures
    }

    #[tokio::test]
    async fn three_and_a_half_seconds_at_one_second_stores_three_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path.clone(), Duration::from_secs(1), FailurePolicy::Abort),
            source,
        )
        .start();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(handle.request_count(), 3);

        let count = handle.shutdown().await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(log.calls.load(Ordering::SeqCst), 3);

        let captures = stored(&path).await;
        assert_eq!(captures.len(), 3);
        let times: Vec<_> = captures.iter().map(|c| c.captured_at().unwrap()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn stop_before_first_interval_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path.clone(), Duration::from_secs(5), FailurePolicy::Abort),
            source,
        )
        .start();
        handle.stop();

        let started = Instant::now();
        assert_eq!(handle.join().await.unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(log.calls.load(Ordering::SeqCst), 0);
        assert!(stored(&path).await.is_empty());
    }

    #[tokio::test]
    async fn no_fetch_starts_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path.clone(), Duration::from_millis(100), FailurePolicy::Abort),
            source,
        )
        .start();
        tokio::time::sleep(Duration::from_millis(550)).await;
        handle.stop();
        let stopped_at = Instant::now();
        let count = handle.join().await.unwrap();

        // floor(550 / 100) give or take one
        assert!((4..=6).contains(&count), "unexpected count {}", count);
        let started = log.started.lock().unwrap();
        assert!(started.iter().all(|t| *t <= stopped_at));
        assert_eq!(stored(&path).await.len() as u64, count);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, _log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path, Duration::from_millis(50), FailurePolicy::Abort),
            source,
        )
        .start();
        handle.stop();
        handle.stop();
        handle.stop();
        assert_eq!(handle.join().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transport_error_ends_loop_and_keeps_earlier_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path.clone(), Duration::from_millis(50), FailurePolicy::Abort),
            source.failing_on(&[3]),
        )
        .start();

        let result = handle.join_within(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AppError::Io(_))));
        assert_eq!(log.calls.load(Ordering::SeqCst), 3);

        let captures = stored(&path).await;
        let payloads: Vec<_> = captures.iter().map(|c| c.payload.as_str()).collect();
        assert_eq!(payloads, ["{\"frame\":1}", "{\"frame\":2}"]);
    }

    #[tokio::test]
    async fn skip_policy_keeps_polling_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path.clone(), Duration::from_millis(50), FailurePolicy::Skip),
            source.failing_on(&[2]),
        )
        .start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.request_count() < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!handle.is_finished());

        let count = handle.shutdown().await.unwrap();
        assert!(count >= 3);
        assert_eq!(log.calls.load(Ordering::SeqCst) as u64, count + 1);
        assert!(stored(&path)
            .await
            .iter()
            .all(|c| c.payload != "{\"frame\":2}"));
    }

    #[tokio::test]
    async fn storage_error_is_reported_from_join() {
        let dir = tempfile::tempdir().unwrap();
        // no schema, so the first insert fails
        let path = dir.path().join("captures.db");
        let (source, _log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path, Duration::from_millis(20), FailurePolicy::Abort),
            source,
        )
        .start();

        let result = handle.join_within(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(AppError::Database(_))));
    }

    #[tokio::test]
    async fn join_within_gives_up_on_a_hung_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path, Duration::from_millis(10), FailurePolicy::Abort),
            source.hanging(),
        )
        .start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);

        handle.stop();
        let result = handle.join_within(Duration::from_millis(200)).await;
        assert!(matches!(result, Err(AppError::ShutdownTimeout(_))));
    }

    #[tokio::test]
    async fn overrun_shutdown_releases_the_database_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let path = prepared_db(dir.path()).await;
        let (source, log) = ScriptedSource::new();

        let handle = Poller::new(
            settings(path.clone(), Duration::from_millis(50), FailurePolicy::Abort),
            source.hanging_from(2),
        )
        .start();
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.calls.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop();
        let result = handle.join_within(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(AppError::ShutdownTimeout(_))));

        // the frame stored before the hang is all there is, now and later
        assert_eq!(stored(&path).await.len(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(stored(&path).await.len(), 1);

        // nothing else holds the file: a clean reset goes through
        let store = CaptureStore::open(&path).await.unwrap();
        store.prepare_schema(true).await.unwrap();
        assert_eq!(store.count_captures().await.unwrap(), 0);
    }
}
