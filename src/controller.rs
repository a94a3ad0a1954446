use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, FixedOffset};

use crate::config::Config;
use crate::db::CaptureStore;
use crate::error::{AppError, Result};
use crate::scraper::{Poller, PollerHandle, PollerSettings, TimingClient, TimingSource};
use crate::tui::StatusLine;

const STATUS_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub requests: u64,
    pub stored_rows: u64,
    pub latest_capture: Option<DateTime<FixedOffset>>,
}

/// Owns the process-level lifecycle: schema setup, one poller, shutdown.
///
/// The controller keeps its own connection for setup and inspection. It is
/// only touched before the poller starts and after it has been joined.
pub struct Controller {
    config: Config,
    db_path: PathBuf,
    store: CaptureStore,
}

impl Controller {
    pub async fn new(config: Config, db_path: PathBuf, clean: bool) -> Result<Self> {
        let store = CaptureStore::open(&db_path).await?;
        store.prepare_schema(clean).await?;
        if clean {
            tracing::info!("Reset capture table in {}", db_path.display());
        }

        Ok(Self {
            config,
            db_path,
            store,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub async fn row_count(&self) -> Result<u64> {
        self.store.count_captures().await
    }

    /// Polls until Ctrl+C, redrawing the request counter once a second.
    pub async fn run_interactive(self, show_status: bool) -> Result<RunSummary> {
        let source = TimingClient::new(&self.config)?;
        let status = if show_status { StatusLine::stdout() } else { None };
        let interrupted = async {
            tokio::signal::ctrl_c().await.map_err(|e| {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                AppError::Io(e)
            })
        };

        self.run_with(source, interrupted, status, None).await
    }

    /// Polls for a fixed duration, then allows the configured grace period
    /// for the poller to wind down.
    pub async fn run_for(self, duration: Duration) -> Result<RunSummary> {
        let source = TimingClient::new(&self.config)?;
        let grace = self.config.shutdown_grace();

        let elapsed = async {
            tokio::time::sleep(duration).await;
            Ok::<(), AppError>(())
        };

        self.run_with(source, elapsed, None, Some(grace)).await
    }

    pub(crate) async fn run_with<S, F>(
        self,
        source: S,
        until: F,
        mut status: Option<StatusLine>,
        grace: Option<Duration>,
    ) -> Result<RunSummary>
    where
        S: TimingSource,
        F: Future<Output = Result<()>>,
    {
        let settings = PollerSettings {
            db_path: self.db_path.clone(),
            interval: self.config.poll_interval(),
            failure_policy: self.config.failure_policy,
        };
        let handle = Poller::new(settings, source).start();

        let supervised = supervise(&handle, until, status.as_mut()).await;
        if matches!(supervised, Ok(true)) {
            match status.as_mut() {
                Some(line) => {
                    if let Err(e) = line.show_shutting_down() {
                        tracing::debug!("Status line unavailable: {}", e);
                    }
                }
                None => tracing::info!("Shutting down"),
            }
        }

        let outcome = match grace {
            Some(grace) => {
                handle.stop();
                handle.join_within(grace).await
            }
            None => handle.shutdown().await,
        };

        let summary = self.finish(outcome).await?;
        // The poller is down either way; a broken signal listener still fails the run
        supervised?;
        Ok(summary)
    }

    async fn finish(self, outcome: Result<u64>) -> Result<RunSummary> {
        // The poller's connection is gone by now, ours closes last
        let stored_rows = self.store.count_captures().await?;
        let latest_capture = self
            .store
            .latest_capture()
            .await?
            .and_then(|c| c.captured_at());
        self.store.close().await?;

        let requests = outcome?;
        tracing::info!(
            "Run finished: {} requests, {} rows in {}",
            requests,
            stored_rows,
            self.db_path.display()
        );

        Ok(RunSummary {
            requests,
            stored_rows,
            latest_capture,
        })
    }
}

/// Waits for `until` while the poller runs. Returns false if the poller
/// exited on its own first, and the error if `until` could not be awaited.
async fn supervise<F>(
    handle: &PollerHandle,
    until: F,
    mut status: Option<&mut StatusLine>,
) -> Result<bool>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(until);
    let mut ticker = tokio::time::interval(STATUS_TICK);

    loop {
        tokio::select! {
            result = &mut until => return result.map(|()| true),
            _ = ticker.tick() => {
                if handle.is_finished() {
                    tracing::warn!("Poller exited before shutdown was requested");
                    return Ok(false);
                }
                if let Some(line) = status.as_deref_mut() {
                    if let Err(e) = line.show_request_count(handle.request_count()) {
                        tracing::debug!("Status line unavailable: {}", e);
                    }
                }
            }
        }
    }
}
