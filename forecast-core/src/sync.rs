//! Background refresh of hourly forecasts for every tracked city.
//!
//! A cycle snapshots the city directory, then for each city fetches the next
//! 24 hours from the provider and appends them in one atomic batch. A failing
//! city is recorded in the [`CycleReport`] and never stops the others.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{CitySyncError, ProviderError, SchedulerError, StoreError},
    model::{City, CityId, RefreshWindow},
    provider::ForecastProvider,
    store::{CityDirectory, ObservationStore},
};

#[derive(Debug)]
pub struct CityOutcome {
    pub city_id: CityId,
    /// Number of observations stored, or why the city was skipped.
    pub result: Result<usize, CitySyncError>,
}

/// What happened during one pass over the city directory.
#[derive(Debug)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub window: RefreshWindow,
    pub outcomes: Vec<CityOutcome>,
    /// Set when the directory itself could not be read; no city was attempted.
    pub directory_error: Option<StoreError>,
    /// Set when shutdown interrupted the cycle before every city was visited.
    pub cancelled: bool,
}

impl CycleReport {
    fn new(started_at: DateTime<Utc>, window: RefreshWindow) -> Self {
        Self { started_at, window, outcomes: Vec::new(), directory_error: None, cancelled: false }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &CityOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &CityOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn outcome(&self, city_id: CityId) -> Option<&CityOutcome> {
        self.outcomes.iter().find(|o| o.city_id == city_id)
    }

    pub fn stored_observations(&self) -> usize {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok()).sum()
    }

    fn log(&self) {
        let elapsed = Utc::now() - self.started_at;

        if let Some(err) = &self.directory_error {
            error!(error = %err, "Refresh cycle skipped: city directory unavailable");
            return;
        }

        info!(
            cities = self.outcomes.len(),
            succeeded = self.succeeded().count(),
            failed = self.failed().count(),
            observations = self.stored_observations(),
            cancelled = self.cancelled,
            elapsed_ms = elapsed.num_milliseconds(),
            "Refresh cycle finished"
        );
    }
}

/// Runs single refresh cycles. [`SyncScheduler`] drives it on an interval.
#[derive(Clone)]
pub struct SyncWorker {
    provider: Arc<dyn ForecastProvider>,
    directory: Arc<dyn CityDirectory>,
    store: Arc<dyn ObservationStore>,
    fetch_timeout: Duration,
}

impl SyncWorker {
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        provider: Arc<dyn ForecastProvider>,
        directory: Arc<dyn CityDirectory>,
        store: Arc<dyn ObservationStore>,
    ) -> Self {
        Self { provider, directory, store, fetch_timeout: Self::DEFAULT_FETCH_TIMEOUT }
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as if the current time were `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        self.cycle(now, &CancellationToken::new()).await
    }

    async fn cycle(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> CycleReport {
        let window = RefreshWindow::starting_at(now);
        let mut report = CycleReport::new(now, window);

        // Cities added after this point are picked up by the next cycle.
        let cities = match self.directory.list_cities().await {
            Ok(cities) => cities,
            Err(err) => {
                report.directory_error = Some(err);
                return report;
            }
        };

        debug!(cities = cities.len(), start = %window.start, "Starting refresh cycle");

        for city in &cities {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let result = self.sync_city(city, &window, cancel).await;
            match &result {
                Ok(stored) => debug!(city_id = %city.id, stored, "City refreshed"),
                Err(err) => warn!(city_id = %city.id, error = %err, "City refresh failed"),
            }

            report.outcomes.push(CityOutcome { city_id: city.id, result });
        }

        report
    }

    async fn sync_city(
        &self,
        city: &City,
        window: &RefreshWindow,
        cancel: &CancellationToken,
    ) -> Result<usize, CitySyncError> {
        let fetch = tokio::time::timeout(
            self.fetch_timeout,
            self.provider.fetch_hourly_forecast(
                city.latitude,
                city.longitude,
                window.start,
                window.end,
            ),
        );

        // Only the fetch may be abandoned; once the batch is in hand it is persisted.
        let series = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CitySyncError::Cancelled),
            fetched = fetch => fetched.map_err(|_| ProviderError::Timeout(self.fetch_timeout))??,
        };

        let batch = series.into_observations(window.start);
        self.store.append_batch(city.id, &batch).await?;

        Ok(batch.len())
    }
}

/// Owns the single background refresh loop of a process.
///
/// `start` spawns the loop, `stop` asks it to halt and waits for it. The next
/// cycle begins `interval` after the previous one finished.
pub struct SyncScheduler {
    worker: Arc<SyncWorker>,
    interval: Duration,
    reports: broadcast::Sender<Arc<CycleReport>>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl SyncScheduler {
    pub fn new(worker: SyncWorker, interval: Duration) -> Self {
        let (reports, _) = broadcast::channel(16);
        Self { worker: Arc::new(worker), interval, reports, running: None }
    }

    /// Receive a report after every completed cycle.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CycleReport>> {
        self.reports.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.worker.clone(),
            self.interval,
            cancel.clone(),
            self.reports.clone(),
        ));

        info!(interval_secs = self.interval.as_secs(), "Sync scheduler started");
        self.running = Some((cancel, handle));
        Ok(())
    }

    /// Stop scheduling cycles. An in-flight fetch is abandoned; an in-flight
    /// append completes before this returns.
    pub async fn stop(&mut self) {
        let Some((cancel, handle)) = self.running.take() else {
            return;
        };

        cancel.cancel();
        if let Err(err) = handle.await {
            error!(error = %err, "Sync scheduler task ended abnormally");
        }

        info!("Sync scheduler stopped");
    }
}

impl Drop for SyncScheduler {
    /// A dropped scheduler cancels its loop instead of leaving it detached.
    fn drop(&mut self) {
        if let Some((cancel, _)) = &self.running {
            cancel.cancel();
        }
    }
}

async fn run_loop(
    worker: Arc<SyncWorker>,
    interval: Duration,
    cancel: CancellationToken,
    reports: broadcast::Sender<Arc<CycleReport>>,
) {
    loop {
        // Each cycle runs in its own task so a panic cannot end the loop.
        let cycle = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.cycle(Utc::now(), &cancel).await })
        };

        match cycle.await {
            Ok(report) => {
                report.log();
                // No subscribers is fine.
                let _ = reports.send(Arc::new(report));
            }
            Err(err) => error!(error = %err, "Refresh cycle aborted"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
