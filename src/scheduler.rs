//! Periodic scrape scheduler.
//!
//! One cycle walks every configured URL in order, scrapes it, filters the
//! listings and records matches. Between cycles the scheduler sleeps for the
//! configured interval, or until a new config is published. A config change
//! never affects a cycle already underway.

use crate::{
    config::{Config, UrlFilter},
    error::ScrapeError,
    filter,
    listings::{ListingSource, RawListing, priced_in},
    storage::{AdCandidate, AdStore, DetailsPolicy, UpsertOutcome, default_retention},
};
use chrono::TimeDelta;
use std::{sync::Arc, time::Duration};
use tokio::sync::{oneshot, watch};

/// Knobs that aren't part of the user-editable config.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Extra attempts after a transient scrape failure.
    pub retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
    /// Upper bound on a single scrape call.
    pub call_timeout: Duration,
    /// Pause between two URLs of the same cycle.
    pub url_pause: Duration,
    pub retention: TimeDelta,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            retries: 2,
            retry_backoff: Duration::from_secs(5),
            call_timeout: Duration::from_secs(60),
            url_pause: Duration::from_secs(2),
            retention: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    ReconfigurePending,
    Stopped,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub urls_scraped: usize,
    pub urls_skipped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub pruned: usize,
    /// Ads held by the store once the cycle is done.
    pub stored: usize,
}

pub struct Scheduler {
    source: Arc<dyn ListingSource>,
    store: AdStore,
    config: watch::Receiver<Arc<Config>>,
    settings: SchedulerSettings,
    state: watch::Sender<SchedulerState>,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn ListingSource>,
        store: AdStore,
        config: watch::Receiver<Arc<Config>>,
        settings: SchedulerSettings,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            source,
            store,
            config,
            settings,
            state,
        }
    }

    /// Observes the scheduler's state from outside the loop.
    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Runs cycles until `shutdown` fires (or its sender goes away).
    ///
    /// Shutdown interrupts the sleep, and drops an in-flight cycle at its next
    /// await point, which cancels the pending scrape call.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!("Starting scheduler");

        loop {
            // The config snapshot for the whole cycle.
            let config = self.config.borrow_and_update().clone();
            self.state.send_replace(SchedulerState::Running);

            tokio::select! {
                report = self.run_cycle(&config) => {
                    tracing::info!(
                        "Cycle finished: {} URLs scraped, {} skipped, {} new ads, {} seen again, {} pruned, {} stored",
                        report.urls_scraped,
                        report.urls_skipped,
                        report.inserted,
                        report.updated,
                        report.pruned,
                        report.stored
                    );
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, abandoning the current cycle");
                    break;
                }
            }

            if !self.wait_for_next_cycle(&config, &mut shutdown).await {
                break;
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
        tracing::info!("Scheduler stopped");
    }

    /// Sleeps out the refresh interval. Returns early when a new config is
    /// published, and returns false on shutdown.
    async fn wait_for_next_cycle(
        &mut self,
        config: &Config,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> bool {
        // A save may already have landed while the cycle was running.
        if self.config.has_changed().unwrap_or(false) {
            tracing::info!("Configuration changed during the cycle, starting next cycle now");
            self.state.send_replace(SchedulerState::ReconfigurePending);
            return true;
        }

        self.state.send_replace(SchedulerState::Idle);
        tracing::info!(
            "Next cycle in {} minutes",
            config.refresh_interval_minutes
        );

        let sleep = tokio::time::sleep(config.refresh_interval());
        tokio::pin!(sleep);
        let mut reconfigurable = true;

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.config.changed(), if reconfigurable => match changed {
                    Ok(()) => {
                        tracing::info!("Configuration changed, starting next cycle now");
                        self.state.send_replace(SchedulerState::ReconfigurePending);
                        return true;
                    }
                    Err(_) => {
                        tracing::debug!("Config publisher is gone, no more reloads");
                        reconfigurable = false;
                    }
                },
                _ = &mut *shutdown => return false,
            }
        }
    }

    /// One sweep over every configured URL, followed by a prune.
    pub async fn run_cycle(&self, config: &Config) -> CycleReport {
        tracing::debug!("Checking {} URLs for new ads", config.url_filters.len());

        let policy = DetailsPolicy::from_flag(config.refresh_ad_details);
        let mut report = CycleReport::default();

        for (index, url_filter) in config.url_filters.iter().enumerate() {
            if index > 0 && !self.settings.url_pause.is_zero() {
                tokio::time::sleep(self.settings.url_pause).await;
            }

            // A failing URL only costs this URL this cycle.
            let listings = match self.fetch_with_retries(&url_filter.url).await {
                Ok(listings) => listings,
                Err(error) => {
                    tracing::warn!(url = %url_filter.url, "Skipping URL for this cycle: {error}");
                    report.urls_skipped += 1;
                    continue;
                }
            };
            report.urls_scraped += 1;

            self.record_matches(url_filter, listings, &config.currency, policy, &mut report)
                .await;

            if let Err(error) = self.store.commit().await {
                tracing::error!(url = %url_filter.url, "Failed to persist ads: {error}");
            }
        }

        report.pruned = self.store.prune(self.settings.retention).await;
        if let Err(error) = self.store.commit().await {
            tracing::error!("Failed to persist pruned store: {error}");
        }
        report.stored = self.store.len().await;

        report
    }

    async fn record_matches(
        &self,
        url_filter: &UrlFilter,
        listings: Vec<RawListing>,
        currency: &str,
        policy: DetailsPolicy,
        report: &mut CycleReport,
    ) {
        let total = listings.len();
        let mut matched = 0;

        for listing in listings {
            if !priced_in(&listing.price, currency) {
                tracing::trace!("Ignoring unpriced listing {:?}", listing.title);
                continue;
            }
            if !filter::matches(&listing.title, &url_filter.spec) {
                continue;
            }
            matched += 1;

            let candidate = AdCandidate {
                ad_id: listing.ad_id,
                title: listing.title,
                price: listing.price,
                listing_url: listing.listing_url,
                source_url: url_filter.url.clone(),
            };
            match self.store.upsert(candidate, policy).await {
                UpsertOutcome::Inserted => report.inserted += 1,
                UpsertOutcome::Updated => report.updated += 1,
            }
        }

        tracing::debug!(url = %url_filter.url, "{matched} of {total} listings matched");
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<RawListing>, ScrapeError> {
        let mut attempt = 0;

        loop {
            let result =
                match tokio::time::timeout(self.settings.call_timeout, self.source.fetch_listings(url))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ScrapeError::Transient(format!(
                        "timed out after {:?}",
                        self.settings.call_timeout
                    ))),
                };

            match result {
                Ok(listings) => return Ok(listings),
                Err(error) if error.is_transient() && attempt < self.settings.retries => {
                    let backoff = self
                        .settings
                        .retry_backoff
                        .saturating_mul(1_u32 << attempt.min(16));
                    attempt += 1;
                    tracing::warn!(
                        url,
                        "Scrape failed ({error}), retry {attempt}/{} in {backoff:?}",
                        self.settings.retries
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex,
    };
    use tokio::{sync::mpsc, time::Instant};

    enum Step {
        Fail { transient: bool },
        Hang,
        Delay(Duration),
    }

    /// A scripted listing source. Each URL serves its listings, unless a
    /// scripted step says otherwise for that call.
    struct FakeSource {
        listings: HashMap<String, Vec<RawListing>>,
        script: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: mpsc::UnboundedSender<(String, Instant)>,
    }

    impl FakeSource {
        fn new(
            listings: HashMap<String, Vec<RawListing>>,
        ) -> (Self, mpsc::UnboundedReceiver<(String, Instant)>) {
            let (calls, receiver) = mpsc::unbounded_channel();
            let source = Self {
                listings,
                script: Mutex::new(HashMap::new()),
                calls,
            };
            (source, receiver)
        }

        fn script(self, url: &str, steps: Vec<Step>) -> Self {
            self.script
                .lock()
                .unwrap()
                .insert(url.to_string(), steps.into());
            self
        }
    }

    #[async_trait]
    impl ListingSource for FakeSource {
        async fn fetch_listings(&self, url: &str) -> Result<Vec<RawListing>, ScrapeError> {
            let _ = self.calls.send((url.to_string(), Instant::now()));

            let step = self
                .script
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(VecDeque::pop_front);
            match step {
                Some(Step::Fail { transient: true }) => {
                    return Err(ScrapeError::Transient("temporarily blocked".to_string()));
                }
                Some(Step::Fail { transient: false }) => {
                    return Err(ScrapeError::Fatal("malformed page".to_string()));
                }
                Some(Step::Hang) => std::future::pending::<()>().await,
                Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
                None => {}
            }

            Ok(self.listings.get(url).cloned().unwrap_or_default())
        }
    }

    const TV_URL: &str = "https://www.facebook.com/marketplace/toronto/search?query=tv";
    const DESK_URL: &str = "https://www.facebook.com/marketplace/toronto/search?query=desk";

    fn listing(id: &str, title: &str, price: &str) -> RawListing {
        RawListing {
            ad_id: id.to_string(),
            title: title.to_string(),
            price: price.to_string(),
            listing_url: format!("https://www.facebook.com/marketplace/item/{id}/"),
        }
    }

    fn config(interval_minutes: u64, url_filters: serde_json::Value) -> Arc<Config> {
        Arc::new(
            Config::from_json_value(json!({
                "server_ip": "127.0.0.1",
                "server_port": 5000,
                "currency": "$",
                "refresh_interval_minutes": interval_minutes,
                "url_filters": url_filters,
            }))
            .unwrap(),
        )
    }

    fn tv_and_desk(interval_minutes: u64) -> Arc<Config> {
        config(
            interval_minutes,
            json!({
                TV_URL: {"level1": ["tv"], "level2": ["smart"], "level3": ["55\"", "55 inch"]},
                DESK_URL: {},
            }),
        )
    }

    fn catalogue() -> HashMap<String, Vec<RawListing>> {
        HashMap::from([
            (
                TV_URL.to_string(),
                vec![
                    listing("1", "TCL 55\" smart tv", "$450"),
                    listing("2", "32 inch basic tv", "$60"),
                    listing("3", "Smart TV 55 inch, sponsored", "Sponsored"),
                ],
            ),
            (
                DESK_URL.to_string(),
                vec![listing("4", "Standing desk", "$120"), listing("5", "Free desk", "Free")],
            ),
        ])
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            retries: 2,
            retry_backoff: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
            url_pause: Duration::ZERO,
            retention: TimeDelta::days(7),
        }
    }

    fn scheduler(source: FakeSource, config: watch::Receiver<Arc<Config>>) -> (Scheduler, AdStore) {
        let store = AdStore::open(MemoryBackend::default()).unwrap();
        let scheduler = Scheduler::new(Arc::new(source), store.clone(), config, settings());
        (scheduler, store)
    }

    fn ids(ads: &[crate::storage::Ad]) -> Vec<&str> {
        let mut ids: Vec<&str> = ads.iter().map(|ad| ad.ad_id.as_str()).collect();
        ids.sort();
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_records_matching_ads() {
        let (source, _calls) = FakeSource::new(catalogue());
        let config = tv_and_desk(15);
        let (_tx, rx) = watch::channel(config.clone());
        let (scheduler, store) = scheduler(source, rx);

        let report = scheduler.run_cycle(&config).await;
        assert_eq!(report.urls_scraped, 2);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.updated, 0);

        let ads = store.query_window(TimeDelta::days(7)).await;
        assert_eq!(ids(&ads), vec!["1", "4", "5"]);
        let tv = ads.iter().find(|ad| ad.ad_id == "1").unwrap();
        assert_eq!(tv.source_url, TV_URL);

        // A second pass only refreshes what's already known.
        let report = scheduler.run_cycle(&config).await;
        assert_eq!(report.inserted, 0);
        assert_eq!(report.updated, 3);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (source, mut calls) = FakeSource::new(catalogue());
        let source = source.script(
            TV_URL,
            vec![Step::Fail { transient: true }, Step::Hang],
        );
        let config = config(15, json!({ TV_URL: {"level1": ["tv"]} }));
        let (_tx, rx) = watch::channel(config.clone());
        let (scheduler, store) = scheduler(source, rx);

        let start = Instant::now();
        let report = scheduler.run_cycle(&config).await;

        assert_eq!(report.urls_scraped, 1);
        assert_eq!(report.urls_skipped, 0);
        assert_eq!(ids(&store.query_window(TimeDelta::days(7)).await), vec!["1", "2"]);

        // Fail, 1s backoff, hang until the 30s timeout, 2s backoff, success.
        let times: Vec<Instant> = std::iter::from_fn(|| calls.try_recv().ok())
            .map(|(_, at)| at)
            .collect();
        assert_eq!(times.len(), 3);
        assert_eq!(times[1] - start, Duration::from_secs(1));
        assert_eq!(times[2] - start, Duration::from_secs(33));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_url_does_not_abort_cycle() {
        let (source, mut calls) = FakeSource::new(catalogue());
        let source = source
            .script(
                TV_URL,
                vec![
                    Step::Fail { transient: true },
                    Step::Fail { transient: true },
                    Step::Fail { transient: true },
                ],
            )
            .script(DESK_URL, vec![Step::Fail { transient: false }]);
        let config = tv_and_desk(15);
        let (_tx, rx) = watch::channel(config.clone());
        let (scheduler, store) = scheduler(source, rx);

        let report = scheduler.run_cycle(&config).await;
        assert_eq!(report.urls_scraped, 0);
        assert_eq!(report.urls_skipped, 2);
        assert_eq!(store.len().await, 0);

        // Three attempts for the transient URL, a single one for the fatal one.
        let urls: Vec<String> = std::iter::from_fn(|| calls.try_recv().ok())
            .map(|(url, _)| url)
            .collect();
        assert_eq!(urls, vec![TV_URL, TV_URL, TV_URL, DESK_URL]);

        // The next cycle scrapes both again.
        let report = scheduler.run_cycle(&config).await;
        assert_eq!(report.urls_scraped, 2);
        assert_eq!(report.inserted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_prunes_expired_ads() {
        let (source, _calls) = FakeSource::new(HashMap::new());
        let config = config(15, json!({}));
        let (_tx, rx) = watch::channel(config.clone());
        let (scheduler, store) = scheduler(source, rx);

        let stale = chrono::Utc::now() - TimeDelta::days(8);
        let candidate = AdCandidate {
            ad_id: "old".to_string(),
            title: "Old tv".to_string(),
            price: "$10".to_string(),
            listing_url: "https://www.facebook.com/marketplace/item/old/".to_string(),
            source_url: TV_URL.to_string(),
        };
        store
            .upsert_at(candidate, DetailsPolicy::KeepFirst, stale)
            .await;

        let report = scheduler.run_cycle(&config).await;
        assert_eq!(report.pruned, 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfiguration_interrupts_sleep() {
        let (source, mut calls) = FakeSource::new(catalogue());
        let (tx, rx) = watch::channel(tv_and_desk(15));
        let (scheduler, _store) = scheduler(source, rx);
        let mut state = scheduler.state();

        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        let (_, first) = calls.recv().await.unwrap();
        let _ = calls.recv().await.unwrap();

        // One minute into the 15 minute sleep, drop the interval to 5 minutes.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*state.borrow_and_update(), SchedulerState::Idle);
        tx.send_replace(config(5, json!({ DESK_URL: {} })));

        let (url, second) = calls.recv().await.unwrap();
        assert_eq!(url, DESK_URL);
        assert_eq!(second - first, Duration::from_secs(60));

        let (url, third) = calls.recv().await.unwrap();
        assert_eq!(url, DESK_URL);
        assert_eq!(third - second, Duration::from_secs(300));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfiguration_mid_cycle_waits_for_cycle_end() {
        let (source, mut calls) = FakeSource::new(catalogue());
        let source = source.script(TV_URL, vec![Step::Delay(Duration::from_secs(10))]);
        let (tx, rx) = watch::channel(tv_and_desk(15));
        let (scheduler, store) = scheduler(source, rx);

        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        let (url, start) = calls.recv().await.unwrap();
        assert_eq!(url, TV_URL);

        // Publish while the TV scrape is still in flight.
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send_replace(config(
            15,
            json!({ "https://www.facebook.com/marketplace/toronto/search?query=bike": {} }),
        ));

        // The running cycle still covers the old URL list.
        let (url, at) = calls.recv().await.unwrap();
        assert_eq!(url, DESK_URL);
        assert_eq!(at - start, Duration::from_secs(10));

        // And the next one starts right away with the new list.
        let (url, at) = calls.recv().await.unwrap();
        assert!(url.ends_with("query=bike"));
        assert_eq!(at - start, Duration::from_secs(10));

        assert_eq!(store.len().await, 3);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_the_loop() {
        let (source, mut calls) = FakeSource::new(catalogue());
        let (_tx, rx) = watch::channel(tv_and_desk(15));
        let (scheduler, _store) = scheduler(source, rx);
        let state = scheduler.state();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        calls.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(*state.borrow(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_inflight_scrape() {
        let (source, mut calls) = FakeSource::new(catalogue());
        let source = source.script(TV_URL, vec![Step::Delay(Duration::from_secs(3600))]);
        let (_tx, rx) = watch::channel(tv_and_desk(15));
        let (scheduler, store) = scheduler(source, rx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        calls.recv().await.unwrap();
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(store.len().await, 0);
    }
}
