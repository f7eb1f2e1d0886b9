//! Periodic ingestion of provider data into the measurement store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SourceConfig;
use crate::error::IngestError;
use crate::providers::{CarbonProvider, ProviderRegistry};
use crate::store::{SqliteStore, source_key};

/// How far back each pass fetches, in hours.
pub const HISTORY_WINDOW_HOURS: i64 = 24;

/// Narrows a pass to matching sources; `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct SourceFilter {
    /// Region code, case-insensitive.
    pub region: Option<String>,
    /// Provider name, case-insensitive.
    pub provider: Option<String>,
}

impl SourceFilter {
    /// Matches only sources for `region`.
    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            provider: None,
        }
    }

    fn matches(&self, source: &SourceConfig) -> bool {
        let region_ok = self
            .region
            .as_deref()
            .is_none_or(|r| r.eq_ignore_ascii_case(&source.region));
        let provider_ok = self
            .provider
            .as_deref()
            .is_none_or(|p| p.eq_ignore_ascii_case(&source.provider));
        region_ok && provider_ok
    }
}

/// Outcome of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Sources fetched and stored.
    pub succeeded: usize,
    /// Sources skipped because their provider is not enabled.
    pub skipped: usize,
    /// Sources whose fetch or write failed.
    pub failed: usize,
    /// New rows written across all sources.
    pub inserted: usize,
}

/// Fetches configured sources and stores their readings.
pub struct Ingestor {
    sources: Vec<SourceConfig>,
    providers: ProviderRegistry,
    store: SqliteStore,
}

impl Ingestor {
    /// Creates an ingestor over `sources`.
    pub fn new(sources: Vec<SourceConfig>, providers: ProviderRegistry, store: SqliteStore) -> Self {
        Self {
            sources,
            providers,
            store,
        }
    }

    /// Enabled providers.
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Runs one pass over every source matching `filter`.
    ///
    /// A failing source is logged and counted; the remaining sources still run.
    pub async fn run_once(&self, filter: &SourceFilter) -> IngestReport {
        let mut report = IngestReport::default();

        for source in self.sources.iter().filter(|s| filter.matches(s)) {
            let region = source.region.to_uppercase();
            let provider_name = source.provider.to_lowercase();

            let Some(provider) = self.providers.get(&provider_name) else {
                warn!(
                    provider = %provider_name,
                    region = %region,
                    "provider is not configured or enabled"
                );
                report.skipped += 1;
                continue;
            };

            debug!(region = %region, provider = %provider_name, "fetching");
            match self.ingest_source(&*provider, &region).await {
                Ok(inserted) => {
                    info!(region = %region, provider = %provider_name, inserted, "source ingested");
                    report.succeeded += 1;
                    report.inserted += inserted;
                }
                Err(e) => {
                    error!(region = %region, provider = %provider_name, error = %e, "ingestion failed");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn ingest_source(
        &self,
        provider: &dyn CarbonProvider,
        region: &str,
    ) -> Result<usize, IngestError> {
        let end = Utc::now();
        let rows = provider
            .fetch_history(region, end - chrono::Duration::hours(HISTORY_WINDOW_HOURS), end)
            .await?;

        let store = self.store.clone();
        let key = source_key(provider.name(), region);
        let inserted = tokio::task::spawn_blocking(move || {
            let inserted = store.insert_measurements(&rows)?;
            store.record_ingest_run(&key, end)?;
            Ok::<_, IngestError>(inserted)
        })
        .await??;
        Ok(inserted)
    }

    /// Runs [`Ingestor::run_once`] every `interval` until `shutdown` turns `true`.
    ///
    /// The first pass starts immediately. A pass in progress is finished
    /// before the task exits.
    pub fn spawn_scheduler(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "ingestion scheduler started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.run_once(&SourceFilter::default()).await;
                        debug!(?report, "ingestion pass finished");
                    }
                }
            }
            info!("ingestion scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};

    use super::*;
    use crate::error::ProviderError;
    use crate::store::Measurement;

    struct Fixed {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Fixed {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl CarbonProvider for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_history(
            &self,
            region: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Measurement>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Payload {
                    provider: self.name,
                    message: "boom".into(),
                });
            }
            Ok((0..3)
                .map(|i| Measurement {
                    time: Utc.with_ymd_and_hms(2024, 1, 1, i, 0, 0).unwrap(),
                    region: region.to_uppercase(),
                    provider: source_key(self.name, region),
                    carbon_intensity: 100.0 + f64::from(i),
                    estimation: false,
                })
                .collect())
        }
    }

    fn source(region: &str, provider: &str) -> SourceConfig {
        SourceConfig {
            region: region.into(),
            provider: provider.into(),
            primary: false,
        }
    }

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("ingest.db"), Duration::from_secs(5)).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn run_once_stores_each_source_once() {
        let (_dir, store) = store();
        let mut registry = ProviderRegistry::default();
        let good = Fixed::new("energycharts", false);
        registry.register(good.clone());

        let ingestor = Ingestor::new(
            vec![source("de", "EnergyCharts"), source("FR", "energycharts")],
            registry,
            store.clone(),
        );

        let report = ingestor.run_once(&SourceFilter::default()).await;
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.inserted, 6);
        assert_eq!(store.count_measurements().unwrap(), 6);

        let again = ingestor.run_once(&SourceFilter::default()).await;
        assert_eq!(again.inserted, 0);

        let runs = store.last_ingest_runs().unwrap();
        let keys: Vec<&str> = runs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["energycharts_de", "energycharts_fr"]);
    }

    #[tokio::test]
    async fn failures_and_unknown_providers_do_not_stop_the_pass() {
        let (_dir, store) = store();
        let mut registry = ProviderRegistry::default();
        registry.register(Fixed::new("electricitymaps", true));
        registry.register(Fixed::new("energycharts", false));

        let ingestor = Ingestor::new(
            vec![
                source("DE", "electricitymaps"),
                source("DE", "smard"),
                source("DE", "energycharts"),
            ],
            registry,
            store.clone(),
        );

        let report = ingestor.run_once(&SourceFilter::default()).await;
        assert_eq!(
            report,
            IngestReport {
                succeeded: 1,
                skipped: 1,
                failed: 1,
                inserted: 3,
            }
        );
    }

    #[tokio::test]
    async fn filter_limits_sources() {
        let (_dir, store) = store();
        let provider = Fixed::new("energycharts", false);
        let mut registry = ProviderRegistry::default();
        registry.register(provider.clone());

        let ingestor = Ingestor::new(
            vec![source("DE", "energycharts"), source("FR", "energycharts")],
            registry,
            store,
        );

        let report = ingestor.run_once(&SourceFilter::region("fr")).await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scheduler_runs_until_shutdown() {
        let (_dir, store) = store();
        let provider = Fixed::new("energycharts", false);
        let mut registry = ProviderRegistry::default();
        registry.register(provider.clone());
        let ingestor = Arc::new(Ingestor::new(
            vec![source("DE", "energycharts")],
            registry,
            store,
        ));

        let (tx, rx) = watch::channel(false);
        let handle = ingestor.spawn_scheduler(Duration::from_millis(20), rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(provider.calls.load(Ordering::SeqCst) >= 1);
    }
}
