//! Refresh pipeline: concurrent fetch, reconciliation, batch upsert, status.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfx_adapters::{
    load_countries_fixture, load_rates_fixture, CountrySource, HttpCountrySource, HttpRateSource,
    RateSource, StaticCountrySource, StaticRateSource, UpstreamUnavailable,
};
use cfx_core::{CountryRecord, RateTable, RawCountry, RefreshOutcome, RefreshStatus};
use cfx_storage::{CountryStore, HttpClientConfig, HttpFetcher, MemoryCountryStore, PgCountryStore, StoreError};
use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfx-sync";

pub const DEFAULT_COUNTRIES_URL: &str =
    "https://restcountries.com/v2/all?fields=name,capital,region,population,flag,currencies";
pub const DEFAULT_EXCHANGE_RATE_URL: &str = "https://open.er-api.com/v6/latest/USD";

/// Bounds of the per-country multiplier in the synthetic GDP estimate.
pub const GDP_MULTIPLIER_MIN: f64 = 1000.0;
pub const GDP_MULTIPLIER_MAX: f64 = 2000.0;

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub countries_url: String,
    pub exchange_rate_url: String,
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

impl RefreshConfig {
    pub fn from_env() -> Self {
        Self {
            countries_url: std::env::var("COUNTRIES_API_ALL")
                .unwrap_or_else(|_| DEFAULT_COUNTRIES_URL.to_string()),
            exchange_rate_url: std::env::var("EXCHANGE_RATE_API")
                .unwrap_or_else(|_| DEFAULT_EXCHANGE_RATE_URL.to_string()),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("CFX_USER_AGENT").unwrap_or_else(|_| "cfx-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("CFX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            web_port: std::env::var("CFX_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

/// Source of the random multiplier used by the GDP estimate.
pub trait RandomSource: Send + Sync {
    /// Next value in `[lo, hi)`.
    fn next_in_range(&self, lo: f64, hi: f64) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandomSource;

impl RandomSource for ThreadRandomSource {
    fn next_in_range(&self, lo: f64, hi: f64) -> f64 {
        if lo >= hi {
            return lo;
        }
        rand::thread_rng().gen_range(lo..hi)
    }
}

/// How a country's declared currency relates to the rate table.
#[derive(Debug, Clone, PartialEq)]
pub enum CurrencyResolution {
    NoCurrency,
    Unresolved { code: String },
    Resolved { code: String, rate: f64 },
}

impl CurrencyResolution {
    pub fn classify(country: &RawCountry, rates: &RateTable) -> Self {
        let Some(currency) = country.primary_currency() else {
            return CurrencyResolution::NoCurrency;
        };
        match rates.rate_for(&currency.code) {
            Some(rate) => CurrencyResolution::Resolved {
                code: currency.code.clone(),
                rate,
            },
            None => CurrencyResolution::Unresolved {
                code: currency.code.clone(),
            },
        }
    }
}

/// Reconciled batch, in the input order of the countries directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub records: Vec<CountryRecord>,
    pub countries_with_no_currency: Vec<String>,
    pub countries_with_unresolved_currency: Vec<String>,
}

/// Joins countries against the rate table and derives the economic fields.
///
/// The GDP figure is a synthetic estimator, `population * k / rate` with `k`
/// drawn from `[GDP_MULTIPLIER_MIN, GDP_MULTIPLIER_MAX)` per country, so it
/// varies from run to run. Countries without a currency get an estimate of
/// `0`; countries whose currency has no usable rate get none at all.
pub struct Reconciler<'a> {
    random: &'a dyn RandomSource,
}

impl<'a> Reconciler<'a> {
    pub fn new(random: &'a dyn RandomSource) -> Self {
        Self { random }
    }

    pub fn reconcile(
        &self,
        countries: &[RawCountry],
        rates: &RateTable,
        refreshed_at: DateTime<Utc>,
    ) -> Reconciliation {
        let mut out = Reconciliation {
            records: Vec::with_capacity(countries.len()),
            countries_with_no_currency: Vec::new(),
            countries_with_unresolved_currency: Vec::new(),
        };

        for country in countries {
            let (currency_code, exchange_rate, estimated_gdp) =
                match CurrencyResolution::classify(country, rates) {
                    CurrencyResolution::NoCurrency => {
                        out.countries_with_no_currency.push(country.name.clone());
                        (None, None, Some(0.0))
                    }
                    CurrencyResolution::Unresolved { code } => {
                        debug!(country = %country.name, %code, "currency has no usable rate");
                        out.countries_with_unresolved_currency
                            .push(country.name.clone());
                        (None, None, None)
                    }
                    CurrencyResolution::Resolved { code, rate } => {
                        let k = self
                            .random
                            .next_in_range(GDP_MULTIPLIER_MIN, GDP_MULTIPLIER_MAX);
                        let gdp = country.population as f64 * k / rate;
                        (Some(code), Some(rate), Some(gdp))
                    }
                };

            out.records.push(CountryRecord {
                id: Uuid::new_v4(),
                name: country.name.clone(),
                capital: country.capital.clone(),
                region: country.region.clone(),
                population: country.population,
                currency_code,
                exchange_rate,
                estimated_gdp,
                flag_url: country.flag_url.clone(),
                last_refreshed_at: refreshed_at,
            });
        }

        out
    }
}

/// Writes a reconciled batch through a store in one call.
#[derive(Clone)]
pub struct BatchUpsertCoordinator {
    store: Arc<dyn CountryStore>,
}

impl BatchUpsertCoordinator {
    pub fn new(store: Arc<dyn CountryStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, run_id: Uuid, records: &[CountryRecord]) -> Result<usize, StoreError> {
        match self.store.upsert_countries(records).await {
            Ok(written) => {
                info!(%run_id, written, "upserted country batch");
                Ok(written)
            }
            Err(err) => {
                warn!(%run_id, error = %err, batch = records.len(), "country batch upsert failed");
                Err(err)
            }
        }
    }
}

/// Last committed refresh: when it happened and how many records it wrote.
#[derive(Debug, Default)]
pub struct StatusTracker {
    state: RwLock<RefreshStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_refresh(&self, timestamp: DateTime<Utc>) {
        self.state.write().await.last_refreshed_at = Some(timestamp);
    }

    pub async fn record_count(&self, total: u64) {
        self.state.write().await.total_countries = total;
    }

    /// Overwrites timestamp and count together.
    pub async fn record_run(&self, timestamp: DateTime<Utc>, total: u64) {
        *self.state.write().await = RefreshStatus {
            last_refreshed_at: Some(timestamp),
            total_countries: total,
        };
    }

    pub async fn get_status(&self) -> RefreshStatus {
        *self.state.read().await
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Upstream(#[from] UpstreamUnavailable),
    #[error("storage failure: {cause}")]
    Storage { cause: String },
}

impl From<StoreError> for RefreshError {
    fn from(err: StoreError) -> Self {
        RefreshError::Storage {
            cause: err.to_string(),
        }
    }
}

pub struct RefreshService {
    countries: Arc<dyn CountrySource>,
    rates: Arc<dyn RateSource>,
    store: Arc<dyn CountryStore>,
    upserter: BatchUpsertCoordinator,
    status: Arc<StatusTracker>,
    random: Arc<dyn RandomSource>,
    commit_lock: Mutex<()>,
}

impl RefreshService {
    pub fn new(
        countries: Arc<dyn CountrySource>,
        rates: Arc<dyn RateSource>,
        store: Arc<dyn CountryStore>,
        status: Arc<StatusTracker>,
    ) -> Self {
        Self {
            countries,
            rates,
            upserter: BatchUpsertCoordinator::new(store.clone()),
            store,
            status,
            random: Arc::new(ThreadRandomSource),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn with_random_source(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn store(&self) -> &Arc<dyn CountryStore> {
        &self.store
    }

    /// One refresh run. Both upstreams are fetched concurrently; the first
    /// failure aborts the run before anything is written.
    pub async fn refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        let run_id = Uuid::new_v4();
        // Microsecond precision survives a TIMESTAMPTZ round-trip unchanged.
        let refreshed_at = Utc::now().trunc_subsecs(6);
        info!(%run_id, "refresh started");

        let (countries, rates) = tokio::try_join!(
            self.countries.fetch_countries(run_id),
            self.rates.fetch_rates(run_id),
        )
        .inspect_err(|err| warn!(%run_id, error = %err, "refresh aborted by upstream failure"))?;

        let reconciled =
            Reconciler::new(self.random.as_ref()).reconcile(&countries, &rates, refreshed_at);

        let _commit = self.commit_lock.lock().await;
        let records_written = self.upserter.upsert(run_id, &reconciled.records).await?;
        self.status
            .record_run(refreshed_at, records_written as u64)
            .await;

        info!(
            %run_id,
            records_written,
            no_currency = reconciled.countries_with_no_currency.len(),
            unresolved_currency = reconciled.countries_with_unresolved_currency.len(),
            "refresh finished"
        );

        Ok(RefreshOutcome {
            run_id,
            refreshed_at,
            records_written,
            countries_with_no_currency: reconciled.countries_with_no_currency,
            countries_with_unresolved_currency: reconciled.countries_with_unresolved_currency,
        })
    }

    pub async fn status(&self) -> RefreshStatus {
        self.status.get_status().await
    }

    /// Status derived from the store aggregates rather than this process.
    pub async fn store_status(&self) -> Result<RefreshStatus, RefreshError> {
        let total_countries = self.store.count().await?;
        let last_refreshed_at = self.store.last_refreshed_at().await?;
        Ok(RefreshStatus {
            last_refreshed_at,
            total_countries,
        })
    }
}

pub async fn connect_store(config: &RefreshConfig) -> Result<Arc<dyn CountryStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgCountryStore::connect(url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory country store");
            Ok(Arc::new(MemoryCountryStore::new()))
        }
    }
}

pub async fn service_from_config(config: &RefreshConfig) -> Result<RefreshService> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let store = connect_store(config).await?;
    Ok(RefreshService::new(
        Arc::new(HttpCountrySource::new(http.clone(), &config.countries_url)),
        Arc::new(HttpRateSource::new(http, &config.exchange_rate_url)),
        store,
        Arc::new(StatusTracker::new()),
    ))
}

/// Builds a service whose upstreams are `countries.json` and `rates.json` in `dir`.
pub async fn fixture_service(
    config: &RefreshConfig,
    dir: &std::path::Path,
) -> Result<RefreshService> {
    let countries = load_countries_fixture(dir.join("countries.json"))?;
    let rates = load_rates_fixture(dir.join("rates.json"))?;
    let store = connect_store(config).await?;
    Ok(RefreshService::new(
        Arc::new(StaticCountrySource::new(countries)),
        Arc::new(StaticRateSource::new(rates)),
        store,
        Arc::new(StatusTracker::new()),
    ))
}
