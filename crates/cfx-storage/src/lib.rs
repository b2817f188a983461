//! Country persistence backends + HTTP fetch utilities.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cfx_core::{CountryQuery, CountryRecord, CountrySort};
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfx-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-attempt HTTP GET client. Failures are returned to the caller as-is.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched upstream payload");
            Ok(FetchedResponse { body })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid country row: {0}")]
    InvalidRow(String),
}

/// Country table keyed uniquely by name.
///
/// `upsert_countries` applies a whole batch or nothing: inserting unseen names,
/// overwriting every mutable field of known ones and keeping their `id`. It
/// returns the number of distinct names written; a name repeated within the
/// batch ends up as one row holding its last occurrence.
#[async_trait]
pub trait CountryStore: Send + Sync {
    async fn upsert_countries(&self, records: &[CountryRecord]) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn last_refreshed_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn list_countries(&self, query: &CountryQuery) -> Result<Vec<CountryRecord>, StoreError>;

    /// Case-insensitive lookup by name.
    async fn get_country(&self, name: &str) -> Result<Option<CountryRecord>, StoreError>;

    /// Removes every row whose name matches case-insensitively. Returns
    /// whether anything was removed.
    async fn delete_country(&self, name: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryCountryStore {
    rows: RwLock<BTreeMap<String, CountryRecord>>,
}

impl MemoryCountryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CountryStore for MemoryCountryStore {
    async fn upsert_countries(&self, records: &[CountryRecord]) -> Result<usize, StoreError> {
        let mut rows = self.rows.write().await;
        for record in records {
            rows.entry(record.name.clone())
                .and_modify(|existing| {
                    let id = existing.id;
                    *existing = CountryRecord {
                        id,
                        ..record.clone()
                    };
                })
                .or_insert_with(|| record.clone());
        }
        Ok(distinct_names(records))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.rows.read().await.len() as u64)
    }

    async fn last_refreshed_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .map(|r| r.last_refreshed_at)
            .max())
    }

    async fn list_countries(&self, query: &CountryQuery) -> Result<Vec<CountryRecord>, StoreError> {
        let mut out = self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.matches(query))
            .cloned()
            .collect::<Vec<_>>();
        if let Some(sort) = query.sort {
            out.sort_by(|a, b| sort.compare(a, b));
        }
        Ok(out)
    }

    async fn get_country(&self, name: &str) -> Result<Option<CountryRecord>, StoreError> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|r| same_name(&r.name, name))
            .cloned())
    }

    async fn delete_country(&self, name: &str) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|key, _| !same_name(key, name));
        Ok(rows.len() < before)
    }
}

const COUNTRY_COLUMNS: &str = "id, name, capital, region, population, currency_code, \
     exchange_rate, estimated_gdp, flag_url, last_refreshed_at";

#[derive(Debug, Clone)]
pub struct PgCountryStore {
    pool: PgPool,
}

impl PgCountryStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CountryStore for PgCountryStore {
    async fn upsert_countries(&self, records: &[CountryRecord]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            let population = i64::try_from(record.population).map_err(|_| {
                StoreError::InvalidRow(format!(
                    "population {} of {} overflows BIGINT",
                    record.population, record.name
                ))
            })?;
            sqlx::query(
                r#"
                INSERT INTO countries (
                    id, name, capital, region, population, currency_code,
                    exchange_rate, estimated_gdp, flag_url, last_refreshed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (name) DO UPDATE SET
                    capital = EXCLUDED.capital,
                    region = EXCLUDED.region,
                    population = EXCLUDED.population,
                    currency_code = EXCLUDED.currency_code,
                    exchange_rate = EXCLUDED.exchange_rate,
                    estimated_gdp = EXCLUDED.estimated_gdp,
                    flag_url = EXCLUDED.flag_url,
                    last_refreshed_at = EXCLUDED.last_refreshed_at
                "#,
            )
            .bind(record.id)
            .bind(&record.name)
            .bind(&record.capital)
            .bind(&record.region)
            .bind(population)
            .bind(&record.currency_code)
            .bind(record.exchange_rate)
            .bind(record.estimated_gdp)
            .bind(&record.flag_url)
            .bind(record.last_refreshed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(distinct_names(records))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM countries")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as u64)
    }

    async fn last_refreshed_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(last_refreshed_at) FROM countries")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn list_countries(&self, query: &CountryQuery) -> Result<Vec<CountryRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {COUNTRY_COLUMNS} FROM countries WHERE TRUE"
        ));
        if let Some(region) = &query.region {
            qb.push(" AND lower(region) = lower(")
                .push_bind(region.clone())
                .push(")");
        }
        if let Some(currency) = &query.currency {
            qb.push(" AND lower(currency_code) = lower(")
                .push_bind(currency.clone())
                .push(")");
        }
        if let Some(population) = query.population {
            let population = i64::try_from(population).map_err(|_| {
                StoreError::InvalidRow(format!("population filter {population} overflows BIGINT"))
            })?;
            qb.push(" AND population = ").push_bind(population);
        }
        if let Some(rate) = query.exchange_rate {
            qb.push(" AND exchange_rate = ").push_bind(rate);
        }
        qb.push(order_by_clause(query.sort));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn get_country(&self, name: &str) -> Result<Option<CountryRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COUNTRY_COLUMNS} FROM countries WHERE lower(name) = lower($1) LIMIT 1"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn delete_country(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM countries WHERE lower(name) = lower($1)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn distinct_names(records: &[CountryRecord]) -> usize {
    records
        .iter()
        .map(|r| r.name.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Name comparison used by lookups and deletes, matching Postgres `lower()`.
fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn order_by_clause(sort: Option<CountrySort>) -> &'static str {
    match sort {
        None => " ORDER BY name",
        Some(CountrySort::GdpAsc) => " ORDER BY estimated_gdp ASC NULLS LAST, name",
        Some(CountrySort::GdpDesc) => " ORDER BY estimated_gdp DESC NULLS LAST, name",
        Some(CountrySort::PopulationAsc) => " ORDER BY population ASC, name",
        Some(CountrySort::PopulationDesc) => " ORDER BY population DESC, name",
    }
}

fn row_to_record(row: &PgRow) -> Result<CountryRecord, StoreError> {
    let name: String = row.try_get("name")?;
    let population: i64 = row.try_get("population")?;
    let population = u64::try_from(population)
        .map_err(|_| StoreError::InvalidRow(format!("negative population for {name}")))?;
    Ok(CountryRecord {
        id: row.try_get("id")?,
        capital: row.try_get("capital")?,
        region: row.try_get("region")?,
        population,
        currency_code: row.try_get("currency_code")?,
        exchange_rate: row.try_get("exchange_rate")?,
        estimated_gdp: row.try_get("estimated_gdp")?,
        flag_url: row.try_get("flag_url")?,
        last_refreshed_at: row.try_get("last_refreshed_at")?,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, hour, 0, 0)
            .single()
            .unwrap()
    }

    fn record(name: &str, region: &str, gdp: Option<f64>, at: DateTime<Utc>) -> CountryRecord {
        CountryRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            capital: format!("{name} City"),
            region: region.to_string(),
            population: 1_000,
            currency_code: gdp.map(|_| "GHS".to_string()),
            exchange_rate: gdp.map(|_| 15.0),
            estimated_gdp: gdp,
            flag_url: None,
            last_refreshed_at: at,
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_in_place_and_keeps_id() {
        let store = MemoryCountryStore::new();
        let first = record("Ghana", "Africa", Some(1.0), ts(1));
        store.upsert_countries(&[first.clone()]).await.unwrap();

        let mut second = record("Ghana", "Africa", Some(2.0), ts(2));
        second.capital = "Accra".into();
        let written = store.upsert_countries(&[second]).await.unwrap();

        assert_eq!(written, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        let row = store.get_country("ghana").await.unwrap().unwrap();
        assert_eq!(row.id, first.id);
        assert_eq!(row.capital, "Accra");
        assert_eq!(row.estimated_gdp, Some(2.0));
        assert_eq!(store.last_refreshed_at().await.unwrap(), Some(ts(2)));
    }

    #[tokio::test]
    async fn repeated_name_in_one_batch_counts_once() {
        let store = MemoryCountryStore::new();
        let written = store
            .upsert_countries(&[
                record("Ghana", "Africa", Some(1.0), ts(1)),
                record("Ghana", "Africa", Some(2.0), ts(1)),
                record("Togo", "Africa", None, ts(1)),
            ])
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(store.count().await.unwrap(), 2);
        let ghana = store.get_country("Ghana").await.unwrap().unwrap();
        assert_eq!(ghana.estimated_gdp, Some(2.0));
    }

    #[tokio::test]
    async fn empty_store_aggregates() {
        let store = MemoryCountryStore::new();
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.last_refreshed_at().await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_filters_and_sorts() {
        let store = MemoryCountryStore::new();
        store
            .upsert_countries(&[
                record("Ghana", "Africa", Some(5.0), ts(1)),
                record("Nigeria", "Africa", Some(9.0), ts(1)),
                record("Nowhere", "Africa", None, ts(1)),
                record("France", "Europe", Some(20.0), ts(1)),
            ])
            .await
            .unwrap();

        let africa = store
            .list_countries(&CountryQuery {
                region: Some("AFRICA".into()),
                sort: Some(CountrySort::GdpDesc),
                ..Default::default()
            })
            .await
            .unwrap();
        let names: Vec<_> = africa.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["Nigeria", "Ghana", "Nowhere"]);

        let unsorted = store.list_countries(&CountryQuery::default()).await.unwrap();
        let names: Vec<_> = unsorted.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["France", "Ghana", "Nigeria", "Nowhere"]);
    }

    #[tokio::test]
    async fn delete_reports_whether_row_existed() {
        let store = MemoryCountryStore::new();
        store
            .upsert_countries(&[record("Ghana", "Africa", None, ts(1))])
            .await
            .unwrap();
        assert!(store.delete_country("GHANA").await.unwrap());
        assert!(!store.delete_country("Ghana").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_removes_every_case_variant() {
        let store = MemoryCountryStore::new();
        store
            .upsert_countries(&[
                record("Côte d'Ivoire", "Africa", None, ts(1)),
                record("CÔTE D'IVOIRE", "Africa", None, ts(1)),
                record("Ghana", "Africa", None, ts(1)),
            ])
            .await
            .unwrap();
        assert!(store.get_country("côte d'ivoire").await.unwrap().is_some());
        assert!(store.delete_country("côte d'ivoire").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.get_country("Ghana").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn postgres_upsert_is_keyed_by_name() {
        let Ok(url) = std::env::var("CFX_TEST_DATABASE_URL") else {
            return;
        };
        let store = PgCountryStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");

        let name = format!("Testland-{}", Uuid::new_v4());
        let at = ts(4) + chrono::Duration::microseconds(123_456);
        let first = record(&name, "Oceania", Some(1.0), ts(3));
        let second = record(&name, "Oceania", None, at);
        store.upsert_countries(&[first.clone()]).await.unwrap();
        let written = store
            .upsert_countries(&[second.clone(), second])
            .await
            .unwrap();

        assert_eq!(written, 1);
        let row = store.get_country(&name).await.unwrap().unwrap();
        assert_eq!(row.id, first.id);
        assert_eq!(row.estimated_gdp, None);
        assert_eq!(row.last_refreshed_at, at);
        assert!(store.delete_country(&name).await.unwrap());
    }
}
