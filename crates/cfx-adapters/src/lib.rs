//! Upstream source contracts: the countries directory and the exchange-rate feed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cfx_core::{RateTable, RawCountry, Upstream};
use cfx_storage::{FetchError, HttpFetcher};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfx-adapters";

/// Status reported when an upstream failed without giving one of its own.
pub const UNAVAILABLE_STATUS: u16 = 503;

/// A failed upstream fetch, tagged with the source it came from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{upstream} upstream unavailable (status {status_code}): {detail}")]
pub struct UpstreamUnavailable {
    pub upstream: Upstream,
    pub status_code: u16,
    pub detail: String,
}

impl UpstreamUnavailable {
    pub fn new(upstream: Upstream, status_code: u16, detail: impl Into<String>) -> Self {
        Self {
            upstream,
            status_code,
            detail: detail.into(),
        }
    }

    pub fn from_fetch_error(upstream: Upstream, err: &FetchError) -> Self {
        let status_code = match err {
            FetchError::HttpStatus { status, .. } => *status,
            FetchError::Request(inner) => inner
                .status()
                .map(|s| s.as_u16())
                .unwrap_or(UNAVAILABLE_STATUS),
        };
        Self::new(upstream, status_code, err.to_string())
    }

    pub fn undecodable(upstream: Upstream, err: &serde_json::Error) -> Self {
        Self::new(
            upstream,
            UNAVAILABLE_STATUS,
            format!("malformed payload: {err}"),
        )
    }
}

#[async_trait]
pub trait CountrySource: Send + Sync {
    async fn fetch_countries(&self, run_id: Uuid) -> Result<Vec<RawCountry>, UpstreamUnavailable>;
}

#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch_rates(&self, run_id: Uuid) -> Result<RateTable, UpstreamUnavailable>;
}

#[derive(Debug, Clone)]
pub struct HttpCountrySource {
    http: HttpFetcher,
    url: String,
}

impl HttpCountrySource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CountrySource for HttpCountrySource {
    async fn fetch_countries(&self, run_id: Uuid) -> Result<Vec<RawCountry>, UpstreamUnavailable> {
        fetch_json(&self.http, run_id, Upstream::Countries, &self.url).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpRateSource {
    http: HttpFetcher,
    url: String,
}

impl HttpRateSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch_rates(&self, run_id: Uuid) -> Result<RateTable, UpstreamUnavailable> {
        fetch_json(&self.http, run_id, Upstream::ExchangeRates, &self.url).await
    }
}

async fn fetch_json<T: DeserializeOwned>(
    http: &HttpFetcher,
    run_id: Uuid,
    upstream: Upstream,
    url: &str,
) -> Result<T, UpstreamUnavailable> {
    let response = http
        .fetch_bytes(run_id, upstream.as_str(), url)
        .await
        .map_err(|err| {
            warn!(%run_id, %upstream, error = %err, "upstream fetch failed");
            UpstreamUnavailable::from_fetch_error(upstream, &err)
        })?;
    serde_json::from_slice(&response.body).map_err(|err| {
        warn!(%run_id, %upstream, error = %err, "upstream payload did not decode");
        UpstreamUnavailable::undecodable(upstream, &err)
    })
}

/// Serves a fixed country list, e.g. one loaded from a fixture file.
#[derive(Debug, Clone, Default)]
pub struct StaticCountrySource {
    countries: Vec<RawCountry>,
}

impl StaticCountrySource {
    pub fn new(countries: Vec<RawCountry>) -> Self {
        Self { countries }
    }
}

#[async_trait]
impl CountrySource for StaticCountrySource {
    async fn fetch_countries(&self, _run_id: Uuid) -> Result<Vec<RawCountry>, UpstreamUnavailable> {
        Ok(self.countries.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticRateSource {
    table: RateTable,
}

impl StaticRateSource {
    pub fn new(table: RateTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch_rates(&self, _run_id: Uuid) -> Result<RateTable, UpstreamUnavailable> {
        Ok(self.table.clone())
    }
}

pub fn load_countries_fixture(path: impl AsRef<Path>) -> Result<Vec<RawCountry>> {
    read_json_file(path)
}

pub fn load_rates_fixture(path: impl AsRef<Path>) -> Result<RateTable> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
