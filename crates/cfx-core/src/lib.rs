//! Core domain model for the country + exchange-rate cache.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfx-core";

/// Tags which upstream a fetch or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Upstream {
    Countries,
    ExchangeRates,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::Countries => "countries",
            Upstream::ExchangeRates => "exchange_rates",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Upstream::Countries => "Rest Countries API",
            Upstream::ExchangeRates => "Exchange Rate API",
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    #[serde(default, deserialize_with = "null_as_default")]
    pub code: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub symbol: String,
}

/// One entry of the countries directory, as fetched.
///
/// A missing or `null` `currencies` field deserializes to an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCountry {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub capital: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub region: String,
    #[serde(default)]
    pub population: u64,
    #[serde(default, rename = "flag", alias = "flag_url")]
    pub flag_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub currencies: Vec<Currency>,
}

impl RawCountry {
    /// The nominal currency. Later entries are never consulted.
    pub fn primary_currency(&self) -> Option<&Currency> {
        self.currencies.first()
    }
}

/// Exchange rates keyed by currency code, relative to `base`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RateTable {
    #[serde(default, alias = "base_code")]
    pub base: String,
    #[serde(default)]
    pub rates: BTreeMap<String, f64>,
}

impl RateTable {
    /// Returns a rate usable as a divisor. Zero, negative and non-finite
    /// rates count as unresolved.
    pub fn rate_for(&self, code: &str) -> Option<f64> {
        self.rates
            .get(code)
            .copied()
            .filter(|rate| rate.is_finite() && *rate > 0.0)
    }
}

/// Canonical persisted row, one per distinct country name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryRecord {
    pub id: Uuid,
    pub name: String,
    pub capital: String,
    pub region: String,
    pub population: u64,
    pub currency_code: Option<String>,
    pub exchange_rate: Option<f64>,
    pub estimated_gdp: Option<f64>,
    pub flag_url: Option<String>,
    pub last_refreshed_at: DateTime<Utc>,
}

impl CountryRecord {
    pub fn matches(&self, query: &CountryQuery) -> bool {
        let region_ok = query
            .region
            .as_deref()
            .map_or(true, |region| self.region.eq_ignore_ascii_case(region));
        let currency_ok = query.currency.as_deref().map_or(true, |code| {
            self.currency_code
                .as_deref()
                .is_some_and(|own| own.eq_ignore_ascii_case(code))
        });
        let population_ok = query
            .population
            .map_or(true, |population| self.population == population);
        let rate_ok = query
            .exchange_rate
            .map_or(true, |rate| self.exchange_rate == Some(rate));
        region_ok && currency_ok && population_ok && rate_ok
    }
}

/// Summary handed back to the caller of a refresh. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub refreshed_at: DateTime<Utc>,
    pub records_written: usize,
    pub countries_with_no_currency: Vec<String>,
    pub countries_with_unresolved_currency: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RefreshStatus {
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub total_countries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountrySort {
    GdpAsc,
    GdpDesc,
    PopulationAsc,
    PopulationDesc,
}

impl CountrySort {
    /// Orders two records; countries without an estimate always sort last.
    pub fn compare(&self, a: &CountryRecord, b: &CountryRecord) -> Ordering {
        match self {
            CountrySort::GdpAsc => cmp_nulls_last(a.estimated_gdp, b.estimated_gdp, false),
            CountrySort::GdpDesc => cmp_nulls_last(a.estimated_gdp, b.estimated_gdp, true),
            CountrySort::PopulationAsc => a.population.cmp(&b.population),
            CountrySort::PopulationDesc => b.population.cmp(&a.population),
        }
        .then_with(|| a.name.cmp(&b.name))
    }
}

fn cmp_nulls_last(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => {
            let ord = x.total_cmp(&y);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CountryQuery {
    pub region: Option<String>,
    #[serde(alias = "currency_code")]
    pub currency: Option<String>,
    pub population: Option<u64>,
    pub exchange_rate: Option<f64>,
    pub sort: Option<CountrySort>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
