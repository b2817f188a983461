use std::net::SocketAddr;
use std::time::Duration;

use axum::{http::StatusCode, routing::get, Json, Router};
use cfx_adapters::{CountrySource, HttpCountrySource, HttpRateSource, RateSource, UNAVAILABLE_STATUS};
use cfx_core::Upstream;
use cfx_storage::{HttpClientConfig, HttpFetcher};
use uuid::Uuid;

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route(
            "/all",
            get(|| async {
                Json(serde_json::json!([
                    {"name": "Ghana", "capital": "Accra", "region": "Africa", "population": 30000000,
                     "flag": "https://flagcdn.com/gh.svg",
                     "currencies": [{"code": "GHS", "name": "Ghanaian cedi", "symbol": "₵"}]},
                    {"name": "Atlantis", "population": 1000}
                ]))
            }),
        )
        .route(
            "/latest",
            get(|| async { Json(serde_json::json!({"base_code": "USD", "rates": {"GHS": 15.0}})) }),
        )
        .route("/down", get(|| async { StatusCode::BAD_GATEWAY }))
        .route("/garbage", get(|| async { "<html>maintenance</html>" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("cfx-test/0.1".into()),
    })
    .unwrap()
}

#[tokio::test]
async fn country_source_decodes_directory() {
    let addr = spawn_upstream().await;
    let source = HttpCountrySource::new(fetcher(), format!("http://{addr}/all"));

    let countries = source.fetch_countries(Uuid::new_v4()).await.unwrap();
    assert_eq!(countries.len(), 2);
    assert_eq!(countries[0].currencies[0].code, "GHS");
    assert_eq!(countries[0].flag_url.as_deref(), Some("https://flagcdn.com/gh.svg"));
    assert!(countries[1].currencies.is_empty());
}

#[tokio::test]
async fn rate_source_decodes_table() {
    let addr = spawn_upstream().await;
    let source = HttpRateSource::new(fetcher(), format!("http://{addr}/latest"));

    let table = source.fetch_rates(Uuid::new_v4()).await.unwrap();
    assert_eq!(table.base, "USD");
    assert_eq!(table.rate_for("GHS"), Some(15.0));
}

#[tokio::test]
async fn non_success_status_is_classified_with_upstream_code() {
    let addr = spawn_upstream().await;
    let source = HttpRateSource::new(fetcher(), format!("http://{addr}/down"));

    let err = source.fetch_rates(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.upstream, Upstream::ExchangeRates);
    assert_eq!(err.status_code, 502);
}

#[tokio::test]
async fn malformed_payload_is_classified_unavailable() {
    let addr = spawn_upstream().await;
    let source = HttpCountrySource::new(fetcher(), format!("http://{addr}/garbage"));

    let err = source.fetch_countries(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.upstream, Upstream::Countries);
    assert_eq!(err.status_code, UNAVAILABLE_STATUS);
}

#[tokio::test]
async fn transport_failure_is_classified_unavailable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = HttpCountrySource::new(fetcher(), format!("http://{addr}/all"));
    let err = source.fetch_countries(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.status_code, UNAVAILABLE_STATUS);
}
