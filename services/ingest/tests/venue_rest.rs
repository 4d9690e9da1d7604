//! Venue REST paths against a local mock server: response parsing, the
//! rate-limit penalty protocol, and server-error surfacing.

use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Server, ServerGuard};

use config::{default_venues, VenueConfig};
use ingest_service::rate_limit::VenueLimiter;
use ingest_service::venue::{make_adapter, VenueAdapter};
use ingest_service::IngestError;
use types::records::LsrVariant;
use types::venue::Exchange;

fn venue_against(server: &ServerGuard, exchange: Exchange) -> VenueConfig {
    let mut venue = default_venues()
        .into_iter()
        .find(|v| v.exchange == exchange)
        .unwrap();
    venue.rest_url = server.url();
    venue
}

fn adapter_for(
    server: &ServerGuard,
    exchange: Exchange,
) -> (Arc<dyn VenueAdapter>, Arc<VenueLimiter>) {
    let venue = venue_against(server, exchange);
    let limiter = Arc::new(VenueLimiter::new(exchange, &venue.rate_limit));
    let adapter = make_adapter(&venue, limiter.clone(), reqwest::Client::new());
    (adapter, limiter)
}

#[tokio::test]
async fn binance_depth_snapshot_parses() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/v3/depth")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
            Matcher::UrlEncoded("limit".into(), "1000".into()),
        ]))
        .with_body(
            r#"{"lastUpdateId":160,
                "bids":[["100.00","1.5"],["99.50","2.0"]],
                "asks":[["100.50","0.7"]]}"#,
        )
        .create_async()
        .await;

    let (adapter, _) = adapter_for(&server, Exchange::BinanceSpot);
    let snapshot = adapter.fetch_book_snapshot("BTC-USDT").await.unwrap();

    assert!(snapshot.is_snapshot);
    assert_eq!(snapshot.last_update_id, 160);
    assert_eq!(snapshot.bids.len(), 2);
    assert_eq!(snapshot.bids[0].0.to_string(), "100.00");
    assert_eq!(snapshot.asks[0].1.to_string(), "0.7");
}

#[tokio::test]
async fn rate_limit_response_opens_the_penalty_window() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/fapi/v1/openInterest")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("retry-after", "2")
        .create_async()
        .await;

    let (adapter, limiter) = adapter_for(&server, Exchange::BinanceDerivatives);
    let err = adapter.fetch_open_interest("BTC-USDT").await.unwrap_err();

    match err {
        IngestError::VenueRateLimit { retry_after, .. } => {
            assert_eq!(retry_after, Some(Duration::from_secs(2)));
        }
        other => panic!("expected rate limit error, got {other}"),
    }
    // Penalty is 2x the advised retry-after.
    let remaining = limiter.penalty_remaining().expect("penalty open");
    assert!(remaining > Duration::from_secs(3));
    assert!(remaining <= Duration::from_secs(4));
}

#[tokio::test]
async fn server_errors_surface_status_and_body() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/fapi/v1/premiumIndex")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("maintenance")
        .create_async()
        .await;

    let (adapter, limiter) = adapter_for(&server, Exchange::BinanceDerivatives);
    let err = adapter.fetch_funding("BTC-USDT").await.unwrap_err();

    match err {
        IngestError::Rest { status, body, .. } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("expected REST error, got {other}"),
    }
    // 5xx is not a rate limit; no penalty.
    assert!(limiter.penalty_remaining().is_none());
}

#[tokio::test]
async fn okx_funding_rate_fetch_unwraps_the_envelope() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/v5/public/funding-rate")
        .match_query(Matcher::UrlEncoded(
            "instId".into(),
            "BTC-USDT-SWAP".into(),
        ))
        .with_body(
            r#"{"code":"0","msg":"","data":[{
                "instId":"BTC-USDT-SWAP",
                "fundingRate":"0.00012",
                "fundingTime":"1703088000000",
                "nextFundingTime":"1703116800000",
                "ts":"1703070685000"}]}"#,
        )
        .create_async()
        .await;

    let (adapter, _) = adapter_for(&server, Exchange::OkxDerivatives);
    let funding = adapter.fetch_funding("BTC-USDT").await.unwrap();

    assert_eq!(funding.symbol, "BTC-USDT-SWAP");
    assert_eq!(funding.rate.to_string(), "0.00012");
    assert_eq!(funding.funding_time_ms, Some(1_703_088_000_000));
}

#[tokio::test]
async fn okx_error_codes_are_rest_errors() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/v5/public/open-interest")
        .match_query(Matcher::Any)
        .with_body(r#"{"code":"51001","msg":"Instrument ID does not exist","data":[]}"#)
        .create_async()
        .await;

    let (adapter, _) = adapter_for(&server, Exchange::OkxDerivatives);
    let err = adapter.fetch_open_interest("BTC-USDT").await.unwrap_err();
    match err {
        IngestError::Rest { body, .. } => assert!(body.contains("51001")),
        other => panic!("expected REST error, got {other}"),
    }
}

#[tokio::test]
async fn okx_lsr_variants_hit_distinct_endpoints() {
    let mut server = Server::new_async().await;
    let top = server
        .mock(
            "GET",
            "/api/v5/rubik/stat/contracts/long-short-position-ratio-contract-top-trader",
        )
        .match_query(Matcher::Any)
        .with_body(r#"{"code":"0","msg":"","data":[["1701417600000","1.83"]]}"#)
        .create_async()
        .await;
    let all = server
        .mock("GET", "/api/v5/rubik/stat/contracts/long-short-account-ratio")
        .match_query(Matcher::Any)
        .with_body(r#"{"code":"0","msg":"","data":[["1701417600000","1.17"]]}"#)
        .create_async()
        .await;

    let (adapter, _) = adapter_for(&server, Exchange::OkxDerivatives);

    let ratio = adapter
        .fetch_long_short_ratio("BTC-USDT", LsrVariant::TopPosition, "5m")
        .await
        .unwrap();
    assert_eq!(ratio.ratio.to_string(), "1.83");
    assert_eq!(ratio.variant, LsrVariant::TopPosition);

    let ratio = adapter
        .fetch_long_short_ratio("BTC-USDT", LsrVariant::AllAccount, "5m")
        .await
        .unwrap();
    assert_eq!(ratio.ratio.to_string(), "1.17");

    top.assert_async().await;
    all.assert_async().await;
}

#[tokio::test]
async fn deribit_volatility_index_reads_the_latest_candle() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/api/v2/public/get_volatility_index")
        .match_query(Matcher::Any)
        .with_body(
            r#"{"jsonrpc":"2.0","result":{
                "data":[
                    [1619777880000.0, 80.0, 81.0, 79.0, 80.5],
                    [1619777940000.0, 80.5, 85.0, 80.0, 84.25]],
                "continuation":null}}"#,
        )
        .create_async()
        .await;

    let (adapter, _) = adapter_for(&server, Exchange::DeribitDerivatives);
    let vol = adapter.fetch_volatility_index("BTC").await.unwrap();

    assert_eq!(vol.currency, "BTC");
    assert_eq!(vol.resolution_secs, 60);
    assert_eq!(vol.event_time_ms, Some(1_619_777_940_000));
    // The close of the newest candle, via lossless f64 conversion.
    assert!(vol.value.to_string().starts_with("84.25"));
}

#[tokio::test]
async fn spot_feeds_reject_derivative_polls() {
    let server = Server::new_async().await;
    let (adapter, _) = adapter_for(&server, Exchange::BinanceSpot);
    assert!(matches!(
        adapter.fetch_funding("BTC-USDT").await.unwrap_err(),
        IngestError::Unsupported { .. }
    ));
    assert!(matches!(
        adapter.fetch_open_interest("BTC-USDT").await.unwrap_err(),
        IngestError::Unsupported { .. }
    ));
}
