//! End-to-end routing behavior: selector header, pattern scan, default
//! pool, stats endpoint, and routing misses.

use poolgate::config::ProxyConfig;

mod common;

#[tokio::test]
async fn test_pattern_scan_routes_by_uri() {
    let api = common::start_fixed_backend(200, "api backend").await;
    let web = common::start_fixed_backend(200, "web backend").await;

    let mut api_pool = common::pool("api", api);
    api_pool.uri_match = "^/api/".into();
    let web_pool = common::pool("default", web);

    let config = ProxyConfig {
        pools: vec![api_pool, web_pool],
        ..Default::default()
    };
    let (addr, shutdown) = common::start_proxy(config).await;
    let client = common::client();

    let res = client
        .get(format!("http://{addr}/api/users"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "api backend");

    let res = client
        .get(format!("http://{addr}/index.html"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "web backend");

    shutdown.trigger();
}

#[tokio::test]
async fn test_selector_header_overrides_patterns() {
    let main = common::start_fixed_backend(200, "main").await;
    let hidden = common::start_fixed_backend(200, "hidden").await;

    let main_pool = common::pool("default", main);
    let mut hidden_pool = common::pool("hidden", hidden);
    hidden_pool.explicit_only = true;

    let config = ProxyConfig {
        pools: vec![hidden_pool, main_pool],
        ..Default::default()
    };
    let (addr, shutdown) = common::start_proxy(config).await;
    let client = common::client();

    // Without the selector the explicit-only pool is invisible.
    let res = client
        .get(format!("http://{addr}/anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "main");

    // The selector reaches it regardless of its patterns.
    let res = client
        .get(format!("http://{addr}/anything"))
        .header("X-Pool", "hidden")
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "hidden");

    shutdown.trigger();
}

#[tokio::test]
async fn test_no_match_returns_routing_error() {
    let backend = common::start_fixed_backend(200, "narrow").await;
    let mut narrow = common::pool("narrow", backend);
    narrow.uri_match = "^/only$".into();

    let config = ProxyConfig {
        pools: vec![narrow],
        ..Default::default()
    };
    let (addr, shutdown) = common::start_proxy(config).await;

    let res = common::client()
        .get(format!("http://{addr}/miss"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body = res.text().await.unwrap();
    assert!(body.starts_with("ERROR: "), "unexpected body: {body}");

    shutdown.trigger();
}

#[tokio::test]
async fn test_unknown_selector_falls_through_to_scan() {
    let backend = common::start_fixed_backend(200, "default").await;
    let config = ProxyConfig {
        pools: vec![common::pool("default", backend)],
        ..Default::default()
    };
    let (addr, shutdown) = common::start_proxy(config).await;

    let res = common::client()
        .get(format!("http://{addr}/x"))
        .header("X-Pool", "no-such-pool")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().await.unwrap(), "default");

    shutdown.trigger();
}

#[tokio::test]
async fn test_stats_endpoint_reports_pools() {
    let backend = common::start_fixed_backend(200, "ok").await;
    let config = ProxyConfig {
        pools: vec![common::pool("default", backend)],
        stats_uri_match: Some("^/proxy-stats".into()),
        ..Default::default()
    };
    let (addr, shutdown) = common::start_proxy(config).await;
    let client = common::client();

    // Generate some traffic, then wait out a tick so it lands in the
    // published snapshot.
    client
        .get(format!("http://{addr}/work"))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    let res = client
        .get(format!("http://{addr}/proxy-stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let stats: serde_json::Value = res.json().await.unwrap();
    assert!(stats["pools"]["default"].is_object());
    assert_eq!(stats["pools"]["default"]["counters"]["requests"], 1);

    shutdown.trigger();
}
