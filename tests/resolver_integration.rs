//! Integration tests for candidate resolution.
//!
//! The doi.org handle API and Unpaywall are both served by wiremock.

use std::sync::Arc;
use std::time::Duration;

use doifetch_core::resolver::build_default_resolver;
use doifetch_core::{
    CandidateResolver, Doi, DoiOrgLocator, FetchConfig, HostThrottle, OpenAccessLookup,
    PublisherLocator, ResolveError, SourceKind, UnpaywallLookup,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

const EMAIL: &str = "team@example.org";

fn throttle() -> Arc<HostThrottle> {
    Arc::new(HostThrottle::new(Duration::ZERO))
}

fn doi() -> Doi {
    Doi::parse("10.1234/example").expect("valid DOI")
}

fn handle_body(url: &str) -> serde_json::Value {
    json!({
        "responseCode": 1,
        "handle": "10.1234/example",
        "values": [
            {"index": 100, "type": "HS_ADMIN", "data": {"format": "admin", "value": {"handle": "0.na/10.1234"}}},
            {"index": 1, "type": "URL", "data": {"format": "string", "value": url}}
        ]
    })
}

fn unpaywall_body() -> serde_json::Value {
    json!({
        "doi": "10.1234/example",
        "is_oa": true,
        "best_oa_location": {
            "url": "https://repo.example/record/1",
            "url_for_pdf": "https://repo.example/record/1/paper.pdf",
            "host_type": "repository"
        },
        "oa_locations": [
            {"url": "https://repo.example/record/1", "url_for_pdf": "https://repo.example/record/1/paper.pdf", "host_type": "repository"},
            {"url": "https://pub.example/article/1", "url_for_pdf": null, "host_type": "publisher"}
        ]
    })
}

async fn mount_handle(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/api/handles/10.1234/example"))
        .and(query_param("type", "URL"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_unpaywall(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/v2/10.1234/example"))
        .and(query_param("email", EMAIL))
        .respond_with(response)
        .mount(server)
        .await;
}

fn config_for(server: &MockServer, email: Option<&str>) -> FetchConfig {
    FetchConfig {
        doi_org_base_url: server.uri(),
        unpaywall_base_url: server.uri(),
        unpaywall_email: email.map(str::to_string),
        api_min_interval: Duration::ZERO,
        ..FetchConfig::default()
    }
}

#[tokio::test]
async fn test_doi_org_returns_registered_url() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(
        &server,
        ResponseTemplate::new(200).set_body_json(handle_body("https://pub.example/article/1")),
    )
    .await;

    let locator = DoiOrgLocator::with_base_url(server.uri(), throttle()).unwrap();
    let located = locator.locate(&doi()).await.unwrap();

    assert_eq!(located.as_deref(), Some("https://pub.example/article/1"));
}

#[tokio::test]
async fn test_doi_org_unknown_doi_is_none() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(
        &server,
        ResponseTemplate::new(404).set_body_json(json!({"responseCode": 100, "handle": "10.1234/example"})),
    )
    .await;

    let locator = DoiOrgLocator::with_base_url(server.uri(), throttle()).unwrap();
    assert_eq!(locator.locate(&doi()).await.unwrap(), None);
}

#[tokio::test]
async fn test_doi_org_server_error_is_reported() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(&server, ResponseTemplate::new(500)).await;

    let locator = DoiOrgLocator::with_base_url(server.uri(), throttle()).unwrap();
    let err = locator.locate(&doi()).await.unwrap_err();

    assert!(matches!(err, ResolveError::HttpStatus { status: 500, .. }));
}

#[tokio::test]
async fn test_doi_org_malformed_body_is_invalid_response() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(&server, ResponseTemplate::new(200).set_body_string("<html>oops</html>")).await;

    let locator = DoiOrgLocator::with_base_url(server.uri(), throttle()).unwrap();
    let err = locator.locate(&doi()).await.unwrap_err();

    assert!(matches!(err, ResolveError::InvalidResponse { .. }));
}

#[tokio::test]
async fn test_unpaywall_ranks_locations() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_unpaywall(&server, ResponseTemplate::new(200).set_body_json(unpaywall_body())).await;

    let lookup = UnpaywallLookup::with_base_url(EMAIL, server.uri(), throttle()).unwrap();
    let urls = lookup.lookup(&doi()).await.unwrap();

    assert_eq!(
        urls,
        vec![
            "https://repo.example/record/1/paper.pdf",
            "https://pub.example/article/1",
        ]
    );
}

#[tokio::test]
async fn test_unpaywall_unknown_doi_is_empty() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_unpaywall(&server, ResponseTemplate::new(404)).await;

    let lookup = UnpaywallLookup::with_base_url(EMAIL, server.uri(), throttle()).unwrap();
    assert!(lookup.lookup(&doi()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_default_resolver_orders_publisher_first_and_dedups() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(
        &server,
        ResponseTemplate::new(200).set_body_json(handle_body("https://pub.example/article/1")),
    )
    .await;
    mount_unpaywall(&server, ResponseTemplate::new(200).set_body_json(unpaywall_body())).await;

    let resolver = build_default_resolver(&config_for(&server, Some(EMAIL)), throttle()).unwrap();
    let candidates = resolver.resolve(&doi()).await;

    let summary: Vec<(&str, SourceKind, usize)> = candidates
        .iter()
        .map(|c| (c.url.as_str(), c.kind, c.priority))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("https://pub.example/article/1", SourceKind::Publisher, 0),
            ("https://repo.example/record/1/paper.pdf", SourceKind::OpenAccess, 1),
        ]
    );
}

#[tokio::test]
async fn test_default_resolver_survives_unpaywall_failure() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(
        &server,
        ResponseTemplate::new(200).set_body_json(handle_body("https://pub.example/article/1")),
    )
    .await;
    mount_unpaywall(&server, ResponseTemplate::new(503)).await;

    let resolver = build_default_resolver(&config_for(&server, Some(EMAIL)), throttle()).unwrap();
    let candidates = resolver.resolve(&doi()).await;

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].kind, SourceKind::Publisher);
}

#[tokio::test]
async fn test_default_resolver_without_email_skips_unpaywall() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(&server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .and(path("/v2/10.1234/example"))
        .respond_with(ResponseTemplate::new(200).set_body_json(unpaywall_body()))
        .expect(0)
        .mount(&server)
        .await;

    let resolver = build_default_resolver(&config_for(&server, None), throttle()).unwrap();

    assert!(!resolver.has_open_access());
    assert!(resolver.resolve(&doi()).await.is_empty());
}

#[tokio::test]
async fn test_default_resolver_open_access_only() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_handle(&server, ResponseTemplate::new(404)).await;
    mount_unpaywall(&server, ResponseTemplate::new(200).set_body_json(unpaywall_body())).await;

    let resolver = build_default_resolver(&config_for(&server, Some(EMAIL)), throttle()).unwrap();
    let candidates = resolver.resolve(&doi()).await;

    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|c| c.kind == SourceKind::OpenAccess));
    assert_eq!(candidates[0].priority, 0);
}
