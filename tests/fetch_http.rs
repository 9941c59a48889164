// tests/fetch_http.rs
//
// Pagination, stop conditions and transports against a local listing site.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use listing_relay::config::{FetcherConfig, RenderedConfig};
use listing_relay::error::FetchError;
use listing_relay::ingest::fetcher::{FetchSettings, Fetcher, StopReason};
use listing_relay::ingest::providers::http::HttpTransport;
use listing_relay::ingest::providers::rendered::RenderedTransport;
use listing_relay::ingest::types::{PageTransport, SourceConfig};

/// What the site answers for a page number.
#[derive(Clone, Copy)]
enum PageKind {
    Items(usize),
    Empty,
    Captcha,
    Fail,
}

#[derive(Clone)]
struct Site {
    pages: Arc<Vec<PageKind>>,
    hits: Arc<AtomicUsize>,
}

fn items_html(page: usize, n: usize) -> String {
    let mut body = String::from("<html><body><div class=\"catalog\">");
    for i in 0..n {
        body.push_str(&format!(
            r#"<div data-marker="item" data-item-id="{page}{i:03}"><h3>Item {page}-{i}</h3></div>"#
        ));
    }
    body.push_str("</div></body></html>");
    body
}

async fn listing_page(State(site): State<Site>, Query(q): Query<HashMap<String, String>>) -> Response {
    site.hits.fetch_add(1, Ordering::SeqCst);
    let page: usize = q.get("p").and_then(|p| p.parse().ok()).unwrap_or(1);
    match site.pages.get(page - 1).copied().unwrap_or(PageKind::Empty) {
        PageKind::Items(n) => Html(items_html(page, n)).into_response(),
        PageKind::Empty => Html("<html><body><p>Ничего не найдено</p></body></html>").into_response(),
        PageKind::Captcha => {
            Html("<html><body><h1>Доступ ограничен</h1><div id=\"captcha\"></div></body></html>")
                .into_response()
        }
        PageKind::Fail => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
    }
}

async fn spawn_site(pages: Vec<PageKind>) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let site = Site {
        pages: Arc::new(pages),
        hits: hits.clone(),
    };
    let app = Router::new()
        .route("/moskva/avto", get(listing_page))
        .route("/redirect", get(|| async { Redirect::temporary("/blocked?from=list") }))
        .route("/blocked", get(|| async { Html("<html><body>please wait</body></html>") }))
        .with_state(site);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn quiet_config() -> FetcherConfig {
    FetcherConfig {
        timeout_secs: 5,
        delay_min_ms: 0,
        delay_max_ms: 0,
        ..FetcherConfig::default()
    }
}

fn fetcher(cfg: &FetcherConfig) -> Fetcher {
    let transport = Arc::new(HttpTransport::from_config(cfg).unwrap());
    Fetcher::new(transport, FetchSettings::from_config(cfg))
}

fn source(url: String) -> SourceConfig {
    SourceConfig {
        category: "auto".into(),
        url,
        enabled: true,
        signature: String::new(),
    }
}

#[tokio::test]
async fn stops_on_first_empty_page() {
    let (base, hits) = spawn_site(vec![PageKind::Items(3), PageKind::Items(2), PageKind::Empty]).await;
    let f = fetcher(&quiet_config());
    let src = source(format!("{base}/moskva/avto"));
    let mut cursor = f.pages(&src, 10);

    let p1 = cursor.next_page().await.unwrap().unwrap();
    assert_eq!(p1.len(), 3);
    assert_eq!(p1[0].page_url, format!("{base}/moskva/avto"));
    let p2 = cursor.next_page().await.unwrap().unwrap();
    assert_eq!(p2.len(), 2);
    assert!(cursor.next_page().await.is_none());
    assert!(cursor.next_page().await.is_none());

    assert_eq!(cursor.stop_reason(), Some(StopReason::EmptyPage));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn max_pages_bounds_the_walk() {
    let (base, hits) = spawn_site(vec![PageKind::Items(1); 5]).await;
    let f = fetcher(&quiet_config());
    let src = source(format!("{base}/moskva/avto"));
    let mut cursor = f.pages(&src, 2);
    let mut pages = 0;
    while let Some(p) = cursor.next_page().await {
        p.unwrap();
        pages += 1;
    }
    assert_eq!(pages, 2);
    assert_eq!(cursor.stop_reason(), Some(StopReason::MaxPages));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn captcha_is_reported_once_then_source_ends() {
    let (base, hits) = spawn_site(vec![PageKind::Items(2), PageKind::Captcha, PageKind::Items(2)]).await;
    let f = fetcher(&quiet_config());
    let src = source(format!("{base}/moskva/avto"));
    let mut cursor = f.pages(&src, 5);

    assert!(cursor.next_page().await.unwrap().is_ok());
    let err = cursor.next_page().await.unwrap().unwrap_err();
    assert!(matches!(err, FetchError::CaptchaDetected { .. }));
    assert!(cursor.next_page().await.is_none());
    assert_eq!(cursor.stop_reason(), Some(StopReason::Captcha));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn challenge_redirect_counts_as_captcha() {
    let (base, _) = spawn_site(vec![]).await;
    let f = fetcher(&quiet_config());
    let src = source(format!("{base}/redirect"));
    let mut cursor = f.pages(&src, 3);
    let err = cursor.next_page().await.unwrap().unwrap_err();
    assert!(err.is_captcha());
    assert!(cursor.next_page().await.is_none());
}

#[tokio::test]
async fn single_failure_is_skipped() {
    let (base, _) = spawn_site(vec![PageKind::Items(1), PageKind::Fail, PageKind::Items(4), PageKind::Empty]).await;
    let f = fetcher(&quiet_config());
    let src = source(format!("{base}/moskva/avto"));
    let mut cursor = f.pages(&src, 10);

    let mut ok_pages = Vec::new();
    let mut errors = 0;
    while let Some(p) = cursor.next_page().await {
        match p {
            Ok(units) => ok_pages.push(units.len()),
            Err(e) => {
                assert!(matches!(e, FetchError::Status { status: 500, .. }));
                errors += 1;
            }
        }
    }
    assert_eq!(ok_pages, vec![1, 4]);
    assert_eq!(errors, 1);
    assert_eq!(cursor.stop_reason(), Some(StopReason::EmptyPage));
}

#[tokio::test]
async fn consecutive_failures_stop_pagination() {
    let (base, hits) = spawn_site(vec![PageKind::Fail; 6]).await;
    let f = fetcher(&quiet_config());
    let src = source(format!("{base}/moskva/avto"));
    let mut cursor = f.pages(&src, 6);

    let mut errors = 0;
    while let Some(p) = cursor.next_page().await {
        assert!(p.is_err());
        errors += 1;
    }
    assert_eq!(errors, 2);
    assert_eq!(cursor.stop_reason(), Some(StopReason::RepeatedFailures));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dead_proxy_falls_back_to_direct() {
    let (base, hits) = spawn_site(vec![PageKind::Items(2)]).await;
    let cfg = FetcherConfig {
        proxies: vec!["http://127.0.0.1:1".into()],
        ..quiet_config()
    };
    let t = HttpTransport::from_config(&cfg).unwrap();
    let page = t.get_page(&format!("{base}/moskva/avto")).await.unwrap();
    assert!(page.body.contains("data-item-id"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[derive(Clone, Default)]
struct RenderLog {
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn render(State(log): State<RenderLog>, Json(req): Json<Value>) -> Json<Value> {
    log.requests.lock().unwrap().push(req.clone());
    Json(json!({
        "html": items_html(1, 2),
        "url": req["url"],
        "cookies": [{"name": "sid", "value": "abc", "domain": ".board.example"}]
    }))
}

#[tokio::test]
async fn rendered_transport_keeps_session_cookies() {
    let log = RenderLog::default();
    let app = Router::new().route("/render", post(render)).with_state(log.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let cookie_path = dir.path().join("cookies.json");
    let rendered_cfg = RenderedConfig {
        endpoint: format!("http://{addr}/render"),
        token: None,
        cookie_path: cookie_path.display().to_string(),
    };
    let t = RenderedTransport::from_config(&quiet_config(), &rendered_cfg).unwrap();

    let page = t.get_page("https://board.example/moskva/avto").await.unwrap();
    assert_eq!(page.final_url, "https://board.example/moskva/avto");
    assert!(page.body.contains("Item 1-1"));
    assert!(cookie_path.exists());

    t.get_page("https://board.example/moskva/avto?p=2").await.unwrap();
    let reqs = log.requests.lock().unwrap().clone();
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[0]["cookies"], json!([]));
    assert_eq!(reqs[1]["cookies"][0]["name"], "sid");
    assert_eq!(reqs[1]["timeout_ms"], 5_000);

    // A fresh transport picks the session up from disk.
    let t2 = RenderedTransport::from_config(&quiet_config(), &rendered_cfg).unwrap();
    t2.get_page("https://board.example/x").await.unwrap();
    let reqs = log.requests.lock().unwrap().clone();
    assert_eq!(reqs[2]["cookies"][0]["value"], "abc");
}
