//! # Stage: HTTP API
//!
//! ## Responsibility
//! A small HTTP/1.1 JSON API over `tokio::net::TcpListener`. One request per
//! connection; the request head is parsed with `httparse` and dispatched by
//! [`route`], which is independent of the socket so it can be tested
//! directly.
//!
//! ## Guarantees
//! - Every response is JSON with an explicit `Content-Length`
//! - Unknown paths → 404, known path with the wrong method → 405,
//!   malformed parameters → 400, handler failures → 500 `{ "error": … }`
//! - A failing connection never takes the accept loop down
//!
//! ## NOT Responsible For
//! - TLS, keep-alive, chunked bodies (put a reverse proxy in front)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use colored::*;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::alert::Severity;
use crate::config::MAX_QUERY_HOURS;
use crate::error::{HeatmapError, Result};
use crate::service::HeatmapService;

/// Upper bound on a request head.
const MAX_REQUEST_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;

/// Default look-back for `/api/alerts` and `/api/trends`.
const DEFAULT_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Query strings
// ---------------------------------------------------------------------------

/// Percent-decoding for URL query parameters; `+` is a space.
pub fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| std::str::from_utf8(h).ok());
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a query string into key-value pairs. Later duplicates win.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let val = parts.next().unwrap_or("");
            Some((url_decode(key), url_decode(val)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
}

impl Request {
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        Request { method: method.to_ascii_uppercase(), path: path.to_string(), query: parse_query(query) }
    }

    /// Parse a request head. `Ok(None)` means more bytes are needed.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(_)) => {
                let method = req.method.ok_or_else(|| HeatmapError::Http("missing method".into()))?;
                let target = req.path.ok_or_else(|| HeatmapError::Http("missing path".into()))?;
                Ok(Some(Request::new(method, target)))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(HeatmapError::Http(e.to_string())),
        }
    }

    /// Optional `hours` parameter bounded to `1..=MAX_QUERY_HOURS`.
    fn hours(&self) -> Result<i64> {
        match self.query.get("hours") {
            None => Ok(DEFAULT_HOURS),
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(h) if (1..=MAX_QUERY_HOURS).contains(&h) => Ok(h),
                _ => Err(HeatmapError::Http(format!("hours must be an integer in 1..={MAX_QUERY_HOURS}, got '{raw}'"))),
            },
        }
    }

    fn severity(&self) -> Result<Option<Severity>> {
        match self.query.get("severity").map(|s| s.trim()) {
            None | Some("") | Some("all") => Ok(None),
            Some(raw) => raw.parse::<Severity>().map(Some).map_err(HeatmapError::Http),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
    pub allow: Option<&'static str>,
}

impl Response {
    pub fn ok<T: Serialize>(body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Response { status: 200, body, allow: None },
            Err(e) => Self::error(500, e.to_string()),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Response { status, body: json!({ "error": message.into() }), allow: None }
    }

    fn from_error(e: HeatmapError) -> Self {
        match e {
            HeatmapError::Http(msg) => Self::error(400, msg),
            other => {
                tracing::error!(target: "wifi_heatmap::web", error = %other, "request failed");
                Self::error(500, other.to_string())
            }
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        let allow = self.allow.map(|m| format!("Allow: {m}\r\n")).unwrap_or_default();
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{}Access-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            body.len(),
            allow,
            body,
        )
        .into_bytes()
    }
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => Response::ok(&body),
        Err(e) => Response::from_error(e),
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Every route with the single method it accepts.
pub const ROUTES: &[(&str, &str)] = &[
    ("GET", "/"),
    ("GET", "/health"),
    ("GET", "/api/stats"),
    ("GET", "/api/latest"),
    ("GET", "/api/alerts"),
    ("POST", "/api/alerts/check"),
    ("GET", "/api/channel_recommendations"),
    ("GET", "/api/heatmap"),
    ("GET", "/api/trends"),
    ("POST", "/api/clear_cache"),
];

pub async fn route(service: &HeatmapService, req: &Request) -> Response {
    let Some(&(method, path)) = ROUTES.iter().find(|(_, p)| *p == req.path) else {
        return Response::error(404, format!("no route for {}", req.path));
    };
    if req.method != method {
        return Response { allow: Some(method), ..Response::error(405, format!("{path} only accepts {method}")) };
    }

    match path {
        "/" => Response::ok(&json!({
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "routes": ROUTES.iter().map(|(m, p)| format!("{m} {p}")).collect::<Vec<_>>(),
        })),
        "/health" => Response::ok(&json!({ "status": "ok" })),
        "/api/stats" => respond(service.stats().await),
        "/api/latest" => respond(service.latest().await),
        "/api/alerts" => {
            let params = req.hours().and_then(|h| Ok((h, req.severity()?)));
            match params {
                Ok((hours, severity)) => respond(
                    service
                        .alerts(hours, severity)
                        .await
                        .map(|alerts| json!({ "count": alerts.len(), "hours": hours, "alerts": alerts })),
                ),
                Err(e) => Response::from_error(e),
            }
        }
        "/api/alerts/check" => respond(service.check_alerts().await),
        "/api/channel_recommendations" => respond(service.channel_recommendations().await),
        "/api/heatmap" => respond(service.heatmap().await),
        "/api/trends" => match req.hours() {
            Ok(hours) => respond(service.trends(hours).await),
            Err(e) => Response::from_error(e),
        },
        "/api/clear_cache" => Response::ok(&json!({ "status": "cleared", "entries": service.clear_cache() })),
        _ => Response::error(404, format!("no route for {}", req.path)),
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Bind the listener configured in `service`.
pub async fn bind(service: &HeatmapService) -> Result<TcpListener> {
    let server = &service.config().server;
    let listener = TcpListener::bind((server.bind.as_str(), server.port)).await?;
    Ok(listener)
}

/// Accept connections forever, one task per connection.
pub async fn serve(listener: TcpListener, service: Arc<HeatmapService>) -> Result<()> {
    let addr = listener.local_addr()?;
    eprintln!("{}", format!("  Wi-Fi heatmap API listening on http://{addr}").bright_green());
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    tracing::info!(target: "wifi_heatmap::web", %addr, "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, &service).await {
                tracing::warn!(target: "wifi_heatmap::web", %peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, service: &HeatmapService) -> Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let response = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        match Request::parse(&buf) {
            Ok(Some(req)) => {
                let response = route(service, &req).await;
                tracing::debug!(
                    target: "wifi_heatmap::web",
                    %peer,
                    method = %req.method,
                    path = %req.path,
                    status = response.status,
                    "request"
                );
                break response;
            }
            Ok(None) if buf.len() >= MAX_REQUEST_BYTES => {
                break Response::error(413, "request head too large");
            }
            Ok(None) => continue,
            Err(e) => break Response::from_error(e),
        }
    };

    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::detectors::testutil::{reading, store_with, ts};
    use crate::ledger::AlertLedger;
    use rstest::rstest;

    fn service() -> HeatmapService {
        let store = store_with(&[
            reading(ts("2024-05-01 10:30:00"), "Kitchen", "HomeNet", -45.0),
            reading(ts("2024-05-01 11:30:00"), "Kitchen", "HomeNet", -62.0),
        ]);
        let config = Config::default();
        let ledger = AlertLedger::open_in_memory(config.analysis.dedup_window()).unwrap();
        let now = ts("2024-05-01 12:00:00");
        HeatmapService::new(Arc::new(store), Arc::new(ledger), config).with_clock(Arc::new(move || now))
    }

    // -- url_decode / parse_query --

    #[rstest]
    #[case("hello%20world", "hello world")]
    #[case("a+b", "a b")]
    #[case("plain", "plain")]
    #[case("", "")]
    #[case("Caf%C3%A9", "Café")]
    #[case("100%", "100%")]
    #[case("%zz", "%zz")]
    fn test_url_decode(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(url_decode(input), expected);
    }

    #[test]
    fn test_parse_query_basic() {
        let q = parse_query("hours=6&severity=warning");
        assert_eq!(q.get("hours").map(String::as_str), Some("6"));
        assert_eq!(q.get("severity").map(String::as_str), Some("warning"));
    }

    #[test]
    fn test_parse_query_empty_and_valueless() {
        assert!(parse_query("").is_empty());
        assert_eq!(parse_query("flag").get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_query_duplicate_keys_last_wins() {
        assert_eq!(parse_query("hours=1&hours=2").get("hours").map(String::as_str), Some("2"));
    }

    // -- request parsing --

    #[test]
    fn test_request_parse_complete() {
        let req = Request::parse(b"GET /api/alerts?hours=6 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/api/alerts");
        assert_eq!(req.hours().unwrap(), 6);
    }

    #[test]
    fn test_request_parse_partial() {
        assert!(Request::parse(b"GET /api/stats HTTP/1.1\r\nHost:").unwrap().is_none());
    }

    #[test]
    fn test_request_parse_garbage_is_http_error() {
        assert!(matches!(Request::parse(b"\x00\x01 nonsense\r\n\r\n"), Err(HeatmapError::Http(_))));
    }

    #[rstest]
    #[case("hours=0")]
    #[case("hours=-5")]
    #[case("hours=abc")]
    #[case("hours=100000")]
    fn test_bad_hours_rejected(#[case] query: &str) {
        let req = Request::new("GET", &format!("/api/alerts?{query}"));
        assert!(req.hours().is_err());
    }

    #[test]
    fn test_response_bytes_have_length_and_status() {
        let bytes = Response::ok(&json!({ "status": "ok" })).to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.ends_with("{\"status\":\"ok\"}"));
    }

    // -- routing --

    #[tokio::test]
    async fn test_health() {
        let resp = route(&service(), &Request::new("GET", "/health")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let resp = route(&service(), &Request::new("GET", "/nope")).await;
        assert_eq!(resp.status, 404);
        assert!(resp.body["error"].is_string());
    }

    #[tokio::test]
    async fn test_wrong_method_is_405_with_allow() {
        let resp = route(&service(), &Request::new("GET", "/api/alerts/check")).await;
        assert_eq!(resp.status, 405);
        assert_eq!(resp.allow, Some("POST"));
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("Allow: POST\r\n"));
    }

    #[tokio::test]
    async fn test_check_then_list_alerts() {
        let svc = service();
        let check = route(&svc, &Request::new("POST", "/api/alerts/check")).await;
        assert_eq!(check.status, 200);
        assert_eq!(check.body["raised"]["degradation"], 1);

        let listed = route(&svc, &Request::new("GET", "/api/alerts?severity=warning")).await;
        assert_eq!(listed.status, 200);
        assert_eq!(listed.body["count"], 1);
        assert_eq!(listed.body["alerts"][0]["kind"], "degradation");

        let info = route(&svc, &Request::new("GET", "/api/alerts?severity=info")).await;
        assert_eq!(info.body["count"], 0);
    }

    #[tokio::test]
    async fn test_bad_severity_is_400() {
        let resp = route(&service(), &Request::new("GET", "/api/alerts?severity=loud")).await;
        assert_eq!(resp.status, 400);
    }

    #[tokio::test]
    async fn test_stats_and_clear_cache() {
        let svc = service();
        let stats = route(&svc, &Request::new("GET", "/api/stats")).await;
        assert_eq!(stats.body["total_scans"], 2);
        let cleared = route(&svc, &Request::new("POST", "/api/clear_cache")).await;
        assert_eq!(cleared.body["entries"], 1);
    }

    #[tokio::test]
    async fn test_serve_answers_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, Arc::new(service())));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        server.abort();

        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.ends_with("{\"status\":\"ok\"}"));
    }
}
