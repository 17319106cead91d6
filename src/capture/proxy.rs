use crate::config::{CaptureConfig, InterceptStage};
use anyhow::{Context, bail};
use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

pub const REPORT_ONLY_HEADER: HeaderName =
    HeaderName::from_static("content-security-policy-report-only");

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Report-only Trusted Types policy delivering reports to `report_uri`
pub fn report_only_policy(report_uri: &str) -> String {
    format!("require-trusted-types-for 'script'; report-uri {}", report_uri)
}

#[derive(Clone)]
struct ProxyState {
    client: reqwest::Client,
    upstream: Arc<str>,
    policy: HeaderValue,
    stage: InterceptStage,
    reports: UnboundedSender<String>,
    max_body_bytes: usize,
}

impl ProxyState {
    fn submit(&self, payload: String) {
        if self.reports.send(payload).is_err() {
            warn!("Report queue closed, dropping report");
        }
    }

    /// Replay a request against the upstream application and relay its answer,
    /// adding the report-only policy to HTML documents
    async fn forward(&self, parts: Parts, body: Bytes) -> Response {
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.upstream, path);
        trace!("Forwarding {} {}", parts.method, url);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);

        let upstream = match self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("Upstream request to {} failed: {}", url, e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        headers.remove(CONTENT_LENGTH);
        if is_document(&headers) {
            headers.append(REPORT_ONLY_HEADER, self.policy.clone());
            debug!("Injected report-only policy into {}", url);
        }

        let body = match read_limited(upstream, self.max_body_bytes).await {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to read upstream response from {}: {:#}", url, e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Buffer an upstream body, refusing anything larger than `limit` bytes
async fn read_limited(mut response: reqwest::Response, limit: usize) -> anyhow::Result<Vec<u8>> {
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            bail!("body of {} bytes exceeds the {} byte limit", len, limit);
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > limit {
            bail!("body exceeds the {} byte limit", limit);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn is_document(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/html"))
        .unwrap_or(false)
}

async fn read_body(state: &ProxyState, request: Request) -> Result<(Parts, Bytes), Response> {
    let (parts, body) = request.into_parts();
    match to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => Ok((parts, bytes)),
        Err(e) => {
            warn!("Rejecting request body for {}: {}", parts.uri, e);
            Err(StatusCode::PAYLOAD_TOO_LARGE.into_response())
        }
    }
}

async fn receive_report(State(state): State<ProxyState>, request: Request) -> Response {
    let (parts, body) = match read_body(&state, request).await {
        Ok(read) => read,
        Err(response) => return response,
    };
    let payload = String::from_utf8_lossy(&body).into_owned();
    debug!("Received violation report ({} bytes)", body.len());

    match state.stage {
        InterceptStage::Request => {
            state.submit(payload);
            StatusCode::NO_CONTENT.into_response()
        }
        InterceptStage::Response => {
            let response = state.forward(parts, body).await;
            state.submit(payload);
            response
        }
    }
}

async fn forward_any(State(state): State<ProxyState>, request: Request) -> Response {
    match read_body(&state, request).await {
        Ok((parts, body)) => state.forward(parts, body).await,
        Err(response) => response,
    }
}

/// Build the capture router: reports on `report_path`, everything else proxied
pub fn router(capture: &CaptureConfig, reports: UnboundedSender<String>) -> anyhow::Result<Router> {
    let policy = HeaderValue::from_str(&report_only_policy(&capture.effective_report_uri()))
        .context("Report URI is not a valid header value")?;
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()?;
    let state = ProxyState {
        client,
        upstream: capture.upstream.trim_end_matches('/').into(),
        policy,
        stage: capture.stage,
        reports,
        max_body_bytes: capture.max_body_bytes,
    };

    Ok(Router::new()
        .route(&capture.report_path, post(receive_report))
        .fallback(forward_any)
        .with_state(state))
}

/// Serve the capture proxy until `shutdown` resolves
pub async fn serve(
    capture: &CaptureConfig,
    reports: UnboundedSender<String>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(capture, reports)?;
    let listener = TcpListener::bind(&capture.listen)
        .await
        .with_context(|| format!("Failed to bind {}", capture.listen))?;
    info!(
        "Capture proxy listening on http://{} (upstream {}, reports via {:?} stage)",
        capture.listen, capture.upstream, capture.stage
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::Html;
    use axum::routing::get;
    use tokio::sync::mpsc;

    async fn spawn(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn upstream() -> String {
        let app = Router::new()
            .route("/", get(|| async { Html("<script>el.innerHTML = x;</script>") }))
            .route(
                "/app.js",
                get(|| async { ([(CONTENT_TYPE, "application/javascript")], "x();") }),
            )
            .route("/csp", post(|| async { StatusCode::CREATED }));
        spawn(app).await
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn capture(upstream: &str, stage: InterceptStage, report_path: &str) -> CaptureConfig {
        CaptureConfig {
            upstream: upstream.to_string(),
            stage,
            report_path: report_path.to_string(),
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn test_report_only_policy() {
        assert_eq!(
            report_only_policy("http://127.0.0.1:8787/r"),
            "require-trusted-types-for 'script'; report-uri http://127.0.0.1:8787/r"
        );
    }

    #[test]
    fn test_is_document() {
        let mut headers = HeaderMap::new();
        assert!(!is_document(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("Text/HTML; charset=utf-8"));
        assert!(is_document(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/javascript"));
        assert!(!is_document(&headers));
    }

    #[tokio::test]
    async fn test_injects_policy_into_documents_only() {
        let upstream = upstream().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = capture(&upstream, InterceptStage::Request, "/__ttscan/report");
        let proxy = spawn(router(&config, tx).unwrap()).await;

        let page = client().get(format!("{}/", proxy)).send().await.unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        let policy = page.headers().get(REPORT_ONLY_HEADER).unwrap().to_str().unwrap();
        assert!(policy.starts_with("require-trusted-types-for 'script'; report-uri "));
        assert_eq!(page.text().await.unwrap(), "<script>el.innerHTML = x;</script>");

        let script = client().get(format!("{}/app.js", proxy)).send().await.unwrap();
        assert!(script.headers().get(REPORT_ONLY_HEADER).is_none());
        assert_eq!(script.text().await.unwrap(), "x();");
    }

    #[tokio::test]
    async fn test_request_stage_answers_locally() {
        let upstream = upstream().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = capture(&upstream, InterceptStage::Request, "/__ttscan/report");
        let proxy = spawn(router(&config, tx).unwrap()).await;

        let response = client()
            .post(format!("{}/__ttscan/report", proxy))
            .body(r#"{"csp-report":{}}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(rx.recv().await.unwrap(), r#"{"csp-report":{}}"#);
    }

    #[tokio::test]
    async fn test_response_stage_forwards_then_ingests() {
        let upstream = upstream().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = capture(&upstream, InterceptStage::Response, "/csp");
        let proxy = spawn(router(&config, tx).unwrap()).await;

        let response = client()
            .post(format!("{}/csp", proxy))
            .body("payload")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(rx.recv().await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_oversized_upstream_response_is_bad_gateway() {
        let upstream = upstream().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = CaptureConfig {
            max_body_bytes: 8,
            ..capture(&upstream, InterceptStage::Request, "/__ttscan/report")
        };
        let proxy = spawn(router(&config, tx).unwrap()).await;

        let page = client().get(format!("{}/", proxy)).send().await.unwrap();
        assert_eq!(page.status(), StatusCode::BAD_GATEWAY);
        let script = client().get(format!("{}/app.js", proxy)).send().await.unwrap();
        assert_eq!(script.status(), StatusCode::OK);
        assert_eq!(script.text().await.unwrap(), "x();");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // Port 9 (discard) on loopback is assumed closed
        let config = capture("http://127.0.0.1:9", InterceptStage::Request, "/__ttscan/report");
        let proxy = spawn(router(&config, tx).unwrap()).await;
        let response = client().get(format!("{}/", proxy)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
