//! Browser-context replay.
//!
//! Re-issues a stored request from inside the live page's JS context so
//! the server sees organic browser traffic: same TLS handshake, same
//! connection pool, same JS-set cookies. The in-page fetch API refuses
//! to set certain headers, so the full original header map travels
//! out-of-band in the reserved override header and is restored by the
//! pipeline's channel-header protocol before the request leaves.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use url::Url;
use veil_browser::PageOps;
use veil_common::Headers;

/// Headers the in-page fetch API refuses to carry; they travel through
/// the override channel instead.
const FORBIDDEN_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "cookie",
    "user-agent",
    "referer",
    "origin",
    "content-length",
    "date",
    "expect",
];

const FORBIDDEN_PREFIXES: &[&str] = &["proxy-", "sec-"];

/// A stored request to re-issue from the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRequest {
    /// Id of the saved capture this replay originates from; echoed back
    /// to the UI untouched.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// What the UI receives: the in-page view of the response, or an error.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplayOutcome {
    Success {
        status: u16,
        headers: Headers,
        body: String,
    },
    Error {
        error: String,
    },
}

fn is_forbidden(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    FORBIDDEN_HEADERS.contains(&lower.as_str())
        || FORBIDDEN_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Split off the headers the fetch API will accept and add the two
/// channel headers carrying the full original map.
fn prepare_safe_headers(original: &Headers) -> Result<Headers, serde_json::Error> {
    let override_json = serde_json::to_string(original)?;
    let mut safe: Headers = original
        .iter()
        .filter(|(name, _)| !is_forbidden(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    safe.insert("X-WAF-Bypass-Repeater".to_string(), "1".to_string());
    safe.insert("X-Antigravity-Override".to_string(), override_json);
    Ok(safe)
}

fn build_fetch_script(request: &ReplayRequest, safe_headers: &Headers) -> String {
    let args = json!({
        "url": request.url,
        "method": request.method,
        "headers": safe_headers,
        "body": request.body,
    });
    format!(
        r#"(async () => {{
    const args = {args};
    const options = {{ method: args.method, headers: args.headers }};
    if (args.method !== 'GET' && args.method !== 'HEAD') {{
        options.body = args.body;
    }}
    try {{
        const response = await fetch(args.url, options);
        const text = await response.text();
        const headers = {{}};
        response.headers.forEach((value, key) => {{ headers[key] = value; }});
        return {{ status: response.status, headers: headers, body: text }};
    }} catch (e) {{
        return {{ error: String(e) }};
    }}
}})()"#
    )
}

fn parse_outcome(value: Value) -> ReplayOutcome {
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return ReplayOutcome::Error {
            error: format!("in-page fetch failed: {error}"),
        };
    }
    let status = value.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
    let mut headers = Headers::new();
    if let Some(map) = value.get("headers").and_then(Value::as_object) {
        for (name, entry) in map {
            headers.insert(
                name.clone(),
                entry.as_str().map(str::to_string).unwrap_or_default(),
            );
        }
    }
    let body = value
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ReplayOutcome::Success {
        status,
        headers,
        body,
    }
}

/// Replay `request` inside the page, returning the in-page view of the
/// response. Never fails the page: every error becomes an
/// [`ReplayOutcome::Error`].
pub(crate) async fn replay_in_page<P: PageOps>(
    page: &P,
    request: &ReplayRequest,
    deadline: Duration,
) -> ReplayOutcome {
    let origin = match Url::parse(&request.url) {
        Ok(parsed) => match parsed.origin() {
            url::Origin::Tuple(..) => parsed.origin().ascii_serialization(),
            url::Origin::Opaque(_) => {
                return ReplayOutcome::Error {
                    error: format!("url has no usable origin: {}", request.url),
                }
            }
        },
        Err(err) => {
            return ReplayOutcome::Error {
                error: format!("invalid url {}: {err}", request.url),
            }
        }
    };

    // Origin priming: anti-bot checks compare window.location against the
    // request target, so make sure the page is on the right origin first.
    let on_origin = page
        .current_url()
        .await
        .map(|current| current.starts_with(&origin))
        .unwrap_or(false);
    if !on_origin {
        info!(target: "mediator.replay", %origin, "navigating to establish origin context");
        if let Err(err) = page.navigate(&origin).await {
            warn!(target: "mediator.replay", %origin, %err, "origin navigation failed; proceeding anyway");
        }
    }

    let safe_headers = match prepare_safe_headers(&request.headers) {
        Ok(safe) => safe,
        Err(err) => {
            return ReplayOutcome::Error {
                error: format!("could not encode header overrides: {err}"),
            }
        }
    };

    let script = build_fetch_script(request, &safe_headers);
    match tokio::time::timeout(deadline, page.evaluate(&script)).await {
        Err(_) => ReplayOutcome::Error {
            error: format!("request timed out ({}s)", deadline.as_secs()),
        },
        Ok(Err(err)) => ReplayOutcome::Error {
            error: err.to_string(),
        },
        Ok(Ok(value)) => parse_outcome(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct FakePage {
        url: String,
        eval_result: Value,
        navigations: Mutex<Vec<String>>,
        scripts: Mutex<Vec<String>>,
        hang: bool,
    }

    impl FakePage {
        fn at(url: &str, eval_result: Value) -> Self {
            Self {
                url: url.to_string(),
                eval_result,
                navigations: Mutex::new(Vec::new()),
                scripts: Mutex::new(Vec::new()),
                hang: false,
            }
        }
    }

    #[async_trait]
    impl PageOps for FakePage {
        async fn navigate(&self, url: &str) -> anyhow::Result<()> {
            self.navigations.lock().unwrap().push(url.to_string());
            Ok(())
        }

        async fn evaluate(&self, expression: &str) -> anyhow::Result<Value> {
            self.scripts.lock().unwrap().push(expression.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(self.eval_result.clone())
        }

        async fn current_url(&self) -> anyhow::Result<String> {
            Ok(self.url.clone())
        }
    }

    fn stored_request() -> ReplayRequest {
        ReplayRequest {
            id: None,
            method: "GET".into(),
            url: "https://a.example/path".into(),
            headers: headers(&[
                ("Host", "a.example"),
                ("Cookie", "sid=1"),
                ("Sec-Fetch-Mode", "cors"),
                ("Proxy-Authorization", "Basic x"),
                ("X-Foo", "bar"),
            ]),
            body: None,
        }
    }

    #[test]
    fn safe_set_excludes_forbidden_and_adds_channel_headers() {
        let request = stored_request();
        let safe = prepare_safe_headers(&request.headers).unwrap();

        assert_eq!(safe["X-Foo"], "bar");
        assert_eq!(safe["X-WAF-Bypass-Repeater"], "1");
        assert!(!safe.contains_key("Host"));
        assert!(!safe.contains_key("Cookie"));
        assert!(!safe.contains_key("Sec-Fetch-Mode"));
        assert!(!safe.contains_key("Proxy-Authorization"));

        // The override channel still carries the complete original map.
        let restored: Headers =
            serde_json::from_str(&safe["X-Antigravity-Override"]).unwrap();
        assert_eq!(restored, request.headers);
    }

    #[test]
    fn fetch_script_omits_body_for_idempotent_methods() {
        let request = stored_request();
        let safe = prepare_safe_headers(&request.headers).unwrap();
        let script = build_fetch_script(&request, &safe);
        assert!(script.contains("args.method !== 'GET'"));
        assert!(script.contains("\"method\":\"GET\""));
    }

    #[tokio::test]
    async fn navigates_when_page_is_off_origin() {
        let page = FakePage::at("about:blank", json!({"status": 200, "headers": {}, "body": ""}));
        let outcome =
            replay_in_page(&page, &stored_request(), Duration::from_secs(5)).await;

        assert_eq!(
            page.navigations.lock().unwrap().as_slice(),
            ["https://a.example"]
        );
        assert!(matches!(outcome, ReplayOutcome::Success { status: 200, .. }));
    }

    #[tokio::test]
    async fn skips_navigation_when_already_on_origin() {
        let page = FakePage::at(
            "https://a.example/login",
            json!({"status": 204, "headers": {"x-served-by": "edge"}, "body": ""}),
        );
        let outcome =
            replay_in_page(&page, &stored_request(), Duration::from_secs(5)).await;

        assert!(page.navigations.lock().unwrap().is_empty());
        match outcome {
            ReplayOutcome::Success { status, headers, .. } => {
                assert_eq!(status, 204);
                assert_eq!(headers["x-served-by"], "edge");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_page_error_becomes_error_outcome() {
        let page = FakePage::at(
            "https://a.example/",
            json!({"error": "TypeError: Failed to fetch"}),
        );
        let outcome =
            replay_in_page(&page, &stored_request(), Duration::from_secs(5)).await;
        match outcome {
            ReplayOutcome::Error { error } => assert!(error.contains("Failed to fetch")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_is_a_single_timeout_error() {
        let mut page = FakePage::at("https://a.example/", Value::Null);
        page.hang = true;
        let outcome =
            replay_in_page(&page, &stored_request(), Duration::from_secs(30)).await;
        match outcome {
            ReplayOutcome::Error { error } => assert_eq!(error, "request timed out (30s)"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_before_touching_the_page() {
        let page = FakePage::at("about:blank", Value::Null);
        let mut request = stored_request();
        request.url = "not a url".into();
        let outcome = replay_in_page(&page, &request, Duration::from_secs(5)).await;
        assert!(matches!(outcome, ReplayOutcome::Error { .. }));
        assert!(page.scripts.lock().unwrap().is_empty());
    }

    #[test]
    fn replay_outcome_serialises_flat() {
        let ok = ReplayOutcome::Success {
            status: 200,
            headers: headers(&[("a", "b")]),
            body: "hi".into(),
        };
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["status"], 200);
        assert!(v.get("error").is_none());

        let err = ReplayOutcome::Error {
            error: "boom".into(),
        };
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["error"], "boom");
    }
}
