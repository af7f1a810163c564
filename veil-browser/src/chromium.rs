//! CDP-backed implementation of the automation surface.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use veil_common::Headers;

use crate::cdp::CdpConnection;
use crate::launch::{self, LaunchOptions};
use crate::surface::{ContinueOverrides, PageOps, RouteIo, RouteRequest};
use crate::BrowserError;

/// A running chromium instance with one controlled tab.
pub struct Browser {
    conn: CdpConnection,
    page: Page,
    child: tokio::process::Child,
    profile_dir: std::path::PathBuf,
}

impl Browser {
    /// Launch chromium, attach to a fresh tab, and enable request-stage
    /// interception. Every network operation the tab performs surfaces on
    /// the returned route stream until the browser is closed.
    pub async fn launch(
        opts: LaunchOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Route>), BrowserError> {
        let launched = launch::launch(&opts).await?;
        let (conn, mut events) = CdpConnection::connect(&launched.ws_url).await?;

        let target = conn
            .call(None, "Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = target["targetId"]
            .as_str()
            .ok_or_else(|| BrowserError::Protocol("createTarget returned no targetId".into()))?
            .to_string();

        let attached = conn
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| BrowserError::Protocol("attachToTarget returned no sessionId".into()))?
            .to_string();

        conn.call(Some(&session_id), "Page.enable", json!({})).await?;
        conn.call(
            Some(&session_id),
            "Fetch.enable",
            json!({ "patterns": [{ "urlPattern": "*" }] }),
        )
        .await?;

        let (route_tx, route_rx) = mpsc::unbounded_channel();
        let event_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.method != "Fetch.requestPaused" {
                    continue;
                }
                let Some(session) = event.session_id else {
                    continue;
                };
                match Route::from_event(event_conn.clone(), session, &event.params) {
                    Some(route) => {
                        if route_tx.send(route).is_err() {
                            break;
                        }
                    }
                    None => warn!(target: "browser.route", "malformed requestPaused event"),
                }
            }
            debug!(target: "browser.route", "route stream ended");
        });

        let page = Page {
            conn: conn.clone(),
            session_id,
        };
        Ok((
            Self {
                conn,
                page,
                child: launched.child,
                profile_dir: launched.profile_dir,
            },
            route_rx,
        ))
    }

    pub fn page(&self) -> Page {
        self.page.clone()
    }

    /// Tear the browser down. Parked routes observe the closed connection
    /// and unwind on their own.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            self.conn.call(None, "Browser.close", json!({})),
        )
        .await;
        let _ = self.child.kill().await;
        let _ = tokio::fs::remove_dir_all(&self.profile_dir).await;
    }
}

/// Handle to the controlled tab.
#[derive(Clone)]
pub struct Page {
    conn: CdpConnection,
    session_id: String,
}

impl Page {
    pub async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let result = self
            .conn
            .call(Some(&self.session_id), "Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(BrowserError::Protocol(format!(
                    "navigation to {url} failed: {error_text}"
                )));
            }
        }
        Ok(())
    }

    pub async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let result = self
            .conn
            .call(
                Some(&self.session_id),
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("uncaught exception");
            return Err(BrowserError::Evaluation(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn current_url(&self) -> Result<String, BrowserError> {
        let value = self.evaluate("window.location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Evaluation("location.href was not a string".into()))
    }
}

#[async_trait]
impl PageOps for Page {
    async fn navigate(&self, url: &str) -> anyhow::Result<()> {
        Ok(Page::navigate(self, url).await?)
    }

    async fn evaluate(&self, expression: &str) -> anyhow::Result<Value> {
        Ok(Page::evaluate(self, expression).await?)
    }

    async fn current_url(&self) -> anyhow::Result<String> {
        Ok(Page::current_url(self).await?)
    }
}

/// One paused network request plus the handle needed to settle it.
pub struct Route {
    request: RouteRequest,
    conn: CdpConnection,
    session_id: String,
    fetch_id: String,
}

impl Route {
    pub(crate) fn from_event(
        conn: CdpConnection,
        session_id: String,
        params: &Value,
    ) -> Option<Self> {
        let fetch_id = params.get("requestId")?.as_str()?.to_string();
        let request = params.get("request")?;
        let url = request.get("url")?.as_str()?.to_string();
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_string();

        let mut headers = Headers::new();
        if let Some(map) = request.get("headers").and_then(Value::as_object) {
            for (name, value) in map {
                headers.insert(
                    name.clone(),
                    value.as_str().map(str::to_string).unwrap_or_default(),
                );
            }
        }

        let body = request
            .get("postData")
            .and_then(Value::as_str)
            .map(str::to_string);
        let resource_type = params
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Some(Self {
            request: RouteRequest {
                method,
                url,
                headers,
                body,
                resource_type,
            },
            conn,
            session_id,
            fetch_id,
        })
    }
}

fn header_list(headers: &Headers) -> Value {
    Value::Array(
        headers
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect(),
    )
}

#[async_trait]
impl RouteIo for Route {
    fn request(&self) -> &RouteRequest {
        &self.request
    }

    async fn continue_with(&self, overrides: ContinueOverrides) -> anyhow::Result<()> {
        let mut params = json!({ "requestId": self.fetch_id });
        if let Some(method) = overrides.method {
            params["method"] = json!(method);
        }
        if let Some(url) = overrides.url {
            params["url"] = json!(url);
        }
        if let Some(headers) = &overrides.headers {
            params["headers"] = header_list(headers);
        }
        if let Some(body) = &overrides.body {
            params["postData"] = json!(BASE64.encode(body.as_bytes()));
        }
        self.conn
            .call(Some(&self.session_id), "Fetch.continueRequest", params)
            .await?;
        Ok(())
    }

    async fn fulfill(
        &self,
        status: u16,
        headers: &Headers,
        body: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut params = json!({
            "requestId": self.fetch_id,
            "responseCode": status,
            "responseHeaders": header_list(headers),
        });
        if let Some(body) = body {
            params["body"] = json!(BASE64.encode(body.as_bytes()));
        }
        self.conn
            .call(Some(&self.session_id), "Fetch.fulfillRequest", params)
            .await?;
        Ok(())
    }

    async fn abort(&self) -> anyhow::Result<()> {
        self.conn
            .call(
                Some(&self.session_id),
                "Fetch.failRequest",
                json!({ "requestId": self.fetch_id, "errorReason": "Aborted" }),
            )
            .await?;
        Ok(())
    }
}
