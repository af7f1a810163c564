//! Mediated-mode HTTP dispatch.
//!
//! When a request is not in bypass mode the mediator performs it from the
//! automation layer so the response side of the pipeline can run. TLS
//! verification is off (matching the browser context) and redirects are
//! not followed: a 3xx is fulfilled to the browser, whose follow-up
//! request re-enters the pipeline, keeping every hop visible to capture.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::debug;
use veil_common::{Headers, VeilError};

/// Substituted for response bodies that do not decode as text.
pub const BINARY_BODY_MARKER: &str = "<binary data>";

/// The final request handed to the wire.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<String>,
}

/// What came back, body already decoded to text or the opaque marker.
#[derive(Debug, Clone)]
pub struct DispatchedResponse {
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

/// Seam for performing mediated-mode requests; tests substitute a fake.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, request: DispatchRequest) -> Result<DispatchedResponse, VeilError>;
}

/// Production dispatcher backed by a shared reqwest client.
pub struct HttpDispatcher {
    client: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new() -> Result<Self, VeilError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| VeilError::Dispatch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn send(&self, request: DispatchRequest) -> Result<DispatchedResponse, VeilError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| VeilError::Dispatch(format!("invalid method {:?}", request.method)))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in &request.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                debug!(target: "mediator.dispatch", header = %name, "dropping unencodable header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                debug!(target: "mediator.dispatch", header = %name, "dropping unencodable header value");
                continue;
            };
            header_map.insert(name, value);
        }

        let mut builder = self.client.request(method, &request.url).headers(header_map);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| VeilError::Dispatch(e.to_string()))?;

        let url = response.url().to_string();
        let status = response.status().as_u16();

        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            // The body below is already decompressed text; the original
            // framing headers would mislead the browser.
            if matches!(
                name.as_str(),
                "content-encoding" | "content-length" | "transfer-encoding"
            ) {
                continue;
            }
            headers.insert(
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| VeilError::Dispatch(e.to_string()))?;
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(text) => text,
            Err(_) => BINARY_BODY_MARKER.to_string(),
        };

        Ok(DispatchedResponse {
            url,
            status,
            headers,
            body,
        })
    }
}
