//! The automation surface the mediator programs against.
//!
//! Two seams: [`RouteIo`], one paused network request with the
//! continue/fulfil/abort primitives, and [`PageOps`], navigation plus
//! in-page script evaluation. The CDP-backed types in
//! [`crate::chromium`] implement both; tests substitute fakes.

use async_trait::async_trait;
use serde_json::Value;
use veil_common::Headers;

/// The observable half of a paused network request.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub resource_type: String,
}

/// Replacements applied when handing a request back to the browser's own
/// network stack.
#[derive(Debug, Clone, Default)]
pub struct ContinueOverrides {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: Option<Headers>,
    pub body: Option<String>,
}

/// One intercepted network operation awaiting a decision.
#[async_trait]
pub trait RouteIo: Send + Sync {
    fn request(&self) -> &RouteRequest;

    /// Let the browser perform the (possibly rewritten) request itself.
    async fn continue_with(&self, overrides: ContinueOverrides) -> anyhow::Result<()>;

    /// Answer the request with a synthetic response.
    async fn fulfill(&self, status: u16, headers: &Headers, body: Option<&str>)
        -> anyhow::Result<()>;

    /// Abort the network operation.
    async fn abort(&self) -> anyhow::Result<()>;
}

/// Navigation and script evaluation on the live page.
#[async_trait]
pub trait PageOps: Send + Sync {
    async fn navigate(&self, url: &str) -> anyhow::Result<()>;

    /// Evaluate an expression in the page, awaiting promises, and return
    /// its JSON value.
    async fn evaluate(&self, expression: &str) -> anyhow::Result<Value>;

    async fn current_url(&self) -> anyhow::Result<String>;
}
