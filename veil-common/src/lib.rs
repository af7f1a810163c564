//! Common types shared across Veil crates.
//!
//! This crate defines the traffic data model (captured requests and
//! responses, match/replace rules, verdicts), observability helpers, and
//! shared error types used throughout the Veil workspace. It is
//! intentionally lightweight so that all crates can depend on it without
//! introducing heavy transitive costs.
//!
//! # Overview
//!
//! - [`CapturedRequest`] / [`CapturedResponse`]: traffic observations,
//!   correlated by [`CapturedResponse::req_id`]
//! - [`MatchReplaceRule`] and [`ItemSlice`]: the rewrite rule model
//! - [`Verdict`] and [`ItemOverrides`]: tester decisions for suspended items
//! - [`observability`]: centralised tracing/logging initialisation
//! - [`VeilError`] and [`Result`]: shared error handling
//!
//! Wire-level field names (`isRegex`, `resourceType`, `req_id`, the slice
//! strings) are part of the UI protocol and are pinned with serde renames.

use chrono::Utc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod observability;

/// Header collection used throughout the pipeline.
///
/// Insertion-ordered, one value per name. HTTP allows repeated header
/// names; the rewrite protocol (linearise, rewrite, reparse) collapses
/// duplicates under last-writer-wins, so the map type makes that
/// limitation explicit rather than hiding it behind a multimap.
pub type Headers = IndexMap<String, String>;

/// The six logical parts of a request/response a rewrite rule may target.
///
/// Serialised as the human-readable strings the UI uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemSlice {
    #[serde(rename = "Request first line")]
    RequestFirstLine,
    #[serde(rename = "Request header")]
    RequestHeader,
    #[serde(rename = "Request body")]
    RequestBody,
    #[serde(rename = "Response first line")]
    ResponseFirstLine,
    #[serde(rename = "Response header")]
    ResponseHeader,
    #[serde(rename = "Response body")]
    ResponseBody,
}

/// A single match/replace rewrite rule.
///
/// Rules apply in list order. A disabled rule is a no-op; a rule whose
/// regex fails to compile is skipped silently and never aborts the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReplaceRule {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub item: ItemSlice,
    #[serde(rename = "match")]
    pub pattern: String,
    pub replace: String,
    #[serde(rename = "isRegex", default)]
    pub is_regex: bool,
    #[serde(default)]
    pub comment: String,
}

fn default_enabled() -> bool {
    true
}

/// Discriminator carried on every capture event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Request,
    Response,
}

fn kind_request() -> CaptureKind {
    CaptureKind::Request
}

fn kind_response() -> CaptureKind {
    CaptureKind::Response
}

/// One observed request. `id` is fresh per observation and is the
/// correlation key for verdicts and for the matching response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedRequest {
    pub id: Uuid,
    #[serde(rename = "type", default = "kind_request")]
    pub kind: CaptureKind,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(rename = "resourceType", default)]
    pub resource_type: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub pending: bool,
}

/// One observed response. `req_id` always names the originating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub id: Uuid,
    pub req_id: Uuid,
    #[serde(rename = "type", default = "kind_response")]
    pub kind: CaptureKind,
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub timestamp: i64,
}

/// Event stream flowing from the mediator to every connected UI client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CaptureEvent {
    Request(CapturedRequest),
    Response(CapturedResponse),
}

/// Tester-supplied replacements applied when a suspended item is forwarded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// A tester decision that resumes a suspended pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Forward(Option<ItemOverrides>),
    Drop,
}

/// Current time in milliseconds since the epoch, the unit every capture
/// timestamp uses.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Error types used across the Veil system.
#[derive(thiserror::Error, Debug)]
pub enum VeilError {
    /// The browser layer reported an error.
    #[error("browser error: {0}")]
    Browser(#[from] anyhow::Error),

    /// Mediated-mode dispatch failed; the operation is aborted, no retry.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// In-page replay failed or timed out; the page remains usable.
    #[error("replay failed: {0}")]
    Replay(String),

    /// Configuration was incomplete or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation exceeded the configured timeout.
    #[error("timeout occurred")]
    Timeout,
}

/// Convenient alias for results that use [`VeilError`].
pub type Result<T> = std::result::Result<T, VeilError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rule_wire_shape_matches_ui_protocol() {
        let rule: MatchReplaceRule = serde_json::from_value(json!({
            "enabled": true,
            "item": "Request header",
            "match": "User-Agent: .*",
            "replace": "User-Agent: X",
            "isRegex": true,
            "comment": "flatten UA"
        }))
        .unwrap();
        assert_eq!(rule.item, ItemSlice::RequestHeader);
        assert!(rule.is_regex);
        assert_eq!(rule.pattern, "User-Agent: .*");

        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["match"], "User-Agent: .*");
        assert_eq!(back["isRegex"], true);
        assert_eq!(back["item"], "Request header");
    }

    #[test]
    fn rule_defaults_apply() {
        let rule: MatchReplaceRule = serde_json::from_value(json!({
            "item": "Response body",
            "match": "a",
            "replace": "b"
        }))
        .unwrap();
        assert!(rule.enabled);
        assert!(!rule.is_regex);
        assert_eq!(rule.comment, "");
    }

    #[test]
    fn captured_request_carries_type_tag() {
        let req = CapturedRequest {
            id: Uuid::new_v4(),
            kind: CaptureKind::Request,
            method: "GET".into(),
            url: "https://example.com/".into(),
            headers: Headers::new(),
            body: None,
            resource_type: "document".into(),
            timestamp: now_millis(),
            pending: false,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["type"], "request");
        assert_eq!(v["resourceType"], "document");
    }

    #[test]
    fn headers_preserve_insertion_order() {
        let mut h = Headers::new();
        h.insert("Host".into(), "a.example".into());
        h.insert("Cookie".into(), "sid=1".into());
        h.insert("X-Foo".into(), "bar".into());
        let keys: Vec<_> = h.keys().cloned().collect();
        assert_eq!(keys, vec!["Host", "Cookie", "X-Foo"]);

        // Re-inserting an existing name keeps its slot but takes the new value.
        h.insert("Cookie".into(), "sid=2".into());
        let keys: Vec<_> = h.keys().cloned().collect();
        assert_eq!(keys, vec!["Host", "Cookie", "X-Foo"]);
        assert_eq!(h["Cookie"], "sid=2");
    }
}
