//! The per-request interception pipeline.
//!
//! For every network operation the browser pauses, exactly one pipeline
//! instance runs: rewrite the request, honour the channel-header
//! protocol, capture or suspend, dispatch (bypass or mediated), rewrite
//! the response, capture or suspend again, deliver. Instances run
//! concurrently and never order themselves against each other; within
//! one instance the request event always precedes the response event.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;
use veil_browser::{ContinueOverrides, RouteIo};
use veil_common::{
    now_millis, CaptureEvent, CaptureKind, CapturedRequest, CapturedResponse, Headers, ItemSlice,
    Verdict,
};
use veil_rules::RuleEngine;

use crate::MediatorState;

/// Reserved wire headers; both are stripped before egress on every path.
pub const BYPASS_HEADER: &str = "x-waf-bypass-repeater";
pub const OVERRIDE_HEADER: &str = "x-antigravity-override";

/// Run the pipeline for one paused route, falling back to an untouched
/// pass-through (and finally an abort) if it fails.
pub(crate) async fn handle_route<R: RouteIo>(state: &MediatorState, route: &R) {
    if let Err(err) = run(state, route).await {
        warn!(target: "mediator.pipeline", %err, url = %route.request().url, "pipeline failed; passing request through");
        let mut headers = route.request().headers.clone();
        strip_reserved(&mut headers);
        let fallback = ContinueOverrides {
            headers: Some(headers),
            ..ContinueOverrides::default()
        };
        if route.continue_with(fallback).await.is_err() {
            let _ = route.abort().await;
        }
    }
}

async fn run<R: RouteIo>(state: &MediatorState, route: &R) -> anyhow::Result<()> {
    let rules = state.rules_snapshot();
    let engine = RuleEngine::new(&rules);
    let request = route.request();

    // Rewrite the request: first line, then headers, then body. The
    // rewritten values are authoritative from here on.
    let (mut method, mut url) = engine.request_line(&request.method, &request.url);
    let mut headers = engine.headers(ItemSlice::RequestHeader, &request.headers);
    let mut body = engine.body(ItemSlice::RequestBody, request.body.clone());

    let bypass = apply_channel_protocol(&mut headers);

    let req_id = Uuid::new_v4();
    let suspend = state.flags.requests() && !bypass;
    let captured = CapturedRequest {
        id: req_id,
        kind: CaptureKind::Request,
        method: method.clone(),
        url: url.clone(),
        headers: headers.clone(),
        body: body.clone(),
        resource_type: request.resource_type.clone(),
        timestamp: now_millis(),
        pending: suspend,
    };
    state.emit(CaptureEvent::Request(captured.clone()));

    if suspend {
        let handle = state
            .registry
            .park(req_id, CaptureKind::Request, serde_json::to_value(&captured)?);
        match handle.await {
            // A closed handle means the registry drained during shutdown.
            Ok(Verdict::Drop) | Err(_) => {
                let _ = route.abort().await;
                return Ok(());
            }
            Ok(Verdict::Forward(overrides)) => {
                if let Some(overrides) = overrides {
                    if let Some(m) = overrides.method {
                        method = m;
                    }
                    if let Some(h) = overrides.headers {
                        headers = h;
                    }
                    if let Some(b) = overrides.body {
                        body = Some(b);
                    }
                }
            }
        }
    }

    if bypass {
        // Hand the request back to the browser's own network stack so
        // TLS fingerprint, connection reuse, and the cookie jar stay
        // intact. Host and Content-Length are recomputed by the browser.
        let mut forward = headers;
        forward.retain(|name, _| {
            let lower = name.to_ascii_lowercase();
            lower != "host" && lower != "content-length"
        });
        let overrides = ContinueOverrides {
            method: Some(method),
            url: Some(url),
            headers: Some(forward),
            body,
        };
        if let Err(err) = route.continue_with(overrides).await {
            warn!(target: "mediator.pipeline", %err, "bypass continue failed; aborting");
            let _ = route.abort().await;
        }
        return Ok(());
    }

    // Mediated mode: perform the request ourselves so the response half
    // of the pipeline can run.
    let outbound = crate::dispatch::DispatchRequest {
        method,
        url: url.clone(),
        headers,
        body,
    };
    let response = match state.dispatcher.send(outbound).await {
        Ok(response) => response,
        Err(err) => {
            warn!(target: "mediator.dispatch", %err, %url, "dispatch failed; aborting operation");
            let _ = route.abort().await;
            return Ok(());
        }
    };

    // Rewrite the response: status line, then headers, then body.
    let mut status = engine.status_line(response.status);
    let mut res_headers = engine.headers(ItemSlice::ResponseHeader, &response.headers);
    let mut res_body = engine.body(ItemSlice::ResponseBody, Some(response.body));

    let res_id = Uuid::new_v4();
    let suspend = state.flags.responses();
    let captured = CapturedResponse {
        id: res_id,
        req_id,
        kind: CaptureKind::Response,
        url: response.url,
        status,
        headers: res_headers.clone(),
        body: res_body.clone(),
        pending: suspend,
        timestamp: now_millis(),
    };
    state.emit(CaptureEvent::Response(captured.clone()));

    if suspend {
        let handle = state.registry.park(
            res_id,
            CaptureKind::Response,
            serde_json::to_value(&captured)?,
        );
        match handle.await {
            Ok(Verdict::Drop) | Err(_) => {
                let _ = route.abort().await;
                return Ok(());
            }
            Ok(Verdict::Forward(overrides)) => {
                if let Some(overrides) = overrides {
                    if let Some(s) = overrides.status {
                        status = s;
                    }
                    if let Some(h) = overrides.headers {
                        res_headers = h;
                    }
                    if let Some(b) = overrides.body {
                        res_body = Some(b);
                    }
                }
            }
        }
    }

    route.fulfill(status, &res_headers, res_body.as_deref()).await?;
    Ok(())
}

/// Detect and consume the reserved channel headers.
///
/// Returns whether bypass mode is on. When either reserved header is
/// present, both are stripped and any override pairs are merged on top
/// of the rewritten headers; this is how forbidden headers injected by
/// the replayer reach the wire. Malformed override JSON is ignored.
// TODO: bind the override channel to replayer-originated requests with a
// per-session nonce; today any page that can set the header is trusted.
fn apply_channel_protocol(headers: &mut Headers) -> bool {
    let mut bypass = false;
    let mut overrides: Option<Headers> = None;

    for (name, value) in headers.iter() {
        let lower = name.to_ascii_lowercase();
        if lower == BYPASS_HEADER {
            bypass = true;
        } else if lower == OVERRIDE_HEADER {
            match serde_json::from_str::<Value>(value) {
                Ok(Value::Object(map)) => {
                    let mut merged = Headers::new();
                    for (key, entry) in map {
                        let entry = match entry {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        merged.insert(key, entry);
                    }
                    overrides = Some(merged);
                }
                Ok(_) | Err(_) => {
                    debug!(target: "mediator.pipeline", "ignoring malformed override header");
                }
            }
        }
    }

    if bypass || overrides.is_some() {
        strip_reserved(headers);
        if let Some(overrides) = overrides {
            for (name, value) in overrides {
                headers.insert(name, value);
            }
        }
    }
    bypass
}

fn strip_reserved(headers: &mut Headers) {
    headers.retain(|name, _| {
        let lower = name.to_ascii_lowercase();
        lower != BYPASS_HEADER && lower != OVERRIDE_HEADER
    });
}
