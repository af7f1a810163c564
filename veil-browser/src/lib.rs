//! Browser boundary: chromium launch, DevTools protocol client, and the
//! route-interception surface the mediator drives.
//!
//! WebDriver-style automation has no primitives for pausing a request in
//! flight, so this crate speaks the Chrome DevTools Protocol directly
//! over the browser's websocket endpoint. The mediator consumes it
//! through two small seams: [`surface::RouteIo`] (one paused network
//! request with continue/fulfil/abort) and [`surface::PageOps`]
//! (navigation and in-page script evaluation).

pub mod cdp;
pub mod chromium;
pub mod launch;
pub mod surface;

pub use chromium::{Browser, Page, Route};
pub use launch::LaunchOptions;
pub use surface::{ContinueOverrides, PageOps, RouteIo, RouteRequest};

/// Errors surfaced by the browser layer.
#[derive(thiserror::Error, Debug)]
pub enum BrowserError {
    /// The browser binary could not be found or did not come up.
    #[error("failed to launch browser: {0}")]
    Launch(String),

    /// The DevTools websocket endpoint rejected the connection.
    #[error("failed to connect to devtools endpoint: {0}")]
    Connect(String),

    /// The browser answered a command with a protocol-level error.
    #[error("devtools protocol error: {0}")]
    Protocol(String),

    /// The websocket to the browser is gone; every in-flight command and
    /// route dies with it.
    #[error("devtools connection closed")]
    ConnectionClosed,

    /// In-page script evaluation threw.
    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("browser i/o error: {0}")]
    Io(#[from] std::io::Error),
}
