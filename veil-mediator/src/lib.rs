//! The traffic mediator: interception state machine, rewrite engine
//! wiring, verdict intake, and browser-context replay.
//!
//! [`Mediator`] is the facade the control channel drives. It owns the
//! browser session, spawns one pipeline task per intercepted network
//! operation, and exposes the verdict/rule/flag surface the UI mutates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;
use veil_browser::{Browser, LaunchOptions, Page};
use veil_common::{CaptureEvent, ItemOverrides, MatchReplaceRule, Verdict, VeilError};

pub mod dispatch;
pub mod pipeline;
pub mod registry;
pub mod replay;

use dispatch::{Dispatcher, HttpDispatcher};
use registry::PendingRegistry;
pub use replay::{ReplayOutcome, ReplayRequest};

/// Process-wide interception switches, consulted once per pipeline entry.
/// Changes never retroactively affect items already past their decision
/// point.
#[derive(Default)]
pub struct InterceptFlags {
    requests: AtomicBool,
    responses: AtomicBool,
}

impl InterceptFlags {
    pub fn requests(&self) -> bool {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn responses(&self) -> bool {
        self.responses.load(Ordering::Relaxed)
    }

    pub fn set_requests(&self, enabled: bool) {
        self.requests.store(enabled, Ordering::Relaxed);
    }

    pub fn set_responses(&self, enabled: bool) {
        self.responses.store(enabled, Ordering::Relaxed);
    }
}

/// Shared state every pipeline instance reads.
pub(crate) struct MediatorState {
    pub(crate) flags: InterceptFlags,
    pub(crate) rules: RwLock<Arc<[MatchReplaceRule]>>,
    pub(crate) registry: PendingRegistry,
    pub(crate) events: broadcast::Sender<CaptureEvent>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
}

impl MediatorState {
    /// Stable rule snapshot for one pipeline run; the only writer is the
    /// UI replacing the whole list.
    pub(crate) fn rules_snapshot(&self) -> Arc<[MatchReplaceRule]> {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn emit(&self, event: CaptureEvent) {
        // No subscribers just means no UI is watching.
        let _ = self.events.send(event);
    }
}

struct ActiveBrowser {
    browser: Browser,
    page: Page,
    routes_task: JoinHandle<()>,
}

/// Mediator construction knobs.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    pub launch: LaunchOptions,
    pub replay_timeout: Duration,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            launch: LaunchOptions::default(),
            replay_timeout: Duration::from_secs(30),
        }
    }
}

/// The traffic mediator facade the control channel drives.
pub struct Mediator {
    state: Arc<MediatorState>,
    browser: tokio::sync::Mutex<Option<ActiveBrowser>>,
    launch: LaunchOptions,
    replay_timeout: Duration,
}

impl Mediator {
    pub fn new(
        config: MediatorConfig,
        events: broadcast::Sender<CaptureEvent>,
    ) -> Result<Self, VeilError> {
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(HttpDispatcher::new()?);
        let state = MediatorState {
            flags: InterceptFlags::default(),
            rules: RwLock::new(Vec::new().into()),
            registry: PendingRegistry::new(),
            events,
            dispatcher,
        };
        Ok(Self {
            state: Arc::new(state),
            browser: tokio::sync::Mutex::new(None),
            launch: config.launch,
            replay_timeout: config.replay_timeout,
        })
    }

    /// Launch the browser and navigate to `url`. An already-running
    /// session is torn down first. Navigation failures are logged, not
    /// fatal; the session is still usable.
    pub async fn start(&self, url: &str) -> anyhow::Result<()> {
        self.stop().await;

        info!(target: "mediator.session", %url, "starting browser session");
        let (browser, mut routes) = Browser::launch(self.launch.clone()).await?;
        let page = browser.page();

        let state = self.state.clone();
        let routes_task = tokio::spawn(async move {
            while let Some(route) = routes.recv().await {
                let state = state.clone();
                tokio::spawn(async move {
                    pipeline::handle_route(state.as_ref(), &route).await;
                });
            }
        });

        *self.browser.lock().await = Some(ActiveBrowser {
            browser,
            page: page.clone(),
            routes_task,
        });

        if let Err(err) = page.navigate(url).await {
            error!(target: "mediator.session", %url, %err, "initial navigation failed");
        }
        Ok(())
    }

    /// Close the browser session. Every parked item wakes with a
    /// synthetic Drop; in-flight pipelines observe the closed connection
    /// and unwind.
    pub async fn stop(&self) {
        if let Some(active) = self.browser.lock().await.take() {
            info!(target: "mediator.session", "stopping browser session");
            active.routes_task.abort();
            active.browser.close().await;
        }
        self.state.registry.drain();
    }

    pub fn set_intercept_requests(&self, enabled: bool) {
        info!(target: "mediator.intercept", enabled, "request interception toggled");
        self.state.flags.set_requests(enabled);
    }

    pub fn set_intercept_responses(&self, enabled: bool) {
        info!(target: "mediator.intercept", enabled, "response interception toggled");
        self.state.flags.set_responses(enabled);
    }

    pub fn intercept_flags(&self) -> (bool, bool) {
        (self.state.flags.requests(), self.state.flags.responses())
    }

    /// Resume a suspended item with optional modifications. False when
    /// the id is unknown or already resolved.
    pub fn forward(&self, id: Uuid, modified: Option<ItemOverrides>) -> bool {
        self.state.registry.resolve(id, Verdict::Forward(modified))
    }

    /// Drop a suspended item. False when the id is unknown or already
    /// resolved.
    pub fn drop_item(&self, id: Uuid) -> bool {
        self.state.registry.resolve(id, Verdict::Drop)
    }

    /// Replace the rewrite rule list atomically. In-flight pipelines keep
    /// the snapshot they took at entry.
    pub fn replace_rules(&self, rules: Vec<MatchReplaceRule>) {
        info!(target: "mediator.rules", count = rules.len(), "rule list replaced");
        *self
            .state
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = rules.into();
    }

    pub fn rules(&self) -> Arc<[MatchReplaceRule]> {
        self.state.rules_snapshot()
    }

    /// Re-issue a stored request from inside the live page.
    pub async fn replay(&self, request: &ReplayRequest) -> ReplayOutcome {
        let page = self
            .browser
            .lock()
            .await
            .as_ref()
            .map(|active| active.page.clone());
        match page {
            Some(page) => replay::replay_in_page(&page, request, self.replay_timeout).await,
            None => ReplayOutcome::Error {
                error: "browser not active".to_string(),
            },
        }
    }

    /// Full teardown for process exit.
    pub async fn shutdown(&self) {
        self.stop().await;
    }
}
