//! Chromium discovery and launch.
//!
//! The browser is started with a fresh throwaway profile, anti-automation
//! arguments, and `--remote-debugging-port=0`; the kernel-assigned
//! DevTools endpoint is then scraped from the `DevTools listening on …`
//! line chromium prints to stderr.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::info;
use uuid::Uuid;

use crate::BrowserError;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

const CANDIDATE_BINARIES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

/// Browser launch knobs.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Explicit binary path; overrides `VEIL_BROWSER` and `PATH` discovery.
    pub binary: Option<PathBuf>,
    pub headless: bool,
    pub window: (u32, u32),
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            binary: None,
            headless: false,
            window: (1920, 1080),
        }
    }
}

pub(crate) struct LaunchedBrowser {
    pub child: Child,
    pub ws_url: String,
    pub profile_dir: PathBuf,
}

/// Construct chromium command-line arguments for an interception session.
///
/// TLS verification is disabled for the whole context
/// (`--ignore-certificate-errors`), matching the workbench contract.
fn build_launch_arguments(opts: &LaunchOptions, profile_dir: &Path) -> Vec<String> {
    let (width, height) = opts.window;
    let mut args = vec![
        "--remote-debugging-port=0".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-infobars".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--no-sandbox".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--start-maximized".to_string(),
        "--window-position=0,0".to_string(),
        format!("--window-size={width},{height}"),
        format!("--user-data-dir={}", profile_dir.display()),
    ];
    if opts.headless {
        args.push("--headless=new".to_string());
        args.push("--disable-gpu".to_string());
    }
    args.push("about:blank".to_string());
    args
}

fn resolve_binary(opts: &LaunchOptions) -> Result<PathBuf, BrowserError> {
    if let Some(explicit) = &opts.binary {
        return Ok(explicit.clone());
    }
    if let Ok(env_binary) = std::env::var("VEIL_BROWSER") {
        return Ok(PathBuf::from(env_binary));
    }
    find_in_path(CANDIDATE_BINARIES).ok_or_else(|| {
        BrowserError::Launch(
            "no chromium binary found; set browser.binary or VEIL_BROWSER".to_string(),
        )
    })
}

fn find_in_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        for name in names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

pub(crate) async fn launch(opts: &LaunchOptions) -> Result<LaunchedBrowser, BrowserError> {
    let binary = resolve_binary(opts)?;
    let profile_dir = std::env::temp_dir().join(format!("veil-profile-{}", Uuid::new_v4()));

    let mut child = Command::new(&binary)
        .args(build_launch_arguments(opts, &profile_dir))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BrowserError::Launch("browser stderr unavailable".to_string()))?;

    let ws_url = tokio::time::timeout(STARTUP_TIMEOUT, wait_for_ws_url(stderr))
        .await
        .map_err(|_| {
            BrowserError::Launch("timed out waiting for the DevTools endpoint".to_string())
        })??;

    info!(target: "browser.launch", binary = %binary.display(), %ws_url, "browser up");
    Ok(LaunchedBrowser {
        child,
        ws_url,
        profile_dir,
    })
}

async fn wait_for_ws_url(stderr: ChildStderr) -> Result<String, BrowserError> {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(rest) = line.strip_prefix("DevTools listening on ") {
            return Ok(rest.trim().to_string());
        }
    }
    Err(BrowserError::Launch(
        "browser exited before exposing a DevTools endpoint".to_string(),
    ))
}
