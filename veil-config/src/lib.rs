//! Loader for workbench configuration with YAML + environment overlays.
//!
//! Precedence: `VEIL__`-prefixed environment variables win over file
//! values; `${VAR}` placeholders inside string values are expanded
//! recursively (bounded depth) after merging.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use std::borrow::Cow;
use std::path::{Path, PathBuf};

const ENV_EXPANSION_PASSES: usize = 4;

/// Top-level configuration for the workbench binary.
#[derive(Debug, Deserialize)]
pub struct VeilConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            version: None,
            control: ControlConfig::default(),
            browser: BrowserConfig::default(),
            projects: ProjectsConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

/// Where the control channel listens for UI connections.
#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8787".into()
}

/// Browser launch knobs. `binary` overrides autodiscovery; the
/// `VEIL_BROWSER` environment variable is consulted as well.
#[derive(Debug, Default, Deserialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
}

fn default_window_width() -> u32 {
    1920
}

fn default_window_height() -> u32 {
    1080
}

/// Where saved projects live. `None` falls back to
/// `~/.local/share/veil/projects`.
#[derive(Debug, Default, Deserialize)]
pub struct ProjectsConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// In-page replay tuning.
#[derive(Debug, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_replay_timeout")]
    pub timeout_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_replay_timeout(),
        }
    }
}

fn default_replay_timeout() -> u64 {
    30
}

/// Walk the merged config tree and expand `${VAR}` placeholders in every
/// string leaf.
fn expand_env(value: Value) -> Value {
    match value {
        Value::String(raw) => Value::String(expand_env_str(raw)),
        Value::Array(items) => Value::Array(items.into_iter().map(expand_env).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, entry)| (key, expand_env(entry)))
                .collect(),
        ),
        scalar => scalar,
    }
}

/// Substitute environment references, re-running while a pass keeps
/// producing new ones (a variable may itself hold `${OTHER}`). Cyclic
/// definitions hit the pass cap and keep their unresolved placeholders;
/// unknown variables are left untouched.
fn expand_env_str(raw: String) -> String {
    let mut text = raw;
    for _ in 0..ENV_EXPANSION_PASSES {
        if !text.contains('$') {
            break;
        }
        let pass = match shellexpand::env(&text) {
            Ok(expanded) => Cow::into_owned(expanded),
            Err(_) => break,
        };
        if pass == text {
            break;
        }
        text = pass;
    }
    text
}

/// Builder hiding the `config` crate wiring (YAML + env overrides).
pub struct VeilConfigLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for VeilConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl VeilConfigLoader {
    /// Start with sensible defaults: `VEIL__`-prefixed env overrides only.
    ///
    /// ```
    /// use veil_config::VeilConfigLoader;
    ///
    /// let cfg = VeilConfigLoader::new()
    ///     .with_yaml_str("version: '1'")
    ///     .load()
    ///     .expect("valid config");
    /// assert_eq!(cfg.version.as_deref(), Some("1"));
    /// assert_eq!(cfg.control.listen, "127.0.0.1:8787");
    /// assert_eq!(cfg.replay.timeout_secs, 30);
    /// ```
    pub fn new() -> Self {
        let builder =
            Config::builder().add_source(Environment::with_prefix("VEIL").separator("__"));
        Self { builder }
    }

    /// Attach a config file that must exist; the `config` crate infers the
    /// format by suffix.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self.builder.add_source(File::from(path.as_ref()));
        self
    }

    /// Attach a config file that may be missing, so deployments can rely
    /// purely on environment variables.
    pub fn with_optional_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self
            .builder
            .add_source(File::from(path.as_ref()).required(false));
        self
    }

    /// Allow tests/CLI to merge inline YAML snippets.
    pub fn with_yaml_str(mut self, yaml: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(yaml, config::FileFormat::Yaml));
        self
    }

    /// Consume the builder and deserialize the merged sources.
    ///
    /// ```
    /// use veil_config::VeilConfigLoader;
    ///
    /// unsafe { std::env::set_var("VEIL_DOCTEST_DIR", "/tmp/veil-projects"); }
    ///
    /// let cfg = VeilConfigLoader::new()
    ///     .with_yaml_str(
    ///         r#"
    /// control:
    ///   listen: "0.0.0.0:9000"
    /// projects:
    ///   dir: "${VEIL_DOCTEST_DIR}"
    /// "#,
    ///     )
    ///     .load()
    ///     .expect("valid configuration");
    ///
    /// assert_eq!(cfg.control.listen, "0.0.0.0:9000");
    /// assert_eq!(
    ///     cfg.projects.dir.as_deref(),
    ///     Some(std::path::Path::new("/tmp/veil-projects"))
    /// );
    ///
    /// unsafe { std::env::remove_var("VEIL_DOCTEST_DIR"); }
    /// ```
    pub fn load(self) -> Result<VeilConfig, ConfigError> {
        let cfg = self.builder.build()?;

        // Round-trip through serde_json::Value so `${VAR}` expansion can
        // walk nested structures before typing them.
        let merged: Value = cfg.try_deserialize()?;
        let expanded = expand_env(merged);

        serde_json::from_value(expanded).map_err(|e| ConfigError::Message(e.to_string()))
    }
}
