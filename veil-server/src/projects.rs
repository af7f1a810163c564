//! JSON-file project store.
//!
//! One file per project under the configured directory. A project
//! bundles everything a tester wants back next session: target URL,
//! saved captures, exclusion rules, UI filter state, repeater tabs, and
//! the match/replace rule list.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use veil_common::{CapturedRequest, MatchReplaceRule};

/// History exclusion rule; applied by the UI, persisted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExclusionRule {
    #[serde(rename = "type")]
    pub kind: ExclusionKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionKind {
    Domain,
    Url,
    Regex,
}

/// A saved capture, optionally with the response it received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRequest {
    #[serde(flatten)]
    pub request: CapturedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(default = "default_target_url")]
    pub target_url: String,
    #[serde(default)]
    pub requests: Vec<StoredRequest>,
    #[serde(default)]
    pub exclusion_rules: Vec<ExclusionRule>,
    #[serde(default)]
    pub history_filter: String,
    #[serde(default)]
    pub hide_static: bool,
    #[serde(default)]
    pub repeater_tabs: Vec<Value>,
    #[serde(default)]
    pub match_replace_rules: Vec<MatchReplaceRule>,
}

fn default_target_url() -> String {
    "https://example.com".to_string()
}

/// Mutable project fields, as sent by the UI on save.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectData {
    pub target_url: String,
    pub requests: Vec<StoredRequest>,
    pub exclusion_rules: Vec<ExclusionRule>,
    pub history_filter: String,
    pub hide_static: bool,
    pub repeater_tabs: Vec<Value>,
    pub match_replace_rules: Vec<MatchReplaceRule>,
}

/// Listing entry: enough to render a project picker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub name: String,
    pub created: String,
    pub last_modified: String,
    pub target_url: String,
    pub request_count: usize,
}

/// Filesystem-backed project persistence.
pub struct ProjectStore {
    dir: PathBuf,
}

impl ProjectStore {
    pub fn new(dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create projects directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitise_name(name)))
    }

    /// All saved projects, newest modification first. Unreadable files
    /// are skipped.
    pub fn list(&self) -> Vec<ProjectSummary> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(target: "projects.store", %err, "projects directory unreadable");
                return Vec::new();
            }
        };

        let mut summaries: Vec<ProjectSummary> = entries
            .flatten()
            .filter(|entry| {
                entry.path().extension().and_then(|e| e.to_str()) == Some("json")
            })
            .filter_map(|entry| match read_project(&entry.path()) {
                Ok(project) => Some(ProjectSummary {
                    name: project.name,
                    created: project.created,
                    last_modified: project.last_modified,
                    target_url: project.target_url,
                    request_count: project.requests.len(),
                }),
                Err(err) => {
                    debug!(target: "projects.store", path = %entry.path().display(), %err, "skipping unreadable project");
                    None
                }
            })
            .collect();

        summaries.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        summaries
    }

    pub fn create(&self, name: &str) -> anyhow::Result<Project> {
        let now = Utc::now().to_rfc3339();
        let mut project = Project {
            name: name.to_string(),
            created: now.clone(),
            last_modified: now,
            target_url: default_target_url(),
            requests: Vec::new(),
            exclusion_rules: Vec::new(),
            history_filter: String::new(),
            hide_static: false,
            repeater_tabs: Vec::new(),
            match_replace_rules: Vec::new(),
        };
        self.save(&mut project)?;
        Ok(project)
    }

    pub fn load(&self, name: &str) -> Option<Project> {
        let path = self.path_for(name);
        if !path.exists() {
            return None;
        }
        match read_project(&path) {
            Ok(project) => Some(project),
            Err(err) => {
                warn!(target: "projects.store", %name, %err, "failed to load project");
                None
            }
        }
    }

    /// Persist, stamping `lastModified`.
    pub fn save(&self, project: &mut Project) -> anyhow::Result<()> {
        project.last_modified = Utc::now().to_rfc3339();
        let path = self.path_for(&project.name);
        let json = serde_json::to_string_pretty(project)?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write project {}", path.display()))?;
        Ok(())
    }

    /// Apply `data` onto the named project, creating it if missing.
    pub fn upsert(&self, name: &str, data: ProjectData) -> anyhow::Result<Project> {
        let mut project = match self.load(name) {
            Some(existing) => existing,
            None => self.create(name)?,
        };
        project.target_url = data.target_url;
        project.requests = data.requests;
        project.exclusion_rules = data.exclusion_rules;
        project.history_filter = data.history_filter;
        project.hide_static = data.hide_static;
        project.repeater_tabs = data.repeater_tabs;
        project.match_replace_rules = data.match_replace_rules;
        self.save(&mut project)?;
        Ok(project)
    }

    pub fn delete(&self, name: &str) -> bool {
        let path = self.path_for(name);
        path.exists() && fs::remove_file(&path).is_ok()
    }
}

fn read_project(path: &Path) -> anyhow::Result<Project> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Keep project names filesystem-safe: alphanumerics, spaces, dashes,
/// underscores; everything else is dropped.
fn sanitise_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}
