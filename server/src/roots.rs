//! Roots configuration file.
//!
//! The file lives at `~/.config/piggychick/config.jsonc` by default and has
//! the shape:
//!
//! ```jsonc
//! {
//!   "tasksDir": ".tasks",            // optional, default ".tasks"
//!   "roots": [
//!     { "path": "/home/me/code/app" },
//!     { "path": "../other", "tasksDir": "plans" }
//!   ]
//! }
//! ```
//!
//! A missing or blank file means "no roots". The file is re-read on every
//! request so edits apply without a restart.
//!
//! Root ids are the short id of the canonical root path. Two roots whose ids
//! collide keep configuration order and get `-2`, `-3`, ... suffixes.

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigError;
use crate::jsonc::parse_jsonc;
use crate::paths::{is_safe_dir_name, resolve_against};
use crate::utils::short_id;

/// Tasks directory used when neither the file nor the root overrides it.
pub const DEFAULT_TASKS_DIR: &str = ".tasks";

/// Raw root entry as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootEntry {
    pub path: String,
    pub tasks_dir: Option<String>,
}

/// Validated contents of the config file, before path normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigFile {
    pub tasks_dir: Option<String>,
    pub roots: Vec<RootEntry>,
}

/// A configured root after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    /// Stable short id of the canonical path (possibly suffixed).
    pub id: String,
    /// Canonical root path (or the absolute path if it does not exist).
    pub path: PathBuf,
    /// Name of the tasks subdirectory.
    pub tasks_dir: String,
}

impl Root {
    /// The root's own tasks directory.
    pub fn tasks_path(&self) -> PathBuf {
        self.path.join(&self.tasks_dir)
    }
}

/// Default config file location.
pub fn default_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(".config")
            .join("piggychick")
            .join("config.jsonc")
    })
}

/// Validates a tasks directory name; blank means the default.
pub fn normalize_tasks_dir(value: Option<&str>) -> Result<String, ConfigError> {
    let raw = value.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Ok(DEFAULT_TASKS_DIR.to_string());
    }
    if !is_safe_dir_name(raw) {
        return Err(ConfigError::invalid(format!("Invalid tasksDir: {raw}")));
    }
    Ok(raw.to_string())
}

/// Reads and validates the config file at `path`.
///
/// # Errors
///
/// - [`ConfigError::Read`] if the file exists but cannot be read
/// - [`ConfigError::Parse`] if it is not valid JSONC
/// - [`ConfigError::Invalid`] if it does not match the schema
pub fn load_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Config file absent, no roots configured");
            return Ok(ConfigFile::default());
        }
        Err(err) => {
            return Err(ConfigError::Read(format!(
                "Failed to read config: {} ({:?})",
                path.display(),
                err.kind()
            )));
        }
    };
    parse_config_text(&text, path)
}

/// Validates config text. `origin` only appears in error messages.
pub fn parse_config_text(text: &str, origin: &Path) -> Result<ConfigFile, ConfigError> {
    if text.trim().is_empty() {
        return Ok(ConfigFile::default());
    }

    let parsed = parse_jsonc(text).map_err(|err| {
        ConfigError::Parse(format!(
            "Failed to parse config {}: {err}",
            origin.display()
        ))
    })?;

    let Value::Object(object) = parsed else {
        return Err(ConfigError::invalid(format!(
            "Invalid config object: {}",
            origin.display()
        )));
    };

    let tasks_dir = match object.get("tasksDir") {
        None => None,
        Some(Value::String(value)) => Some(value.clone()),
        Some(_) => {
            return Err(ConfigError::invalid(format!(
                "Invalid tasksDir in {}",
                origin.display()
            )));
        }
    };

    let raw_roots = match object.get("roots") {
        None => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => {
            return Err(ConfigError::invalid(format!(
                "Invalid roots array in {}",
                origin.display()
            )));
        }
    };

    let mut roots = Vec::with_capacity(raw_roots.len());
    for item in raw_roots {
        let Value::Object(entry) = item else {
            return Err(ConfigError::invalid(format!(
                "Invalid root entry in {}",
                origin.display()
            )));
        };
        let path = entry
            .get("path")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if path.is_empty() {
            return Err(ConfigError::invalid(format!(
                "Root path is required in {}",
                origin.display()
            )));
        }
        roots.push(RootEntry {
            path: path.to_string(),
            tasks_dir: entry
                .get("tasksDir")
                .and_then(Value::as_str)
                .map(str::to_string),
        });
    }

    Ok(ConfigFile { tasks_dir, roots })
}

/// Resolves, canonicalizes and deduplicates configured roots and assigns
/// their ids.
pub fn normalize_roots(
    config: &ConfigFile,
    cwd: &Path,
    origin: &Path,
) -> Result<Vec<Root>, ConfigError> {
    let with_origin =
        |err: ConfigError| ConfigError::invalid(format!("{err} ({})", origin.display()));
    let default_tasks_dir = normalize_tasks_dir(config.tasks_dir.as_deref()).map_err(with_origin)?;

    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(config.roots.len());
    for entry in &config.roots {
        let absolute = resolve_against(cwd, Path::new(&entry.path));
        let path = fs::canonicalize(&absolute).unwrap_or(absolute);
        if !seen.insert(path.to_string_lossy().to_lowercase()) {
            continue;
        }

        let tasks_dir = match entry.tasks_dir.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => {
                normalize_tasks_dir(Some(value)).map_err(with_origin)?
            }
            _ => default_tasks_dir.clone(),
        };
        resolved.push((path, tasks_dir));
    }

    let mut id_counts: HashMap<String, usize> = HashMap::new();
    let roots = resolved
        .into_iter()
        .map(|(path, tasks_dir)| {
            let base = short_id(&path.to_string_lossy());
            let count = id_counts.entry(base.clone()).or_insert(0);
            *count += 1;
            let id = if *count == 1 {
                base
            } else {
                format!("{base}-{count}")
            };
            Root {
                id,
                path,
                tasks_dir,
            }
        })
        .collect();

    Ok(roots)
}

/// Handle on the roots configuration file.
///
/// Cheap to clone; every call re-reads the file.
#[derive(Debug, Clone)]
pub struct RootsConfig {
    path: PathBuf,
}

impl RootsConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads and normalizes all configured roots.
    pub fn load_roots(&self) -> Result<Vec<Root>, ConfigError> {
        let config = load_config_file(&self.path)?;
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        normalize_roots(&config, &cwd, &self.path)
    }

    /// Looks up a single root by id.
    pub fn resolve_root(&self, root_id: &str) -> Result<Option<Root>, ConfigError> {
        Ok(self
            .load_roots()?
            .into_iter()
            .find(|root| root.id == root_id))
    }

    /// Ids of every configured root, in configuration order.
    pub fn root_ids(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.load_roots()?.into_iter().map(|root| root.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn origin() -> &'static Path {
        Path::new("/etc/pgch/config.jsonc")
    }

    #[test]
    fn missing_file_means_no_roots() {
        let tmp = TempDir::new().unwrap();
        let config = load_config_file(&tmp.path().join("absent.jsonc")).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn blank_file_means_no_roots() {
        assert_eq!(parse_config_text("  \n", origin()).unwrap(), ConfigFile::default());
    }

    #[test]
    fn parses_roots_with_overrides() {
        let text = r#"{
            // shared default
            "tasksDir": "plans",
            "roots": [
                { "path": "/srv/app" },
                { "path": " /srv/other ", "tasksDir": "work", },
            ],
        }"#;
        let config = parse_config_text(text, origin()).unwrap();
        assert_eq!(config.tasks_dir.as_deref(), Some("plans"));
        assert_eq!(config.roots.len(), 2);
        assert_eq!(config.roots[1].path, "/srv/other");
        assert_eq!(config.roots[1].tasks_dir.as_deref(), Some("work"));
    }

    #[test]
    fn schema_violations_are_invalid() {
        for text in [
            "[]",
            r#"{"roots": {}}"#,
            r#"{"tasksDir": 3}"#,
            r#"{"roots": [1]}"#,
            r#"{"roots": [{"path": "  "}]}"#,
            r#"{"roots": [{}]}"#,
        ] {
            let err = parse_config_text(text, origin()).unwrap_err();
            assert_eq!(err.code(), "config_invalid", "{text}");
        }
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        let err = parse_config_text("{ roots: ", origin()).unwrap_err();
        assert_eq!(err.code(), "config_parse_error");
        assert!(err.to_string().contains("config.jsonc"));
    }

    #[test]
    fn unsafe_tasks_dir_is_rejected() {
        let config = ConfigFile {
            tasks_dir: None,
            roots: vec![RootEntry {
                path: "/srv/app".into(),
                tasks_dir: Some("../escape".into()),
            }],
        };
        let err = normalize_roots(&config, Path::new("/"), origin()).unwrap_err();
        assert_eq!(err.code(), "config_invalid");
        assert_eq!(normalize_tasks_dir(Some("c:drive")).unwrap_err().code(), "config_invalid");
        assert_eq!(normalize_tasks_dir(Some("  ")).unwrap(), DEFAULT_TASKS_DIR);
    }

    #[test]
    fn relative_paths_resolve_against_cwd_and_dedupe() {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("Project");
        fs::create_dir_all(&project).unwrap();
        let config = ConfigFile {
            tasks_dir: None,
            roots: vec![
                RootEntry { path: "Project".into(), tasks_dir: None },
                RootEntry { path: project.display().to_string(), tasks_dir: Some("other".into()) },
            ],
        };

        let roots = normalize_roots(&config, tmp.path(), origin()).unwrap();
        assert_eq!(roots.len(), 1);
        let canonical = fs::canonicalize(&project).unwrap();
        assert_eq!(roots[0].path, canonical);
        assert_eq!(roots[0].tasks_dir, DEFAULT_TASKS_DIR);
        assert_eq!(roots[0].id, short_id(&canonical.to_string_lossy()));
    }

    #[test]
    fn tilde_is_not_expanded() {
        let config = ConfigFile {
            tasks_dir: None,
            roots: vec![RootEntry { path: "~/code/app".into(), tasks_dir: None }],
        };
        let roots = normalize_roots(&config, Path::new("/srv/pgch"), origin()).unwrap();
        assert_eq!(roots[0].path, PathBuf::from("/srv/pgch/~/code/app"));
    }

    #[test]
    fn missing_paths_keep_absolute_form() {
        let config = ConfigFile {
            tasks_dir: Some("plans".into()),
            roots: vec![RootEntry { path: "/nonexistent/pgch/root".into(), tasks_dir: None }],
        };
        let roots = normalize_roots(&config, Path::new("/"), origin()).unwrap();
        assert_eq!(roots[0].path, PathBuf::from("/nonexistent/pgch/root"));
        assert_eq!(roots[0].tasks_path(), PathBuf::from("/nonexistent/pgch/root/plans"));
    }

    #[test]
    fn roots_config_reads_file_each_time() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.jsonc");
        let roots = RootsConfig::new(&path);
        assert!(roots.load_roots().unwrap().is_empty());

        fs::write(&path, format!("{{\"roots\": [{{\"path\": \"{}\"}}]}}", tmp.path().display()))
            .unwrap();
        let ids = roots.root_ids().unwrap();
        assert_eq!(ids.len(), 1);
        assert!(roots.resolve_root(&ids[0]).unwrap().is_some());
        assert!(roots.resolve_root("000000000000").unwrap().is_none());
    }
}
