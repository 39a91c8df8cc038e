#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context as _;
use directories::ProjectDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScriptgateError;
use crate::task::model::{DEFAULT_HINT, PrivilegeMode, TaskCatalog, TaskSpec};

pub const CONFIG_ENV: &str = "SCRIPTGATE_CONFIG";

const MIN_TICK_INTERVAL_MS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub hints: HintsConfig,
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub unlock_all: bool,
    pub tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unlock_all: false,
            tick_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HintsConfig {
    pub default: String,
}

impl Default for HintsConfig {
    fn default() -> Self {
        Self {
            default: DEFAULT_HINT.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEntry {
    pub name: String,
    #[serde(alias = "script")]
    pub path: String,
    #[serde(default)]
    pub privilege: PrivilegeMode,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "troubleshooting")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

/// Resolves the config file: explicit path, then `$SCRIPTGATE_CONFIG`, then
/// the per-user default.
pub fn resolve_paths(explicit: Option<&Path>) -> anyhow::Result<ConfigPaths> {
    if let Some(p) = explicit {
        return Ok(ConfigPaths {
            config_file: expand_path(&p.to_string_lossy())?,
        });
    }
    if let Some(v) = std::env::var_os(CONFIG_ENV)
        && !v.is_empty()
    {
        return Ok(ConfigPaths {
            config_file: expand_path(&v.to_string_lossy())?,
        });
    }
    default_paths()
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    let unix = home_config_path_unix();
    if !cfg!(windows) || unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("com", "scriptgate", "scriptgate")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

/// Where the interactive UI writes its log file.
#[must_use]
pub fn log_file_path() -> PathBuf {
    ProjectDirs::from("com", "scriptgate", "scriptgate").map_or_else(
        || std::env::temp_dir().join("scriptgate.log"),
        |p| p.data_local_dir().join("scriptgate.log"),
    )
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("scriptgate").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

// $VAR or ${VAR}; braces must pair.
static ENV_VAR: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").ok()
});

/// Unknown variables are left as written.
fn expand_env_vars(input: &str) -> String {
    let Some(re) = ENV_VAR.as_ref() else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn load(paths: &ConfigPaths) -> anyhow::Result<Config> {
    let (_doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn list_resolved_toml(paths: &ConfigPaths) -> anyhow::Result<String> {
    let (_doc, cfg) = load_from_file(&paths.config_file)?;
    Ok(toml::to_string_pretty(&cfg)?)
}

fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    let value = lookup_value(&cfg, key);
    Ok(value.map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, _cfg) = load_from_file(path)?;

    let item = parse_value_for_key(key, value)?;
    apply_set(&mut doc, key, item)?;

    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate_settings()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

impl Config {
    /// Full validation, including the task list.
    pub fn validate(&self) -> Result<(), ScriptgateError> {
        self.validate_settings()?;
        if self.tasks.is_empty() {
            return Err(ScriptgateError::Config(
                "no tasks configured; add [[tasks]] entries".to_owned(),
            ));
        }
        let mut seen = BTreeSet::new();
        for (i, t) in self.tasks.iter().enumerate() {
            if t.name.trim().is_empty() {
                return Err(ScriptgateError::Config(format!(
                    "tasks[{i}].name must not be empty"
                )));
            }
            if t.path.trim().is_empty() {
                return Err(ScriptgateError::Config(format!(
                    "tasks[{i}].path must not be empty ({})",
                    t.name
                )));
            }
            if !seen.insert(t.name.as_str()) {
                return Err(ScriptgateError::DuplicateTask(t.name.clone()));
            }
        }
        Ok(())
    }

    /// Validation of everything except the task list, so settings can be
    /// edited before any task exists.
    pub fn validate_settings(&self) -> Result<(), ScriptgateError> {
        if self.engine.tick_interval_ms < MIN_TICK_INTERVAL_MS {
            return Err(ScriptgateError::Config(format!(
                "engine.tick_interval_ms must be >= {MIN_TICK_INTERVAL_MS}"
            )));
        }
        Ok(())
    }

    /// Builds the immutable catalog, expanding `~` and environment
    /// variables in script paths.
    pub fn catalog(&self) -> anyhow::Result<TaskCatalog> {
        let specs = self
            .tasks
            .iter()
            .map(|t| {
                Ok(TaskSpec {
                    name: t.name.trim().to_owned(),
                    executable_path: expand_path(&t.path)?,
                    privilege: t.privilege,
                    description: t.description.clone(),
                    troubleshooting_hint: t.hint.clone(),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(TaskCatalog::new(specs, self.hints.default.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Bool,
    Int,
    String,
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "engine.unlock_all" => KeyType::Bool,
        "engine.tick_interval_ms" => KeyType::Int,
        "hints.default" => KeyType::String,
        _ => return None,
    })
}

fn parse_value_for_key(key: &str, value: &str) -> anyhow::Result<toml_edit::Item> {
    let invalid = |msg| ScriptgateError::InvalidConfigValue {
        key: key.to_owned(),
        msg,
    };
    let key_type = key_type(key).ok_or_else(|| ScriptgateError::InvalidConfigKey(key.to_owned()))?;
    Ok(match key_type {
        KeyType::Bool => toml_edit::value(parse_bool(value).map_err(invalid)?),
        KeyType::Int => toml_edit::value(parse_int(value).map_err(invalid)?),
        KeyType::String => toml_edit::value(value),
    })
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    let Some((leaf, tables)) = parts.split_last() else {
        return Err(ScriptgateError::InvalidConfigKey(key.to_owned()).into());
    };

    let mut cur = doc.as_table_mut();
    for &seg in tables {
        if !cur.contains_key(seg) {
            cur.insert(seg, toml_edit::Item::Table(toml_edit::Table::new()));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            ScriptgateError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }
    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        v = match v {
            serde_json::Value::Object(mut map) => map.remove(seg)?,
            serde_json::Value::Array(mut items) => {
                let i: usize = seg.parse().ok()?;
                if i >= items.len() {
                    return None;
                }
                items.swap_remove(i)
            }
            _ => return None,
        };
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[engine]
unlock_all = false

[[tasks]]
name = "apple"
path = "/scripts/apple.sh"
description = "Runs apple script"

[[tasks]]
name = "cherry"
path = "/scripts/cherry.sh"
privilege = "sudo"
hint = "This script requires sudo."

[[tasks]]
name = "orange"
script = "/scripts/run_as_root.sh"
privilege = "root"
"#;

    fn write_sample(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).expect("write config");
        path
    }

    #[test]
    fn default_settings_are_valid_but_need_tasks() {
        let cfg = Config::default();
        cfg.validate_settings().unwrap();
        assert!(matches!(cfg.validate(), Err(ScriptgateError::Config(_))));
    }

    #[test]
    fn loads_catalog_from_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = ConfigPaths {
            config_file: write_sample(&dir),
        };
        let cfg = load(&paths).unwrap();
        assert_eq!(cfg.engine.tick_interval(), Duration::from_millis(100));

        let catalog = cfg.catalog().unwrap();
        assert_eq!(catalog.len(), 3);
        let orange = catalog.get(2).unwrap();
        assert_eq!(orange.privilege, PrivilegeMode::SudoAsRoot);
        assert_eq!(orange.executable_path, PathBuf::from("/scripts/run_as_root.sh"));
        assert_eq!(catalog.hint_for(1), "This script requires sudo.");
        assert_eq!(catalog.hint_for(0), DEFAULT_HINT);
    }

    #[test]
    fn validation_catches_duplicates_and_bad_intervals() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.tasks[1].name = "apple".to_owned();
        assert!(matches!(
            cfg.validate(),
            Err(ScriptgateError::DuplicateTask(ref n)) if n == "apple"
        ));

        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.engine.tick_interval_ms = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn set_and_get_preserve_the_task_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_sample(&dir);

        set_value_string_at_path(&path, "engine.unlock_all", "true").unwrap();
        set_value_string_at_path(&path, "engine.tick_interval_ms", "250").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "engine.unlock_all")
                .unwrap()
                .as_deref(),
            Some("true")
        );
        assert_eq!(
            get_value_string_at_path(&path, "tasks.1.privilege")
                .unwrap()
                .as_deref(),
            Some("sudo-as-invoker")
        );

        let cfg = load(&ConfigPaths {
            config_file: path.clone(),
        })
        .unwrap();
        assert!(cfg.engine.unlock_all);
        assert_eq!(cfg.engine.tick_interval_ms, 250);
        assert_eq!(cfg.tasks.len(), 3);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("script = \"/scripts/run_as_root.sh\""));
    }

    #[test]
    fn set_rejects_unknown_keys_and_bad_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        assert!(set_value_string_at_path(&path, "engine.colour", "red").is_err());
        assert!(set_value_string_at_path(&path, "engine.unlock_all", "yes").is_err());
        assert!(set_value_string_at_path(&path, "engine.tick_interval_ms", "5").is_err());
        assert!(!path.exists());

        set_value_string_at_path(&path, "hints.default", "Ask ops.").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "hints.default")
                .unwrap()
                .as_deref(),
            Some("Ask ops.")
        );
    }

    #[test]
    fn expands_env_vars_in_paths() {
        let home = home_dir().unwrap_or_else(|| PathBuf::from("/"));
        let expanded = expand_path("~/scripts/a.sh").unwrap();
        assert_eq!(expanded, home.join("scripts/a.sh"));
        assert_eq!(expand_env_vars("/x/$SCRIPTGATE_UNSET_VAR/y"), "/x/$SCRIPTGATE_UNSET_VAR/y");
    }

    #[test]
    fn env_var_braces_must_pair() {
        let Ok(home) = std::env::var("HOME") else {
            return;
        };
        assert_eq!(expand_env_vars("${HOME}/x"), format!("{home}/x"));
        assert_eq!(expand_env_vars("$HOME/x"), format!("{home}/x"));
        // a stray closing brace is kept as text
        assert_eq!(expand_env_vars("$HOME}/x"), format!("{home}}}/x"));
        // an unclosed opening brace is not a reference at all
        assert_eq!(expand_env_vars("${HOME/x"), "${HOME/x");
    }
}
