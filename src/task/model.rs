#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ScriptgateError;

pub const DEFAULT_HINT: &str =
    "Verify the script exists, is executable, and works from a terminal.";

/// How a script is elevated when it is launched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PrivilegeMode {
    #[default]
    Normal,
    #[serde(alias = "sudo")]
    SudoAsInvoker,
    #[serde(alias = "root")]
    SudoAsRoot,
}

impl PrivilegeMode {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            PrivilegeMode::Normal => "normal",
            PrivilegeMode::SudoAsInvoker => "sudo",
            PrivilegeMode::SudoAsRoot => "root",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskDefinition {
    pub index: usize,
    pub name: String,
    pub executable_path: PathBuf,
    pub privilege: PrivilegeMode,
    pub description: String,
    pub troubleshooting_hint: Option<String>,
}

/// Ordered, immutable list of tasks. Position in the list is the task's
/// index and defines the default gating order.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCatalog {
    tasks: Vec<TaskDefinition>,
    default_hint: String,
}

/// A task as declared by configuration, before it is assigned an index.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub executable_path: PathBuf,
    pub privilege: PrivilegeMode,
    pub description: String,
    pub troubleshooting_hint: Option<String>,
}

impl TaskCatalog {
    pub fn new(
        specs: impl IntoIterator<Item = TaskSpec>,
        default_hint: impl Into<String>,
    ) -> Result<Self, ScriptgateError> {
        let mut seen = BTreeSet::new();
        let mut tasks = Vec::new();
        for (index, spec) in specs.into_iter().enumerate() {
            if !seen.insert(spec.name.clone()) {
                return Err(ScriptgateError::DuplicateTask(spec.name));
            }
            tasks.push(TaskDefinition {
                index,
                name: spec.name,
                executable_path: spec.executable_path,
                privilege: spec.privilege,
                description: spec.description,
                troubleshooting_hint: spec.troubleshooting_hint.filter(|h| !h.trim().is_empty()),
            });
        }
        if tasks.is_empty() {
            return Err(ScriptgateError::EmptyCatalog);
        }

        let default_hint = default_hint.into();
        let default_hint = if default_hint.trim().is_empty() {
            DEFAULT_HINT.to_owned()
        } else {
            default_hint
        };
        Ok(Self {
            tasks,
            default_hint,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TaskDefinition> {
        self.tasks.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskDefinition> {
        self.tasks.iter()
    }

    /// Troubleshooting text for a task, falling back to the catalog default.
    #[must_use]
    pub fn hint_for(&self, index: usize) -> &str {
        self.tasks
            .get(index)
            .and_then(|t| t.troubleshooting_hint.as_deref())
            .unwrap_or(&self.default_hint)
    }
}

impl<'a> IntoIterator for &'a TaskCatalog {
    type Item = &'a TaskDefinition;
    type IntoIter = std::slice::Iter<'a, TaskDefinition>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

#[cfg(test)]
pub(crate) fn spec(name: &str, path: &str, privilege: PrivilegeMode) -> TaskSpec {
    TaskSpec {
        name: name.to_owned(),
        executable_path: PathBuf::from(path),
        privilege,
        description: format!("Runs {name} script"),
        troubleshooting_hint: None,
    }
}
