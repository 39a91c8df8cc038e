#![forbid(unsafe_code)]

use std::path::Path;

use crate::task::model::{PrivilegeMode, TaskDefinition};

/// Argument vector used to launch a task's script.
#[must_use]
pub fn build_command(task: &TaskDefinition) -> Vec<String> {
    command_for(task.privilege, &task.executable_path)
}

#[must_use]
pub fn command_for(privilege: PrivilegeMode, path: &Path) -> Vec<String> {
    let script = path.to_string_lossy().into_owned();
    let mut argv: Vec<String> = match privilege {
        PrivilegeMode::Normal => Vec::new(),
        PrivilegeMode::SudoAsInvoker => vec!["sudo".to_owned()],
        PrivilegeMode::SudoAsRoot => vec!["sudo".to_owned(), "-u".to_owned(), "root".to_owned()],
    };
    argv.push("bash".to_owned());
    argv.push(script);
    argv
}

/// Shell-style rendering for display only.
#[must_use]
pub fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty() || a.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
                format!("'{}'", a.replace('\'', r"'\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(privilege: PrivilegeMode) -> Vec<String> {
        command_for(privilege, Path::new("/x.sh"))
    }

    #[test]
    fn maps_every_privilege_mode() {
        assert_eq!(argv(PrivilegeMode::Normal), ["bash", "/x.sh"]);
        assert_eq!(argv(PrivilegeMode::SudoAsInvoker), ["sudo", "bash", "/x.sh"]);
        assert_eq!(
            argv(PrivilegeMode::SudoAsRoot),
            ["sudo", "-u", "root", "bash", "/x.sh"]
        );
    }

    #[test]
    fn display_quotes_paths_with_spaces() {
        let argv = command_for(PrivilegeMode::SudoAsInvoker, Path::new("/opt/my scripts/a.sh"));
        assert_eq!(display_command(&argv), "sudo bash '/opt/my scripts/a.sh'");
    }
}
