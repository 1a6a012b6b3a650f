//! Policy validator: decides whether a directory and a command may run.
//!
//! Containment is checked on canonical paths (symlinks and `..`
//! resolved) and compared component-wise, so `/tmp-evil` is never
//! considered to be under `/tmp`. The only I/O performed is the stat
//! work done by canonicalization.

use std::path::{Path, PathBuf};

use crate::config::SandboxConfig;
use crate::error::RunnerError;

/// Immutable execution policy built once at startup.
#[derive(Debug, Clone)]
pub struct Policy {
    allowed_root: PathBuf,
    allowed_executables: Vec<String>,
}

impl Policy {
    /// Builds the policy, canonicalizing the allowed root.
    pub fn new(allowed_root: &Path, allowed_executables: &[String]) -> anyhow::Result<Self> {
        let allowed_root = std::fs::canonicalize(allowed_root).map_err(|e| {
            anyhow::anyhow!("allowed root {} is not usable: {e}", allowed_root.display())
        })?;
        let allowed_executables = allowed_executables
            .iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect();

        Ok(Self {
            allowed_root,
            allowed_executables,
        })
    }

    pub fn from_config(config: &SandboxConfig) -> anyhow::Result<Self> {
        Self::new(&config.allowed_root, &config.allowed_executables)
    }

    pub fn allowed_root(&self) -> &Path {
        &self.allowed_root
    }

    /// Resolves `target` and checks it lies at or below the allowed root.
    /// Returns the canonical path on success.
    pub fn check_directory(&self, target: &Path) -> Result<PathBuf, RunnerError> {
        if !target.is_absolute() {
            return Err(RunnerError::invalid_input(
                "target directory must be an absolute path",
            ));
        }
        let resolved = std::fs::canonicalize(target).map_err(|_| {
            RunnerError::invalid_input("invalid or inaccessible target directory")
        })?;
        if !resolved.starts_with(&self.allowed_root) {
            return Err(RunnerError::invalid_input(
                "target directory must be under the allowed root",
            ));
        }
        Ok(resolved)
    }

    /// Checks the command is non-empty and its executable is allowlisted.
    pub fn check_command(&self, command: &[String]) -> Result<(), RunnerError> {
        let Some(program) = command.first() else {
            return Err(RunnerError::invalid_input("command cannot be empty"));
        };
        let exe = executable_name(program);
        let allowed = !exe.is_empty()
            && self
                .allowed_executables
                .iter()
                .any(|prefix| exe == *prefix || exe.starts_with(prefix.as_str()));
        if !allowed {
            return Err(RunnerError::invalid_input(
                "command executable not in allowlist",
            ));
        }
        Ok(())
    }

    /// Full decision: directory first, then command.
    pub fn validate(&self, target: &Path, command: &[String]) -> Result<PathBuf, RunnerError> {
        let resolved = self.check_directory(target)?;
        self.check_command(command)?;
        Ok(resolved)
    }
}

/// Lowercased base name of a program path (`/usr/bin/Python3` -> `python3`).
fn executable_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_for(root: &Path) -> Policy {
        let allow: Vec<String> = ["pytest", "npm", "cargo", "go", "python", "node"]
            .into_iter()
            .map(String::from)
            .collect();
        Policy::new(root, &allow).unwrap()
    }

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    // ── Containment ─────────────────────────────────────

    #[test]
    fn test_root_itself_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let resolved = policy.check_directory(dir.path()).unwrap();
        assert_eq!(resolved, policy.allowed_root());
    }

    #[test]
    fn test_descendant_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project").join("src");
        std::fs::create_dir_all(&project).unwrap();
        let policy = policy_for(dir.path());
        assert!(policy.check_directory(&project).is_ok());
    }

    #[test]
    fn test_shared_prefix_sibling_is_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("work");
        let evil = parent.path().join("work-evil");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&evil).unwrap();

        let policy = policy_for(&root);
        let err = policy.check_directory(&evil).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidInput(_)));
    }

    #[test]
    fn test_dotdot_escape_is_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("work");
        std::fs::create_dir_all(&root).unwrap();

        let policy = policy_for(&root);
        let escape = root.join("..");
        assert!(matches!(
            policy.check_directory(&escape),
            Err(RunnerError::InvalidInput(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("work");
        let outside = parent.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();

        let policy = policy_for(&root);
        assert!(policy.check_directory(&root.join("link")).is_err());
    }

    #[test]
    fn test_missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let err = policy
            .check_directory(&dir.path().join("does-not-exist"))
            .unwrap_err();
        assert!(err.to_string().contains("inaccessible"));
    }

    #[test]
    fn test_relative_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert!(policy.check_directory(Path::new("relative/dir")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_etc_outside_tmp_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert!(policy.check_directory(Path::new("/etc")).is_err());
    }

    // ── Allowlist ───────────────────────────────────────

    #[test]
    fn test_exact_and_prefixed_names_are_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        for exe in ["pytest", "python", "python3", "node", "npm", "cargo", "go", "gofmt"] {
            assert!(policy.check_command(&cmd(&[exe])).is_ok(), "{exe}");
        }
    }

    #[test]
    fn test_directory_component_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert!(policy
            .check_command(&cmd(&["/usr/bin/python3", "-c", "pass"]))
            .is_ok());
        assert!(policy.check_command(&cmd(&["/opt/python/bin/rm"])).is_err());
    }

    #[test]
    fn test_match_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert!(policy.check_command(&cmd(&["PyTest"])).is_ok());
    }

    #[test]
    fn test_disallowed_executables_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        for exe in ["rm", "sh", "bash", "curl", "xpython", "/bin/rm"] {
            let err = policy.check_command(&cmd(&[exe, "-rf", "/"])).unwrap_err();
            assert!(matches!(err, RunnerError::InvalidInput(_)), "{exe}");
        }
    }

    #[test]
    fn test_empty_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let err = policy.check_command(&[]).unwrap_err();
        assert_eq!(err.to_string(), "command cannot be empty");
    }

    #[test]
    fn test_empty_program_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        assert!(policy.check_command(&cmd(&[""])).is_err());
    }

    #[test]
    fn test_validate_checks_directory_before_command() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy_for(dir.path());
        let err = policy
            .validate(&dir.path().join("missing"), &cmd(&["rm"]))
            .unwrap_err();
        assert!(err.to_string().contains("target directory"));
    }

    #[test]
    fn test_policy_requires_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let result = Policy::new(&dir.path().join("nope"), &[]);
        assert!(result.is_err());
    }
}
