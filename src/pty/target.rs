use std::path::{Path, PathBuf};

use tracing::info;

use crate::models::{SandboxId, TerminalMode};
use crate::platform::{ContainerPlatform, ShellCommand};

/// What a connection ends up running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellTarget {
    pub command: ShellCommand,
    pub cwd: Option<PathBuf>,
    pub in_container: bool,
}

/// Sandbox mode with an existing container gets a shell inside it; every
/// other case falls back to the host shell in `workdir`.
pub async fn select_target(
    platform: &dyn ContainerPlatform,
    mode: TerminalMode,
    container: Option<&SandboxId>,
    host_shell: &str,
    workdir: &Path,
) -> ShellTarget {
    if let (TerminalMode::Sandbox, Some(id)) = (mode, container) {
        if platform.exists(id).await {
            return ShellTarget {
                command: platform.shell_command(id),
                cwd: None,
                in_container: true,
            };
        }
        info!(sandbox = %id, "container not found, using host shell");
    }
    ShellTarget {
        command: ShellCommand::new(host_shell),
        cwd: Some(workdir.to_path_buf()),
        in_container: false,
    }
}

fn is_within(path: &Path, root: &Path) -> bool {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    if root.parent().is_none() {
        return path == root;
    }
    path.starts_with(&root)
}

/// First existing directory among `requested`, `$HOME` and the temp dir that
/// is not `code_dir` or below it.
pub fn safe_workdir(requested: Option<&Path>, code_dir: &Path) -> PathBuf {
    requested
        .map(Path::to_path_buf)
        .into_iter()
        .chain(dirs::home_dir())
        .chain(std::iter::once(std::env::temp_dir()))
        .find(|candidate| candidate.is_dir() && !is_within(candidate, code_dir))
        .unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workdir_inside_code_dir_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let code = tmp.path().join("code");
        let inside = code.join("public");
        std::fs::create_dir_all(&inside).unwrap();

        let chosen = safe_workdir(Some(&inside), &code);
        assert!(!is_within(&chosen, &code));
        let chosen = safe_workdir(Some(&code), &code);
        assert_ne!(chosen, code);
    }

    #[test]
    fn workdir_outside_code_dir_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let code = tmp.path().join("code");
        let home = tmp.path().join("home");
        std::fs::create_dir_all(&code).unwrap();
        std::fs::create_dir_all(&home).unwrap();
        assert_eq!(safe_workdir(Some(&home), &code), home);
    }

    #[test]
    fn missing_workdir_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let chosen = safe_workdir(Some(&tmp.path().join("absent")), &tmp.path().join("code"));
        assert!(chosen.is_dir());
    }

    #[test]
    fn filesystem_root_as_code_dir_only_blocks_root() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_within(tmp.path(), Path::new("/")));
        assert!(is_within(Path::new("/"), Path::new("/")));
    }
}
