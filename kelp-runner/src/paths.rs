use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const STATE_DIR: &str = ".kelp";
pub const CONTROL_SOCKET: &str = "kelp.sock";

/// Per-workspace state directory, next to the config file.
pub fn state_dir(workspace: &Path) -> PathBuf {
    workspace.join(STATE_DIR)
}

pub fn socket_path(workspace: &Path) -> PathBuf {
    state_dir(workspace).join(CONTROL_SOCKET)
}

/// Workspace root for a config file: its parent directory.
pub fn workspace_of(config_file: &Path) -> PathBuf {
    match config_file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
