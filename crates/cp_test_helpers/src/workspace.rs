//! Temporary ClassPoints workspaces

use assert_fs::TempDir;
use std::fs;

/// Cleaned up when dropped
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Temp directory containing an empty `.classpoints` directory
///
/// ```rust
/// use cp_test_helpers::workspace::init_workspace;
///
/// let workspace = init_workspace();
/// assert!(workspace.path().join(".classpoints").exists());
/// ```
pub fn init_workspace() -> TempDir {
    let temp = temp_dir();
    fs::create_dir_all(temp.path().join(".classpoints"))
        .expect("Failed to create .classpoints directory");
    temp
}

/// Workspace whose `.classpoints/config.toml` holds `config`
pub fn workspace_with_config(config: &str) -> TempDir {
    let workspace = init_workspace();
    fs::write(workspace.path().join(".classpoints").join("config.toml"), config)
        .expect("Failed to write config.toml");
    workspace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_with_config() {
        let workspace = workspace_with_config("[sync]\ndedup_window_ms = 100\n");
        let written = fs::read_to_string(workspace.path().join(".classpoints/config.toml")).unwrap();
        assert!(written.contains("dedup_window_ms"));
    }
}
