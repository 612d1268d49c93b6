// src/infra/paths.rs — XDG-compliant path management
//
// All paths respect the HANDOFF_HOME environment variable for isolation.
// When HANDOFF_HOME is set, config and data live under that directory.
// When unset, config uses ~/.handoff/ and data uses XDG_DATA_HOME/handoff.

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

/// Returns the HANDOFF_HOME override, if set.
fn handoff_home() -> Option<PathBuf> {
    std::env::var_os("HANDOFF_HOME").map(PathBuf::from)
}

/// Home directory, or the current directory when none can be determined.
pub fn dirs_home() -> PathBuf {
    BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Configuration directory: $HANDOFF_HOME/ or ~/.handoff/
pub fn config_dir() -> PathBuf {
    if let Some(home) = handoff_home() {
        return home;
    }
    dirs_home().join(".handoff")
}

/// Data directory: $HANDOFF_HOME/data/ or ~/.local/share/handoff/
pub fn data_dir() -> PathBuf {
    if let Some(home) = handoff_home() {
        return home.join("data");
    }
    ProjectDirs::from("", "", "handoff")
        .map(|d| d.data_local_dir().to_path_buf())
        .unwrap_or_else(|| config_dir().join("data"))
}

/// Per-session key material and job files
pub fn sessions_dir() -> PathBuf {
    data_dir().join("sessions")
}

/// Config file path
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Ensure all required directories exist
pub async fn ensure_dirs(work_dir: &std::path::Path) -> anyhow::Result<()> {
    for dir in [config_dir(), data_dir(), work_dir.to_path_buf()] {
        tokio::fs::create_dir_all(&dir).await?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(work_dir, std::fs::Permissions::from_mode(0o700)).await?;
    }

    Ok(())
}
