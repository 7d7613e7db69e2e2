// ABOUTME: Where the bot keeps its config file, room store and logs
// ABOUTME: XDG directories with working-directory fallbacks, plus room store path resolution

use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "boardbot";
const APPLICATION: &str = "boardbot";

/// Default room store file name, relative to the working directory
pub const ROOM_STORE_FILE: &str = "bot_data.json";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Data directory (e.g., ~/.local/share/boardbot/), ./data as fallback
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// e.g., ~/.local/share/boardbot/logs/
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// e.g., ~/.config/boardbot/config.toml
pub fn config_file() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

/// Resolve the configured room store location.
///
/// A leading `~/` means the home directory. A blank setting falls back to
/// `bot_data.json` in the data directory.
pub fn room_store_file(configured: &str) -> PathBuf {
    let configured = configured.trim();
    if configured.is_empty() {
        return data_dir().join(ROOM_STORE_FILE);
    }
    if let Some(stripped) = configured.strip_prefix("~/") {
        match BaseDirs::new() {
            Some(base) => return base.home_dir().join(stripped),
            None => tracing::warn!(
                path = %configured,
                "Could not determine home directory, using room store path as written"
            ),
        }
    }
    PathBuf::from(configured)
}
