/// Canonical file paths for the daemon's data files.
///
/// Both files live under the daemon home directory:
///   - config.toml  Written by the operator, read by the daemon.
///   - status.toml  Written by the daemon, read by the web front end.
use std::path::PathBuf;

/// Overrides the home directory when set.
pub const HOME_ENV_VAR: &str = "CAPTURE_DAEMON_HOME";
const DEFAULT_HOME_DIR: &str = ".capture-daemon";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the daemon home directory: `$CAPTURE_DAEMON_HOME`, else `./.capture-daemon`.
pub fn app_data_dir() -> PathBuf {
    std::env::var_os(HOME_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME_DIR))
}

/// Returns the full path to the config file.
pub fn config_file_path() -> PathBuf {
    app_data_dir().join(CONFIG_FILE_NAME)
}

/// Returns the full path to the status file.
pub fn status_file_path() -> PathBuf {
    app_data_dir().join(STATUS_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_path_has_correct_name() {
        let path = config_file_path();
        assert_eq!(path.file_name().unwrap(), CONFIG_FILE_NAME);
    }

    #[test]
    fn status_file_path_has_correct_name() {
        let path = status_file_path();
        assert_eq!(path.file_name().unwrap(), STATUS_FILE_NAME);
    }

    #[test]
    fn config_and_status_share_same_parent_dir() {
        let config = config_file_path();
        let status = status_file_path();
        assert_eq!(config.parent(), status.parent());
    }
}
