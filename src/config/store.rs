use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::schema::AppConfig;
use crate::error::{AppError, Result};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "PHONECAM_CONFIG";

/// Resolve the configuration file path: explicit path, then `PHONECAM_CONFIG`
pub fn config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

/// Load configuration from a TOML file.
///
/// A missing file yields the defaults; a malformed one is an error.
pub fn load(path: &Path) -> Result<AppConfig> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No configuration at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        Err(e) => return Err(e.into()),
    };

    let config = parse(&text)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Parse and validate configuration text
pub fn parse(text: &str) -> Result<AppConfig> {
    let config: AppConfig =
        toml::from_str(text).map_err(|e| AppError::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

/// Check values that deserialize fine but cannot work
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.video.frame_slots < 2 {
        return Err(AppError::Config(format!(
            "video.frame_slots must be at least 2 (got {})",
            config.video.frame_slots
        )));
    }
    if config.video.buffer_limit >= config.video.frame_slots {
        return Err(AppError::Config(format!(
            "video.buffer_limit ({}) must be below video.frame_slots ({})",
            config.video.buffer_limit, config.video.frame_slots
        )));
    }
    if config.connection.port == 0 {
        return Err(AppError::Config("connection.port must not be 0".into()));
    }
    if config.video.codec.is_empty() || config.video.codec.contains(['/', ' ']) {
        return Err(AppError::Config(format!(
            "video.codec '{}' is not a valid codec name",
            config.video.codec
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionMode;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse(
            r#"
            [connection]
            mode = "adb"
            port = 4748

            [video]
            buffer_limit = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.mode, ConnectionMode::Adb);
        assert_eq!(config.connection.port, 4748);
        assert_eq!(config.connection.connect_timeout_ms, 2000);
        assert_eq!(config.video.buffer_limit, 1);
        assert_eq!(config.video.frame_slots, 3);
        assert_eq!(config.video.codec, "jpg");
        assert!(!config.audio.enabled);
    }

    #[test]
    fn test_buffer_limit_must_leave_a_free_slot() {
        let err = parse("[video]\nframe_slots = 3\nbuffer_limit = 3\n").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[video\nenabled = yes").unwrap();

        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
