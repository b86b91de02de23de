use std::path::PathBuf;

/// Base directory for all hub data (`~/.dronehub`).
///
/// Overridable with `DRONEHUB_DATA_DIR` for tests and multi-instance setups.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DRONEHUB_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".dronehub")
}

/// Path of the registry snapshot file.
#[must_use]
pub fn registry_snapshot_path() -> PathBuf {
    data_dir().join("registry.json")
}

/// Path of the main configuration file.
#[must_use]
pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Directory for rotated daemon log files.
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lives_under_data_dir() {
        assert!(registry_snapshot_path().starts_with(data_dir()));
        assert!(config_path().starts_with(data_dir()));
    }
}
