use std::path::{Path, PathBuf};

/// Environment variable forcing container data placement.
const CONTAINER_ENV: &str = "DROPS_MINER_DOCKER";
/// Sentinel file present inside container images.
const CONTAINER_SENTINEL: &str = "/.dockerenv";
/// Container data mount point.
const CONTAINER_DATA_DIR: &str = "/app/data";

/// Resolve the data directory for persistent state.
///
/// Containers get the fixed `/app/data` mount; everywhere else the data
/// lives next to the working directory.
pub fn data_dir() -> PathBuf {
    if is_container() {
        PathBuf::from(CONTAINER_DATA_DIR)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("data")
    }
}

fn is_container() -> bool {
    matches!(std::env::var(CONTAINER_ENV).as_deref(), Ok("1") | Ok("true"))
        || Path::new(CONTAINER_SENTINEL).exists()
}

pub fn cookies_path(data_dir: &Path) -> PathBuf {
    data_dir.join("cookies.jar")
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("cache")
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Control surface port, from `PORT` with a default of 8080.
pub fn control_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(8080)
}

/// Create the data directory layout if missing.
pub fn ensure_layout(data_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(cache_dir(data_dir))?;
    std::fs::create_dir_all(logs_dir(data_dir))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let base = PathBuf::from("/tmp/miner-data");
        assert_eq!(cookies_path(&base), PathBuf::from("/tmp/miner-data/cookies.jar"));
        assert_eq!(settings_path(&base), PathBuf::from("/tmp/miner-data/settings.json"));
        assert_eq!(cache_dir(&base), PathBuf::from("/tmp/miner-data/cache"));
        assert_eq!(logs_dir(&base), PathBuf::from("/tmp/miner-data/logs"));
    }

    #[test]
    fn test_ensure_layout_creates_directories() {
        let base = std::env::temp_dir().join(format!("dm-paths-{}", std::process::id()));
        ensure_layout(&base).unwrap();
        assert!(base.is_dir());
        assert!(cache_dir(&base).is_dir());
        assert!(logs_dir(&base).is_dir());
        std::fs::remove_dir_all(&base).ok();
    }
}
