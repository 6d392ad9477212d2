use crate::error::{Result, WatchdogError};
use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "watchdog";
pub const APP_NAME: &str = "watchdog";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("WATCHDOG_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| WatchdogError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}

pub fn baseline_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("baseline.json"))
}

pub fn keys_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("keys"))
}

pub fn exports_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("exports"))
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}
