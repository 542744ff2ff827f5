use crate::error::AppError;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Runtime configuration, resolved once at startup. Per-request parameters
/// (format selectors, bitrates) never travel through the environment; they
/// are passed explicitly in each download request.
#[derive(Clone, Debug)]
pub struct Config {
    pub download_dir: PathBuf,
    pub history_db: PathBuf,
    pub max_artifact_bytes: u64,
    pub max_height: u32,
    pub audio_bitrate_ladder: Vec<u32>,
    pub socket_timeout: Duration,
    pub retries: u32,
    pub cleanup_after_send: bool,
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = PathBuf::from("downloads");
        Self {
            history_db: download_dir.join("history.json"),
            download_dir,
            max_artifact_bytes: 1900 * 1024 * 1024,
            max_height: 720,
            audio_bitrate_ladder: vec![192, 128, 64],
            socket_timeout: Duration::from_secs(30),
            retries: 3,
            cleanup_after_send: true,
            history_limit: 20,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Config::default();
        if let Some(dir) = env::var("DOWNLOAD_DIR").ok().filter(|v| !v.is_empty()) {
            config.download_dir = PathBuf::from(dir);
            config.history_db = config.download_dir.join("history.json");
        }
        if let Some(db) = env::var("HISTORY_DB").ok().filter(|v| !v.is_empty()) {
            config.history_db = PathBuf::from(db);
        }
        if let Some(mb) = parse_env::<u64>("MAX_FILE_MB")? {
            config.max_artifact_bytes = mb * 1024 * 1024;
        }
        if let Some(height) = parse_env::<u32>("MAX_HEIGHT")? {
            config.max_height = height;
        }
        if let Some(ladder) = env::var("AUDIO_BITRATE_LADDER").ok().filter(|v| !v.is_empty()) {
            config.audio_bitrate_ladder = parse_ladder(&ladder)?;
        }
        if let Some(secs) = parse_env::<u64>("SOCKET_TIMEOUT")? {
            config.socket_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parse_env::<u32>("DOWNLOAD_RETRIES")? {
            config.retries = retries;
        }
        if let Some(flag) = env::var("CLEANUP_AFTER_SEND").ok().filter(|v| !v.is_empty()) {
            config.cleanup_after_send = parse_bool(&flag);
        }
        if let Some(limit) = parse_env::<usize>("HISTORY_LIMIT")? {
            config.history_limit = limit.max(1);
        }
        Ok(config)
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, AppError> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{key}={value}"))),
        _ => Ok(None),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

/// Comma-separated descending kbps list, e.g. "192,128,64".
fn parse_ladder(value: &str) -> Result<Vec<u32>, AppError> {
    let ladder: Vec<u32> = value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| AppError::Config(format!("AUDIO_BITRATE_LADDER={value}")))
        })
        .collect::<Result<_, _>>()?;
    if ladder.is_empty() || ladder.windows(2).any(|pair| pair[0] <= pair[1]) {
        return Err(AppError::Config(format!(
            "AUDIO_BITRATE_LADDER must be strictly descending: {value}"
        )));
    }
    Ok(ladder)
}
