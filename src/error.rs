use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Teloxide request error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("extractor failed: {0}")]
    Extraction(String),

    #[error("network error: {0}")]
    NetworkTransient(String),

    #[error("postprocessing failed: {0}")]
    Postprocess(String),

    #[error("no {0} stream available for this source")]
    NoFormatAvailable(&'static str),

    #[error("smallest quality is still {size} bytes (budget {budget})")]
    SizeExceeded { size: u64, budget: u64 },

    #[error("a download is already in progress")]
    AlreadyActive,

    #[error("cancelled")]
    Cancelled,

    #[error("Missing yt-dlp output: {0}")]
    MissingOutput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for errors worth retrying at the same quality tier.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::NetworkTransient(_))
    }
}
