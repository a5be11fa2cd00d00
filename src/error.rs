use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unknown device type '{device_type}' for device '{device}'")]
    UnknownDeviceType { device: String, device_type: String },
    #[error("Time-series store is not verified; check credentials and reachability")]
    StoreUnverified,
    #[error("{task} did not finish within {secs}s")]
    DeadlineExceeded { task: &'static str, secs: u64 },
    #[error("Device error: {0}")]
    Device(String),
    #[error("DB error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
