use thiserror::Error;

pub type DonorflowResult<T> = Result<T, DonorflowError>;

#[derive(Error, Debug)]
pub enum DonorflowError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for DonorflowError {
    fn from(err: config::ConfigError) -> Self {
        DonorflowError::Config(err.to_string())
    }
}
