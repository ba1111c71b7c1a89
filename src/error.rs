use thiserror::Error;

#[derive(Debug, Error)]
pub enum FecError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("source packet too large for coded payload budget: {len} > {max}")]
    OversizedSrc { len: usize, max: usize },
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("pollution threshold exceeded")]
    Pollution,
}

pub type Result<T> = std::result::Result<T, FecError>;
