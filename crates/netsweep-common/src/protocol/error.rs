use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetsweepError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Wire format error: {0}")]
    Wire(String),

    #[error("Invalid message code {0}")]
    InvalidCode(u32),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid IP range: {0}")]
    InvalidIpRange(String),

    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("Invalid time interval: {0}")]
    InvalidInterval(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::net::AddrParseError> for NetsweepError {
    fn from(err: std::net::AddrParseError) -> Self {
        NetsweepError::InvalidIpRange(err.to_string())
    }
}

impl From<std::num::ParseIntError> for NetsweepError {
    fn from(err: std::num::ParseIntError) -> Self {
        NetsweepError::Wire(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetsweepError>;
