//! Validation errors raised by the shared value objects

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Latitude/longitude out of range or not representable as a cell
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("invalid geo-cell: {0}")]
    InvalidGeoCell(String),

    /// Negative amounts, out-of-range surge or a blank currency
    #[error("invalid fare: {0}")]
    InvalidFare(String),
}

impl Error {
    /// The message without the error-kind prefix
    pub fn detail(&self) -> &str {
        match self {
            Error::InvalidCoordinate(msg) | Error::InvalidGeoCell(msg) | Error::InvalidFare(msg) => msg,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
