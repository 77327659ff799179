//! Clients for the external collaborators
//!
//! Each capability is a protocol-agnostic trait with a static implementation
//! for development and tests, and an HTTP implementation behind the `client`
//! feature.

pub mod location;
pub mod profile;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Bound an external call by `limit`; elapsed calls become `ClientError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ClientError>(1)
        };
        let result = with_timeout(Duration::from_millis(800), slow).await;
        assert_matches!(result, Err(ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, ClientError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
