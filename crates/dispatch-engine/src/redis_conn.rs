//! Shared Redis connection setup

use config::RedisConfig;
use redis::aio::ConnectionManager;
use tracing::info;

/// Open a managed connection; clones share the underlying multiplexed link
pub async fn connect(config: &RedisConfig) -> redis::RedisResult<ConnectionManager> {
    info!(host = %config.host, port = config.port, db = config.db_index, "Connecting to Redis");

    let client = redis::Client::open(config.connection_url())?;
    client.get_connection_manager().await
}
