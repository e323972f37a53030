//! Server connections.

use tokio_postgres::{config::ReplicationMode, Client, Config, NoTls};
use tracing::debug;

/// Connect and drive the connection on a background task.
pub async fn connect(config: &Config) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = config.connect(NoTls).await?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!("connection closed: {}", err);
        }
    });

    Ok(client)
}

/// Connect with the logical replication protocol enabled. The caller
/// owns this connection exclusively.
pub async fn connect_replication(config: &Config) -> Result<Client, tokio_postgres::Error> {
    let mut config = config.clone();
    config.replication_mode(ReplicationMode::Logical);
    connect(&config).await
}
