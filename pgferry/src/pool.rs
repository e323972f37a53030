//! Minimal connection pool.
//!
//! Checked-out connections return to the pool on drop. Closed
//! connections are discarded and replaced lazily.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_postgres::Client;

use crate::connection::connect;

#[derive(Debug)]
struct Inner {
    config: tokio_postgres::Config,
    idle_tx: mpsc::Sender<Client>,
    permits: Semaphore,
}

/// Fixed-size pool of regular (non-replication) connections.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<Inner>,
    idle_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Client>>>,
}

impl Pool {
    pub fn new(config: tokio_postgres::Config, size: usize) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(size.max(1));

        Self {
            inner: Arc::new(Inner {
                config,
                idle_tx,
                permits: Semaphore::new(size.max(1)),
            }),
            idle_rx: Arc::new(tokio::sync::Mutex::new(idle_rx)),
        }
    }

    /// Check out a connection, opening one if the pool isn't
    /// at capacity yet.
    pub async fn get(&self) -> Result<PooledConn, tokio_postgres::Error> {
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .expect("pool semaphore closed");
        permit.forget();

        let client = {
            let mut idle = self.idle_rx.lock().await;
            idle.try_recv().ok()
        };

        let client = match client {
            Some(client) if !client.is_closed() => client,
            _ => match connect(&self.inner.config).await {
                Ok(client) => client,
                Err(err) => {
                    self.inner.permits.add_permits(1);
                    return Err(err);
                }
            },
        };

        Ok(PooledConn {
            client: Some(client),
            pool: self.inner.clone(),
        })
    }
}

pub struct PooledConn {
    client: Option<Client>,
    pool: Arc<Inner>,
}

impl Deref for PooledConn {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if !client.is_closed() {
                let _ = self.pool.idle_tx.try_send(client);
            }
        }
        self.pool.permits.add_permits(1);
    }
}
