//! Snapshot copier.
//!
//! Copies all user tables from source to destination at a named
//! snapshot, in parallel. Each worker holds one source transaction
//! importing the snapshot, so every table read observes the same
//! point-in-time state regardless of scheduling.

pub mod progress;
pub mod table;

use std::collections::VecDeque;
use std::sync::Arc;

use futures::{pin_mut, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::connect;
use crate::pool::Pool;

use super::copy_statement::CopyStatement;
use super::Error;
use progress::CopyProgress;
pub use table::{CopyResult, TableInfo};

pub struct Copier {
    source: tokio_postgres::Config,
    destination: Pool,
    workers: usize,
    cancel: CancellationToken,
}

impl Copier {
    pub fn new(
        source: tokio_postgres::Config,
        destination: Pool,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            destination,
            workers: workers.max(1),
            cancel,
        }
    }

    /// Table inventory from the source, in scheduling order.
    pub async fn list_tables(&self) -> Result<Vec<TableInfo>, Error> {
        let client = connect(&self.source)
            .await
            .map_err(Error::SourceUnreachable)?;

        TableInfo::load(&client).await
    }

    /// Open the worker transactions and import the snapshot.
    ///
    /// Must run while the exported snapshot is still valid, i.e.
    /// before the replication stream starts.
    pub async fn begin(&self, snapshot: &str) -> Result<CopySession, Error> {
        let mut workers = vec![];

        for _ in 0..self.workers {
            let client = connect(&self.source)
                .await
                .map_err(Error::SourceUnreachable)?;

            client
                .simple_query("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
                .await
                .map_err(Error::SourceUnreachable)?;

            if !snapshot.is_empty() {
                client
                    .simple_query(&format!(
                        "SET TRANSACTION SNAPSHOT '{}'",
                        snapshot.replace('\'', "''")
                    ))
                    .await
                    .map_err(Error::SourceUnreachable)?;
            }

            workers.push(client);
        }

        Ok(CopySession {
            workers,
            destination: self.destination.clone(),
            cancel: self.cancel.clone(),
        })
    }
}

/// Worker transactions holding the snapshot open.
pub struct CopySession {
    workers: Vec<Client>,
    destination: Pool,
    cancel: CancellationToken,
}

impl CopySession {
    /// Copy all tables across the worker pool. A failing table does
    /// not cancel its siblings; every table gets a result.
    pub async fn copy_all(self, tables: Vec<TableInfo>) -> Result<Vec<CopyResult>, Error> {
        let total = tables.len();
        let queue = Arc::new(Mutex::new(tables.into_iter().collect::<VecDeque<_>>()));
        let (results_tx, mut results_rx) = mpsc::channel(total.max(1));

        let mut handles = vec![];

        for (number, source) in self.workers.into_iter().enumerate() {
            let queue = queue.clone();
            let destination = self.destination.clone();
            let results = results_tx.clone();
            let cancel = self.cancel.clone();

            handles.push(spawn(async move {
                worker(number, source, destination, queue, results, cancel).await
            }));
        }

        drop(results_tx);

        let mut results = vec![];
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }

        for handle in handles {
            handle.await.map_err(|e| {
                Error::MalformedMessage(format!("copy worker panicked: {}", e))
            })??;
        }

        if self.cancel.is_cancelled() && results.len() < total {
            return Err(Error::Cancelled);
        }

        Ok(results)
    }
}

async fn worker(
    number: usize,
    source: Client,
    destination: Pool,
    queue: Arc<Mutex<VecDeque<TableInfo>>>,
    results: mpsc::Sender<CopyResult>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let Some(table) = queue.lock().pop_front() else {
            break;
        };

        info!(
            "copying table {} ({} rows estimated) [worker: {}]",
            table.qualified(),
            table.rows.max(0),
            number
        );

        let outcome = copy_table(&source, &destination, &table, &cancel).await;

        let (rows, error) = match outcome {
            Ok(rows) => (rows, None),
            Err(err) => (0, Some(err)),
        };

        let failed = error.is_some();
        let _ = results
            .send(CopyResult {
                table,
                rows,
                error,
            })
            .await;

        // A source-side failure aborts the worker's snapshot
        // transaction; no more tables can be read on it.
        if failed && source.simple_query("SELECT 1").await.is_err() {
            warn!("copy worker {} lost its snapshot transaction", number);
            break;
        }
    }

    let _ = source.simple_query("COMMIT").await;

    Ok(())
}

async fn copy_table(
    source: &Client,
    destination: &Pool,
    table: &TableInfo,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let copy_row = |source: tokio_postgres::Error| Error::CopyRow {
        schema: table.schema.clone(),
        name: table.name.clone(),
        source,
    };

    let statement = CopyStatement::new(&table.schema, &table.name);

    let reader = source
        .copy_out(&statement.copy_out())
        .await
        .map_err(copy_row)?;

    let writer = destination.get().await.map_err(Error::DestUnreachable)?;
    let sink = writer
        .copy_in::<_, bytes::Bytes>(&statement.copy_in())
        .await
        .map_err(copy_row)?;

    pin_mut!(reader);
    pin_mut!(sink);

    let progress = CopyProgress::new(table);
    let mut bytes = 0;

    while let Some(chunk) = reader.next().await {
        let chunk = chunk.map_err(copy_row)?;
        bytes += chunk.len();

        sink.as_mut().send(chunk).await.map_err(copy_row)?;
        progress.update(bytes);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
    }

    let rows = sink.finish().await.map_err(copy_row)?;
    progress.done();

    info!(
        "copied {} rows into {} ({})",
        rows,
        table.qualified(),
        crate::util::format_bytes(bytes as u64),
    );

    Ok(rows)
}
