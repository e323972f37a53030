//! Replay applier.
//!
//! Applies decoded changes to the destination, preserving source
//! commit order and per-transaction atomicity while coalescing many
//! small source transactions into fewer destination commits.
//! Confirmed LSNs advance only after a durable destination commit.

pub mod statement;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::{pin_mut, SinkExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_postgres::types::{ToSql, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pool::PooledConn;

use super::copy_statement::CopyStatement;
use super::decoder::Confirm;
use super::message::{Change, ChangeKind, Message, MessageBody, Relation, Tuple};
use super::progress::Progress;
use super::sentinel::SentinelCoordinator;
use super::{Error, Lsn};

use statement::{CachedStatement, StatementKey, StatementOp};

/// Rows buffered per relation before an insert batch flushes.
pub(crate) const INSERT_BATCH_SIZE: usize = 1000;
/// Source transactions coalesced into one destination commit.
pub(crate) const COALESCE_TX_LIMIT: usize = 500;
/// Oldest a coalesced transaction may get before committing.
pub(crate) const COALESCE_MAX_WAIT: Duration = Duration::from_millis(50);
/// Batches up to this size use a multi-values INSERT; above it, COPY.
pub(crate) const COPY_THRESHOLD: usize = 5;

#[derive(Debug, Clone)]
struct RelationEntry {
    relation: Relation,
    /// Server-side cast per column, e.g. "int4".
    casts: Vec<String>,
}

#[derive(Debug)]
struct InsertBatch {
    relation: u32,
    rows: Vec<Tuple>,
}

pub struct Applier {
    client: PooledConn,
    origin: String,
    confirm: Confirm,
    sentinel: SentinelCoordinator,
    progress: Progress,

    relations: HashMap<u32, RelationEntry>,
    statements: HashMap<StatementKey, CachedStatement>,
    streaming_marked: HashSet<u32>,

    batch: Option<InsertBatch>,
    dest_tx_open: bool,
    source_tx_open: bool,
    coalesced: usize,
    first_begin: Option<Instant>,
    pending_commits: Vec<Lsn>,
    rows_since_commit: u64,
    bytes_since_commit: u64,
}

impl Applier {
    pub fn new(
        client: PooledConn,
        origin: &str,
        confirm: Confirm,
        sentinel: SentinelCoordinator,
        progress: Progress,
    ) -> Self {
        Self {
            client,
            origin: origin.to_owned(),
            confirm,
            sentinel,
            progress,
            relations: HashMap::new(),
            statements: HashMap::new(),
            streaming_marked: HashSet::new(),
            batch: None,
            dest_tx_open: false,
            source_tx_open: false,
            coalesced: 0,
            first_begin: None,
            pending_commits: vec![],
            rows_since_commit: 0,
            bytes_since_commit: 0,
        }
    }

    /// Consume the stream until it closes or the run is cancelled.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        self.setup_origin().await?;

        loop {
            let message = select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = self.finish().await {
                        warn!("final commit on cancellation failed: {}", err);
                        self.rollback().await;
                    }
                    return Err(Error::Cancelled);
                }

                message = input.recv() => message,
            };

            let Some(message) = message else {
                if let Err(err) = self.finish().await {
                    self.rollback().await;
                    return Err(err);
                }
                return Ok(());
            };

            let drained = input.is_empty();

            if let Err(err) = self.handle(message, drained).await {
                self.rollback().await;
                return Err(err);
            }
        }
    }

    /// Tag destination writes with our own origin so a peer streaming
    /// them back out can filter them.
    async fn setup_origin(&mut self) -> Result<(), Error> {
        if self.origin.is_empty() {
            return Ok(());
        }

        self.client
            .query(
                "SELECT COALESCE(pg_replication_origin_oid($1), pg_replication_origin_create($1))",
                &[&self.origin],
            )
            .await
            .map_err(Error::DestUnreachable)?;
        self.client
            .query("SELECT pg_replication_origin_session_setup($1)", &[&self.origin])
            .await
            .map_err(Error::DestUnreachable)?;

        debug!("destination session writes under origin \"{}\"", self.origin);

        Ok(())
    }

    async fn handle(&mut self, message: Message, drained: bool) -> Result<(), Error> {
        match message.body {
            MessageBody::Begin => {
                if !self.dest_tx_open {
                    self.begin().await?;
                }
                self.source_tx_open = true;
                self.coalesced += 1;
            }

            MessageBody::Change(change) => {
                if !self.source_tx_open {
                    warn!("change outside a transaction at {}, skipped", message.lsn);
                    return Ok(());
                }
                self.change(change).await?;
            }

            MessageBody::Relation(relation) => {
                self.flush_batch().await?;
                self.learn_relation(relation).await?;
            }

            MessageBody::Commit => {
                self.flush_batch().await?;
                self.source_tx_open = false;
                self.pending_commits.push(message.lsn);

                let age = self
                    .first_begin
                    .map(|begin| begin.elapsed())
                    .unwrap_or_default();

                if self.coalesced >= COALESCE_TX_LIMIT || age >= COALESCE_MAX_WAIT || drained {
                    self.commit().await?;
                }
            }

            MessageBody::Sentinel { id } => {
                self.flush_batch().await?;
                if self.dest_tx_open {
                    self.commit().await?;
                }
                self.sentinel.confirm(id);
            }
        }

        Ok(())
    }

    async fn change(&mut self, change: Change) -> Result<(), Error> {
        let entry = self
            .relations
            .get(&change.relation)
            .ok_or_else(|| {
                Error::MalformedMessage(format!(
                    "change for unknown relation {}",
                    change.relation
                ))
            })?
            .clone();

        if self.streaming_marked.insert(change.relation) {
            self.progress.table_streaming(&entry.relation.qualified());
        }

        match change.kind {
            ChangeKind::Insert => self.insert(&entry, change).await,
            ChangeKind::Update => self.update(&entry, change).await,
            ChangeKind::Delete => self.delete(&entry, change).await,
        }
    }

    async fn insert(&mut self, entry: &RelationEntry, change: Change) -> Result<(), Error> {
        let tuple = change
            .new
            .ok_or_else(|| Error::MalformedMessage("insert without a new tuple".into()))?;

        if tuple.len() != entry.relation.columns.len() {
            return Err(Error::MalformedMessage(format!(
                "insert arity {} != {} columns of {}",
                tuple.len(),
                entry.relation.columns.len(),
                entry.relation.qualified()
            )));
        }

        match &mut self.batch {
            Some(batch) if batch.relation == change.relation => {
                batch.rows.push(tuple);
            }
            Some(_) => {
                self.flush_batch().await?;
                self.batch = Some(InsertBatch {
                    relation: change.relation,
                    rows: vec![tuple],
                });
            }
            None => {
                self.batch = Some(InsertBatch {
                    relation: change.relation,
                    rows: vec![tuple],
                });
            }
        }

        if self
            .batch
            .as_ref()
            .map(|batch| batch.rows.len() >= INSERT_BATCH_SIZE)
            .unwrap_or(false)
        {
            self.flush_batch().await?;
        }

        Ok(())
    }

    async fn update(&mut self, entry: &RelationEntry, change: Change) -> Result<(), Error> {
        self.flush_batch().await?;

        let new = change
            .new
            .ok_or_else(|| Error::MalformedMessage("update without a new tuple".into()))?;

        if new.len() != entry.relation.columns.len() {
            return Err(Error::MalformedMessage(format!(
                "update arity {} != {} columns of {}",
                new.len(),
                entry.relation.columns.len(),
                entry.relation.qualified()
            )));
        }

        let set = present_columns(&new);

        // Without an old tuple the row still carries its pre-update
        // values on the destination; only the (unchanged) key columns
        // of the new tuple can match it.
        let (old, filter) = match change.old.as_ref() {
            Some(old) => (old, present_columns(old)),
            None => (&new, key_columns(&entry.relation, &new)),
        };

        let key = StatementKey {
            op: StatementOp::Update,
            relation: change.relation,
            set_arity: set.len(),
            where_arity: filter.len(),
        };

        let sql = {
            let entry = entry.clone();
            let set = set.clone();
            let filter = filter.clone();
            move || statement::update_sql(&entry.relation, &entry.casts, &set, &filter)
        };

        let statement = self.statement(key, &set, &filter, sql).await?;

        let mut values: Vec<Option<&str>> = vec![];
        for i in &set {
            values.push(new.0[*i].as_text()?);
        }
        for i in &filter {
            values.push(old.0[*i].as_text()?);
        }

        self.execute(&statement, &values).await?;

        Ok(())
    }

    async fn delete(&mut self, entry: &RelationEntry, change: Change) -> Result<(), Error> {
        self.flush_batch().await?;

        let old = change.old.ok_or_else(|| {
            Error::MalformedMessage("delete without replica identity columns".into())
        })?;

        let filter = present_columns(&old);

        let key = StatementKey {
            op: StatementOp::Delete,
            relation: change.relation,
            set_arity: 0,
            where_arity: filter.len(),
        };

        let sql = {
            let entry = entry.clone();
            let filter = filter.clone();
            move || statement::delete_sql(&entry.relation, &entry.casts, &filter)
        };

        let statement = self.statement(key, &[], &filter, sql).await?;

        let mut values: Vec<Option<&str>> = vec![];
        for i in &filter {
            values.push(old.0[*i].as_text()?);
        }

        self.execute(&statement, &values).await?;

        Ok(())
    }

    async fn execute(
        &mut self,
        statement: &tokio_postgres::Statement,
        values: &[Option<&str>],
    ) -> Result<(), Error> {
        let params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        self.client
            .execute(statement, &params)
            .await
            .map_err(Error::ApplyConflict)?;

        self.rows_since_commit += 1;

        Ok(())
    }

    /// Look up or prepare a statement for this shape.
    async fn statement(
        &mut self,
        key: StatementKey,
        set: &[usize],
        filter: &[usize],
        sql: impl FnOnce() -> String,
    ) -> Result<tokio_postgres::Statement, Error> {
        if let Some(cached) = self.statements.get(&key) {
            if cached.set_columns == set && cached.where_columns == filter {
                return Ok(cached.statement.clone());
            }
        }

        let sql = sql();
        let types = vec![Type::TEXT; set.len() + filter.len()];
        let statement = self
            .client
            .prepare_typed(&sql, &types)
            .await
            .map_err(Error::ApplyConflict)?;

        self.statements.insert(
            key,
            CachedStatement {
                statement: statement.clone(),
                set_columns: set.to_vec(),
                where_columns: filter.to_vec(),
            },
        );

        Ok(statement)
    }

    async fn flush_batch(&mut self) -> Result<(), Error> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };

        if batch.rows.is_empty() {
            return Ok(());
        }

        let entry = self
            .relations
            .get(&batch.relation)
            .ok_or_else(|| {
                Error::MalformedMessage(format!("batch for unknown relation {}", batch.relation))
            })?
            .clone();

        if batch.rows.len() <= COPY_THRESHOLD {
            self.flush_values(&entry, &batch).await?;
        } else {
            self.flush_copy(&entry, &batch).await?;
        }

        self.rows_since_commit += batch.rows.len() as u64;

        Ok(())
    }

    async fn flush_values(
        &mut self,
        entry: &RelationEntry,
        batch: &InsertBatch,
    ) -> Result<(), Error> {
        let columns = entry.relation.columns.len();
        let rows = batch.rows.len();

        let key = StatementKey {
            op: StatementOp::Insert,
            relation: batch.relation,
            set_arity: columns,
            where_arity: rows,
        };

        let sql = {
            let entry = entry.clone();
            move || statement::insert_sql(&entry.relation, &entry.casts, rows)
        };

        let all: Vec<usize> = (0..columns).collect();
        let statement = self.statement(key, &all, &[], sql).await?;

        let mut values: Vec<Option<&str>> = Vec::with_capacity(columns * rows);
        for tuple in &batch.rows {
            for datum in &tuple.0 {
                values.push(datum.as_text()?);
            }
        }

        let params: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        self.client
            .execute(&statement, &params)
            .await
            .map_err(Error::ApplyConflict)?;

        Ok(())
    }

    async fn flush_copy(&mut self, entry: &RelationEntry, batch: &InsertBatch) -> Result<(), Error> {
        let columns = entry
            .relation
            .columns
            .iter()
            .map(|column| column.name.clone())
            .collect::<Vec<_>>();

        let copy =
            CopyStatement::with_columns(&entry.relation.namespace, &entry.relation.name, &columns);

        let sink = self
            .client
            .copy_in::<_, bytes::Bytes>(&copy.copy_in())
            .await
            .map_err(Error::ApplyConflict)?;
        pin_mut!(sink);

        for tuple in &batch.rows {
            let line = statement::encode_copy_row(tuple)?;
            self.bytes_since_commit += line.len() as u64;
            sink.as_mut().send(line).await.map_err(Error::ApplyConflict)?;
        }

        sink.finish().await.map_err(Error::ApplyConflict)?;

        Ok(())
    }

    /// Learn or refresh a relation. Cached statements for it are
    /// invalidated.
    async fn learn_relation(&mut self, relation: Relation) -> Result<(), Error> {
        let casts = self.casts(&relation).await?;

        self.statements.retain(|key, _| key.relation != relation.id);

        debug!(
            "relation {} is {} ({} columns)",
            relation.id,
            relation.qualified(),
            relation.columns.len()
        );

        self.relations
            .insert(relation.id, RelationEntry { relation, casts });

        Ok(())
    }

    /// Per-column server-side casts. Built-in type OIDs resolve
    /// locally; anything else is looked up in the destination catalog.
    async fn casts(&mut self, relation: &Relation) -> Result<Vec<String>, Error> {
        let mut casts = Vec::with_capacity(relation.columns.len());
        let mut unresolved = false;

        for column in &relation.columns {
            match Type::from_oid(column.type_oid) {
                Some(ty) => casts.push(ty.name().to_string()),
                None => {
                    casts.push(String::new());
                    unresolved = true;
                }
            }
        }

        if unresolved {
            let rows = self
                .client
                .query(
                    "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
                     FROM pg_attribute a
                     JOIN pg_class c ON a.attrelid = c.oid
                     JOIN pg_namespace n ON c.relnamespace = n.oid
                     WHERE n.nspname = $1 AND c.relname = $2
                       AND a.attnum > 0 AND NOT a.attisdropped",
                    &[&relation.namespace, &relation.name],
                )
                .await
                .map_err(Error::ApplyConflict)?;

            let types: HashMap<String, String> = rows
                .iter()
                .map(|row| (row.get(0), row.get(1)))
                .collect();

            for (i, column) in relation.columns.iter().enumerate() {
                if casts[i].is_empty() {
                    casts[i] = types
                        .get(&column.name)
                        .cloned()
                        .unwrap_or_else(|| "text".into());
                }
            }
        }

        Ok(casts)
    }

    async fn begin(&mut self) -> Result<(), Error> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(Error::ApplyConflict)?;

        self.dest_tx_open = true;
        self.coalesced = 0;
        self.first_begin = Some(Instant::now());

        Ok(())
    }

    /// Commit the destination transaction and release every pending
    /// source commit LSN, in order, to the confirm handle.
    async fn commit(&mut self) -> Result<(), Error> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(Error::ApplyConflict)?;

        self.dest_tx_open = false;
        self.coalesced = 0;
        self.first_begin = None;

        let rows = std::mem::take(&mut self.rows_since_commit);
        let bytes = std::mem::take(&mut self.bytes_since_commit);
        let last = self.pending_commits.last().copied();

        for lsn in std::mem::take(&mut self.pending_commits) {
            self.confirm.confirm(lsn);
            self.progress.confirmed(lsn);

            if Some(lsn) == last {
                self.progress.applied(lsn, rows, bytes);
            } else {
                self.progress.applied(lsn, 0, 0);
            }
        }

        Ok(())
    }

    async fn rollback(&mut self) {
        if self.dest_tx_open {
            let _ = self.client.batch_execute("ROLLBACK").await;
        }

        self.dest_tx_open = false;
        self.source_tx_open = false;
        self.coalesced = 0;
        self.first_begin = None;
        self.batch = None;
        self.pending_commits.clear();
        self.rows_since_commit = 0;
        self.bytes_since_commit = 0;
    }

    /// End of stream or cancellation: commit fully-received source
    /// transactions, never a partial one.
    async fn finish(&mut self) -> Result<(), Error> {
        if self.source_tx_open {
            warn!("stream ended inside a transaction, rolling back the partial work");
            self.rollback().await;
            return Ok(());
        }

        if self.dest_tx_open {
            self.flush_batch().await?;
            self.commit().await?;
        }

        Ok(())
    }
}

fn present_columns(tuple: &Tuple) -> Vec<usize> {
    tuple
        .0
        .iter()
        .enumerate()
        .filter(|(_, datum)| !datum.is_toast())
        .map(|(i, _)| i)
        .collect()
}

/// Replica-identity key columns carried by the tuple; every present
/// column when the relation has no key flags at all.
fn key_columns(relation: &Relation, tuple: &Tuple) -> Vec<usize> {
    let keyed: Vec<usize> = relation
        .columns
        .iter()
        .enumerate()
        .filter(|(i, column)| column.key && !tuple.0[*i].is_toast())
        .map(|(i, _)| i)
        .collect();

    if keyed.is_empty() {
        present_columns(tuple)
    } else {
        keyed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::replication::message::{Datum, RelationColumn};

    #[test]
    fn test_present_columns_skips_toast() {
        let tuple = Tuple(vec![
            Datum::Text(bytes::Bytes::from_static(b"1")),
            Datum::Toast,
            Datum::Null,
        ]);
        assert_eq!(present_columns(&tuple), vec![0, 2]);
    }

    #[test]
    fn test_key_columns() {
        let relation = Relation {
            id: 1,
            namespace: "public".into(),
            name: "t".into(),
            columns: vec![
                RelationColumn {
                    name: "id".into(),
                    type_oid: 23,
                    key: true,
                },
                RelationColumn {
                    name: "value".into(),
                    type_oid: 23,
                    key: false,
                },
            ],
        };

        let tuple = Tuple(vec![
            Datum::Text(bytes::Bytes::from_static(b"1")),
            Datum::Text(bytes::Bytes::from_static(b"9999")),
        ]);

        assert_eq!(key_columns(&relation, &tuple), vec![0]);
    }
}
