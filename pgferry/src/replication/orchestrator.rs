//! Pipeline orchestrator.
//!
//! Composes schema migration, snapshot copy, decoding and replay into
//! runs: clone, clone-and-follow, follow and switchover. Errors bubble
//! up here; the first one wins, fails the run and cancels every task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::connect_replication;
use crate::pool::Pool;

use super::applier::Applier;
use super::copy::Copier;
use super::decoder::{Confirm, StartedDecoder, StreamDecoder, MESSAGE_CHANNEL};
use super::filter::BidiFilter;
use super::message::Message;
use super::progress::{MetricsSink, Phase, Progress};
use super::schema::SchemaMigrator;
use super::sentinel::SentinelCoordinator;
use super::slot::ReplicationSlot;
use super::{Error, Lsn};

/// In-memory buffer between the decoder and the applier while the
/// initial copy runs.
pub(crate) const COPY_BUFFER: usize = 4096;

pub struct Pipeline {
    config: Config,
    source: tokio_postgres::Config,
    /// Bulk writes: schema apply and table copy.
    copy_pool: Pool,
    /// Applier transactions.
    apply_pool: Pool,
    progress: Progress,
    sentinel: SentinelCoordinator,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: Config, sink: Arc<dyn MetricsSink>) -> Result<Self, Error> {
        let source = config.source()?;
        let destination = config.destination()?;
        let cancel = CancellationToken::new();

        Ok(Self {
            copy_pool: Pool::new(destination.clone(), config.copy.workers + 1),
            apply_pool: Pool::new(destination.clone(), 1),
            progress: Progress::new(sink),
            sentinel: SentinelCoordinator::new(cancel.clone()),
            cancel,
            config,
            source,
        })
    }

    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Shared cancellation token. Cancelling it shuts the run down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Schema and data copy only. The replication slot exists just to
    /// pin the snapshot and is dropped before returning.
    pub async fn clone_data(&self) -> Result<(), Error> {
        let result = self.run_clone().await;
        self.guard(result)
    }

    /// Full migration: clone, then stream changes until cancelled.
    pub async fn migrate(&self) -> Result<(), Error> {
        let result = self.run_migrate().await;
        self.guard(result)
    }

    /// Resume streaming from an existing slot.
    pub async fn follow(&self, lsn: Lsn) -> Result<(), Error> {
        let result = self.run_follow(lsn).await;
        self.guard(result)
    }

    /// Witnessed cutover: returns once every source commit up to the
    /// currently applied LSN is durable on the destination.
    pub async fn switchover(&self, timeout: Duration) -> Result<Lsn, Error> {
        self.progress.set_phase(Phase::Switchover);

        let applied = self.progress.last_applied();
        let id = self.sentinel.initiate(applied).await?;
        self.sentinel.wait(id, timeout).await?;

        self.progress.set_phase(Phase::SwitchoverComplete);
        info!("switchover complete, destination caught up past {}", applied);

        Ok(applied)
    }

    /// Drop the replication slot on the source.
    pub async fn cleanup(&self) -> Result<(), Error> {
        let client = connect_replication(&self.source)
            .await
            .map_err(Error::SourceUnreachable)?;

        ReplicationSlot::new(&self.config.replication.slot, &self.config.replication.plugin)
            .drop_slot(&client)
            .await
    }

    async fn run_clone(&self) -> Result<(), Error> {
        let (_decoder, started, copier) = self.connect_and_prepare().await?;

        let tables = copier.list_tables().await?;
        self.progress.started(tables.len());

        let session = copier.begin(&started.snapshot).await?;

        self.progress.set_phase(Phase::Copy);
        self.copy_tables(session, tables).await?;

        started.drop_slot().await?;

        self.progress.set_phase(Phase::Done);

        Ok(())
    }

    async fn run_migrate(&self) -> Result<(), Error> {
        let (decoder, started, copier) = self.connect_and_prepare().await?;

        let tables = copier.list_tables().await?;
        self.progress.started(tables.len());

        let session = copier.begin(&started.snapshot).await?;

        // The workers hold the snapshot now; streaming may begin and
        // buffer behind the copy.
        let confirm = decoder.confirm();
        let (messages, decoder_task) = started.stream().await?;
        let applier_input = self.bridge(messages, COPY_BUFFER);

        self.progress.set_phase(Phase::Copy);
        self.copy_tables(session, tables).await?;

        self.progress.set_phase(Phase::Streaming);
        self.stream_and_apply(applier_input, confirm, decoder_task)
            .await
    }

    async fn run_follow(&self, lsn: Lsn) -> Result<(), Error> {
        self.progress.set_phase(Phase::Connecting);
        self.check_destination().await?;

        let decoder = StreamDecoder::new(
            self.source.clone(),
            &self.config.replication,
            self.cancel.clone(),
        );

        let confirm = decoder.confirm();
        let started = decoder.start(lsn).await?;
        let (messages, decoder_task) = started.stream().await?;
        let applier_input = self.bridge(messages, MESSAGE_CHANNEL);

        self.progress.set_phase(Phase::Streaming);
        self.stream_and_apply(applier_input, confirm, decoder_task)
            .await
    }

    /// Shared front half of clone and migrate: connect, install the
    /// schema, create the slot and export its snapshot.
    async fn connect_and_prepare(
        &self,
    ) -> Result<(StreamDecoder, StartedDecoder, Copier), Error> {
        self.progress.set_phase(Phase::Connecting);
        self.check_destination().await?;

        self.progress.set_phase(Phase::Schema);
        let migrator = SchemaMigrator::new(
            &self.config.replication,
            &self.source,
            self.copy_pool.clone(),
        );
        let ddl = migrator.dump().await?;
        migrator.apply(&ddl).await?;

        let decoder = StreamDecoder::new(
            self.source.clone(),
            &self.config.replication,
            self.cancel.clone(),
        );
        let started = decoder.start(Lsn::ZERO).await?;

        let copier = Copier::new(
            self.source.clone(),
            self.copy_pool.clone(),
            self.config.copy.workers,
            self.cancel.clone(),
        );

        Ok((decoder, started, copier))
    }

    async fn check_destination(&self) -> Result<(), Error> {
        let client = self
            .copy_pool
            .get()
            .await
            .map_err(Error::DestUnreachable)?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(Error::DestUnreachable)?;

        Ok(())
    }

    async fn copy_tables(
        &self,
        session: super::copy::CopySession,
        tables: Vec<super::copy::TableInfo>,
    ) -> Result<(), Error> {
        let total = tables.len();
        let results = session.copy_all(tables).await?;

        let mut first_error = None;
        for result in results {
            match result.error {
                Some(err) => {
                    warn!("table {} failed to copy: {}", result.table.qualified(), err);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                None => {
                    self.progress
                        .table_copied(&result.table.qualified(), result.rows);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        info!("all {} tables copied", total);

        Ok(())
    }

    /// Forward decoder output onto the channel sentinels inject into.
    fn bridge(
        &self,
        mut messages: mpsc::Receiver<Message>,
        capacity: usize,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity);
        self.sentinel.install(tx.clone());

        spawn(async move {
            while let Some(message) = messages.recv().await {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        rx
    }

    async fn stream_and_apply(
        &self,
        input: mpsc::Receiver<Message>,
        confirm: Confirm,
        mut decoder_task: JoinHandle<Result<(), Error>>,
    ) -> Result<(), Error> {
        let origin = &self.config.replication.origin;

        let input = if origin.is_empty() {
            input
        } else {
            BidiFilter::new(origin).spawn(input, self.cancel.clone())
        };

        let applier = Applier::new(
            self.apply_pool.get().await.map_err(Error::DestUnreachable)?,
            origin,
            confirm,
            self.sentinel.clone(),
            self.progress.clone(),
        );

        let mut applier_task = spawn(applier.run(input, self.cancel.clone()));

        let result = select! {
            decoder = &mut decoder_task => {
                let decoder = flatten(decoder);

                // Source stream ended. Close the applier's input so it
                // can commit what it has and drain out.
                self.sentinel.uninstall();

                let applier = flatten(applier_task.await);
                decoder.and(applier)
            }

            applier = &mut applier_task => {
                let applier = flatten(applier);
                self.cancel.cancel();
                let _ = decoder_task.await;
                applier
            }
        };

        self.sentinel.drop_pending();

        result
    }

    fn fail(&self, error: &Error) {
        self.progress.error(error);
        self.progress.set_phase(Phase::Failed);
        self.sentinel.drop_pending();
        self.cancel.cancel();
    }

    /// Uniform exit: cancellation after a completed switchover is a
    /// clean finish, anything else unrecoverable fails the run.
    fn guard(&self, result: Result<(), Error>) -> Result<(), Error> {
        match result {
            Ok(()) => {
                self.progress.set_phase(Phase::Done);
                Ok(())
            }

            Err(Error::Cancelled) => {
                if self.progress.phase() >= Phase::SwitchoverComplete {
                    self.progress.set_phase(Phase::Done);
                    Ok(())
                } else {
                    Err(Error::Cancelled)
                }
            }

            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }
}

fn flatten(result: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    match result {
        Ok(result) => result,
        Err(err) => Err(Error::MalformedMessage(format!("task panicked: {}", err))),
    }
}
