//! Stream decoder.
//!
//! Owns the dedicated replication connection. Creates or attaches to
//! the logical slot, decodes the pgoutput stream into [`Message`]s and
//! feeds confirmed-LSN updates back to the source as standby status.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use postgres_protocol::message::backend::{LogicalReplicationMessage, ReplicationMessage};
use postgres_types::PgLsn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio::{select, spawn};
use tokio_postgres::replication::LogicalReplicationStream;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config;
use crate::connection::connect_replication;
use crate::util::postgres_now;

use super::message::{Change, Message, MessageBody, Relation};
use super::slot::ReplicationSlot;
use super::{Error, Lsn};

/// Capacity of the decoder's output channel.
pub(crate) const MESSAGE_CHANNEL: usize = 256;

/// Standby status cadence. Keeps the source from timing out the slot.
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Confirmed-LSN feedback handle. The applier records durably
/// committed positions here; the decoder folds the latest value into
/// its next standby status update.
#[derive(Debug, Clone, Default)]
pub struct Confirm {
    lsn: Arc<AtomicU64>,
}

impl Confirm {
    /// Record a durably applied position. Non-blocking, monotonic.
    pub fn confirm(&self, lsn: Lsn) {
        self.lsn.fetch_max(lsn.0, Ordering::SeqCst);
    }

    pub fn lsn(&self) -> Lsn {
        Lsn(self.lsn.load(Ordering::SeqCst))
    }
}

pub struct StreamDecoder {
    config: tokio_postgres::Config,
    slot: ReplicationSlot,
    publication: String,
    confirm: Confirm,
    cancel: CancellationToken,
}

impl StreamDecoder {
    pub fn new(
        config: tokio_postgres::Config,
        replication: &config::Replication,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            slot: ReplicationSlot::new(&replication.slot, &replication.plugin),
            publication: replication.publication.clone(),
            confirm: Confirm::default(),
            cancel,
        }
    }

    pub fn confirm(&self) -> Confirm {
        self.confirm.clone()
    }

    /// Open the replication connection and position the slot.
    ///
    /// A zero `start_lsn` creates the slot and exports its consistent
    /// snapshot; a non-zero one resumes an existing slot with an empty
    /// snapshot name. Streaming starts lazily, see
    /// [`StartedDecoder::stream`].
    pub async fn start(&self, start_lsn: Lsn) -> Result<StartedDecoder, Error> {
        let client = connect_replication(&self.config)
            .await
            .map_err(Error::SourceUnreachable)?;

        let (start_lsn, snapshot) = if start_lsn.is_zero() {
            let created = self.slot.create(&client).await?;
            (created.consistent_point, created.snapshot)
        } else {
            self.slot_exists(&client).await?;
            (start_lsn, String::new())
        };

        Ok(StartedDecoder {
            client,
            slot: self.slot.clone(),
            publication: self.publication.clone(),
            start_lsn,
            snapshot,
            confirm: self.confirm.clone(),
            cancel: self.cancel.clone(),
        })
    }

    async fn slot_exists(&self, client: &Client) -> Result<(), Error> {
        let query = format!(
            "SELECT 1 FROM pg_replication_slots WHERE slot_name = '{}'",
            self.slot.name().replace('\'', "''")
        );
        let rows = client
            .simple_query(&query)
            .await
            .map_err(Error::SourceUnreachable)?;

        let found = rows
            .iter()
            .any(|row| matches!(row, tokio_postgres::SimpleQueryMessage::Row(_)));

        if found {
            Ok(())
        } else {
            Err(Error::SlotMissing(self.slot.name().to_owned()))
        }
    }
}

/// Slot positioned, snapshot exported, replication not yet flowing.
pub struct StartedDecoder {
    client: Client,
    slot: ReplicationSlot,
    publication: String,
    pub start_lsn: Lsn,
    pub snapshot: String,
    confirm: Confirm,
    cancel: CancellationToken,
}

impl StartedDecoder {
    /// Begin streaming. Consumes the exported snapshot's validity:
    /// sessions importing it must have done so before this call.
    pub async fn stream(
        self,
    ) -> Result<(mpsc::Receiver<Message>, JoinHandle<Result<(), Error>>), Error> {
        let query = self.slot.start_query(&self.publication, self.start_lsn);
        debug!("{}", query);

        let duplex = self
            .client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(|err| {
                if err.code() == Some(&tokio_postgres::error::SqlState::UNDEFINED_OBJECT) {
                    Error::SlotMissing(self.slot.name().to_owned())
                } else {
                    Error::Pg(err)
                }
            })?;

        let stream = LogicalReplicationStream::new(duplex);
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL);

        let client = self.client;
        let confirm = self.confirm;
        let cancel = self.cancel;

        let handle = spawn(async move {
            let result = decode_loop(stream, tx, confirm, cancel).await;
            drop(client);
            result
        });

        Ok((rx, handle))
    }

    /// Drop the slot instead of streaming (clone-only runs).
    pub async fn drop_slot(self) -> Result<(), Error> {
        self.slot.drop_slot(&self.client).await
    }
}

async fn decode_loop(
    stream: LogicalReplicationStream,
    tx: mpsc::Sender<Message>,
    confirm: Confirm,
    cancel: CancellationToken,
) -> Result<(), Error> {
    tokio::pin!(stream);

    let mut status = interval(STATUS_INTERVAL);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Origin of the transaction currently on the wire. pgoutput sends
    // it right after Begin for foreign-origin transactions.
    let mut origin = String::new();

    loop {
        select! {
            _ = cancel.cancelled() => {
                let _ = send_status(stream.as_mut(), &confirm, 0).await;
                break;
            }

            _ = status.tick() => {
                // Failures here retry on the next tick; a dead
                // connection surfaces through the stream itself.
                if let Err(err) = send_status(stream.as_mut(), &confirm, 0).await {
                    warn!("standby status update failed: {}", err);
                }
            }

            message = stream.next() => {
                let Some(message) = message else {
                    debug!("source closed the replication stream");
                    break;
                };

                match message? {
                    ReplicationMessage::XLogData(xlog) => {
                        let lsn = Lsn(xlog.wal_start());
                        let sent_at = xlog.timestamp();

                        let message = decode(xlog.into_data(), lsn, sent_at, &mut origin)?;

                        if let Some(message) = message {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                    }

                    ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                        trace!(
                            "keepalive at {} [confirmed: {}]",
                            Lsn(keepalive.wal_end()),
                            confirm.lsn()
                        );

                        if keepalive.reply() == 1 {
                            send_status(stream.as_mut(), &confirm, 0).await?;
                        }
                    }

                    _ => (),
                }
            }
        }
    }

    Ok(())
}

fn decode(
    data: LogicalReplicationMessage,
    lsn: Lsn,
    sent_at: i64,
    origin: &mut String,
) -> Result<Option<Message>, Error> {
    let message = match data {
        LogicalReplicationMessage::Begin(begin) => {
            origin.clear();
            Some(Message {
                lsn,
                timestamp: begin.timestamp(),
                body: MessageBody::Begin,
            })
        }

        LogicalReplicationMessage::Commit(commit) => Some(Message {
            lsn: Lsn(commit.end_lsn()),
            timestamp: commit.timestamp(),
            body: MessageBody::Commit,
        }),

        LogicalReplicationMessage::Origin(body) => {
            *origin = body
                .name()
                .map_err(|e| Error::MalformedMessage(format!("origin name: {}", e)))?
                .to_owned();
            None
        }

        LogicalReplicationMessage::Relation(relation) => Some(Message {
            lsn,
            timestamp: sent_at,
            body: MessageBody::Relation(Relation::from_wire(&relation)?),
        }),

        LogicalReplicationMessage::Insert(insert) => Some(Message {
            lsn,
            timestamp: sent_at,
            body: MessageBody::Change(Change::insert(insert, origin)),
        }),

        LogicalReplicationMessage::Update(update) => Some(Message {
            lsn,
            timestamp: sent_at,
            body: MessageBody::Change(Change::update(update, origin)),
        }),

        LogicalReplicationMessage::Delete(delete) => Some(Message {
            lsn,
            timestamp: sent_at,
            body: MessageBody::Change(Change::delete(delete, origin)),
        }),

        LogicalReplicationMessage::Truncate(_) => {
            warn!("TRUNCATE received and skipped, it is not replayed");
            None
        }

        LogicalReplicationMessage::Type(_) => None,

        _ => None,
    };

    Ok(message)
}

async fn send_status(
    stream: Pin<&mut LogicalReplicationStream>,
    confirm: &Confirm,
    reply: u8,
) -> Result<(), Error> {
    let lsn: PgLsn = confirm.lsn().into();
    stream
        .standby_status_update(lsn, lsn, lsn, postgres_now(), reply)
        .await?;

    Ok(())
}
