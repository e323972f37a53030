//! Bidirectional replication filter.
//!
//! When the destination replicates back to the source under its own
//! origin, our own writes come back around in the stream. Dropping
//! changes tagged with the configured self-origin breaks the loop.

use tokio::sync::mpsc;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::decoder::MESSAGE_CHANNEL;
use super::message::{Message, MessageBody};

#[derive(Debug, Clone)]
pub struct BidiFilter {
    origin: String,
}

impl BidiFilter {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: origin.to_owned(),
        }
    }

    /// True when the message is one of our own writes echoed back.
    fn drops(&self, message: &Message) -> bool {
        if self.origin.is_empty() {
            return false;
        }

        match &message.body {
            MessageBody::Change(change) => change.origin == self.origin,
            _ => false,
        }
    }

    /// Filter the stream onto a new channel. Everything that is not a
    /// self-origin change passes through unchanged and in order.
    pub fn spawn(
        self,
        mut input: mpsc::Receiver<Message>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Message> {
        let (tx, output) = mpsc::channel(MESSAGE_CHANNEL);

        spawn(async move {
            loop {
                select! {
                    _ = cancel.cancelled() => break,

                    message = input.recv() => {
                        let Some(message) = message else {
                            break;
                        };

                        if self.drops(&message) {
                            trace!("dropped change from origin \"{}\"", self.origin);
                            continue;
                        }

                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        output
    }
}

#[cfg(test)]
mod test {
    use super::super::message::{Change, ChangeKind};
    use super::super::Lsn;
    use super::*;

    fn change(origin: &str) -> Message {
        Message {
            lsn: Lsn(1),
            timestamp: 0,
            body: MessageBody::Change(Change {
                relation: 1,
                kind: ChangeKind::Insert,
                new: None,
                old: None,
                origin: origin.into(),
            }),
        }
    }

    fn boundary(body: MessageBody) -> Message {
        Message {
            lsn: Lsn(1),
            timestamp: 0,
            body,
        }
    }

    #[tokio::test]
    async fn test_drops_self_origin() {
        let (tx, rx) = mpsc::channel(16);
        let filter = BidiFilter::new("ferry_b");
        let mut out = filter.spawn(rx, CancellationToken::new());

        tx.send(boundary(MessageBody::Begin)).await.unwrap();
        tx.send(change("ferry_b")).await.unwrap();
        tx.send(change("")).await.unwrap();
        tx.send(change("other")).await.unwrap();
        tx.send(boundary(MessageBody::Commit)).await.unwrap();
        drop(tx);

        let mut kinds = vec![];
        while let Some(message) = out.recv().await {
            kinds.push(match message.body {
                MessageBody::Begin => "begin",
                MessageBody::Commit => "commit",
                MessageBody::Change(_) => "change",
                _ => "other",
            });
        }

        assert_eq!(kinds, vec!["begin", "change", "change", "commit"]);
    }

    #[tokio::test]
    async fn test_empty_origin_passes_everything() {
        let (tx, rx) = mpsc::channel(16);
        let filter = BidiFilter::new("");
        let mut out = filter.spawn(rx, CancellationToken::new());

        tx.send(change("ferry_b")).await.unwrap();
        tx.send(boundary(MessageBody::Sentinel { id: 7 })).await.unwrap();
        drop(tx);

        assert!(matches!(
            out.recv().await.unwrap().body,
            MessageBody::Change(_)
        ));
        assert!(matches!(
            out.recv().await.unwrap().body,
            MessageBody::Sentinel { id: 7 }
        ));
        assert!(out.recv().await.is_none());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Self-origin changes are dropped, transaction boundaries
            // never are.
            #[test]
            fn boundaries_always_pass(origins in proptest::collection::vec("[a-z]{0,6}", 1..20)) {
                let filter = BidiFilter::new("me");

                for origin in origins {
                    prop_assert!(!filter.drops(&boundary(MessageBody::Begin)));
                    prop_assert!(!filter.drops(&boundary(MessageBody::Commit)));
                    prop_assert_eq!(filter.drops(&change(&origin)), origin == "me");
                }
            }
        }
    }
}
