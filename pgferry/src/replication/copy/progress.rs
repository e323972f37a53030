use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tokio::{select, spawn};
use tracing::info;

use super::table::TableInfo;

#[derive(Debug)]
struct Inner {
    table: TableInfo,
    bytes: AtomicUsize,
    done: Notify,
}

/// Periodic per-table copy throughput logging.
#[derive(Debug, Clone)]
pub(crate) struct CopyProgress {
    inner: Arc<Inner>,
}

impl CopyProgress {
    pub(crate) fn new(table: &TableInfo) -> Self {
        let inner = Arc::new(Inner {
            bytes: AtomicUsize::new(0),
            done: Notify::new(),
            table: table.clone(),
        });

        let notify = inner.clone();

        spawn(async move {
            let mut prev = 0;
            loop {
                select! {
                    _ = sleep(Duration::from_secs(5)) => {
                        let written = notify.bytes.load(Ordering::Relaxed);

                        info!(
                            "copied {:.3} MB for table {} [{:.3} MB/sec]",
                            written as f64 / 1024.0 / 1024.0,
                            notify.table.qualified(),
                            (written - prev) as f64 / 5.0 / 1024.0 / 1024.0
                        );

                        prev = written;
                    }

                    _ = notify.done.notified() => {
                        break;
                    }
                }
            }
        });

        CopyProgress { inner }
    }

    pub(crate) fn update(&self, total_bytes: usize) {
        self.inner.bytes.store(total_bytes, Ordering::Relaxed);
    }

    pub(crate) fn done(&self) {
        self.inner.done.notify_one();
    }
}

impl Drop for CopyProgress {
    fn drop(&mut self) {
        self.done()
    }
}
