//! Pipeline phases and observable progress.

use std::fmt::Display;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::{Error, Lsn};

/// Pipeline phase. Strictly non-decreasing within a run, except that
/// `Failed` absorbs everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Schema,
    Copy,
    Streaming,
    Switchover,
    SwitchoverComplete,
    Done,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Schema => "schema",
            Self::Copy => "copy",
            Self::Streaming => "streaming",
            Self::Switchover => "switchover",
            Self::SwitchoverComplete => "switchover-complete",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Observer for pipeline events. Implementations are best-effort:
/// nothing here may fail the pipeline.
pub trait MetricsSink: Send + Sync {
    fn phase_changed(&self, _phase: Phase) {}
    fn table_copied(&self, _table: &str, _rows: u64) {}
    fn table_streaming(&self, _table: &str) {}
    fn record_applied(&self, _lsn: Lsn, _rows: u64, _bytes: u64) {}
    fn record_error(&self, _error: &Error) {}
}

/// Default sink: structured log lines.
pub struct LogSink;

impl MetricsSink for LogSink {
    fn phase_changed(&self, phase: Phase) {
        info!("phase: {}", phase);
    }

    fn table_copied(&self, table: &str, rows: u64) {
        debug!("table {} copied ({} rows)", table, rows);
    }

    fn table_streaming(&self, table: &str) {
        debug!("table {} streaming", table);
    }

    fn record_applied(&self, lsn: Lsn, rows: u64, bytes: u64) {
        debug!("applied {} rows ({} bytes) through {}", rows, bytes, lsn);
    }

    fn record_error(&self, error: &Error) {
        debug!("pipeline error: {}", error);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub last_applied: Lsn,
    pub last_confirmed: Lsn,
    pub tables_total: usize,
    pub tables_copied: usize,
    pub started_at: Option<SystemTime>,
    pub errors: usize,
}

/// Shared, observable pipeline state. Mutated only by the pipeline's
/// own callbacks.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<Mutex<ProgressSnapshot>>,
    sink: Arc<dyn MetricsSink>,
}

impl Progress {
    pub fn new(sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProgressSnapshot::default())),
            sink,
        }
    }

    pub fn started(&self, tables_total: usize) {
        let mut guard = self.inner.lock();
        guard.started_at = Some(SystemTime::now());
        guard.tables_total = tables_total;
    }

    /// Advance the phase. Going backwards is ignored; `Failed` always
    /// sticks.
    pub fn set_phase(&self, phase: Phase) {
        let changed = {
            let mut guard = self.inner.lock();
            if guard.phase == Phase::Failed || phase < guard.phase {
                false
            } else if guard.phase != phase {
                guard.phase = phase;
                true
            } else {
                false
            }
        };

        if changed {
            self.sink.phase_changed(phase);
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    pub fn table_copied(&self, table: &str, rows: u64) {
        self.inner.lock().tables_copied += 1;
        self.sink.table_copied(table, rows);
    }

    pub fn table_streaming(&self, table: &str) {
        self.sink.table_streaming(table);
    }

    pub fn applied(&self, lsn: Lsn, rows: u64, bytes: u64) {
        let mut guard = self.inner.lock();
        if lsn > guard.last_applied {
            guard.last_applied = lsn;
        }
        drop(guard);
        self.sink.record_applied(lsn, rows, bytes);
    }

    pub fn confirmed(&self, lsn: Lsn) {
        let mut guard = self.inner.lock();
        if lsn > guard.last_confirmed {
            guard.last_confirmed = lsn;
        }
    }

    pub fn last_applied(&self) -> Lsn {
        self.inner.lock().last_applied
    }

    pub fn error(&self, error: &Error) {
        self.inner.lock().errors += 1;
        self.sink.record_error(error);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullSink;
    impl MetricsSink for NullSink {}

    #[test]
    fn test_phase_monotonic() {
        let progress = Progress::new(Arc::new(NullSink));

        progress.set_phase(Phase::Copy);
        progress.set_phase(Phase::Schema); // backwards, ignored
        assert_eq!(progress.phase(), Phase::Copy);

        progress.set_phase(Phase::Streaming);
        assert_eq!(progress.phase(), Phase::Streaming);
    }

    #[test]
    fn test_failed_absorbing() {
        let progress = Progress::new(Arc::new(NullSink));

        progress.set_phase(Phase::Failed);
        progress.set_phase(Phase::Done);
        assert_eq!(progress.phase(), Phase::Failed);
    }

    #[test]
    fn test_lsn_tracking() {
        let progress = Progress::new(Arc::new(NullSink));

        progress.applied(Lsn(100), 1, 10);
        progress.applied(Lsn(50), 1, 10); // stale, keeps max
        assert_eq!(progress.last_applied(), Lsn(100));

        progress.confirmed(Lsn(100));
        assert_eq!(progress.snapshot().last_confirmed, Lsn(100));
    }
}
