use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("source unreachable: {0}")]
    SourceUnreachable(#[source] tokio_postgres::Error),

    #[error("destination unreachable: {0}")]
    DestUnreachable(#[source] tokio_postgres::Error),

    #[error("replication slot \"{0}\" already exists")]
    SlotExists(String),

    #[error("replication slot \"{0}\" does not exist")]
    SlotMissing(String),

    #[error("pg_dump: {0}")]
    PgDump(String),

    #[error("schema apply: {0}")]
    SchemaApply(#[source] tokio_postgres::Error),

    #[error("copy failed for \"{schema}\".\"{name}\": {source}")]
    CopyRow {
        schema: String,
        name: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("apply conflict: {0}")]
    ApplyConflict(#[source] tokio_postgres::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("switchover timed out")]
    Timeout,

    #[error("unknown sentinel {0}")]
    UnknownSentinel(u64),

    #[error("pipeline is not streaming")]
    NotStreaming,

    #[error("malformed replication message: {0}")]
    MalformedMessage(String),

    #[error("lsn decode")]
    LsnDecode,

    #[error("{0}")]
    Config(#[from] crate::config::Error),

    #[error("{0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Termination kinds an operator can act on without a fresh start.
    pub fn recoverable(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout)
    }
}
