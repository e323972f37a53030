//! Schema migrator.
//!
//! Installs on the destination a DDL projection of the source schema,
//! sufficient for the applier to operate. Objects that already exist
//! are skipped; anything else failing aborts the run.

pub mod pg_dump;
pub mod splitter;

use tokio_postgres::error::SqlState;
use tracing::{debug, info, warn};

use crate::config;
use crate::pool::Pool;

use super::Error;
use pg_dump::PgDump;

pub struct SchemaMigrator {
    pg_dump: PgDump,
    destination: Pool,
}

impl SchemaMigrator {
    pub fn new(
        replication: &config::Replication,
        source: &tokio_postgres::Config,
        destination: Pool,
    ) -> Self {
        Self {
            pg_dump: PgDump::new(&replication.pg_dump_path, source),
            destination,
        }
    }

    /// Dump the source schema.
    pub async fn dump(&self) -> Result<String, Error> {
        self.pg_dump.dump().await
    }

    /// Apply a DDL script to the destination, one statement per
    /// transaction. Duplicate objects are logged and skipped.
    pub async fn apply(&self, ddl: &str) -> Result<(), Error> {
        let statements = splitter::split(ddl);
        let client = self.destination.get().await.map_err(Error::DestUnreachable)?;

        let total = statements.len();
        let mut skipped = 0;

        for statement in &statements {
            client.simple_query("BEGIN").await?;
            client
                .simple_query("SET LOCAL statement_timeout = '30s'")
                .await?;

            match client.simple_query(statement).await {
                Ok(_) => {
                    client.simple_query("COMMIT").await?;
                }

                Err(err) if duplicate_object(&err) => {
                    debug!("object exists, skipping: {}", first_line(statement));
                    skipped += 1;
                    let _ = client.simple_query("ROLLBACK").await;
                }

                Err(err) => {
                    warn!("schema statement failed: {}", first_line(statement));
                    let _ = client.simple_query("ROLLBACK").await;
                    return Err(Error::SchemaApply(err));
                }
            }
        }

        info!(
            "applied {} schema statements ({} already existed)",
            total - skipped,
            skipped
        );

        Ok(())
    }
}

fn duplicate_object(err: &tokio_postgres::Error) -> bool {
    matches!(
        err.code(),
        Some(&SqlState::DUPLICATE_TABLE)
            | Some(&SqlState::INVALID_TABLE_DEFINITION)
            | Some(&SqlState::DUPLICATE_OBJECT)
    )
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("CREATE TABLE a (\n id int\n)"), "CREATE TABLE a (");
        assert_eq!(first_line(""), "");
    }
}
