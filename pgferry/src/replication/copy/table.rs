//! Table inventory.

use tokio_postgres::Client;

use super::super::Error;

/// One user table on the source, with planner size estimates used
/// for work scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    /// Planner row estimate; display only.
    pub rows: i64,
    /// On-disk size, the scheduling weight.
    pub bytes: i64,
}

impl TableInfo {
    /// All user tables, largest first so the biggest copies start
    /// on the critical path. Ties break lexicographically.
    pub async fn load(client: &Client) -> Result<Vec<TableInfo>, Error> {
        let rows = client
            .query(
                "SELECT n.nspname::text, c.relname::text,
                        c.reltuples::bigint, pg_table_size(c.oid)
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE c.relkind = 'r'
                   AND n.nspname NOT LIKE 'pg\\_%'
                   AND n.nspname <> 'information_schema'
                 ORDER BY pg_table_size(c.oid) DESC, n.nspname, c.relname",
                &[],
            )
            .await
            .map_err(Error::SourceUnreachable)?;

        Ok(rows
            .iter()
            .map(|row| TableInfo {
                schema: row.get(0),
                name: row.get(1),
                rows: row.get(2),
                bytes: row.get(3),
            })
            .collect())
    }

    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }
}

/// Per-table copy outcome.
#[derive(Debug)]
pub struct CopyResult {
    pub table: TableInfo,
    pub rows: u64,
    pub error: Option<Error>,
}
