//! Replication slot lifecycle.

use tokio_postgres::{error::SqlState, Client, SimpleQueryMessage};
use tracing::{debug, info};

use super::{Error, Lsn};

/// Result of creating a logical slot: the consistent point the slot
/// starts at and the exported snapshot naming that state.
#[derive(Debug, Clone)]
pub struct CreatedSlot {
    pub consistent_point: Lsn,
    pub snapshot: String,
}

/// A named logical replication slot, operated over a
/// replication-protocol connection.
#[derive(Debug, Clone)]
pub struct ReplicationSlot {
    name: String,
    plugin: String,
}

impl ReplicationSlot {
    pub fn new(name: &str, plugin: &str) -> Self {
        Self {
            name: name.to_owned(),
            plugin: plugin.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the slot and export the consistent snapshot.
    pub async fn create(&self, client: &Client) -> Result<CreatedSlot, Error> {
        let query = format!(
            r#"CREATE_REPLICATION_SLOT "{}" LOGICAL "{}" EXPORT_SNAPSHOT"#,
            self.name, self.plugin
        );

        let rows = client.simple_query(&query).await.map_err(|err| {
            if err.code() == Some(&SqlState::DUPLICATE_OBJECT) {
                Error::SlotExists(self.name.clone())
            } else {
                Error::SourceUnreachable(err)
            }
        })?;

        let row = rows
            .iter()
            .find_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .ok_or_else(|| Error::MalformedMessage("CREATE_REPLICATION_SLOT returned no row".into()))?;

        let consistent_point = row
            .get(1)
            .ok_or(Error::LsnDecode)?
            .parse::<Lsn>()?;
        let snapshot = row.get(2).unwrap_or_default().to_owned();

        info!(
            "created replication slot \"{}\" at {} [snapshot: {}]",
            self.name, consistent_point, snapshot
        );

        Ok(CreatedSlot {
            consistent_point,
            snapshot,
        })
    }

    /// Drop the slot. Safe to call when the slot is already gone.
    pub async fn drop_slot(&self, client: &Client) -> Result<(), Error> {
        let query = format!(r#"DROP_REPLICATION_SLOT "{}" WAIT"#, self.name);

        match client.simple_query(&query).await {
            Ok(_) => {
                debug!("dropped replication slot \"{}\"", self.name);
                Ok(())
            }
            Err(err) if err.code() == Some(&SqlState::UNDEFINED_OBJECT) => Ok(()),
            Err(err) => Err(Error::SourceUnreachable(err)),
        }
    }

    /// START_REPLICATION command for this slot.
    pub fn start_query(&self, publication: &str, lsn: Lsn) -> String {
        format!(
            r#"START_REPLICATION SLOT "{}" LOGICAL {} ("proto_version" '1', "publication_names" '{}')"#,
            self.name, lsn, publication
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_start_query() {
        let slot = ReplicationSlot::new("ferry", "pgoutput");
        assert_eq!(
            slot.start_query("pub", Lsn::from(0x16_0000_0001)),
            r#"START_REPLICATION SLOT "ferry" LOGICAL 16/1 ("proto_version" '1', "publication_names" 'pub')"#
        );
    }
}
