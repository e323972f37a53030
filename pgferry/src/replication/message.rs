//! Replication stream messages.
//!
//! The decoder turns pgoutput wire messages into this closed sum type.
//! Messages move through bounded channels and are consumed exactly once
//! by the applier.

use bytes::Bytes;
use postgres_protocol::message::backend::{
    DeleteBody, InsertBody, RelationBody, Tuple as WireTuple, TupleData, UpdateBody,
};

use super::{Error, Lsn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One column value as decoded from the stream: absent, unchanged
/// TOAST datum, or the text representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Toast,
    Text(Bytes),
}

impl Datum {
    /// Text value, if any. Toast datums carry no value.
    pub fn as_text(&self) -> Result<Option<&str>, Error> {
        match self {
            Self::Null => Ok(None),
            Self::Toast => Err(Error::MalformedMessage(
                "unchanged toast datum where a value is required".into(),
            )),
            Self::Text(bytes) => std::str::from_utf8(bytes)
                .map(Some)
                .map_err(|e| Error::MalformedMessage(format!("non-utf8 datum: {}", e))),
        }
    }

    pub fn is_toast(&self) -> bool {
        matches!(self, Self::Toast)
    }
}

/// Ordered column values of one row version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple(pub Vec<Datum>);

impl Tuple {
    pub(crate) fn from_wire(tuple: &WireTuple) -> Self {
        Self(
            tuple
                .tuple_data()
                .iter()
                .map(|data| match data {
                    TupleData::Null => Datum::Null,
                    TupleData::UnchangedToast => Datum::Toast,
                    TupleData::Text(bytes) => Datum::Text(bytes.clone()),
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Row change inside a transaction.
#[derive(Debug, Clone)]
pub struct Change {
    /// Relation the change applies to.
    pub relation: u32,
    pub kind: ChangeKind,
    /// New row image, present for INSERT and UPDATE.
    pub new: Option<Tuple>,
    /// Old row image, present for UPDATE/DELETE when replica
    /// identity supplied one.
    pub old: Option<Tuple>,
    /// Replication origin of the transaction this change belongs to.
    /// Empty for locally-originated writes.
    pub origin: String,
}

impl Change {
    pub(crate) fn insert(insert: InsertBody, origin: &str) -> Self {
        Self {
            relation: insert.rel_id(),
            kind: ChangeKind::Insert,
            new: Some(Tuple::from_wire(insert.tuple())),
            old: None,
            origin: origin.to_owned(),
        }
    }

    pub(crate) fn update(update: UpdateBody, origin: &str) -> Self {
        let old = update
            .old_tuple()
            .or(update.key_tuple())
            .map(Tuple::from_wire);

        Self {
            relation: update.rel_id(),
            kind: ChangeKind::Update,
            new: Some(Tuple::from_wire(update.new_tuple())),
            old,
            origin: origin.to_owned(),
        }
    }

    pub(crate) fn delete(delete: DeleteBody, origin: &str) -> Self {
        let old = delete
            .old_tuple()
            .or(delete.key_tuple())
            .map(Tuple::from_wire);

        Self {
            relation: delete.rel_id(),
            kind: ChangeKind::Delete,
            new: None,
            old,
            origin: origin.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelationColumn {
    pub name: String,
    /// Source-side type OID. Built-in OIDs are stable across clusters.
    pub type_oid: u32,
    /// Part of the replica identity key.
    pub key: bool,
}

/// Relation descriptor, learned from Relation messages and cached
/// for the lifetime of the run.
#[derive(Debug, Clone)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub columns: Vec<RelationColumn>,
}

impl Relation {
    pub(crate) fn from_wire(relation: &RelationBody) -> Result<Self, Error> {
        let namespace = relation
            .namespace()
            .map_err(|e| Error::MalformedMessage(format!("relation namespace: {}", e)))?
            .to_owned();
        let name = relation
            .name()
            .map_err(|e| Error::MalformedMessage(format!("relation name: {}", e)))?
            .to_owned();

        let mut columns = vec![];
        for column in relation.columns() {
            columns.push(RelationColumn {
                name: column
                    .name()
                    .map_err(|e| Error::MalformedMessage(format!("column name: {}", e)))?
                    .to_owned(),
                type_oid: column.type_id() as u32,
                key: column.flags() & 1 == 1,
            });
        }

        Ok(Self {
            id: relation.rel_id(),
            namespace,
            name,
            columns,
        })
    }

    /// Quoted, schema-qualified name.
    pub fn qualified(&self) -> String {
        format!(
            r#""{}"."{}""#,
            quote_ident(&self.namespace),
            quote_ident(&self.name)
        )
    }
}

/// Double any embedded quotes. Callers wrap the result in quotes.
pub fn quote_ident(name: &str) -> String {
    name.replace('"', "\"\"")
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    Begin,
    Commit,
    Change(Change),
    Relation(Relation),
    /// Synthetic caught-up marker injected by the sentinel coordinator.
    Sentinel {
        id: u64,
    },
}

#[derive(Debug, Clone)]
pub struct Message {
    pub lsn: Lsn,
    /// Microseconds since the Postgres epoch; send time for changes,
    /// commit time for transaction boundaries.
    pub timestamp: i64,
    pub body: MessageBody,
}

impl Message {
    pub fn sentinel(id: u64, lsn: Lsn, timestamp: i64) -> Self {
        Self {
            lsn,
            timestamp,
            body: MessageBody::Sentinel { id },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "users");
        assert_eq!(quote_ident(r#"we"ird"#), r#"we""ird"#);
    }

    #[test]
    fn test_datum_text() {
        let datum = Datum::Text(Bytes::from_static(b"42"));
        assert_eq!(datum.as_text().unwrap(), Some("42"));
        assert_eq!(Datum::Null.as_text().unwrap(), None);
        assert!(Datum::Toast.as_text().is_err());
    }
}
