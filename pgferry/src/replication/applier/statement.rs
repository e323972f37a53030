//! Destination statement templates.
//!
//! Statements are prepared once per shape and bound with text
//! parameters; the server casts each one to the column's type. Big
//! insert batches bypass statements entirely and go through COPY.

use bytes::{BufMut, Bytes, BytesMut};

use super::super::message::{quote_ident, Relation, Tuple};
use super::super::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementOp {
    Insert,
    Update,
    Delete,
}

/// Shape of a statement, not its values. For inserts the where-arity
/// slot carries the row count of the multi-values form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub op: StatementOp,
    pub relation: u32,
    pub set_arity: usize,
    pub where_arity: usize,
}

#[derive(Debug, Clone)]
pub struct CachedStatement {
    pub statement: tokio_postgres::Statement,
    // Column sets behind the arities; toasted columns can change the
    // set at equal arity.
    pub set_columns: Vec<usize>,
    pub where_columns: Vec<usize>,
}

fn column_list(relation: &Relation, indexes: &[usize]) -> String {
    indexes
        .iter()
        .map(|i| format!(r#""{}""#, quote_ident(&relation.columns[*i].name)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholder(position: usize, cast: &str) -> String {
    format!("${}::{}", position, cast)
}

/// Multi-values INSERT for `rows` rows covering every column.
pub fn insert_sql(relation: &Relation, casts: &[String], rows: usize) -> String {
    let columns = (0..relation.columns.len()).collect::<Vec<_>>();
    let mut param = 0;

    let values = (0..rows)
        .map(|_| {
            let row = columns
                .iter()
                .map(|i| {
                    param += 1;
                    placeholder(param, &casts[*i])
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", row)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        relation.qualified(),
        column_list(relation, &columns),
        values
    )
}

/// UPDATE with the given SET and WHERE column sets. Null-safe
/// equality, so REPLICA IDENTITY FULL rows with NULLs still match.
pub fn update_sql(
    relation: &Relation,
    casts: &[String],
    set: &[usize],
    filter: &[usize],
) -> String {
    let mut param = 0;

    let assignments = set
        .iter()
        .map(|i| {
            param += 1;
            format!(
                r#""{}" = {}"#,
                quote_ident(&relation.columns[*i].name),
                placeholder(param, &casts[*i])
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "UPDATE {} SET {} WHERE {}",
        relation.qualified(),
        assignments,
        where_clause(relation, casts, filter, &mut param)
    )
}

pub fn delete_sql(relation: &Relation, casts: &[String], filter: &[usize]) -> String {
    let mut param = 0;

    format!(
        "DELETE FROM {} WHERE {}",
        relation.qualified(),
        where_clause(relation, casts, filter, &mut param)
    )
}

fn where_clause(
    relation: &Relation,
    casts: &[String],
    filter: &[usize],
    param: &mut usize,
) -> String {
    filter
        .iter()
        .map(|i| {
            *param += 1;
            format!(
                r#""{}" IS NOT DISTINCT FROM {}"#,
                quote_ident(&relation.columns[*i].name),
                placeholder(*param, &casts[*i])
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// One text-format COPY line for the tuple.
pub fn encode_copy_row(tuple: &Tuple) -> Result<Bytes, Error> {
    let mut line = BytesMut::new();

    for (i, datum) in tuple.0.iter().enumerate() {
        if i > 0 {
            line.put_u8(b'\t');
        }

        match datum.as_text()? {
            None => line.put_slice(b"\\N"),
            Some(value) => {
                for b in value.bytes() {
                    match b {
                        b'\\' => line.put_slice(b"\\\\"),
                        b'\t' => line.put_slice(b"\\t"),
                        b'\n' => line.put_slice(b"\\n"),
                        b'\r' => line.put_slice(b"\\r"),
                        _ => line.put_u8(b),
                    }
                }
            }
        }
    }

    line.put_u8(b'\n');
    Ok(line.freeze())
}

#[cfg(test)]
mod test {
    use super::super::super::message::{Datum, RelationColumn};
    use super::*;

    fn relation() -> Relation {
        Relation {
            id: 1,
            namespace: "public".into(),
            name: "users".into(),
            columns: vec![
                RelationColumn {
                    name: "id".into(),
                    type_oid: 23,
                    key: true,
                },
                RelationColumn {
                    name: "email".into(),
                    type_oid: 25,
                    key: false,
                },
            ],
        }
    }

    fn casts() -> Vec<String> {
        vec!["int4".into(), "text".into()]
    }

    #[test]
    fn test_insert_sql() {
        let sql = insert_sql(&relation(), &casts(), 2);
        assert_eq!(
            sql,
            r#"INSERT INTO "public"."users" ("id", "email") VALUES ($1::int4, $2::text), ($3::int4, $4::text)"#
        );
    }

    #[test]
    fn test_update_sql() {
        let sql = update_sql(&relation(), &casts(), &[0, 1], &[0]);
        assert_eq!(
            sql,
            r#"UPDATE "public"."users" SET "id" = $1::int4, "email" = $2::text WHERE "id" IS NOT DISTINCT FROM $3::int4"#
        );
    }

    #[test]
    fn test_delete_sql() {
        let sql = delete_sql(&relation(), &casts(), &[0, 1]);
        assert_eq!(
            sql,
            r#"DELETE FROM "public"."users" WHERE "id" IS NOT DISTINCT FROM $1::int4 AND "email" IS NOT DISTINCT FROM $2::text"#
        );
    }

    #[test]
    fn test_encode_copy_row() {
        let tuple = Tuple(vec![
            Datum::Text(Bytes::from_static(b"1")),
            Datum::Null,
            Datum::Text(Bytes::from_static(b"a\tb\nc\\d")),
        ]);
        let line = encode_copy_row(&tuple).unwrap();
        assert_eq!(&line[..], b"1\t\\N\ta\\tb\\nc\\\\d\n");
    }

    #[test]
    fn test_encode_toast_fails() {
        let tuple = Tuple(vec![Datum::Toast]);
        assert!(encode_copy_row(&tuple).is_err());
    }
}
