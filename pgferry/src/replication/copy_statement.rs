//!
//! Generate COPY statements for table data movement.
//!

use super::message::quote_ident;

/// COPY statement generator.
#[derive(Debug, Clone)]
pub struct CopyStatement {
    schema: String,
    name: String,
    columns: Vec<String>,
}

impl CopyStatement {
    /// Statement without a column list: every column, table order.
    pub fn new(schema: &str, name: &str) -> CopyStatement {
        CopyStatement {
            schema: schema.to_owned(),
            name: name.to_owned(),
            columns: vec![],
        }
    }

    /// Statement restricted to the given columns.
    pub fn with_columns(schema: &str, name: &str, columns: &[String]) -> CopyStatement {
        CopyStatement {
            schema: schema.to_owned(),
            name: name.to_owned(),
            columns: columns.to_vec(),
        }
    }

    /// Generate COPY ... TO STDOUT statement.
    pub fn copy_out(&self) -> String {
        self.copy(true)
    }

    /// Generate COPY ... FROM STDIN statement.
    pub fn copy_in(&self) -> String {
        self.copy(false)
    }

    // Generate the statement. Text format: it survives major version
    // differences between source and destination.
    fn copy(&self, out: bool) -> String {
        let columns = if self.columns.is_empty() {
            "".to_string()
        } else {
            format!(
                " ({})",
                self.columns
                    .iter()
                    .map(|c| format!(r#""{}""#, quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };

        format!(
            r#"COPY "{}"."{}"{} {}"#,
            quote_ident(&self.schema),
            quote_ident(&self.name),
            columns,
            if out { "TO STDOUT" } else { "FROM STDIN" }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_copy_stmt() {
        let copy = CopyStatement::new("public", "test");
        assert_eq!(copy.copy_out(), r#"COPY "public"."test" TO STDOUT"#);
        assert_eq!(copy.copy_in(), r#"COPY "public"."test" FROM STDIN"#);
    }

    #[test]
    fn test_copy_stmt_columns() {
        let copy =
            CopyStatement::with_columns("public", "test", &["id".into(), "email".into()]);
        assert_eq!(
            copy.copy_in(),
            r#"COPY "public"."test" ("id", "email") FROM STDIN"#
        );
        assert_eq!(
            copy.copy_out(),
            r#"COPY "public"."test" ("id", "email") TO STDOUT"#
        );
    }
}
