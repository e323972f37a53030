//! Split SQL scripts into statements.
//!
//! pg_dump output is one big script: statements separated by
//! semicolons, function bodies in dollar quotes, psql meta-commands
//! and comments in between. Statements must be split without
//! mistaking a `;` inside a dollar-quoted body for a separator.

/// Split a script into executable statements. Line comments and
/// `\`-meta-commands are stripped; block comments stay in place.
pub fn split(script: &str) -> Vec<String> {
    let mut statements = vec![];
    let mut current = String::new();

    let bytes = script.as_bytes();
    let mut i = 0;
    let mut line_start = true;

    while i < bytes.len() {
        let c = bytes[i] as char;

        // psql meta-command: a line starting with a backslash.
        if line_start && c == '\\' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        if c != ' ' && c != '\t' {
            line_start = c == '\n';
        }

        match c {
            '-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }

            '/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = block_comment_end(bytes, i);
                current.push_str(&script[i..end]);
                i = end;
            }

            '\'' => {
                // E'...' prefix: a standalone E, not the tail of an
                // identifier like date'...'.
                let escaped = {
                    let mut rev = current.chars().rev();
                    match rev.next() {
                        Some(p) if p == 'e' || p == 'E' => {
                            !matches!(rev.next(), Some(q) if q.is_ascii_alphanumeric() || q == '_')
                        }
                        _ => false,
                    }
                };
                let end = string_end(bytes, i, escaped);
                current.push_str(&script[i..end]);
                i = end;
            }

            '"' => {
                let end = ident_end(bytes, i);
                current.push_str(&script[i..end]);
                i = end;
            }

            '$' => {
                if let Some(tag_end) = dollar_tag(bytes, i) {
                    let tag = &script[i..tag_end];
                    let end = dollar_end(script, tag_end, tag);
                    current.push_str(&script[i..end]);
                    i = end;
                } else {
                    current.push(c);
                    i += 1;
                }
            }

            ';' => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
                i += 1;
            }

            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }

    statements
}

// Position right after the closing `*/`, honoring nesting.
fn block_comment_end(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0;
    let mut i = start;

    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                break;
            }
        } else {
            i += 1;
        }
    }

    i
}

// Position right after the closing quote. `''` stays inside the
// string; backslash escapes only count in E-strings.
fn string_end(bytes: &[u8], start: usize, escaped: bool) -> usize {
    let mut i = start + 1;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' if escaped => i += 2,
            b'\'' => {
                if bytes.get(i + 1) == Some(&b'\'') {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }

    i
}

// Position right after the closing double quote of an identifier.
fn ident_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;

    while i < bytes.len() {
        if bytes[i] == b'"' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
            } else {
                return i + 1;
            }
        } else {
            i += 1;
        }
    }

    i
}

// If a dollar-quote delimiter starts here, return the position right
// after its closing `$`. Tags are `$$` or `$tag$`; a tag starts with
// a letter or underscore, so `$1` placeholders don't match.
fn dollar_tag(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'$' {
            return Some(i + 1);
        }
        let first = i == start + 1;
        let tag_char = if first {
            c.is_ascii_alphabetic() || c == b'_'
        } else {
            c.is_ascii_alphanumeric() || c == b'_'
        };
        if !tag_char {
            return None;
        }
        i += 1;
    }

    None
}

// Position right after the matching closing tag.
fn dollar_end(script: &str, body_start: usize, tag: &str) -> usize {
    match script[body_start..].find(tag) {
        Some(offset) => body_start + offset + tag.len(),
        None => script.len(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_simple_statements() {
        let script = "CREATE TABLE a (id int);\nCREATE TABLE b (id int);\n";
        let statements = split(script);
        assert_eq!(
            statements,
            vec!["CREATE TABLE a (id int)", "CREATE TABLE b (id int)"]
        );
    }

    #[test]
    fn test_dollar_quoted_body() {
        let script = r#"
CREATE FUNCTION bump() RETURNS trigger AS $$
BEGIN
  UPDATE t SET n = n + 1; RETURN NEW;
END;
$$ LANGUAGE plpgsql;
SELECT 1;
"#;
        let statements = split(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("UPDATE t SET n = n + 1; RETURN NEW;"));
        assert_eq!(statements[1], "SELECT 1");
    }

    #[test]
    fn test_tagged_dollar_quotes() {
        let script = r#"
CREATE FUNCTION f() RETURNS text AS $fn$
SELECT $inner$ a; b $inner$;
$fn$ LANGUAGE sql;
"#;
        let statements = split(script);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("$inner$ a; b $inner$"));
    }

    #[test]
    fn test_meta_commands_and_comments() {
        let script = "\\connect app\n-- a comment; with semicolon\nCREATE TABLE a (id int);\n\\.\n";
        let statements = split(script);
        assert_eq!(statements, vec!["CREATE TABLE a (id int)"]);
    }

    #[test]
    fn test_quoted_semicolons() {
        let script = r#"INSERT INTO t VALUES ('a;b', 'it''s;'); SELECT ";" FROM "we;ird";"#;
        let statements = split(script);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], r#"INSERT INTO t VALUES ('a;b', 'it''s;')"#);
        assert_eq!(statements[1], r#"SELECT ";" FROM "we;ird""#);
    }

    #[test]
    fn test_escape_string() {
        let script = r#"SELECT E'a\';b'; SELECT 2;"#;
        let statements = split(script);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], r#"SELECT E'a\';b'"#);
    }

    #[test]
    fn test_block_comment() {
        let script = "CREATE /* nested /* ; */ still; */ TABLE a (id int);";
        let statements = split(script);
        assert_eq!(statements.len(), 1);
        assert!(statements[0].starts_with("CREATE"));
        assert!(statements[0].ends_with("TABLE a (id int)"));
    }

    #[test]
    fn test_trailing_statement_without_semicolon() {
        let statements = split("SELECT 1");
        assert_eq!(statements, vec!["SELECT 1"]);
    }

    #[test]
    fn test_positional_params_are_not_tags() {
        let statements = split("PREPARE q AS SELECT $1::int; EXECUTE q(1);");
        assert_eq!(
            statements,
            vec!["PREPARE q AS SELECT $1::int", "EXECUTE q(1)"]
        );
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Joining plain statements with ';' and splitting again
            // is the identity.
            #[test]
            fn split_rejoins(statements in proptest::collection::vec("[a-zA-Z0-9_ ,()=]{1,40}", 1..8)) {
                let script = statements
                    .iter()
                    .map(|s| format!("{};", s))
                    .collect::<String>();

                let expected = statements
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>();

                prop_assert_eq!(split(&script), expected);
            }

            // A dollar-quoted body survives splitting verbatim, no
            // matter what it contains.
            #[test]
            fn dollar_quotes_opaque(body in "[a-zA-Z0-9_ ;'\"\n]{0,60}") {
                let script = format!("SELECT $q${}$q$;SELECT 2;", body);
                let statements = split(&script);

                prop_assert_eq!(statements.len(), 2);
                prop_assert!(statements[0].contains(&format!("$q${}$q$", body)));
            }
        }
    }
}
