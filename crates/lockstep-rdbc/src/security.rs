//! Identifier handling for generated SQL.
//!
//! Names that come from configuration (trigger, function and bookkeeping table
//! names) are validated strictly. Names that come from the catalog may contain
//! anything PostgreSQL allows and are always emitted double-quoted.

use crate::error::Error;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a configured SQL identifier.
///
/// Rules:
/// - Must not be empty
/// - At most 63 bytes
/// - Must start with ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters and underscores
///
/// # Examples
///
/// ```
/// use lockstep_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("lockstep_capture").is_ok());
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::config("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::config(format!(
            "SQL identifier too long: {} bytes (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    for c in chars {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(Error::config(format!(
                "Invalid SQL identifier '{}': contains invalid character '{}'",
                name, c
            )));
        }
    }

    Ok(())
}

/// Validate a `schema.name` pair where both parts are configured identifiers.
///
/// Returns the two parts on success.
pub fn validate_qualified_identifier(name: &str) -> crate::Result<(&str, &str)> {
    let (schema, table) = name.split_once('.').ok_or_else(|| {
        Error::config(format!(
            "Invalid qualified name '{}': expected 'schema.name'",
            name
        ))
    })?;
    validate_sql_identifier(schema)?;
    validate_sql_identifier(table)?;
    Ok((schema, table))
}

/// Quote an identifier for PostgreSQL, doubling embedded double quotes.
///
/// ```
/// use lockstep_rdbc::security::quote_identifier;
///
/// assert_eq!(quote_identifier("orders"), "\"orders\"");
/// assert_eq!(quote_identifier("odd\"name"), "\"odd\"\"name\"");
/// ```
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a schema-qualified name as `"schema"."name"`.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(name))
}

/// Escape a string value for interpolation into a single-quoted SQL literal.
///
/// Prefer bind parameters. This exists for statements that cannot take
/// parameters, such as `SET LOCAL`.
pub fn escape_string_literal(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_length_limit() {
        let ok = "a".repeat(MAX_IDENTIFIER_LEN);
        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_sql_identifier(&ok).is_ok());
        assert!(validate_sql_identifier(&too_long).is_err());
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("public", "orders"), "\"public\".\"orders\"");
        assert_eq!(
            quote_qualified("Sales", "Order Items"),
            "\"Sales\".\"Order Items\""
        );
    }

    #[test]
    fn test_validate_qualified_identifier() {
        assert_eq!(
            validate_qualified_identifier("lockstep.index_snapshots").unwrap(),
            ("lockstep", "index_snapshots")
        );
        assert!(validate_qualified_identifier("index_snapshots").is_err());
        assert!(validate_qualified_identifier("a.b;drop").is_err());
    }
}
