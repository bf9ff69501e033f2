//! Identifier validation and quoting for table and column names.

use regex::Regex;
use std::sync::OnceLock;

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Is `name` a plain identifier usable as a table, column, or field name?
///
/// # Examples
///
/// ```
/// use rowbroker_core::is_valid_identifier;
///
/// assert!(is_valid_identifier("order_items"));
/// assert!(!is_valid_identifier("1st"));
/// assert!(!is_valid_identifier("users; DROP"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

/// Quote an identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` → `""`).
///
/// # Examples
///
/// ```
/// use rowbroker_core::quote_ident;
///
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
