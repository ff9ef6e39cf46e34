//! Quoting for dynamically generated schema/table/column names. Every
//! identifier interpolated into runtime DDL or queries goes through here.

/// Double-quotes an identifier, doubling embedded quotes. NUL bytes cannot be
/// represented in postgres identifiers at all, so they are stripped.
pub fn quote_ident(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| *c != '\0').collect();
    format!("\"{}\"", cleaned.replace('"', "\"\""))
}

pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Single-quoted SQL string literal with embedded quotes doubled. Used for
/// constant strings (external ids in payload projections), never for user
/// filter values, which are always bound as parameters.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Lowercases and squeezes an external id into `[a-z0-9_]+` so it can be used
/// as a human-readable suffix of a physical column name.
pub fn ident_slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_and_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident("nul\0byte"), "\"nulbyte\"");
        assert_eq!(
            quote_qualified("sch", "tbl"),
            "\"sch\".\"tbl\""
        );
    }

    #[test]
    fn slug_squeezes_non_alphanumerics() {
        assert_eq!(ident_slug("Room Temperature"), "room_temperature");
        assert_eq!(ident_slug("a--b__c"), "a_b_c");
        assert_eq!(ident_slug("__leading"), "leading");
        assert_eq!(ident_slug("trailing!!"), "trailing");
    }
}
