//! Query-language hygiene for the remote API.
//!
//! Folder-scoped lookups interpolate caller-supplied ids and filenames into
//! the provider's query string. Ids are restricted to the provider's legal
//! id alphabet and names are escaped, so a crafted folder URL or filename
//! cannot smuggle extra query terms.

use crate::error::{RemoteError, SyncErrorCode};

/// Checks that an object id contains only legal id characters.
///
/// Drive ids are URL-safe base64-ish: letters, digits, `-`, `_`.
pub fn sanitize_id(id: &str) -> Result<&str, RemoteError> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RemoteError::new(
            SyncErrorCode::NotFound,
            "Malformed remote object id",
        ));
    }
    Ok(id)
}

/// Escapes a filename for interpolation inside single quotes in a query.
pub fn escape_name(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_ids_pass_through() {
        assert_eq!(sanitize_id("1AbC-d_9xYz").unwrap(), "1AbC-d_9xYz");
    }

    #[test]
    fn test_injection_attempts_rejected() {
        assert!(sanitize_id("").is_err());
        assert!(sanitize_id("abc' or name contains 'x").is_err());
        assert!(sanitize_id("abc def").is_err());
        assert!(sanitize_id("abc/../def").is_err());
    }

    #[test]
    fn test_name_escaping() {
        assert_eq!(escape_name("ledger.db"), "ledger.db");
        assert_eq!(escape_name("it's.db"), "it\\'s.db");
        assert_eq!(escape_name(r"back\slash"), r"back\\slash");
        // Escaping backslashes first keeps a crafted name from un-escaping
        // the quote escape
        assert_eq!(escape_name(r"a\'b"), r"a\\\'b");
    }
}
