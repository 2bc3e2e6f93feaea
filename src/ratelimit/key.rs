//! Identifier sanitization and storage key generation.

use std::sync::Arc;

/// Builds the per-identifier part of a storage key from a sanitized
/// identifier and an optional namespace.
pub type KeyGenerator = Arc<dyn Fn(&str, Option<&str>) -> String + Send + Sync>;

/// Replace every character outside `[a-zA-Z0-9._-]` with `_`.
///
/// Keeps caller-supplied identifiers from smuggling `:` separators into the
/// storage key and addressing another namespace's bucket.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `namespace:identifier`, or the bare identifier without a namespace.
pub fn default_key(identifier: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(namespace) => format!("{}:{}", namespace, identifier),
        None => identifier.to_string(),
    }
}

/// The default [`KeyGenerator`].
pub fn default_key_generator() -> KeyGenerator {
    Arc::new(default_key)
}

/// Join a key prefix and a generated key into the full storage key.
pub fn storage_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}
