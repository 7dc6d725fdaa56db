//! Cache key derivation
//!
//! Turns the arguments of a wrapped call into a stable SHA-256 key. Positional
//! arguments keep their order, keyword arguments are sorted by name, so two
//! calls with the same arguments always map to the same key regardless of the
//! order keywords were supplied in or the process that computed it.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Keyword that disables caching when set to `true`
pub const STREAM_FLAG: &str = "stream";

const PART_DELIMITER: &str = "|";

/// Arguments of one wrapped call
///
/// ```rust
/// use recommender_cache::CallArgs;
///
/// let args = CallArgs::new()
///     .arg("We need invoicing and a CRM")
///     .kwarg("industry", "retail")
///     .kwarg("stream", false);
/// assert!(!args.is_stream());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<serde_json::Value>,
    keyword: BTreeMap<String, serde_json::Value>,
}

impl CallArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg<T: Serialize + std::fmt::Debug>(mut self, value: T) -> Self {
        self.positional.push(arg_value(&value));
        self
    }

    /// Set a keyword argument, replacing any earlier value under that name
    #[must_use]
    pub fn kwarg<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: Serialize + std::fmt::Debug,
    {
        self.keyword.insert(name.into(), arg_value(&value));
        self
    }

    #[must_use]
    pub fn positional(&self) -> &[serde_json::Value] {
        &self.positional
    }

    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&serde_json::Value> {
        self.keyword.get(name)
    }

    /// Whether the caller asked for a streamed (uncacheable) response
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self.keyword.get(STREAM_FLAG), Some(serde_json::Value::Bool(true)))
    }
}

/// Convert an argument for key material, falling back to its `Debug` text
fn arg_value<T: Serialize + std::fmt::Debug>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|_| serde_json::Value::String(format!("{value:?}")))
}

/// Render a value the way it appears inside the key string
///
/// Strings are written bare so `"CRM"` and `CRM` produce the same part.
fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Derives cache keys from call arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyCodec;

impl KeyCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Key for `args`, 64 lowercase hex characters
    #[must_use]
    pub fn derive_key(&self, args: &CallArgs) -> String {
        self.derive_namespaced_key("", args)
    }

    /// Key for `args` scoped to `namespace` (usually the operation name)
    ///
    /// Two operations called with identical arguments get distinct keys.
    #[must_use]
    pub fn derive_namespaced_key(&self, namespace: &str, args: &CallArgs) -> String {
        let capacity = 1 + args.positional.len() + args.keyword.len();
        let mut parts: Vec<String> = Vec::with_capacity(capacity);
        if !namespace.is_empty() {
            parts.push(namespace.to_string());
        }
        parts.extend(args.positional.iter().map(render));
        // BTreeMap iteration is already sorted by name
        parts.extend(args.keyword.iter().map(|(name, value)| format!("{name}:{}", render(value))));

        let mut hasher = Sha256::new();
        hasher.update(parts.join(PART_DELIMITER).as_bytes());
        format!("{:x}", hasher.finalize())
    }
}
