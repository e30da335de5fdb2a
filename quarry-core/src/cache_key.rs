//! Composite cache keys.
//!
//! A key is `entity:variant[:k=v...]` with params sorted, so two logically
//! equal keys always render to the same bytes. Separators inside a component
//! are percent-escaped in the rendered form, so `BRK:A` and `BRK_A` stay
//! distinct. LMDB rejects keys longer than 511 bytes; those are stored under
//! a SHA-256 digest instead.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ConfigError;

/// Longest rendered key stored verbatim. Matches LMDB's default max key size.
pub const MAX_STORED_KEY_LEN: usize = 511;

const SEPARATOR: char = ':';
const HASHED_PREFIX: &str = "h:";

/// Identifies one logical cached unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    entity: String,
    variant: String,
    params: BTreeMap<String, String>,
}

const ESCAPES: [(char, &str); 3] = [('%', "%25"), (':', "%3A"), ('=', "%3D")];

fn escape_into(out: &mut String, component: &str) {
    for c in component.chars() {
        match ESCAPES.iter().find(|(raw, _)| *raw == c) {
            Some((_, escaped)) => out.push_str(escaped),
            None => out.push(c),
        }
    }
}

/// Inverse of `escape_into`. Any `%` not starting a known escape is rejected.
fn unescape(component: &str) -> Option<String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let (raw, escaped) = ESCAPES
            .iter()
            .find(|(_, escaped)| tail.starts_with(escaped))?;
        out.push(*raw);
        rest = &tail[escaped.len()..];
    }
    out.push_str(rest);
    Some(out)
}

impl CacheKey {
    /// Build a key from an entity (symbol, series id, ...) and a variant
    /// (`daily`, `fundamentals`, ...). Surrounding whitespace is trimmed.
    pub fn new(entity: impl AsRef<str>, variant: impl AsRef<str>) -> Self {
        Self {
            entity: entity.as_ref().trim().to_string(),
            variant: variant.as_ref().trim().to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Add a scoping parameter. A repeated name overwrites the earlier value.
    pub fn with_param(mut self, name: impl AsRef<str>, value: impl fmt::Display) -> Self {
        self.params
            .insert(name.as_ref().trim().to_string(), value.to_string().trim().to_string());
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Human-readable form, `entity:variant[:k=v...]`.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.entity.len() + self.variant.len() + 1);
        escape_into(&mut out, &self.entity);
        out.push(SEPARATOR);
        escape_into(&mut out, &self.variant);
        for (name, value) in &self.params {
            out.push(SEPARATOR);
            escape_into(&mut out, name);
            out.push('=');
            escape_into(&mut out, value);
        }
        out
    }

    /// Parse a rendered key. Returns `None` for anything `render` could not
    /// have produced.
    pub fn parse(rendered: &str) -> Option<Self> {
        let mut parts = rendered.split(SEPARATOR);
        let entity = parts.next().filter(|s| !s.is_empty())?;
        let variant = parts.next().filter(|s| !s.is_empty())?;

        let mut params = BTreeMap::new();
        for part in parts {
            let (name, value) = part.split_once('=')?;
            if name.is_empty() || value.contains('=') {
                return None;
            }
            params.insert(unescape(name)?, unescape(value)?);
        }

        Some(Self {
            entity: unescape(entity)?,
            variant: unescape(variant)?,
            params,
        })
    }

    /// Bytes used as the physical key in both tiers.
    pub fn storage_key(&self) -> String {
        let rendered = self.render();
        if rendered.len() <= MAX_STORED_KEY_LEN {
            return rendered;
        }
        let digest = Sha256::digest(rendered.as_bytes());
        format!("{}{}", HASHED_PREFIX, hex::encode(digest))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for CacheKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheKey::parse(s).ok_or_else(|| ConfigError::InvalidValue {
            field: "cache_key".to_string(),
            value: s.to_string(),
            reason: "expected entity:variant[:name=value...]".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sorts_params() {
        let a = CacheKey::new("AAPL", "daily")
            .with_param("start", "2024-01-01")
            .with_param("interval", "1d");
        let b = CacheKey::new("AAPL", "daily")
            .with_param("interval", "1d")
            .with_param("start", "2024-01-01");
        assert_eq!(a.render(), "AAPL:daily:interval=1d:start=2024-01-01");
        assert_eq!(a, b);
    }

    #[test]
    fn test_plain_key() {
        let key = CacheKey::new("AAPL", "daily");
        assert_eq!(key.to_string(), "AAPL:daily");
        assert_eq!(key.storage_key(), "AAPL:daily");
        assert_eq!(key.param("interval"), None);
    }

    #[test]
    fn test_separators_are_escaped() {
        let key = CacheKey::new("BRK:B", "daily").with_param("a=b", "c:d%");
        assert_eq!(key.render(), "BRK%3AB:daily:a%3Db=c%3Ad%25");
        assert_eq!(key.entity(), "BRK:B");
        assert_eq!(CacheKey::parse(&key.render()), Some(key));
    }

    #[test]
    fn test_escaped_entities_do_not_collide() {
        let colon = CacheKey::new("BRK:A", "daily");
        let underscore = CacheKey::new("BRK_A", "daily");
        assert_ne!(colon.render(), underscore.render());
        assert_ne!(colon.storage_key(), underscore.storage_key());

        let eq = CacheKey::new("X", "daily").with_param("a", "b=c");
        let under = CacheKey::new("X", "daily").with_param("a", "b_c");
        assert_ne!(eq.storage_key(), under.storage_key());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(CacheKey::parse("").is_none());
        assert!(CacheKey::parse("AAPL").is_none());
        assert!(CacheKey::parse("AAPL:").is_none());
        assert!(CacheKey::parse("AAPL:daily:novalue").is_none());
        assert!(CacheKey::parse("AAPL:daily:=x").is_none());
        assert!(CacheKey::parse("AAPL%:daily").is_none());
        assert!(CacheKey::parse("AAPL%4:daily").is_none());
        assert!("AAPL_daily".parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_long_keys_are_hashed() {
        let key = CacheKey::new("SERIES", "economic").with_param("ids", "X".repeat(600));
        let stored = key.storage_key();
        assert!(stored.starts_with("h:"));
        assert_eq!(stored.len(), 2 + 64);
        assert_eq!(stored, key.clone().storage_key());
    }
}
