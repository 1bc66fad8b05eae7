//! Idempotency key construction.
//!
//! Keys are opaque to the coordination engine. This module offers a validated
//! newtype plus a pure derivation helper that turns tagged request components
//! into a deterministic key, so callers never need reflection or request
//! introspection inside the core.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::constants::MAX_KEY_LENGTH;
use crate::error::{IdempotencyError, IdempotencyResult};

/// A validated idempotency key (1..=256 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Validate and wrap a caller-supplied key.
    pub fn new(key: impl Into<String>) -> IdempotencyResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(IdempotencyError::invalid_argument(
                "key",
                "idempotency key must not be empty",
            ));
        }
        if key.chars().count() > MAX_KEY_LENGTH {
            return Err(IdempotencyError::invalid_argument(
                "key",
                format!("idempotency key must be at most {} characters", MAX_KEY_LENGTH),
            ));
        }
        Ok(Self(key))
    }

    /// Derive a key from the SHA-256 fingerprint of a serializable value.
    pub fn from_fingerprint<T: Serialize + ?Sized>(value: &T) -> IdempotencyResult<Self> {
        Ok(Self(fingerprint(value)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One tagged piece of a request that contributes to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyComponent {
    pub name: String,
    /// Explicit position; components without one sort before ordered ones.
    pub order: Option<i32>,
    pub value: String,
}

/// Builds a key from tagged components.
///
/// Components are sorted by `order` (unordered first), then by `name`, and
/// their values joined with `.`.
///
/// ```
/// use idemp_core::KeyBuilder;
///
/// let key = KeyBuilder::new()
///     .component("amount", None, 250)
///     .component("account", Some(1), "acc-9")
///     .component("reference", Some(0), "ref-1")
///     .build()
///     .unwrap();
/// assert_eq!(key.as_str(), "250.ref-1.acc-9");
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    components: Vec<KeyComponent>,
}

impl KeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component.
    pub fn component(
        mut self,
        name: impl Into<String>,
        order: Option<i32>,
        value: impl fmt::Display,
    ) -> Self {
        self.components.push(KeyComponent {
            name: name.into(),
            order,
            value: value.to_string(),
        });
        self
    }

    /// Number of components collected so far.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Produce the key. Fails if no components were supplied.
    pub fn build(mut self) -> IdempotencyResult<IdempotencyKey> {
        self.components.sort_by(|a, b| {
            let rank = |c: &KeyComponent| (c.order.is_some(), c.order.unwrap_or_default());
            rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
        });
        let joined = self
            .components
            .iter()
            .map(|c| c.value.as_str())
            .collect::<Vec<_>>()
            .join(".");
        IdempotencyKey::new(joined)
    }
}

/// Hex SHA-256 of the JSON encoding of `value`.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> IdempotencyResult<String> {
    let encoded = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_validation() {
        assert!(IdempotencyKey::new("").unwrap_err().is_invalid_argument());
        assert!(IdempotencyKey::new("a".repeat(MAX_KEY_LENGTH)).is_ok());
        assert!(IdempotencyKey::new("a".repeat(MAX_KEY_LENGTH + 1))
            .unwrap_err()
            .is_invalid_argument());
    }

    #[test]
    fn test_builder_orders_by_order_then_name() {
        let key = KeyBuilder::new()
            .component("zeta", None, "z")
            .component("alpha", None, "a")
            .component("second", Some(2), "s")
            .component("first", Some(1), "f")
            .build()
            .unwrap();
        assert_eq!(key.as_str(), "a.z.f.s");
    }

    #[test]
    fn test_builder_unordered_component_leads() {
        let key = KeyBuilder::new()
            .component("Amount", Some(1), 250)
            .component("Reference", None, "ref-1")
            .build()
            .unwrap();
        assert_eq!(key.as_str(), "ref-1.250");
    }

    #[test]
    fn test_builder_negative_orders_sort_first() {
        let key = KeyBuilder::new()
            .component("b", Some(0), "zero")
            .component("a", Some(-1), "neg")
            .build()
            .unwrap();
        assert_eq!(key.as_str(), "neg.zero");
    }

    #[test]
    fn test_builder_without_components_fails() {
        assert!(KeyBuilder::new().build().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint(&json!({"amount": 10})).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(&json!({"amount": 10})).unwrap());
        assert_ne!(fp, fingerprint(&json!({"amount": 11})).unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: the derived key does not depend on insertion order.
        #[test]
        fn prop_builder_is_insertion_order_independent(
            parts in proptest::collection::btree_map("[a-z]{1,6}", (any::<Option<i8>>(), "[a-z0-9]{1,6}"), 1..6),
        ) {
            let forward = parts.iter().fold(KeyBuilder::new(), |b, (name, (order, value))| {
                b.component(name.clone(), order.map(i32::from), value)
            });
            let backward = parts.iter().rev().fold(KeyBuilder::new(), |b, (name, (order, value))| {
                b.component(name.clone(), order.map(i32::from), value)
            });

            prop_assert_eq!(forward.build().unwrap(), backward.build().unwrap());
        }
    }
}
