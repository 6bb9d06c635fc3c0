//! Fingerprints — deterministic cache keys over configuration and data identity.
//!
//! A fingerprint is the BLAKE3 hash of a canonical JSON document:
//! `{ "version", "namespace", "fields" }`. Fields live in a `BTreeMap` and
//! `serde_json` objects are key-sorted, so the order in which fields are
//! added never changes the result.

use crate::domain::{DatasetHash, Fingerprint};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Bump when the meaning of a cached payload changes.
pub const FINGERPRINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
#[error("failed to serialize fingerprint field '{field}': {source}")]
pub struct FingerprintError {
    pub field: String,
    #[source]
    pub source: serde_json::Error,
}

/// Accumulates named fields and hashes them in canonical order.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    namespace: String,
    fields: BTreeMap<String, Value>,
}

impl FingerprintBuilder {
    /// `namespace` separates payload types (e.g. "eligibility", "preselection").
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field<T: Serialize + ?Sized>(mut self, key: &str, value: &T) -> Result<Self, FingerprintError> {
        let value = serde_json::to_value(value).map_err(|source| FingerprintError {
            field: key.to_string(),
            source,
        })?;
        self.fields.insert(key.to_string(), value);
        Ok(self)
    }

    /// Identity of the data slice the payload was computed from.
    pub fn data(mut self, key: &str, hash: &DatasetHash) -> Self {
        self.fields
            .insert(key.to_string(), Value::String(hash.0.clone()));
        self
    }

    pub fn build(self) -> Fingerprint {
        let doc = serde_json::json!({
            "version": FINGERPRINT_VERSION,
            "namespace": self.namespace,
            "fields": self.fields,
        });
        Fingerprint::from_bytes(doc.to_string().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preselection::FactorMethod;

    #[test]
    fn field_order_does_not_matter() {
        let a = FingerprintBuilder::new("preselection")
            .field("top_k", &10)
            .unwrap()
            .field("lookback", &252)
            .unwrap()
            .build();
        let b = FingerprintBuilder::new("preselection")
            .field("lookback", &252)
            .unwrap()
            .field("top_k", &10)
            .unwrap()
            .build();
        assert_eq!(a, b);
    }

    #[test]
    fn namespace_separates_payloads() {
        let a = FingerprintBuilder::new("eligibility").field("x", &1).unwrap().build();
        let b = FingerprintBuilder::new("preselection").field("x", &1).unwrap().build();
        assert_ne!(a, b);
    }

    #[test]
    fn parameters_and_data_both_matter() {
        let base = || {
            FingerprintBuilder::new("preselection")
                .field(
                    "method",
                    &FactorMethod::Combined {
                        momentum_weight: 0.5,
                        low_vol_weight: 0.5,
                    },
                )
                .unwrap()
        };
        let h1 = DatasetHash::from_hash("aaa");
        let h2 = DatasetHash::from_hash("bbb");

        assert_eq!(base().data("slice", &h1).build(), base().data("slice", &h1).build());
        assert_ne!(base().data("slice", &h1).build(), base().data("slice", &h2).build());

        let other = FingerprintBuilder::new("preselection")
            .field(
                "method",
                &FactorMethod::Combined {
                    momentum_weight: 0.6,
                    low_vol_weight: 0.4,
                },
            )
            .unwrap()
            .data("slice", &h1)
            .build();
        assert_ne!(base().data("slice", &h1).build(), other);
    }
}
