//! Bounded string metadata bag
//!
//! Provider objects and log rows carry free-form metadata. It is kept as an
//! opaque `String -> String` map with the same limits the provider enforces,
//! and is never used to drive business logic beyond a few well-known keys
//! (`user_id`, `plan`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SharedError;

pub const MAX_METADATA_KEYS: usize = 50;
pub const MAX_METADATA_KEY_LEN: usize = 40;
pub const MAX_METADATA_VALUE_LEN: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Build from an untrusted map, rejecting anything over the limits
    pub fn from_map<I>(entries: I) -> Result<Self, SharedError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            if key.is_empty() || key.chars().count() > MAX_METADATA_KEY_LEN {
                return Err(SharedError::MetadataLimit(format!(
                    "key '{}' must be 1-{} characters",
                    key, MAX_METADATA_KEY_LEN
                )));
            }
            if value.chars().count() > MAX_METADATA_VALUE_LEN {
                return Err(SharedError::MetadataLimit(format!(
                    "value for '{}' exceeds {} characters",
                    key, MAX_METADATA_VALUE_LEN
                )));
            }
            map.insert(key, value);
            if map.len() > MAX_METADATA_KEYS {
                return Err(SharedError::MetadataLimit(format!(
                    "more than {} keys",
                    MAX_METADATA_KEYS
                )));
            }
        }
        Ok(Self(map))
    }

    /// Insert an internally-produced entry. Oversized values are truncated and
    /// inserts past the key limit are dropped.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key: String = key.into().chars().take(MAX_METADATA_KEY_LEN).collect();
        if key.is_empty() || (self.0.len() >= MAX_METADATA_KEYS && !self.0.contains_key(&key)) {
            return;
        }
        let value: String = value.into().chars().take(MAX_METADATA_VALUE_LEN).collect();
        self.0.insert(key, value);
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}
