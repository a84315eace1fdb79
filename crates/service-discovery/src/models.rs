//! Data models for service discovery
//!
//! A [`ServiceDescriptor`] is what a registrar announces. It is stored in the
//! coordination service as JSON under a key derived from the descriptor:
//!
//! ```text
//! /<name>/<addr>             (no version)
//! /<name>/<version>/<addr>   (versioned)
//! ```
//!
//! Resolvers turn stored records back into [`AddressEntry`] values keyed by
//! their [`AddressKey`] identity.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One instance of one logical service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Logical service name
    pub name: String,

    /// Network address of this instance (e.g. "10.0.0.1:9000")
    #[serde(rename = "addr")]
    pub address: String,

    /// Load-balancing weight
    pub weight: u32,

    /// Service version, empty when unversioned
    #[serde(default)]
    pub version: String,

    /// Lease time-to-live in seconds
    pub ttl: u64,
}

impl ServiceDescriptor {
    /// Create an unversioned descriptor
    pub fn new(name: impl Into<String>, address: impl Into<String>, weight: u32, ttl: u64) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            weight,
            version: String::new(),
            ttl,
        }
    }

    /// Set the version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Check that the descriptor can be bound under a well-formed key
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidDescriptor("name is empty".to_string()));
        }
        if self.address.is_empty() {
            return Err(Error::InvalidDescriptor("address is empty".to_string()));
        }
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("address", &self.address),
        ] {
            if value.contains('/') {
                return Err(Error::InvalidDescriptor(format!(
                    "{} '{}' must not contain '/'",
                    field, value
                )));
            }
        }
        if self.ttl == 0 {
            return Err(Error::InvalidDescriptor("ttl must be at least 1 second".to_string()));
        }
        Ok(())
    }

    /// Serialize all five fields as a JSON registry record
    ///
    /// Only descriptors that pass [`validate`](Self::validate) are encoded,
    /// so every encoded record decodes back to the same descriptor.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a registry record
    ///
    /// Fails without producing a descriptor if the bytes are not a complete
    /// record or if name/address are empty.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let descriptor: ServiceDescriptor =
            serde_json::from_slice(bytes).map_err(|e| Error::Parse(e.to_string()))?;
        if descriptor.name.is_empty() || descriptor.address.is_empty() {
            return Err(Error::Parse("record without name or address".to_string()));
        }
        Ok(descriptor)
    }

    /// Registry key under which this descriptor is bound
    pub fn key(&self) -> String {
        build_key(&self.name, &self.version, &self.address)
    }

    /// Identity of this instance in an address set
    pub fn identity(&self) -> AddressKey {
        AddressKey {
            name: self.name.clone(),
            version: self.version.clone(),
            address: self.address.clone(),
        }
    }

    /// Address entry handed to consumers
    pub fn to_entry(&self) -> AddressEntry {
        AddressEntry {
            address: self.address.clone(),
            weight: self.weight,
            version: self.version.clone(),
        }
    }
}

/// Build a registry key: `/name/address` or `/name/version/address`
pub fn build_key(name: &str, version: &str, address: &str) -> String {
    if version.is_empty() {
        format!("/{}/{}", name, address)
    } else {
        format!("/{}/{}/{}", name, version, address)
    }
}

/// Parse a registry key back into its parts
///
/// Inverse of [`build_key`]: two segments are `name/address`, three are
/// `name/version/address`.
pub fn parse_key(key: &str) -> Result<KeyParts> {
    let rest = key
        .strip_prefix('/')
        .ok_or_else(|| Error::InvalidKey(key.to_string()))?;
    let segments: Vec<&str> = rest.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidKey(key.to_string()));
    }

    match segments.as_slice() {
        [name, address] => Ok(KeyParts {
            name: name.to_string(),
            version: None,
            address: address.to_string(),
        }),
        [name, version, address] => Ok(KeyParts {
            name: name.to_string(),
            version: Some(version.to_string()),
            address: address.to_string(),
        }),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Partial descriptor recovered from a registry key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    /// Logical service name
    pub name: String,
    /// Version segment, if the key had one
    pub version: Option<String>,
    /// Instance address
    pub address: String,
}

impl KeyParts {
    /// Identity this key addresses in an address set
    pub fn identity(&self) -> AddressKey {
        AddressKey {
            name: self.name.clone(),
            version: self.version.clone().unwrap_or_default(),
            address: self.address.clone(),
        }
    }
}

/// Identity of an address within an address set: `(name, version, address)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressKey {
    /// Logical service name
    pub name: String,
    /// Version, empty when unversioned
    pub version: String,
    /// Instance address
    pub address: String,
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&build_key(&self.name, &self.version, &self.address))
    }
}

/// A live address as seen by the load-balancing layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    /// Network address
    pub address: String,
    /// Load-balancing weight
    pub weight: u32,
    /// Service version, empty when unversioned
    pub version: String,
}
