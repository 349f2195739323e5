//! Identity types for peerlog.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length in bytes of content-derived identifiers.
const ID_LENGTH: usize = 32;

fn hash_parts(label: &[u8], parts: &[&[u8]]) -> [u8; ID_LENGTH] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    for part in parts {
        // Length-prefix each part so adjacent fields cannot be shifted
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut bytes = [0u8; ID_LENGTH];
    bytes.copy_from_slice(&result);
    bytes
}

fn copy_id(bytes: &[u8]) -> Option<[u8; ID_LENGTH]> {
    if bytes.len() == ID_LENGTH {
        let mut arr = [0u8; ID_LENGTH];
        arr.copy_from_slice(bytes);
        Some(arr)
    } else {
        None
    }
}

/// A unique identifier for a group of related messages.
///
/// Derived from the owning client, its major version and the group
/// descriptor, so every peer computes the same id for the same group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId([u8; ID_LENGTH]);

impl GroupId {
    /// Derive a GroupId from the group's client, version and descriptor.
    pub fn derive(client_id: &ClientId, major_version: u32, descriptor: &[u8]) -> Self {
        Self(hash_parts(
            b"peerlog-group-id-v1",
            &[
                client_id.as_str().as_bytes(),
                &major_version.to_be_bytes(),
                descriptor,
            ],
        ))
    }

    /// Create a random GroupId (for testing).
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }

    /// Create a GroupId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        copy_id(bytes).map(Self)
    }

    /// Get the raw bytes of this GroupId.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", &self.to_string()[..8])
    }
}

/// A content-derived identifier for a message.
///
/// Two peers holding the same (group, timestamp, body) agree on the id
/// without coordination.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId([u8; ID_LENGTH]);

impl MessageId {
    /// Derive a MessageId from the message content.
    pub fn derive(group_id: &GroupId, timestamp: u64, body: &[u8]) -> Self {
        Self(hash_parts(
            b"peerlog-message-id-v1",
            &[group_id.as_bytes(), &timestamp.to_be_bytes(), body],
        ))
    }

    /// Create a MessageId from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        copy_id(bytes).map(Self)
    }

    /// Get the raw bytes of this MessageId.
    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", &self.to_string()[..8])
    }
}

/// Identifies the application module that owns a group.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a ClientId, e.g. `"org.peerlog.forum"`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string form of this ClientId.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

/// A client together with the major version of its schema.
///
/// Selects the validator and delivery hook for all messages in a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientMajorVersion {
    /// The owning client.
    pub client_id: ClientId,
    /// Major version of the client's message schema.
    pub major_version: u32,
}

impl ClientMajorVersion {
    /// Create a new key.
    pub fn new(client_id: ClientId, major_version: u32) -> Self {
        Self {
            client_id,
            major_version,
        }
    }
}

impl fmt::Display for ClientMajorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.major_version)
    }
}

/// Identifies the contact a message was received from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(u32);

impl ContactId {
    /// Create a ContactId with the given value.
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the numeric value of this ContactId.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
