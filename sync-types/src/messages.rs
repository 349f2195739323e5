//! Messages, groups and the data the validation pipeline attaches to them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{ClientId, ClientMajorVersion, GroupId, MessageId, SyncError};

/// A named bucket of related messages owned by one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Content-derived group identifier.
    pub id: GroupId,
    /// Client whose validator and hook govern this group.
    pub client_id: ClientId,
    /// Major version of the client's schema.
    pub major_version: u32,
    /// Opaque client-defined descriptor.
    pub descriptor: Vec<u8>,
}

impl Group {
    /// Create a group, deriving its id.
    pub fn new(client_id: ClientId, major_version: u32, descriptor: Vec<u8>) -> Self {
        let id = GroupId::derive(&client_id, major_version, &descriptor);
        Self {
            id,
            client_id,
            major_version,
            descriptor,
        }
    }

    /// The registry key selecting this group's validator and hook.
    pub fn client_major_version(&self) -> ClientMajorVersion {
        ClientMajorVersion::new(self.client_id.clone(), self.major_version)
    }
}

/// An immutable message belonging to exactly one group.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Content-derived message identifier.
    pub id: MessageId,
    /// Group this message belongs to.
    pub group_id: GroupId,
    /// Author-assigned timestamp (milliseconds since the Unix epoch).
    pub timestamp: u64,
    /// Opaque body, interpreted only by the group's client.
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message, deriving its id from the content.
    pub fn new(group_id: GroupId, timestamp: u64, body: Vec<u8>) -> Self {
        let id = MessageId::derive(&group_id, timestamp, &body);
        Self {
            id,
            group_id,
            timestamp,
            body,
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("group_id", &self.group_id)
            .field("timestamp", &self.timestamp)
            .field("body", &format!("[{} bytes]", self.body.len()))
            .finish()
    }
}

/// Validation and delivery state of a stored message.
///
/// Transitions: `Unknown → Pending → {Delivered, Invalid}`. A `Delivered`
/// message can still be forced to `Invalid` by a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageState {
    /// Not yet validated, or (as a dependency) missing or in another group.
    Unknown = 0,
    /// Rejected; body and metadata have been erased.
    Invalid = 1,
    /// Validated but waiting on dependencies or a deferring hook.
    Pending = 2,
    /// Delivered to the owning client.
    Delivered = 3,
}

impl MessageState {
    /// Stable integer code used for persistence.
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageState {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageState::Unknown),
            1 => Ok(MessageState::Invalid),
            2 => Ok(MessageState::Pending),
            3 => Ok(MessageState::Delivered),
            _ => Err(SyncError::UnknownState(value)),
        }
    }
}

/// Opaque key/value data attached to a message.
///
/// Merged into storage rather than overwritten. An empty value is the
/// removal marker: merging it deletes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(BTreeMap<String, Vec<u8>>);

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key. Passing an empty value marks the key for removal.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    /// Mark a key for removal on the next merge.
    pub fn remove_on_merge(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), Vec::new());
    }

    /// Builder-style [`Metadata::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl FromIterator<(String, Vec<u8>)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Output of a successful validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    /// Metadata to merge into storage.
    pub metadata: Metadata,
    /// Messages that must be delivered before this one.
    pub dependencies: BTreeSet<MessageId>,
}

impl MessageContext {
    /// A context with metadata and no dependencies.
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            dependencies: BTreeSet::new(),
        }
    }

    /// A context with metadata and the given dependencies.
    pub fn with_dependencies(
        metadata: Metadata,
        dependencies: impl IntoIterator<Item = MessageId>,
    ) -> Self {
        Self {
            metadata,
            dependencies: dependencies.into_iter().collect(),
        }
    }
}

/// A delivery hook's verdict on a message whose dependencies are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryAction {
    /// Invalidate the message and its dependents.
    Reject,
    /// Leave the message pending.
    Defer,
    /// Deliver and mark the message (and its dependencies) shareable.
    AcceptShare,
    /// Deliver without sharing.
    AcceptDoNotShare,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_state_codes_roundtrip() {
        for state in [
            MessageState::Unknown,
            MessageState::Invalid,
            MessageState::Pending,
            MessageState::Delivered,
        ] {
            assert_eq!(MessageState::try_from(state.code()).unwrap(), state);
        }
    }

    #[test]
    fn message_state_rejects_unknown_code() {
        assert!(matches!(
            MessageState::try_from(7),
            Err(SyncError::UnknownState(7))
        ));
    }

    #[test]
    fn message_id_matches_content() {
        let group = GroupId::random();
        let m = Message::new(group, 42, b"body".to_vec());
        assert_eq!(m.id, MessageId::derive(&group, 42, b"body"));
    }

    #[test]
    fn message_debug_redacts_body() {
        let m = Message::new(GroupId::random(), 1, b"secret text".to_vec());
        let debug = format!("{:?}", m);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[11 bytes]"));
    }

    #[test]
    fn group_key_matches_fields() {
        let g = Group::new(ClientId::new("org.peerlog.forum"), 2, b"d".to_vec());
        let cv = g.client_major_version();
        assert_eq!(cv.client_id, ClientId::new("org.peerlog.forum"));
        assert_eq!(cv.major_version, 2);
        assert_eq!(g.id, GroupId::derive(&cv.client_id, 2, b"d"));
    }

    #[test]
    fn context_dependencies_are_deduplicated() {
        let group = GroupId::random();
        let dep = MessageId::derive(&group, 1, b"x");
        let ctx = MessageContext::with_dependencies(Metadata::new(), [dep, dep]);
        assert_eq!(ctx.dependencies.len(), 1);
    }
}
