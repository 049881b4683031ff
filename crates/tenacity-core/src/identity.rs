// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow identity types.
//!
//! A flow instance is identified by a [`FlowId`]: the registered flow kind
//! ([`FlowType`]) paired with a caller-supplied or generated instance
//! identifier ([`FlowInstance`]). The id is immutable, is the primary key of
//! every durable record, and is the unit of mutual exclusion.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a registered flow kind (e.g. `"order-fulfillment"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowType(String);

impl FlowType {
    /// Create a flow type from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FlowType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unique identifier of one instance of a flow, typically a UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowInstance(String);

impl FlowInstance {
    /// Create an instance id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh random instance id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FlowInstance {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FlowInstance {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Composite key identifying a single durable flow instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId {
    /// The registered flow kind.
    pub flow_type: FlowType,
    /// The unique instance identifier within that kind.
    pub instance: FlowInstance,
}

impl FlowId {
    /// Create a flow id from a type and instance.
    pub fn new(flow_type: impl Into<FlowType>, instance: impl Into<FlowInstance>) -> Self {
        Self {
            flow_type: flow_type.into(),
            instance: instance.into(),
        }
    }

    /// Parse a `"type/instance"` reference, as stored for parent links.
    ///
    /// The instance part may itself contain `/`; only the first separator is
    /// significant.
    pub fn parse(value: &str) -> Option<Self> {
        let (flow_type, instance) = value.split_once('/')?;
        if flow_type.is_empty() || instance.is_empty() {
            return None;
        }
        Some(Self::new(flow_type, instance))
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_type, self.instance)
    }
}

/// Identity of one engine process, used as the lease owner of Executing rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Generate a fresh replica id for this process.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. decoded from storage).
    pub fn from_uuid(value: Uuid) -> Self {
        Self(value)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_id_display() {
        let id = FlowId::new("order", "abc-123");
        assert_eq!(id.to_string(), "order/abc-123");
    }

    #[test]
    fn test_flow_id_parse_round_trip() {
        let id = FlowId::new("order", "abc-123");
        let parsed = FlowId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_flow_id_parse_instance_with_separator() {
        let parsed = FlowId::parse("order/a/b").unwrap();
        assert_eq!(parsed.flow_type.as_str(), "order");
        assert_eq!(parsed.instance.as_str(), "a/b");
    }

    #[test]
    fn test_flow_id_parse_rejects_malformed() {
        assert!(FlowId::parse("order").is_none());
        assert!(FlowId::parse("/abc").is_none());
        assert!(FlowId::parse("order/").is_none());
    }

    #[test]
    fn test_generated_instances_are_unique() {
        assert_ne!(FlowInstance::generate(), FlowInstance::generate());
        assert_ne!(ReplicaId::generate(), ReplicaId::generate());
    }
}
