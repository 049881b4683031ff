// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow type registry.
//!
//! Maps each registered [`FlowType`] to the object-safe [`Reinvoker`] facet of
//! its typed invoker, so the watchdog can resume any persisted flow knowing
//! only its identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::identity::FlowType;
use crate::invocation::Reinvoker;

/// Registry of flow types known to this process.
#[derive(Default)]
pub struct FlowRegistry {
    entries: Mutex<HashMap<FlowType, Arc<dyn Reinvoker>>>,
}

impl FlowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reinvoker for its flow type, replacing any previous entry.
    pub fn register(&self, reinvoker: Arc<dyn Reinvoker>) {
        let flow_type = reinvoker.flow_type().clone();
        debug!(flow_type = %flow_type, "Registered flow type");
        self.lock().insert(flow_type, reinvoker);
    }

    /// Look up the reinvoker for a flow type.
    pub fn get(&self, flow_type: &FlowType) -> Option<Arc<dyn Reinvoker>> {
        self.lock().get(flow_type).cloned()
    }

    /// Registered flow types, for diagnostics.
    pub fn flow_types(&self) -> Vec<FlowType> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FlowType, Arc<dyn Reinvoker>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_types", &self.flow_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FlowId;
    use crate::status::{Epoch, Status};

    struct FakeReinvoker(FlowType);

    impl Reinvoker for FakeReinvoker {
        fn flow_type(&self) -> &FlowType {
            &self.0
        }

        fn schedule_reinvoke(
            &self,
            _id: FlowId,
            _expected_statuses: Vec<Status>,
            _expected_epoch: Option<Epoch>,
            _tolerate_lost_race: bool,
        ) {
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = FlowRegistry::new();
        registry.register(Arc::new(FakeReinvoker(FlowType::new("order"))));

        assert!(registry.get(&FlowType::new("order")).is_some());
        assert!(registry.get(&FlowType::new("missing")).is_none());
        assert_eq!(registry.flow_types(), vec![FlowType::new("order")]);
    }
}
