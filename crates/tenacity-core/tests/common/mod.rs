// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for tenacity-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tenacity_core::config::RuntimeSettings;
use tenacity_core::identity::FlowId;
use tenacity_core::runtime::{FlowRuntime, FlowRuntimeBuilder};
use tenacity_core::status::Status;
use tenacity_core::storage::{FlowStore, InMemoryFlowStore, SqliteFlowStore, StoredFlow};

/// Opt-in log capture: `RUST_LOG=tenacity_core=debug cargo test` shows the
/// runtime's tracing output for failing tests. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Aggressive timing so tests exercise leases and sweeps without long waits.
pub fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        lease_length: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        watchdog_interval: Duration::from_millis(50),
    }
}

/// A started runtime over an in-memory store with fast timing.
pub async fn memory_runtime() -> FlowRuntime {
    init_tracing();
    FlowRuntimeBuilder::new()
        .store(Arc::new(InMemoryFlowStore::new()))
        .settings(fast_settings())
        .build()
        .expect("builder should have everything it needs")
        .start()
        .await
        .expect("runtime should start")
}

/// A migrated SQLite store in a temporary directory.
pub async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteFlowStore> {
    init_tracing();
    Arc::new(
        SqliteFlowStore::from_path(dir.path().join("flows.db"))
            .await
            .expect("sqlite store should initialize"),
    )
}

/// Poll the store until the flow reaches the expected status (5s deadline).
pub async fn wait_for_status(store: &dyn FlowStore, id: &FlowId, status: Status) -> StoredFlow {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut last = None;
    while tokio::time::Instant::now() < deadline {
        let flow = store
            .get_flow(id)
            .await
            .expect("get_flow should not fail");
        if let Some(flow) = flow {
            if flow.status == status {
                return flow;
            }
            last = Some(flow.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "flow {} never reached status {:?} (last seen: {:?})",
        id, status, last
    );
}
