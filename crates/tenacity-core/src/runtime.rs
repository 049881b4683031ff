// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable flow runtime.
//!
//! [`FlowRuntime`] ties the engine together for embedding in an existing
//! tokio application: a flow store, the background workers (lease renewal and
//! the crash-recovery watchdog), and the registry through which flow types
//! are registered and invoked.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenacity_core::outcome::Outcome;
//! use tenacity_core::runtime::FlowRuntime;
//! use tenacity_core::storage::SqliteFlowStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteFlowStore::from_path(".data/flows.db").await?);
//!
//!     let runtime = FlowRuntime::builder()
//!         .store(store)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let greeter = runtime.register_flow("greeter", |name: String, _ctx| async move {
//!         Outcome::Succeed(format!("hello, {name}"))
//!     });
//!     let greeting = greeter.invoke("readme", "world".to_string()).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::RuntimeSettings;
use crate::error::FlowError;
use crate::identity::{FlowType, ReplicaId};
use crate::invocation::context::into_flow_fn;
use crate::invocation::{
    CommonInvoker, ErrorSink, FlowContext, FlowInvoker, FlowState, FlowValue, Middleware,
    ShutdownCoordinator, TracingErrorSink,
};
use crate::lease::{LeaseMonitor, LeaseRenewer};
use crate::outcome::Outcome;
use crate::registry::FlowRegistry;
use crate::storage::FlowStore;
use crate::watchdog::Watchdog;

/// Builder for creating a [`FlowRuntime`].
pub struct FlowRuntimeBuilder {
    store: Option<Arc<dyn FlowStore>>,
    settings: RuntimeSettings,
    replica: Option<ReplicaId>,
    error_sink: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for FlowRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("settings", &self.settings)
            .field("replica", &self.replica)
            .finish()
    }
}

impl Default for FlowRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            settings: RuntimeSettings::default(),
            replica: None,
            error_sink: Arc::new(TracingErrorSink),
        }
    }
}

impl FlowRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder with a connected SQLite store from configuration.
    #[cfg(feature = "sqlite")]
    pub async fn from_config(
        config: &crate::config::Config,
    ) -> std::result::Result<Self, FlowError> {
        let store = crate::storage::SqliteFlowStore::connect(&config.database_url).await?;
        Ok(Self::new()
            .store(Arc::new(store))
            .settings(config.settings))
    }

    /// Set the flow store (required).
    pub fn store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the timing settings.
    ///
    /// Default: [`RuntimeSettings::default`]
    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set this process's replica id.
    ///
    /// Default: freshly generated on `build`.
    pub fn replica_id(mut self, replica: ReplicaId) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Set the sink receiving errors from background executions.
    ///
    /// Default: [`TracingErrorSink`]
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<FlowRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        Ok(FlowRuntimeConfig {
            store,
            settings: self.settings,
            replica: self.replica.unwrap_or_else(ReplicaId::generate),
            error_sink: self.error_sink,
        })
    }
}

/// Configuration for a [`FlowRuntime`].
pub struct FlowRuntimeConfig {
    store: Arc<dyn FlowStore>,
    settings: RuntimeSettings,
    replica: ReplicaId,
    error_sink: Arc<dyn ErrorSink>,
}

impl std::fmt::Debug for FlowRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRuntimeConfig")
            .field("store", &"...")
            .field("settings", &self.settings)
            .field("replica", &self.replica)
            .finish()
    }
}

impl FlowRuntimeConfig {
    /// Start the runtime, spawning the lease renewer and watchdog workers.
    pub async fn start(self) -> Result<FlowRuntime> {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let monitor = Arc::new(LeaseMonitor::new());
        let registry = Arc::new(FlowRegistry::new());

        let common = Arc::new(CommonInvoker::new(
            Arc::clone(&self.store),
            self.settings,
            self.replica,
            Arc::clone(&coordinator),
            Arc::clone(&monitor),
            Arc::clone(&self.error_sink),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let renewer = LeaseRenewer::new(Arc::clone(&self.store), Arc::clone(&monitor), self.settings);
        let renewer_handle = tokio::spawn(renewer.run(shutdown_rx.clone()));

        let watchdog = Watchdog::new(Arc::clone(&self.store), Arc::clone(&registry), self.settings);
        let watchdog_handle = tokio::spawn(watchdog.run(shutdown_rx));

        info!(replica = %self.replica, "FlowRuntime started");

        Ok(FlowRuntime {
            store: self.store,
            common,
            registry,
            coordinator,
            shutdown_tx,
            worker_handles: vec![renewer_handle, watchdog_handle],
            replica: self.replica,
        })
    }
}

/// A running flow engine that can be embedded in an application.
///
/// The runtime manages:
/// - lease renewal for attempts executing in this process
/// - the crash-recovery and wakeup sweep
/// - the registry of flow types and their typed invokers
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct FlowRuntime {
    store: Arc<dyn FlowStore>,
    common: Arc<CommonInvoker>,
    registry: Arc<FlowRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
    shutdown_tx: watch::Sender<bool>,
    worker_handles: Vec<JoinHandle<()>>,
    replica: ReplicaId,
}

impl FlowRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> FlowRuntimeBuilder {
        FlowRuntimeBuilder::new()
    }

    /// Register a flow type and obtain its typed invoker.
    ///
    /// The invoker is also recorded in the registry so the watchdog can
    /// resume persisted instances of this type. Registering the same type
    /// twice replaces the earlier registration.
    pub fn register_flow<P, R, S, F, Fut>(
        &self,
        flow_type: impl Into<FlowType>,
        f: F,
    ) -> FlowInvoker<P, R, S>
    where
        P: FlowValue,
        R: FlowValue,
        S: FlowState,
        F: Fn(P, FlowContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<R>> + Send + 'static,
    {
        self.register_flow_with_middleware(flow_type, Vec::new(), f)
    }

    /// [`FlowRuntime::register_flow`] with an ordered middleware chain wrapped
    /// around the flow code.
    pub fn register_flow_with_middleware<P, R, S, F, Fut>(
        &self,
        flow_type: impl Into<FlowType>,
        middleware: Vec<Arc<dyn Middleware<P, R, S>>>,
        f: F,
    ) -> FlowInvoker<P, R, S>
    where
        P: FlowValue,
        R: FlowValue,
        S: FlowState,
        F: Fn(P, FlowContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<R>> + Send + 'static,
    {
        let invoker = FlowInvoker::new(
            flow_type.into(),
            Arc::clone(&self.common),
            into_flow_fn(f),
            middleware,
        );
        self.registry.register(Arc::new(invoker.clone()));
        invoker
    }

    /// Reclaim every executing flow still owned by a replica known to be
    /// dead, making them immediately eligible for resumption here.
    pub async fn take_over(&self, replica: ReplicaId) -> std::result::Result<u64, FlowError> {
        let reclaimed = self.store.reschedule_owned_by(replica).await?;
        if reclaimed > 0 {
            info!(%replica, reclaimed, "Took over flows from dead replica");
        }
        Ok(reclaimed)
    }

    /// Get a reference to the flow store.
    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    /// Get a reference to the flow type registry.
    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// This process's replica id.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    /// Number of attempts currently executing in this process.
    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Refuses new attempts, waits for in-flight attempts to finish and
    /// commit, then stops the background workers. Running user code is never
    /// interrupted.
    pub async fn shutdown(self) -> Result<()> {
        info!("FlowRuntime shutting down...");

        // Drain attempts first; the lease renewer keeps them covered while
        // they finish.
        self.coordinator.shutdown().await;

        let _ = self.shutdown_tx.send(true);
        for handle in self.worker_handles {
            handle
                .await
                .map_err(|e| anyhow::anyhow!("worker task panicked: {}", e))?;
        }

        info!("FlowRuntime shutdown complete");
        Ok(())
    }
}
