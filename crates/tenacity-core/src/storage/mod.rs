// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow store contract and backend implementations.
//!
//! The [`FlowStore`] trait is the only shared mutable resource in the system.
//! All mutation of a stored flow goes through epoch-gated conditional updates:
//! the caller supplies the epoch it expects, the store applies the change only
//! on a match, and every applied change increments the epoch by exactly one.
//! Backends must make [`FlowStore::restart_execution`] atomic with respect to
//! concurrent callers attempting the same transition; it is the
//! leader-election primitive.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use self::memory::InMemoryFlowStore;
#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteFlowStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FlowError;
use crate::identity::{FlowId, ReplicaId};
use crate::status::{Epoch, Status};

/// The durable record of one flow instance.
#[derive(Debug, Clone)]
pub struct StoredFlow {
    /// Composite primary key.
    pub id: FlowId,
    /// Caller-friendly instance label (defaults to the instance id).
    pub human_instance_id: String,
    /// Current lifecycle status.
    pub status: Status,
    /// Optimistic-concurrency counter; incremented by every applied update.
    pub epoch: Epoch,
    /// Serialized invocation parameter.
    pub param: Vec<u8>,
    /// Serialized auxiliary state (scrapbook), if the flow has written any.
    pub state: Option<Vec<u8>>,
    /// Serialized result, present once succeeded.
    pub result: Option<Vec<u8>>,
    /// Serialized [`FlowFailure`](crate::outcome::FlowFailure), present once failed.
    pub error: Option<Vec<u8>>,
    /// When a postponed flow becomes eligible for automatic resumption.
    pub postpone_until: Option<DateTime<Utc>>,
    /// Interrupt total at which a suspended flow becomes eligible to resume.
    pub suspend_after: Option<i64>,
    /// How many interrupts have been delivered to this flow so far.
    pub interrupt_count: i64,
    /// Lease deadline while executing; an expired lease marks an abandoned attempt.
    pub lease_expiration: Option<DateTime<Utc>>,
    /// The process currently holding the lease.
    pub owner: Option<ReplicaId>,
    /// Optional parent flow (sub-flow relationships), stored as `"type/instance"`.
    pub parent: Option<FlowId>,
    /// Timestamp of the last status change.
    pub status_changed_at: DateTime<Utc>,
}

/// Outcome of a conditional suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendResult {
    /// The flow is now suspended.
    Suspended,
    /// Interrupts already reached the target; the flow was not suspended and
    /// the caller should persist an immediate postponement instead.
    WasInterrupted,
    /// The epoch precondition failed; another executor mutated the record.
    Conflict,
}

/// Durable storage of flow records keyed by identity.
///
/// Implementations must guarantee that every method taking an `expected_epoch`
/// applies its change atomically and only when the stored epoch matches, and
/// that an applied change increments the epoch by exactly one. Returning
/// `false` (or zero rows) on a mismatch is the contract; the engine translates
/// that into [`FlowError::ConcurrentModification`] or
/// [`FlowError::UnexpectedState`] depending on the call site.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert a new flow record at epoch 0 if none exists for the id.
    ///
    /// The record is created as `Executing` holding `lease_expiration`, or as
    /// `Postponed` when `postpone_until` is supplied (scheduled invocation).
    /// Returns `false` when a record already exists; the caller must then wait
    /// for the existing execution's result instead of running a duplicate.
    #[allow(clippy::too_many_arguments)]
    async fn create_flow(
        &self,
        id: &FlowId,
        human_instance_id: &str,
        param: &[u8],
        lease_expiration: DateTime<Utc>,
        postpone_until: Option<DateTime<Utc>>,
        parent: Option<&FlowId>,
        owner: Option<ReplicaId>,
    ) -> Result<bool, FlowError>;

    /// Fetch a flow record by id.
    async fn get_flow(&self, id: &FlowId) -> Result<Option<StoredFlow>, FlowError>;

    /// Generic epoch-gated rewrite of status, param, state, result and error.
    ///
    /// Administrative surface; the status-specific methods below are the
    /// normal persistence path. Returns `false` on epoch mismatch.
    #[allow(clippy::too_many_arguments)]
    async fn set_flow_state(
        &self,
        id: &FlowId,
        status: Status,
        param: Option<&[u8]>,
        state: Option<&[u8]>,
        result: Option<&[u8]>,
        error: Option<&[u8]>,
        postpone_until: Option<DateTime<Utc>>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError>;

    /// Commit a success. Clears the lease and owner. Returns `false` on epoch mismatch.
    async fn succeed_flow(
        &self,
        id: &FlowId,
        result: &[u8],
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError>;

    /// Commit a postponement. Clears the lease and owner. Returns `false` on epoch mismatch.
    async fn postpone_flow(
        &self,
        id: &FlowId,
        postpone_until: DateTime<Utc>,
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError>;

    /// Commit a failure. Clears the lease and owner. Returns `false` on epoch mismatch.
    async fn fail_flow(
        &self,
        id: &FlowId,
        error: &[u8],
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError>;

    /// Commit a suspension, unless interrupts already reached the target.
    ///
    /// A suspend that raced an interrupt returns
    /// [`SuspendResult::WasInterrupted`] so the caller can postpone the flow
    /// for immediate resumption instead of losing the wakeup.
    async fn suspend_flow(
        &self,
        id: &FlowId,
        expected_interrupts: i64,
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<SuspendResult, FlowError>;

    /// Leader election: move a resumable flow back to `Executing` at
    /// `expected_epoch + 1`, binding the lease to `owner`.
    ///
    /// Must be atomic with respect to concurrent callers; exactly one caller
    /// per epoch observes `Some`. Returns `None` when the epoch did not match
    /// or the status was not resumable.
    async fn restart_execution(
        &self,
        id: &FlowId,
        expected_epoch: Epoch,
        new_lease_expiration: DateTime<Utc>,
        owner: ReplicaId,
    ) -> Result<Option<StoredFlow>, FlowError>;

    /// Executing flows whose lease expired before `before`.
    async fn get_expired_leases(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(FlowId, Epoch)>, FlowError>;

    /// Postponed flows whose resume timestamp is at or before `before`.
    async fn get_eligible_postponed(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(FlowId, Epoch)>, FlowError>;

    /// Extend the lease of the given executing attempts. The epoch in each
    /// entry gates the renewal, so a reclaimed flow is never re-leased by its
    /// stale executor. Returns the number of leases actually renewed.
    async fn renew_leases(
        &self,
        leases: &[(FlowId, Epoch)],
        new_expiration: DateTime<Utc>,
    ) -> Result<u64, FlowError>;

    /// Reclaim executing flows whose lease expired before `before`:
    /// status becomes `Postponed` (eligible immediately), the owner is
    /// cleared and the epoch bumped so stale commits are rejected.
    /// Returns the number of flows reclaimed.
    async fn reschedule_crashed(&self, before: DateTime<Utc>) -> Result<u64, FlowError>;

    /// Reclaim all executing flows owned by a replica known to be dead
    /// (startup takeover). Same transition as [`FlowStore::reschedule_crashed`].
    async fn reschedule_owned_by(&self, owner: ReplicaId) -> Result<u64, FlowError>;

    /// Deliver an external interrupt: increments the interrupt counter and,
    /// when a suspended flow's counter reaches its target, flips it to
    /// `Postponed` (eligible immediately) with an epoch bump.
    ///
    /// The counter itself is advisory metadata and is deliberately not
    /// epoch-gated; bumping the epoch of an executing flow on interrupt would
    /// poison its in-flight commit. Returns `false` when no record exists.
    async fn interrupt(&self, id: &FlowId) -> Result<bool, FlowError>;

    /// Deliver an interrupt to several flows. Returns the number found.
    async fn interrupt_many(&self, ids: &[FlowId]) -> Result<u64, FlowError> {
        let mut found = 0;
        for id in ids {
            if self.interrupt(id).await? {
                found += 1;
            }
        }
        Ok(found)
    }

    /// Administrative delete of a flow record and everything attached to it.
    /// Returns `false` when no record exists.
    async fn delete_flow(&self, id: &FlowId) -> Result<bool, FlowError>;
}
