// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory flow store.
//!
//! Backs tests and embedded single-process deployments. All operations take
//! one process-wide mutex, which trivially gives the atomicity the contract
//! demands; the epoch checks are still performed so the store behaves exactly
//! like a durable backend under concurrent commits.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FlowError;
use crate::identity::{FlowId, ReplicaId};
use crate::status::{Epoch, Status};

use super::{FlowStore, StoredFlow, SuspendResult};

/// Flow store keeping all records in process memory.
#[derive(Default)]
pub struct InMemoryFlowStore {
    flows: Mutex<HashMap<FlowId, StoredFlow>>,
}

impl InMemoryFlowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FlowId, StoredFlow>> {
        // Lock poisoning only happens if a holder panicked mid-update; the
        // map is always left consistent, so continue with the inner value.
        self.flows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Apply the shared part of every commit: epoch bump, lease and owner cleared,
/// status change timestamped.
fn commit(flow: &mut StoredFlow, status: Status, state: Option<&[u8]>) {
    flow.status = status;
    flow.epoch += 1;
    flow.lease_expiration = None;
    flow.owner = None;
    flow.status_changed_at = Utc::now();
    if let Some(state) = state {
        flow.state = Some(state.to_vec());
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn create_flow(
        &self,
        id: &FlowId,
        human_instance_id: &str,
        param: &[u8],
        lease_expiration: DateTime<Utc>,
        postpone_until: Option<DateTime<Utc>>,
        parent: Option<&FlowId>,
        owner: Option<ReplicaId>,
    ) -> Result<bool, FlowError> {
        let mut flows = self.lock();
        if flows.contains_key(id) {
            return Ok(false);
        }
        let status = if postpone_until.is_some() {
            Status::Postponed
        } else {
            Status::Executing
        };
        flows.insert(
            id.clone(),
            StoredFlow {
                id: id.clone(),
                human_instance_id: human_instance_id.to_string(),
                status,
                epoch: 0,
                param: param.to_vec(),
                state: None,
                result: None,
                error: None,
                postpone_until,
                suspend_after: None,
                interrupt_count: 0,
                lease_expiration: match status {
                    Status::Executing => Some(lease_expiration),
                    _ => None,
                },
                owner: match status {
                    Status::Executing => owner,
                    _ => None,
                },
                parent: parent.cloned(),
                status_changed_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn get_flow(&self, id: &FlowId) -> Result<Option<StoredFlow>, FlowError> {
        Ok(self.lock().get(id).cloned())
    }

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
    ) -> Result<bool, FlowError> {
        let mut flows = self.lock();
        let Some(flow) = flows.get_mut(id) else {
            return Ok(false);
        };
        if flow.epoch != expected_epoch {
            return Ok(false);
        }
        if let Some(param) = param {
            flow.param = param.to_vec();
        }
        flow.result = result.map(|b| b.to_vec());
        flow.error = error.map(|b| b.to_vec());
        flow.postpone_until = postpone_until;
        commit(flow, status, state);
        Ok(true)
    }

    async fn succeed_flow(
        &self,
        id: &FlowId,
        result: &[u8],
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError> {
        let mut flows = self.lock();
        let Some(flow) = flows.get_mut(id) else {
            return Ok(false);
        };
        if flow.epoch != expected_epoch || flow.status != Status::Executing {
            return Ok(false);
        }
        flow.result = Some(result.to_vec());
        flow.postpone_until = None;
        commit(flow, Status::Succeeded, state);
        Ok(true)
    }

    async fn postpone_flow(
        &self,
        id: &FlowId,
        postpone_until: DateTime<Utc>,
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError> {
        let mut flows = self.lock();
        let Some(flow) = flows.get_mut(id) else {
            return Ok(false);
        };
        if flow.epoch != expected_epoch || flow.status != Status::Executing {
            return Ok(false);
        }
        flow.postpone_until = Some(postpone_until);
        commit(flow, Status::Postponed, state);
        Ok(true)
    }

    async fn fail_flow(
        &self,
        id: &FlowId,
        error: &[u8],
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<bool, FlowError> {
        let mut flows = self.lock();
        let Some(flow) = flows.get_mut(id) else {
            return Ok(false);
        };
        if flow.epoch != expected_epoch || flow.status != Status::Executing {
            return Ok(false);
        }
        flow.error = Some(error.to_vec());
        flow.postpone_until = None;
        commit(flow, Status::Failed, state);
        Ok(true)
    }

    async fn suspend_flow(
        &self,
        id: &FlowId,
        expected_interrupts: i64,
        state: Option<&[u8]>,
        expected_epoch: Epoch,
    ) -> Result<SuspendResult, FlowError> {
        let mut flows = self.lock();
        let Some(flow) = flows.get_mut(id) else {
            return Ok(SuspendResult::Conflict);
        };
        if flow.epoch != expected_epoch || flow.status != Status::Executing {
            return Ok(SuspendResult::Conflict);
        }
        if flow.interrupt_count >= expected_interrupts {
            return Ok(SuspendResult::WasInterrupted);
        }
        flow.suspend_after = Some(expected_interrupts);
        flow.postpone_until = None;
        commit(flow, Status::Suspended, state);
        Ok(SuspendResult::Suspended)
    }

    async fn restart_execution(
        &self,
        id: &FlowId,
        expected_epoch: Epoch,
        new_lease_expiration: DateTime<Utc>,
        owner: ReplicaId,
    ) -> Result<Option<StoredFlow>, FlowError> {
        let mut flows = self.lock();
        let Some(flow) = flows.get_mut(id) else {
            return Ok(None);
        };
        if flow.epoch != expected_epoch || !flow.status.is_resumable() {
            return Ok(None);
        }
        flow.status = Status::Executing;
        flow.epoch += 1;
        flow.lease_expiration = Some(new_lease_expiration);
        flow.owner = Some(owner);
        flow.postpone_until = None;
        flow.suspend_after = None;
        flow.status_changed_at = Utc::now();
        Ok(Some(flow.clone()))
    }

    async fn get_expired_leases(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(FlowId, Epoch)>, FlowError> {
        Ok(self
            .lock()
            .values()
            .filter(|f| {
                f.status == Status::Executing
                    && f.lease_expiration.is_some_and(|lease| lease <= before)
            })
            .map(|f| (f.id.clone(), f.epoch))
            .collect())
    }

    async fn get_eligible_postponed(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<(FlowId, Epoch)>, FlowError> {
        Ok(self
            .lock()
            .values()
            .filter(|f| {
                f.status == Status::Postponed
                    && f.postpone_until.is_none_or(|until| until <= before)
            })
            .map(|f| (f.id.clone(), f.epoch))
            .collect())
    }

    async fn renew_leases(
        &self,
        leases: &[(FlowId, Epoch)],
        new_expiration: DateTime<Utc>,
    ) -> Result<u64, FlowError> {
        let mut flows = self.lock();
        let mut renewed = 0;
        for (id, epoch) in leases {
            if let Some(flow) = flows.get_mut(id)
                && flow.epoch == *epoch
                && flow.status == Status::Executing
            {
                flow.lease_expiration = Some(new_expiration);
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    async fn reschedule_crashed(&self, before: DateTime<Utc>) -> Result<u64, FlowError> {
        let mut flows = self.lock();
        let now = Utc::now();
        let mut reclaimed = 0;
        for flow in flows.values_mut() {
            if flow.status == Status::Executing
                && flow.lease_expiration.is_some_and(|lease| lease <= before)
            {
                flow.status = Status::Postponed;
                flow.epoch += 1;
                flow.postpone_until = Some(now);
                flow.lease_expiration = None;
                flow.owner = None;
                flow.status_changed_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn reschedule_owned_by(&self, owner: ReplicaId) -> Result<u64, FlowError> {
        let mut flows = self.lock();
        let now = Utc::now();
        let mut reclaimed = 0;
        for flow in flows.values_mut() {
            if flow.status == Status::Executing && flow.owner == Some(owner) {
                flow.status = Status::Postponed;
                flow.epoch += 1;
                flow.postpone_until = Some(now);
                flow.lease_expiration = None;
                flow.owner = None;
                flow.status_changed_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn interrupt(&self, id: &FlowId) -> Result<bool, FlowError> {
        let mut flows = self.lock();
        let Some(flow) = flows.get_mut(id) else {
            return Ok(false);
        };
        flow.interrupt_count += 1;
        if flow.status == Status::Suspended
            && flow.suspend_after.is_some_and(|after| flow.interrupt_count >= after)
        {
            let now = Utc::now();
            flow.status = Status::Postponed;
            flow.epoch += 1;
            flow.postpone_until = Some(now);
            flow.suspend_after = None;
            flow.status_changed_at = now;
        }
        Ok(true)
    }

    async fn delete_flow(&self, id: &FlowId) -> Result<bool, FlowError> {
        Ok(self.lock().remove(id).is_some())
    }
}
