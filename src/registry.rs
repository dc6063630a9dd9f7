//! Explicit state machine factory table.
//!
//! The host owns a registry mapping each group to a constructor closure,
//! supplied at startup. Group creation asks the registry to build the
//! instance for a `(group, replica)` pair; the kind the builder returns is
//! fixed for that group's lifetime. There is no process-wide mutable
//! registration state.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::Error;
use crate::GroupId;
use crate::ReplicaId;
use crate::Result;
use crate::StateMachineHandle;
use crate::StateMachineVariant;

/// Constructor closure for one group's state machine kind.
pub type MachineBuilder = Arc<dyn Fn(GroupId, ReplicaId) -> Result<StateMachineVariant> + Send + Sync>;

#[derive(Default)]
pub struct MachineRegistry {
    builders: DashMap<GroupId, MachineBuilder>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        MachineRegistry {
            builders: DashMap::new(),
        }
    }

    /// Register the builder for a group. Rejects double registration: the
    /// kind of a group must never change behind the runtime's back.
    pub fn register(
        &self,
        group_id: GroupId,
        builder: MachineBuilder,
    ) -> Result<()> {
        match self.builders.entry(group_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::BuilderExists(group_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(builder);
                debug!(group = group_id, "registered state machine builder");
                Ok(())
            }
        }
    }

    /// Convenience wrapper over [`MachineRegistry::register`] for plain
    /// closures.
    pub fn register_fn<F>(
        &self,
        group_id: GroupId,
        builder: F,
    ) -> Result<()>
    where
        F: Fn(GroupId, ReplicaId) -> Result<StateMachineVariant> + Send + Sync + 'static,
    {
        self.register(group_id, Arc::new(builder))
    }

    pub fn contains(
        &self,
        group_id: GroupId,
    ) -> bool {
        self.builders.contains_key(&group_id)
    }

    /// Drop a group's builder, e.g. on group removal.
    pub fn deregister(
        &self,
        group_id: GroupId,
    ) -> Result<()> {
        self.builders
            .remove(&group_id)
            .map(|_| ())
            .ok_or(Error::BuilderMissing(group_id))
    }

    /// Build the state machine instance for a `(group, replica)` pair.
    pub fn build(
        &self,
        group_id: GroupId,
        replica_id: ReplicaId,
    ) -> Result<StateMachineHandle> {
        let builder = self
            .builders
            .get(&group_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::BuilderMissing(group_id))?;

        let variant = builder(group_id, replica_id)?;
        debug!(group = group_id, replica = replica_id, kind = %variant.kind(), "built state machine instance");
        Ok(StateMachineHandle::new(group_id, replica_id, variant))
    }
}
