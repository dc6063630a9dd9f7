//! Tagged-variant dispatch over the three state machine kinds, plus the
//! per-instance handle the group runtime drives.
//!
//! The handle owns the two defensive guarantees the contracts leave to the
//! caller side: entries are accepted only in strictly increasing,
//! contiguous index order, and a failed apply latches the instance so no
//! further update can diverge the replica.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use autometrics::autometrics;
use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::ApplyError;
use crate::ConcurrentStateMachine;
use crate::Entry;
use crate::Error;
use crate::GroupId;
use crate::OnDiskStateMachine;
use crate::QueryResult;
use crate::ReplicaId;
use crate::Result;
use crate::SnapshotCookie;
use crate::StateMachine;
use crate::UpdateResult;
use crate::APPLIED_ENTRIES_METRIC;
use crate::APPLY_FAILURES_METRIC;
use crate::API_SLO;

/// Concurrency discipline of a state machine instance. Fixed per group at
/// creation time, never changed for that group's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateMachineKind {
    Sequential,
    Concurrent,
    OnDisk,
}

impl StateMachineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateMachineKind::Sequential => "sequential",
            StateMachineKind::Concurrent => "concurrent",
            StateMachineKind::OnDisk => "on-disk",
        }
    }
}

impl std::fmt::Display for StateMachineKind {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state machine instance behind its kind tag.
#[derive(Clone)]
pub enum StateMachineVariant {
    Sequential(Arc<dyn StateMachine>),
    Concurrent(Arc<dyn ConcurrentStateMachine>),
    OnDisk(Arc<dyn OnDiskStateMachine>),
}

impl StateMachineVariant {
    pub fn kind(&self) -> StateMachineKind {
        match self {
            StateMachineVariant::Sequential(_) => StateMachineKind::Sequential,
            StateMachineVariant::Concurrent(_) => StateMachineKind::Concurrent,
            StateMachineVariant::OnDisk(_) => StateMachineKind::OnDisk,
        }
    }

    /// Whether lookups may run concurrently with updates on this kind.
    pub fn concurrent_reads(&self) -> bool {
        !matches!(self, StateMachineVariant::Sequential(_))
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self, StateMachineVariant::OnDisk(_))
    }
}

/// Uniform operation surface over one `(group, replica)` state machine
/// instance.
///
/// The group runtime guarantees single-writer semantics for `update`;
/// lookup concurrency follows the kind. The handle tracks the last applied
/// index observed through it, rejects out-of-order delivery, and latches
/// fatally after any apply failure.
pub struct StateMachineHandle {
    group_id: GroupId,
    replica_id: ReplicaId,
    variant: StateMachineVariant,

    /// Index of the last entry applied through this handle. For the
    /// on-disk kind this is seeded by `open`; for the in-memory kinds it
    /// is seeded by snapshot recovery.
    applied: AtomicU64,
    halted: AtomicBool,
    closed: AtomicBool,
}

impl StateMachineHandle {
    pub fn new(
        group_id: GroupId,
        replica_id: ReplicaId,
        variant: StateMachineVariant,
    ) -> Self {
        StateMachineHandle {
            group_id,
            replica_id,
            variant,
            applied: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn kind(&self) -> StateMachineKind {
        self.variant.kind()
    }

    pub fn concurrent_reads(&self) -> bool {
        self.variant.concurrent_reads()
    }

    pub fn is_on_disk(&self) -> bool {
        self.variant.is_on_disk()
    }

    /// Index of the last entry applied through this handle.
    pub fn last_applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub(crate) fn set_applied(
        &self,
        index: u64,
    ) {
        self.applied.store(index, Ordering::Release);
    }

    pub(crate) fn variant(&self) -> &StateMachineVariant {
        &self.variant
    }

    /// The instance refused further updates after a fatal apply failure.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Open the owned storage of an on-disk instance and seed the applied
    /// watermark; replay must resume at the returned index + 1. A no-op
    /// for the in-memory kinds.
    pub async fn open(
        &self,
        stop: &CancellationToken,
    ) -> Result<u64> {
        match &self.variant {
            StateMachineVariant::OnDisk(sm) => {
                let applied = sm.open(stop).await?;
                self.applied.store(applied, Ordering::Release);
                debug!(group = self.group_id, replica = self.replica_id, applied, "opened on-disk state machine");
                Ok(applied)
            }
            _ => Ok(self.last_applied()),
        }
    }

    /// Apply a batch of committed entries in strict log order.
    ///
    /// Produces one result per entry, in entry order. Any failure is fatal:
    /// the handle latches and every later call fails with
    /// [`ApplyError::Halted`].
    #[autometrics(objective = API_SLO)]
    pub fn update(
        &self,
        entries: Vec<Entry>,
    ) -> Result<Vec<UpdateResult>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ApplyError::Closed.into());
        }
        if self.halted.load(Ordering::Acquire) {
            return Err(ApplyError::Halted.into());
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut expected = self.last_applied() + 1;
        for entry in &entries {
            if entry.index != expected {
                let e = ApplyError::OutOfOrder {
                    expected,
                    got: entry.index,
                };
                self.halt(&e);
                return Err(e.into());
            }
            expected += 1;
        }

        let count = entries.len() as u64;
        let last_index = expected - 1;

        let outcome = match &self.variant {
            StateMachineVariant::Sequential(sm) => sm.update(entries),
            StateMachineVariant::Concurrent(sm) => sm.update(entries),
            StateMachineVariant::OnDisk(sm) => sm.update(entries),
        };

        match outcome {
            Ok(results) => {
                self.applied.store(last_index, Ordering::Release);
                APPLIED_ENTRIES_METRIC
                    .with_label_values(&[&self.group_id.to_string()])
                    .inc_by(count);
                Ok(results)
            }
            Err(e) => {
                self.halt(&e);
                Err(e)
            }
        }
    }

    /// Serve a read. Permitted while halted (the state is still consistent
    /// up to the last applied entry), refused once closed.
    #[autometrics(objective = API_SLO)]
    pub fn lookup(
        &self,
        query: &[u8],
    ) -> Result<QueryResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ApplyError::Closed.into());
        }
        match &self.variant {
            StateMachineVariant::Sequential(sm) => sm.lookup(query),
            StateMachineVariant::Concurrent(sm) => sm.lookup(query),
            StateMachineVariant::OnDisk(sm) => sm.lookup(query),
        }
    }

    /// Capture a consistent view for a later `save_snapshot`. Concurrent
    /// kind only.
    pub fn prepare_snapshot(&self) -> Result<SnapshotCookie> {
        match &self.variant {
            StateMachineVariant::Concurrent(sm) => sm.prepare_snapshot(),
            other => Err(Error::Unsupported {
                op: "prepare_snapshot",
                kind: other.kind().as_str(),
            }),
        }
    }

    /// Force durability of all applied updates. On-disk kind only.
    pub fn sync(&self) -> Result<()> {
        match &self.variant {
            StateMachineVariant::OnDisk(sm) => sm.sync(),
            other => Err(Error::Unsupported {
                op: "sync",
                kind: other.kind().as_str(),
            }),
        }
    }

    /// Release owned resources. Idempotent: the first call closes the
    /// machine, later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(group = self.group_id, replica = self.replica_id, "closing state machine");
        match &self.variant {
            StateMachineVariant::Sequential(sm) => sm.close(),
            StateMachineVariant::Concurrent(sm) => sm.close(),
            StateMachineVariant::OnDisk(sm) => sm.close(),
        }
    }

    fn halt(
        &self,
        cause: &dyn std::fmt::Display,
    ) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            error!(
                group = self.group_id,
                replica = self.replica_id,
                %cause,
                "state machine halted; refusing further updates"
            );
            APPLY_FAILURES_METRIC
                .with_label_values(&[&self.group_id.to_string()])
                .inc();
        } else {
            warn!(group = self.group_id, %cause, "apply failure on already-halted state machine");
        }
    }
}
