//! Unit of Work: turning tracked state into one storage transaction.
//!
//! [`FlushPlan::from_map`] snapshots every pending record, in insertion
//! order, into a list of [`PendingOp`]s. [`FlushPlan::execute`] runs them
//! inside a single transaction and rolls back on the first failure. The
//! session only updates record states once the transaction has committed, so
//! a failed commit leaves every record exactly as it was.

use crate::identity_map::IdentityMap;
use crate::record::EntityState;
use crate::{SessionEvent, SessionInner};
use entitrack_core::{AnyEntityRef, EntityKey, Error, Result, Row, Schema, Storage};
use serde::Serialize;

/// One storage operation of a commit.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert or overwrite the full row (`Added` or `Modified`).
    Upsert {
        key: EntityKey,
        table: &'static str,
        row: Row,
        state: EntityState,
    },
    Delete { key: EntityKey, table: &'static str },
}

impl PendingOp {
    pub fn key(&self) -> EntityKey {
        match self {
            PendingOp::Upsert { key, .. } | PendingOp::Delete { key, .. } => *key,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Upsert { table, .. } | PendingOp::Delete { table, .. } => *table,
        }
    }

    /// The state the record was in when the plan was taken.
    pub fn state(&self) -> EntityState {
        match self {
            PendingOp::Upsert { state, .. } => *state,
            PendingOp::Delete { .. } => EntityState::Deleted,
        }
    }
}

/// Rows written by a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl CommitSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl PendingCounts {
    pub fn from_map(map: &IdentityMap) -> Self {
        let mut counts = Self::default();
        for record in map.iter() {
            match record.state {
                EntityState::Added => counts.added += 1,
                EntityState::Modified => counts.modified += 1,
                EntityState::Deleted => counts.deleted += 1,
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        counts
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// The ordered operations of one commit.
#[derive(Debug, Clone, Default)]
pub struct FlushPlan {
    pub ops: Vec<PendingOp>,
}

impl FlushPlan {
    /// Snapshot the pending records of `map` in insertion order.
    pub fn from_map(map: &IdentityMap, schema: &Schema) -> Result<Self> {
        let mut ops = Vec::new();
        for record in map.ordered() {
            match record.state {
                EntityState::Added | EntityState::Modified => {
                    let table = schema.table(record.table)?;
                    let entity = record.entity().ok_or(Error::UnknownEntity {
                        key: record.key,
                        operation: "commit",
                    })?;
                    ops.push(PendingOp::Upsert {
                        key: record.key,
                        table: record.table,
                        row: entity.to_row(table),
                        state: record.state,
                    });
                }
                EntityState::Deleted => ops.push(PendingOp::Delete {
                    key: record.key,
                    table: record.table,
                }),
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        Ok(Self { ops })
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Run every operation inside one transaction.
    #[tracing::instrument(level = "debug", skip_all, fields(ops = self.ops.len()))]
    pub fn execute(&self, schema: &Schema, backend: &mut dyn Storage) -> Result<CommitSummary> {
        if self.is_empty() {
            return Ok(CommitSummary::default());
        }
        backend.begin()?;
        let outcome = self
            .run(schema, backend)
            .and_then(|summary| backend.commit().map(|()| summary));
        match outcome {
            Ok(summary) => {
                tracing::debug!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    "Flush complete"
                );
                Ok(summary)
            }
            Err(err) => {
                if backend.in_transaction() {
                    if let Err(rollback) = backend.rollback() {
                        tracing::warn!(error = %rollback, "Rollback failed");
                    }
                }
                tracing::debug!(error = %err, "Flush rolled back");
                Err(err)
            }
        }
    }

    fn run(&self, schema: &Schema, backend: &mut dyn Storage) -> Result<CommitSummary> {
        let mut summary = CommitSummary::default();
        for op in &self.ops {
            let table = schema.table(op.table())?;
            match op {
                PendingOp::Upsert { row, state, .. } => {
                    backend.insert_or_replace(table, row)?;
                    if *state == EntityState::Added {
                        summary.inserted += 1;
                    } else {
                        summary.updated += 1;
                    }
                }
                PendingOp::Delete { key, .. } => {
                    backend.delete(table, *key)?;
                    summary.deleted += 1;
                }
            }
        }
        Ok(summary)
    }
}

impl SessionInner {
    #[tracing::instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub(crate) fn commit(&self) -> Result<CommitSummary> {
        self.ensure_open()?;
        self.fire(SessionEvent::BeforeCommit)?;

        let plan = FlushPlan::from_map(&self.map.borrow(), self.schema())?;
        let executed = {
            let mut backend = self.store.backend.borrow_mut();
            plan.execute(self.schema(), &mut **backend)
        };
        let summary = match executed {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(callback) = self.fire(SessionEvent::AfterRollback) {
                    tracing::warn!(error = %callback, "after_rollback callback failed");
                }
                return Err(err);
            }
        };

        let mut removed = Vec::new();
        {
            let mut map = self.map.borrow_mut();
            for op in &plan.ops {
                match op {
                    PendingOp::Upsert { key, .. } => {
                        if let Some(record) = map.get_mut(*key) {
                            record.transition(EntityState::Unchanged);
                        }
                    }
                    PendingOp::Delete { key, .. } => {
                        if let Some(record) = map.remove(*key) {
                            removed.extend(record.entity());
                        }
                    }
                }
            }
            if self.config.prune_on_commit {
                map.prune();
            }
        }
        for entity in &removed {
            self.release(entity);
        }
        tracing::debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            "Commit complete"
        );

        if self.config.synchronize {
            crate::sync::replay(self, &plan);
        }
        self.fire(SessionEvent::AfterCommit)?;
        Ok(summary)
    }

    /// Write a detached entity in its own transaction, then track it.
    pub(crate) fn insert(&self, entity: &AnyEntityRef) -> Result<()> {
        self.ensure_open()?;
        let key = entity.key();
        if let Some(owner) = entity.session() {
            if owner.session_id() != self.id {
                return Err(self.ownership_error(entity.as_ref(), owner.session_id()));
            }
            let state = self.state(key).unwrap_or(EntityState::Detached);
            return Err(Error::InvalidState {
                key,
                state: state.as_str(),
                operation: "insert",
            });
        }
        if self.live(key).is_some() {
            return Err(Error::DuplicateIdentity { key });
        }
        let table = self.schema().table(entity.table_name())?;
        let plan = FlushPlan {
            ops: vec![PendingOp::Upsert {
                key,
                table: entity.table_name(),
                row: entity.to_row(table),
                state: EntityState::Added,
            }],
        };
        {
            let mut backend = self.store.backend.borrow_mut();
            plan.execute(self.schema(), &mut **backend)?;
        }
        entity.bind_session(self.link());
        self.map.borrow_mut().insert(entity, EntityState::Unchanged);
        Ok(())
    }
}
