//! # Change Log
//!
//! The pending unit of work of a session: operations in submission order plus
//! the pre-image of every state they touched.
//!
//! ## Design
//!
//! - Each entry records its operation and the ids whose state it mutated
//! - The baseline keeps one pre-image per touched id, first touch wins, in
//!   first-touch order; discarding restores it in reverse
//! - Removing a never-persisted item drops the entries that only served to
//!   build it, so a doomed creation never reaches the remote store
//! - A second value change on the same property either replaces the first
//!   or is rejected, depending on [`ValueConflict`]
//!
//! ## Example
//!
//! ```rust,ignore
//! session.create_node(&root, "draft", None)?;
//! session.remove(&draft)?;
//! assert!(session.change_log().is_empty());
//! ```

use crate::config::ValueConflict;
use crate::errors::{SessionError, SessionResult};
use crate::operation::Operation;
use crate::state::{ItemState, ItemStatus};
use crate::state_tree::StateTree;
use crate::visitor::{Applied, OperationVisitor};
use arbor_spi::ItemId;
use std::collections::HashSet;
use tracing::debug;

/// One recorded operation
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    seq: u64,
    operation: Operation,
    touched: Vec<ItemId>,
}

impl LogEntry {
    /// Monotonically increasing within a session
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Ids whose state this entry mutated
    pub fn touched(&self) -> &[ItemId] {
        &self.touched
    }

    fn touches(&self, id: &ItemId) -> bool {
        self.touched.contains(id)
    }

    fn merge_touched(&mut self, ids: impl IntoIterator<Item = ItemId>) {
        for id in ids {
            if !self.touched.contains(&id) {
                self.touched.push(id);
            }
        }
    }
}

/// How the log absorbed an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Appended { seq: u64 },
    /// Replaced an earlier pending value change on the same property
    Replaced { seq: u64, replaced: u64 },
    /// Folded into the entry that created the property
    Folded { into: u64 },
    /// Cancelled out earlier entries that built a never-persisted item
    Collapsed { dropped: usize },
}

#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    entries: Vec<LogEntry>,
    baseline: Vec<(ItemId, Option<ItemState>)>,
    /// `New` ids deleted while other entries still mention them
    orphaned: HashSet<ItemId>,
    next_seq: u64,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().map(|e| &e.operation)
    }

    pub fn is_orphaned(&self, id: &ItemId) -> bool {
        self.orphaned.contains(id)
    }

    /// Every id the pending work touches or affects, in first-touch order
    pub fn affected(&self) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self.baseline.iter().map(|(id, _)| id.clone()).collect();
        for entry in &self.entries {
            for id in entry.operation.affected() {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    fn position_where(&self, predicate: impl Fn(&Operation) -> bool) -> Option<usize> {
        self.entries.iter().position(|e| predicate(&e.operation))
    }

    /// Check that `operation` may join the log, before anything is applied
    pub fn admit(&self, operation: &Operation, policy: ValueConflict, max_entries: usize) -> SessionResult<()> {
        if let Operation::SetPropertyValue(op) = operation {
            let created_here = self
                .position_where(|o| matches!(o, Operation::AddProperty(a) if a.id() == op.property()))
                .is_some();
            if created_here {
                return Ok(());
            }

            let pending = self
                .position_where(|o| matches!(o, Operation::SetPropertyValue(s) if s.property() == op.property()))
                .is_some();
            if pending {
                return match policy {
                    ValueConflict::LastWriterWins => Ok(()),
                    ValueConflict::Reject => Err(SessionError::constraint(
                        op.property(),
                        "a value change is already pending for this property",
                    )),
                };
            }
        }

        if max_entries > 0 && self.entries.len() >= max_entries {
            return Err(SessionError::UnsupportedOperation(format!(
                "change log is full ({} entries)",
                max_entries
            )));
        }
        Ok(())
    }

    /// Record an operation that has just been applied to `tree`
    pub fn record(&mut self, tree: &mut StateTree, operation: Operation, applied: Applied) -> Recorded {
        for (id, pre_image) in &applied.pre_images {
            if !self.baseline.iter().any(|(seen, _)| seen == id) {
                self.baseline.push((id.clone(), pre_image.clone()));
            }
        }
        let touched: Vec<ItemId> = applied.touched().cloned().collect();

        if let Operation::SetPropertyValue(op) = &operation {
            if let Some(index) = self
                .position_where(|o| matches!(o, Operation::AddProperty(a) if a.id() == op.property()))
            {
                let entry = &mut self.entries[index];
                if let Operation::AddProperty(add) = &entry.operation {
                    entry.operation =
                        Operation::AddProperty(add.with_values(op.property_type(), op.values().to_vec()));
                }
                entry.merge_touched(touched);
                return Recorded::Folded { into: entry.seq };
            }

            if let Some(index) = self
                .position_where(|o| matches!(o, Operation::SetPropertyValue(s) if s.property() == op.property()))
            {
                let earlier = self.entries.remove(index);
                let seq = self.append(operation, touched);
                if let Some(last) = self.entries.last_mut() {
                    last.merge_touched(earlier.touched);
                }
                return Recorded::Replaced {
                    seq,
                    replaced: earlier.seq,
                };
            }
        }

        let doomed: HashSet<ItemId> = applied.deleted.iter().cloned().collect();
        let seq = self.append(operation, touched);

        if doomed.is_empty() {
            return Recorded::Appended { seq };
        }
        match self.collapse(tree, &doomed) {
            Some(dropped) => Recorded::Collapsed { dropped },
            None => {
                self.orphaned.extend(doomed);
                Recorded::Appended { seq }
            }
        }
    }

    fn append(&mut self, operation: Operation, touched: Vec<ItemId>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(LogEntry {
            seq,
            operation,
            touched,
        });
        seq
    }

    /// Drop the entries whose subject is a deleted `New` item, if no other
    /// entry still mentions one. States left touched only by dropped entries
    /// go back to their pre-image when their content is unchanged.
    fn collapse(&mut self, tree: &mut StateTree, doomed: &HashSet<ItemId>) -> Option<usize> {
        let (dropped, surviving): (Vec<LogEntry>, Vec<LogEntry>) = self
            .entries
            .iter()
            .cloned()
            .partition(|e| doomed.contains(e.operation.subject()));

        let still_referenced = surviving
            .iter()
            .flat_map(|e| e.operation.references())
            .any(|id| doomed.contains(&id));
        if dropped.is_empty() || still_referenced {
            return None;
        }

        let loose: Vec<ItemId> = self
            .baseline
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| dropped.iter().any(|e| e.touches(id)))
            .filter(|id| !surviving.iter().any(|e| e.touches(id)))
            .collect();

        self.entries = surviving;
        for id in loose {
            self.settle(tree, &id);
        }

        if self.entries.is_empty() {
            self.restore_baseline(tree);
            self.clear();
        }

        debug!(dropped = dropped.len(), "Collapsed cancelled operations");
        Some(dropped.len())
    }

    /// Forget `id` in the baseline if its state no longer differs from it
    fn settle(&mut self, tree: &mut StateTree, id: &ItemId) {
        let Some(index) = self.baseline.iter().position(|(seen, _)| seen == id) else {
            return;
        };
        let unchanged = match (&self.baseline[index].1, tree.peek(id)) {
            (Some(pre), Some(current)) => pre.same_content(current),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            let (id, pre_image) = self.baseline.remove(index);
            tree.restore(&id, pre_image);
        }
    }

    /// Run `visitor` over every entry in submission order
    pub fn replay<V: OperationVisitor + ?Sized>(&self, visitor: &mut V) -> SessionResult<Vec<V::Output>> {
        self.entries
            .iter()
            .map(|entry| entry.operation.accept(visitor))
            .collect()
    }

    fn restore_baseline(&mut self, tree: &mut StateTree) {
        for (id, pre_image) in self.baseline.iter().rev() {
            let current = tree.peek(id).map(|s| s.status());
            match (current, pre_image) {
                (Some(ItemStatus::StaleDestroyed), _) => tree.evict(id),
                (Some(ItemStatus::StaleModified), Some(pre)) => {
                    let mut pre = pre.clone();
                    pre.set_status(ItemStatus::Invalidated);
                    tree.restore(id, Some(pre));
                }
                _ => tree.restore(id, pre_image.clone()),
            }
        }
    }

    /// Undo every pending operation and empty the log
    pub fn discard(&mut self, tree: &mut StateTree) {
        debug!(entries = self.entries.len(), touched = self.baseline.len(), "Discarding change log");
        self.restore_baseline(tree);
        self.clear();
    }

    /// Forget pending work without touching the tree
    pub fn clear(&mut self) {
        self.entries.clear();
        self.baseline.clear();
        self.orphaned.clear();
    }
}
