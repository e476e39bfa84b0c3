//! # Save Transaction
//!
//! Coordinates one save: Prepare → Submit → Commit | Rollback
//!
//! The Transaction manages:
//! - A snapshot of every affected state, taken before anything is sent
//! - Revalidation of the pending operations against the current tree
//! - Encoding the change log into one [`Batch`] of primitive instructions
//! - Committing the store's answer into the tree, or putting the snapshot back
//!
//! Submission itself belongs to the caller (see [`crate::Session::save`] and
//! [`crate::Session::begin_save`]), so the batch can cross an async boundary.

use crate::change_log::ChangeLog;
use crate::constraints::Permission;
use crate::errors::{SessionError, SessionResult};
use crate::identity::DefinitionLookup;
use crate::operation::{
    AddNode, AddProperty, Move, ReorderNodes, Remove, SetMixins, SetPropertyValue,
};
use crate::state::{ItemState, ItemStatus, NodeState};
use crate::state_tree::StateTree;
use crate::visitor::{check_values, Guard, OperationVisitor};
use arbor_spi::{Batch, BatchResult, Instruction, ItemId};
use std::collections::BTreeMap;

/// Summary of a committed save
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveReport {
    /// Instructions sent to the remote store
    pub submitted: usize,
    /// States now `Existing`, by persisted id
    pub persisted: Vec<ItemId>,
    /// States whose removal was persisted
    pub removed: Vec<ItemId>,
    /// Session-local id -> persisted id
    pub reassigned: BTreeMap<ItemId, ItemId>,
}

/// A prepared save waiting for the remote store's answer
#[derive(Debug, Clone)]
pub struct Transaction {
    snapshot: Vec<(ItemId, Option<ItemState>)>,
    batch: Batch,
}

impl Transaction {
    /// Snapshot, revalidate and encode the pending work in `log`
    pub(crate) fn prepare(
        tree: &StateTree,
        log: &ChangeLog,
        lookup: &DefinitionLookup,
        guard: Guard<'_>,
    ) -> SessionResult<Self> {
        let snapshot = log
            .affected()
            .into_iter()
            .map(|id| {
                let state = tree.peek(&id).cloned();
                (id, state)
            })
            .collect();

        let mut revalidator = Revalidator {
            tree,
            log,
            lookup,
            guard,
        };
        log.replay(&mut revalidator)?;

        let instructions = log.replay(&mut InstructionEncoder)?;
        Ok(Self {
            snapshot,
            batch: Batch { instructions },
        })
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Ids covered by the pre-save snapshot
    pub fn affected(&self) -> impl Iterator<Item = &ItemId> {
        self.snapshot.iter().map(|(id, _)| id)
    }

    /// Fold a successful batch result into the tree and clear the log.
    ///
    /// On error the tree may be half-committed; callers roll back.
    pub(crate) fn commit(
        &self,
        tree: &mut StateTree,
        log: &mut ChangeLog,
        result: &BatchResult,
    ) -> SessionResult<SaveReport> {
        for (id, _) in &self.snapshot {
            if let Some(state) = tree.peek(id) {
                let status = state.status();
                if status.is_stale() || status == ItemStatus::Invalidated || status == ItemStatus::Removed {
                    return Err(SessionError::StaleState(id.clone()));
                }
            }
        }

        let mut report = SaveReport {
            submitted: self.batch.len(),
            reassigned: result.reassigned.clone(),
            ..SaveReport::default()
        };

        for (id, _) in &self.snapshot {
            let Some(status) = tree.peek(id).map(|s| s.status()) else {
                continue;
            };
            match status {
                ItemStatus::ExistingRemoved => {
                    tree.transition(id, ItemStatus::Removed)?;
                    report.removed.extend(tree.subtree(id));
                    tree.evict(id);
                }
                ItemStatus::New | ItemStatus::ExistingModified => {
                    tree.transition(id, ItemStatus::Existing)?;
                    report.persisted.push(id.clone());
                }
                _ => {}
            }
        }

        for (local, persisted) in &result.reassigned {
            tree.rebind(local, persisted);
        }
        for id in report.persisted.iter_mut() {
            if let Some(persisted) = result.reassigned.get(&*id) {
                *id = persisted.clone();
            }
        }
        for id in &report.persisted {
            if let Some(revision) = result.revisions.get(id) {
                tree.set_revision(id, Some(*revision));
            }
        }

        log.clear();
        Ok(report)
    }

    /// Put every affected state back the way it was before the save
    pub(crate) fn rollback(&self, tree: &mut StateTree) {
        for (id, state) in self.snapshot.iter().rev() {
            tree.restore(id, state.clone());
        }
    }
}

/// Save-time checks: every operand still present and current, collaborators
/// still agreeing. States removed later in the same log are fine; removed
/// `New` items still mentioned by other entries are skipped, both as subjects
/// and as parents, sources or destinations.
struct Revalidator<'a> {
    tree: &'a StateTree,
    log: &'a ChangeLog,
    lookup: &'a DefinitionLookup,
    guard: Guard<'a>,
}

impl<'a> Revalidator<'a> {
    fn skipped(&self, id: &ItemId) -> bool {
        self.log.is_orphaned(id)
    }

    fn current(&self, id: &ItemId) -> SessionResult<&'a ItemState> {
        let tree = self.tree;
        let state = tree
            .peek(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        match state.status() {
            ItemStatus::Removed => Err(SessionError::NotFound(id.clone())),
            ItemStatus::StaleModified | ItemStatus::StaleDestroyed | ItemStatus::Invalidated => {
                Err(SessionError::StaleState(id.clone()))
            }
            _ => Ok(state),
        }
    }

    fn writable_node(&self, id: &ItemId, permission: Permission) -> SessionResult<&'a NodeState> {
        let state = self.current(id)?;
        let node = state
            .as_node()
            .ok_or_else(|| SessionError::constraint(id, "not a node"))?;
        self.guard.writable(node)?;
        self.guard.granted(state, permission)?;
        Ok(node)
    }

    fn writable_operand(&self, id: &ItemId, permission: Permission) -> SessionResult<()> {
        if self.skipped(id) {
            return Ok(());
        }
        self.writable_node(id, permission).map(|_| ())
    }
}

impl OperationVisitor for Revalidator<'_> {
    type Output = ();

    fn visit_add_node(&mut self, op: &AddNode) -> SessionResult<()> {
        if self.skipped(op.id()) {
            return Ok(());
        }
        self.current(op.id())?;
        self.writable_operand(op.parent(), Permission::AddNode)
    }

    fn visit_add_property(&mut self, op: &AddProperty) -> SessionResult<()> {
        if self.skipped(op.id()) {
            return Ok(());
        }
        self.current(op.id())?;
        self.writable_operand(op.parent(), Permission::SetProperty)?;
        check_values(op.id(), op.property_type(), op.is_multi_valued(), op.values())
    }

    fn visit_set_property_value(&mut self, op: &SetPropertyValue) -> SessionResult<()> {
        if self.skipped(op.property()) {
            return Ok(());
        }
        let state = self.current(op.property())?;
        let property = state
            .as_property()
            .ok_or_else(|| SessionError::constraint(op.property(), "not a property"))?;
        self.writable_operand(property.parent(), Permission::SetProperty)?;
        self.guard.granted(state, Permission::SetProperty)?;
        check_values(
            op.property(),
            op.property_type(),
            property.is_multi_valued(),
            op.values(),
        )
    }

    fn visit_remove(&mut self, op: &Remove) -> SessionResult<()> {
        if self.skipped(op.item()) {
            return Ok(());
        }
        let item = self.current(op.item())?;
        if let Some(parent) = op.parent() {
            self.writable_operand(parent, Permission::RemoveItem)?;
        }
        if let Some(node) = item.as_node() {
            self.guard.writable(node)?;
        }
        self.guard.granted(item, Permission::RemoveItem)
    }

    fn visit_move(&mut self, op: &Move) -> SessionResult<()> {
        if self.skipped(op.node()) {
            return Ok(());
        }
        let state = self.current(op.node())?;
        if let Some(node) = state.as_node() {
            self.guard.writable(node)?;
        }
        self.writable_operand(op.source(), Permission::RemoveItem)?;
        self.writable_operand(op.destination(), Permission::AddNode)
    }

    fn visit_reorder_nodes(&mut self, op: &ReorderNodes) -> SessionResult<()> {
        self.writable_operand(op.parent(), Permission::AddNode)
    }

    fn visit_set_mixins(&mut self, op: &SetMixins) -> SessionResult<()> {
        if self.skipped(op.node()) {
            return Ok(());
        }
        let node = self.writable_node(op.node(), Permission::NodeTypeManagement)?;
        for mixin in op.mixins() {
            self.lookup.mixin(node, mixin)?;
        }
        Ok(())
    }
}

/// Operation -> primitive store instruction
struct InstructionEncoder;

impl OperationVisitor for InstructionEncoder {
    type Output = Instruction;

    fn visit_add_node(&mut self, op: &AddNode) -> SessionResult<Instruction> {
        Ok(Instruction::AddNode {
            parent: op.parent().clone(),
            id: op.id().clone(),
            name: op.name().clone(),
            primary_type: op.node_type().clone(),
        })
    }

    fn visit_add_property(&mut self, op: &AddProperty) -> SessionResult<Instruction> {
        Ok(Instruction::AddProperty {
            parent: op.parent().clone(),
            id: op.id().clone(),
            name: op.name().clone(),
            property_type: op.property_type(),
            multi_valued: op.is_multi_valued(),
            values: op.values().to_vec(),
        })
    }

    fn visit_set_property_value(&mut self, op: &SetPropertyValue) -> SessionResult<Instruction> {
        Ok(Instruction::SetValue {
            id: op.property().clone(),
            property_type: op.property_type(),
            values: op.values().to_vec(),
        })
    }

    fn visit_remove(&mut self, op: &Remove) -> SessionResult<Instruction> {
        Ok(Instruction::Remove {
            id: op.item().clone(),
        })
    }

    fn visit_move(&mut self, op: &Move) -> SessionResult<Instruction> {
        Ok(Instruction::Move {
            id: op.node().clone(),
            new_parent: op.destination().clone(),
            new_name: op.new_name().clone(),
        })
    }

    fn visit_reorder_nodes(&mut self, op: &ReorderNodes) -> SessionResult<Instruction> {
        Ok(Instruction::Reorder {
            parent: op.parent().clone(),
            child: op.child().clone(),
            before: op.before().cloned(),
        })
    }

    fn visit_set_mixins(&mut self, op: &SetMixins) -> SessionResult<Instruction> {
        Ok(Instruction::SetMixins {
            id: op.node().clone(),
            mixins: op.mixins().to_vec(),
        })
    }
}
