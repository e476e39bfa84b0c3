//! In-memory remote store
//!
//! [`MemoryStore`] is a cheaply cloneable handle onto shared state, so a test
//! can hand one clone to a session and keep another to play the part of a
//! concurrent writer. Batches are atomic: instructions run against a copy of
//! the items, which replaces the live items only if every instruction applied.

use crate::error::StoreError;
use crate::ids::{ItemId, Name};
use crate::result::StoreResult;
use crate::store::{
    Batch, BatchResult, FailureKind, Instruction, InstructionOutcome, ItemSnapshot,
    NodeSnapshot, PropertySnapshot, RefreshOutcome, RemoteStore,
};
use crate::value::{PropertyType, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub const ROOT_ID: &str = "root";

#[derive(Debug)]
struct StoreInner {
    items: HashMap<ItemId, ItemSnapshot>,
    next_id: u64,
    injected_failure: Option<(FailureKind, String)>,
    lose_next: bool,
    history: Vec<Batch>,
}

/// Shared in-memory remote store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    root: ItemId,
    inner: Arc<Mutex<StoreInner>>,
}

/// Failed instruction while applying a batch to the working copy
struct Rejection {
    kind: FailureKind,
    message: String,
}

impl Rejection {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Working copy a batch is applied to
struct WorkingCopy {
    items: HashMap<ItemId, ItemSnapshot>,
    next_id: u64,
    reassigned: BTreeMap<ItemId, ItemId>,
    touched: BTreeSet<ItemId>,
}

impl MemoryStore {
    /// Create a store holding only a root node of `root_type`
    pub fn new(root_type: impl Into<Name>) -> Self {
        let root = ItemId::new(ROOT_ID);
        let mut items = HashMap::new();
        items.insert(
            root.clone(),
            ItemSnapshot::Node(NodeSnapshot {
                id: root.clone(),
                parent: None,
                name: Name::new(""),
                revision: 1,
                primary_type: root_type.into(),
                mixins: Vec::new(),
                children: Vec::new(),
                properties: Vec::new(),
            }),
        );

        Self {
            root,
            inner: Arc::new(Mutex::new(StoreInner {
                items,
                next_id: 0,
                injected_failure: None,
                lose_next: false,
                history: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// Reject the next submitted batch at its first instruction
    pub fn fail_next_batch(&self, kind: FailureKind, message: impl Into<String>) -> StoreResult<()> {
        self.lock()?.injected_failure = Some((kind, message.into()));
        Ok(())
    }

    /// Drop the next submitted batch without answering
    pub fn lose_next_batch(&self) -> StoreResult<()> {
        self.lock()?.lose_next = true;
        Ok(())
    }

    /// Batches committed so far, in order
    pub fn history(&self) -> StoreResult<Vec<Batch>> {
        Ok(self.lock()?.history.clone())
    }

    pub fn contains(&self, id: &ItemId) -> StoreResult<bool> {
        Ok(self.lock()?.items.contains_key(id))
    }

    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock()?.items.len())
    }

    /// Add a node as another writer would; returns the persisted id
    pub fn add_node(
        &self,
        parent: &ItemId,
        name: impl Into<Name>,
        primary_type: impl Into<Name>,
    ) -> StoreResult<ItemId> {
        let local = ItemId::new("external-node");
        let result = self.external(Instruction::AddNode {
            parent: parent.clone(),
            id: local.clone(),
            name: name.into(),
            primary_type: primary_type.into(),
        })?;
        persisted_id(&result, &local)
    }

    /// Add a property as another writer would; returns the persisted id
    pub fn add_property(
        &self,
        parent: &ItemId,
        name: impl Into<Name>,
        property_type: PropertyType,
        values: Vec<Value>,
    ) -> StoreResult<ItemId> {
        let local = ItemId::new("external-property");
        let result = self.external(Instruction::AddProperty {
            parent: parent.clone(),
            id: local.clone(),
            name: name.into(),
            property_type,
            multi_valued: values.len() != 1,
            values,
        })?;
        persisted_id(&result, &local)
    }

    /// Overwrite property values as another writer would
    pub fn set_values(&self, id: &ItemId, values: Vec<Value>) -> StoreResult<()> {
        let property_type = match self.fetch(id)? {
            ItemSnapshot::Property(p) => p.property_type,
            ItemSnapshot::Node(_) => {
                return Err(StoreError::Generic(format!("{} is not a property", id)))
            }
        };
        self.external(Instruction::SetValue {
            id: id.clone(),
            property_type,
            values,
        })?;
        Ok(())
    }

    /// Remove an item as another writer would
    pub fn remove(&self, id: &ItemId) -> StoreResult<()> {
        self.external(Instruction::Remove { id: id.clone() })?;
        Ok(())
    }

    fn external(&self, instruction: Instruction) -> StoreResult<BatchResult> {
        let mut inner = self.lock()?;
        let batch = Batch {
            instructions: vec![instruction],
        };
        let result = apply_batch(&mut inner, &batch);
        match result.first_failure() {
            Some((_, kind, message)) => Err(StoreError::Generic(format!("{:?}: {}", kind, message))),
            None => Ok(result),
        }
    }
}

fn persisted_id(result: &BatchResult, local: &ItemId) -> StoreResult<ItemId> {
    result
        .reassigned
        .get(local)
        .cloned()
        .ok_or_else(|| StoreError::Generic(format!("no id assigned for {}", local)))
}

impl RemoteStore for MemoryStore {
    fn root_id(&self) -> ItemId {
        self.root.clone()
    }

    fn submit_batch(&self, batch: &Batch) -> StoreResult<BatchResult> {
        let mut inner = self.lock()?;

        if inner.lose_next {
            inner.lose_next = false;
            return Err(StoreError::OutcomeUnknown("batch lost in transit".to_string()));
        }

        if let Some((kind, message)) = inner.injected_failure.take() {
            let mut outcomes = vec![InstructionOutcome::NotAttempted; batch.len()];
            if let Some(first) = outcomes.first_mut() {
                *first = InstructionOutcome::Failed { kind, message };
            }
            return Ok(BatchResult {
                outcomes,
                ..BatchResult::default()
            });
        }

        Ok(apply_batch(&mut inner, batch))
    }

    fn fetch(&self, id: &ItemId) -> StoreResult<ItemSnapshot> {
        self.lock()?
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn refresh(&self, id: &ItemId, known_revision: u64) -> StoreResult<RefreshOutcome> {
        let inner = self.lock()?;
        Ok(match inner.items.get(id) {
            None => RefreshOutcome::Destroyed,
            Some(item) if item.revision() == known_revision => RefreshOutcome::Unchanged,
            Some(item) => RefreshOutcome::Modified(item.clone()),
        })
    }
}

fn apply_batch(inner: &mut StoreInner, batch: &Batch) -> BatchResult {
    let mut working = WorkingCopy {
        items: inner.items.clone(),
        next_id: inner.next_id,
        reassigned: BTreeMap::new(),
        touched: BTreeSet::new(),
    };

    let mut outcomes = Vec::with_capacity(batch.len());
    for (index, instruction) in batch.instructions.iter().enumerate() {
        if let Err(rejection) = working.apply(instruction) {
            debug!(index, kind = ?rejection.kind, "Memory store rejected batch");
            outcomes.push(InstructionOutcome::Failed {
                kind: rejection.kind,
                message: rejection.message,
            });
            outcomes.resize(batch.len(), InstructionOutcome::NotAttempted);
            return BatchResult {
                outcomes,
                ..BatchResult::default()
            };
        }
        outcomes.push(InstructionOutcome::Applied);
    }

    let revisions = working
        .touched
        .iter()
        .filter_map(|id| working.items.get(id).map(|item| (id.clone(), item.revision())))
        .collect();

    inner.items = working.items;
    inner.next_id = working.next_id;
    inner.history.push(batch.clone());
    debug!(instructions = batch.len(), "Memory store committed batch");

    BatchResult {
        outcomes,
        reassigned: working.reassigned,
        revisions,
    }
}

impl WorkingCopy {
    fn resolve(&self, id: &ItemId) -> ItemId {
        self.reassigned.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Reference values may name items created earlier in the batch
    fn resolve_values(&self, values: &[Value]) -> Vec<Value> {
        values
            .iter()
            .cloned()
            .map(|mut value| {
                for (local, persisted) in &self.reassigned {
                    if value.rebind_reference(local, persisted) {
                        break;
                    }
                }
                value
            })
            .collect()
    }

    fn allocate(&mut self, local: &ItemId) -> Result<ItemId, Rejection> {
        if self.reassigned.contains_key(local) || self.items.contains_key(local) {
            return Err(Rejection::new(
                FailureKind::AlreadyExists,
                format!("id {} already in use", local),
            ));
        }
        self.next_id += 1;
        let id = ItemId::new(format!("item-{}", self.next_id));
        self.reassigned.insert(local.clone(), id.clone());
        Ok(id)
    }

    fn node_mut(&mut self, id: &ItemId) -> Result<&mut NodeSnapshot, Rejection> {
        match self.items.get_mut(id) {
            Some(ItemSnapshot::Node(node)) => Ok(node),
            Some(ItemSnapshot::Property(_)) => Err(Rejection::new(
                FailureKind::Constraint,
                format!("{} is not a node", id),
            )),
            None => Err(Rejection::new(FailureKind::NotFound, format!("node {} not found", id))),
        }
    }

    fn touch(&mut self, id: &ItemId) {
        if self.touched.insert(id.clone()) {
            if let Some(item) = self.items.get_mut(id) {
                match item {
                    ItemSnapshot::Node(n) => n.revision += 1,
                    ItemSnapshot::Property(p) => p.revision += 1,
                }
            }
        }
    }

    fn is_ancestor(&self, ancestor: &ItemId, id: &ItemId) -> bool {
        let mut current = Some(id.clone());
        while let Some(cursor) = current {
            if &cursor == ancestor {
                return true;
            }
            current = match self.items.get(&cursor) {
                Some(ItemSnapshot::Node(n)) => n.parent.clone(),
                Some(ItemSnapshot::Property(p)) => Some(p.parent.clone()),
                None => None,
            };
        }
        false
    }

    fn apply(&mut self, instruction: &Instruction) -> Result<(), Rejection> {
        match instruction {
            Instruction::AddNode {
                parent,
                id,
                name,
                primary_type,
            } => {
                let parent = self.resolve(parent);
                self.node_mut(&parent)?;
                let new_id = self.allocate(id)?;
                self.node_mut(&parent)?
                    .children
                    .push((name.clone(), new_id.clone()));
                self.items.insert(
                    new_id.clone(),
                    ItemSnapshot::Node(NodeSnapshot {
                        id: new_id.clone(),
                        parent: Some(parent.clone()),
                        name: name.clone(),
                        revision: 0,
                        primary_type: primary_type.clone(),
                        mixins: Vec::new(),
                        children: Vec::new(),
                        properties: Vec::new(),
                    }),
                );
                self.touch(&parent);
                self.touch(&new_id);
                Ok(())
            }

            Instruction::AddProperty {
                parent,
                id,
                name,
                property_type,
                multi_valued,
                values,
            } => {
                let parent = self.resolve(parent);
                if self.node_mut(&parent)?.properties.iter().any(|(n, _)| n == name) {
                    return Err(Rejection::new(
                        FailureKind::AlreadyExists,
                        format!("property {} already exists on {}", name, parent),
                    ));
                }
                let new_id = self.allocate(id)?;
                let values = self.resolve_values(values);
                self.node_mut(&parent)?
                    .properties
                    .push((name.clone(), new_id.clone()));
                self.items.insert(
                    new_id.clone(),
                    ItemSnapshot::Property(PropertySnapshot {
                        id: new_id.clone(),
                        parent: parent.clone(),
                        name: name.clone(),
                        revision: 0,
                        property_type: *property_type,
                        multi_valued: *multi_valued,
                        values,
                    }),
                );
                self.touch(&parent);
                self.touch(&new_id);
                Ok(())
            }

            Instruction::SetValue {
                id,
                property_type,
                values,
            } => {
                let id = self.resolve(id);
                let values = self.resolve_values(values);
                match self.items.get_mut(&id) {
                    Some(ItemSnapshot::Property(p)) => {
                        p.property_type = *property_type;
                        p.values = values;
                    }
                    Some(ItemSnapshot::Node(_)) => {
                        return Err(Rejection::new(
                            FailureKind::Constraint,
                            format!("{} is not a property", id),
                        ))
                    }
                    None => {
                        return Err(Rejection::new(
                            FailureKind::NotFound,
                            format!("property {} not found", id),
                        ))
                    }
                }
                self.touch(&id);
                Ok(())
            }

            Instruction::Remove { id } => {
                let id = self.resolve(id);
                let parent = match self.items.get(&id) {
                    Some(ItemSnapshot::Node(n)) => n.parent.clone().ok_or_else(|| {
                        Rejection::new(FailureKind::Constraint, "cannot remove the root node")
                    })?,
                    Some(ItemSnapshot::Property(p)) => p.parent.clone(),
                    None => {
                        return Err(Rejection::new(
                            FailureKind::NotFound,
                            format!("item {} not found", id),
                        ))
                    }
                };
                let parent_node = self.node_mut(&parent)?;
                parent_node.children.retain(|(_, c)| c != &id);
                parent_node.properties.retain(|(_, p)| p != &id);
                self.remove_subtree(&id);
                self.touch(&parent);
                Ok(())
            }

            Instruction::Move {
                id,
                new_parent,
                new_name,
            } => {
                let id = self.resolve(id);
                let new_parent = self.resolve(new_parent);
                self.node_mut(&new_parent)?;
                if self.is_ancestor(&id, &new_parent) {
                    return Err(Rejection::new(
                        FailureKind::Constraint,
                        format!("cannot move {} below itself", id),
                    ));
                }
                let old_parent = self.node_mut(&id)?.parent.clone().ok_or_else(|| {
                    Rejection::new(FailureKind::Constraint, "cannot move the root node")
                })?;
                self.node_mut(&old_parent)?.children.retain(|(_, c)| c != &id);
                self.node_mut(&new_parent)?
                    .children
                    .push((new_name.clone(), id.clone()));
                let node = self.node_mut(&id)?;
                node.parent = Some(new_parent.clone());
                node.name = new_name.clone();
                self.touch(&old_parent);
                self.touch(&new_parent);
                self.touch(&id);
                Ok(())
            }

            Instruction::Reorder {
                parent,
                child,
                before,
            } => {
                let parent = self.resolve(parent);
                let child = self.resolve(child);
                let before = before.as_ref().map(|b| self.resolve(b));
                let node = self.node_mut(&parent)?;
                let from = node
                    .children
                    .iter()
                    .position(|(_, c)| c == &child)
                    .ok_or_else(|| {
                        Rejection::new(FailureKind::NotFound, format!("{} is not a child", child))
                    })?;
                let entry = node.children.remove(from);
                let to = match &before {
                    Some(b) => node
                        .children
                        .iter()
                        .position(|(_, c)| c == b)
                        .ok_or_else(|| {
                            Rejection::new(FailureKind::NotFound, format!("{} is not a child", b))
                        })?,
                    None => node.children.len(),
                };
                node.children.insert(to, entry);
                self.touch(&parent);
                Ok(())
            }

            Instruction::SetMixins { id, mixins } => {
                let id = self.resolve(id);
                self.node_mut(&id)?.mixins = mixins.clone();
                self.touch(&id);
                Ok(())
            }
        }
    }

    fn remove_subtree(&mut self, id: &ItemId) {
        if let Some(item) = self.items.remove(id) {
            self.touched.remove(id);
            if let ItemSnapshot::Node(node) = item {
                for (_, child) in node.children.iter().chain(node.properties.iter()) {
                    self.remove_subtree(child);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new("nt:unstructured")
    }

    #[test]
    fn test_batch_reassigns_local_ids() {
        let store = store();
        let root = store.root_id();

        let batch = Batch {
            instructions: vec![
                Instruction::AddNode {
                    parent: root.clone(),
                    id: ItemId::new("tmp-1"),
                    name: Name::new("a"),
                    primary_type: Name::new("nt:unstructured"),
                },
                Instruction::AddProperty {
                    parent: ItemId::new("tmp-1"),
                    id: ItemId::new("tmp-2"),
                    name: Name::new("title"),
                    property_type: PropertyType::String,
                    multi_valued: false,
                    values: vec![Value::from("hello")],
                },
            ],
        };

        let result = store.submit_batch(&batch).unwrap();
        assert!(result.is_success());

        let node_id = result.reassigned[&ItemId::new("tmp-1")].clone();
        let prop_id = result.reassigned[&ItemId::new("tmp-2")].clone();

        match store.fetch(&node_id).unwrap() {
            ItemSnapshot::Node(node) => {
                assert_eq!(node.properties, vec![(Name::new("title"), prop_id.clone())]);
                assert_eq!(node.parent, Some(root));
            }
            other => panic!("expected node, got {:?}", other),
        }
        assert!(result.revisions.contains_key(&prop_id));
    }

    #[test]
    fn test_failed_batch_is_not_committed() {
        let store = store();
        let root = store.root_id();

        let batch = Batch {
            instructions: vec![
                Instruction::AddNode {
                    parent: root.clone(),
                    id: ItemId::new("tmp-1"),
                    name: Name::new("a"),
                    primary_type: Name::new("nt:unstructured"),
                },
                Instruction::Remove {
                    id: ItemId::new("missing"),
                },
                Instruction::SetMixins {
                    id: root.clone(),
                    mixins: vec![],
                },
            ],
        };

        let result = store.submit_batch(&batch).unwrap();
        assert!(!result.is_success());
        assert_eq!(result.outcomes[0], InstructionOutcome::Applied);
        assert!(matches!(
            result.outcomes[1],
            InstructionOutcome::Failed {
                kind: FailureKind::NotFound,
                ..
            }
        ));
        assert_eq!(result.outcomes[2], InstructionOutcome::NotAttempted);

        // Only the root is left
        assert_eq!(store.len().unwrap(), 1);
        assert!(store.history().unwrap().is_empty());
    }

    #[test]
    fn test_refresh_reports_modification_and_destruction() {
        let store = store();
        let root = store.root_id();
        let prop = store
            .add_property(&root, "title", PropertyType::String, vec![Value::from("a")])
            .unwrap();

        let revision = store.fetch(&prop).unwrap().revision();
        assert_eq!(store.refresh(&prop, revision).unwrap(), RefreshOutcome::Unchanged);

        store.set_values(&prop, vec![Value::from("b")]).unwrap();
        assert!(matches!(
            store.refresh(&prop, revision).unwrap(),
            RefreshOutcome::Modified(_)
        ));

        store.remove(&prop).unwrap();
        assert_eq!(store.refresh(&prop, revision).unwrap(), RefreshOutcome::Destroyed);
    }

    #[test]
    fn test_remove_drops_descendants() {
        let store = store();
        let root = store.root_id();
        let a = store.add_node(&root, "a", "nt:unstructured").unwrap();
        let b = store.add_node(&a, "b", "nt:unstructured").unwrap();
        let p = store
            .add_property(&b, "flag", PropertyType::Boolean, vec![Value::from(true)])
            .unwrap();

        store.remove(&a).unwrap();

        assert!(!store.contains(&a).unwrap());
        assert!(!store.contains(&b).unwrap());
        assert!(!store.contains(&p).unwrap());
    }

    #[test]
    fn test_move_below_itself_is_rejected() {
        let store = store();
        let root = store.root_id();
        let a = store.add_node(&root, "a", "nt:unstructured").unwrap();
        let b = store.add_node(&a, "b", "nt:unstructured").unwrap();

        let result = store
            .submit_batch(&Batch {
                instructions: vec![Instruction::Move {
                    id: a.clone(),
                    new_parent: b,
                    new_name: Name::new("a"),
                }],
            })
            .unwrap();

        assert_eq!(result.first_failure().map(|f| f.1), Some(FailureKind::Constraint));
    }

    #[test]
    fn test_injected_failures() {
        let store = store();
        let root = store.root_id();
        let batch = Batch {
            instructions: vec![Instruction::SetMixins {
                id: root,
                mixins: vec![Name::new("mix:title")],
            }],
        };

        store.fail_next_batch(FailureKind::LockConflict, "locked").unwrap();
        let result = store.submit_batch(&batch).unwrap();
        assert_eq!(result.first_failure().map(|f| f.1), Some(FailureKind::LockConflict));

        store.lose_next_batch().unwrap();
        assert!(matches!(
            store.submit_batch(&batch),
            Err(StoreError::OutcomeUnknown(_))
        ));

        // Injected failures are one-shot
        assert!(store.submit_batch(&batch).unwrap().is_success());
    }
}
