//! # Item States
//!
//! In-memory representation of one node or one property. Fields are only
//! writable inside this crate: status changes go through the state tree's
//! transition table, content changes through operations.
//!
//! ## Status lifecycle
//!
//! ```text
//!             discard / save
//!        ┌──────────────────────┐
//!        ▼                      │
//!    Existing ──modify──▶ ExistingModified ──refresh──▶ StaleModified
//!        │                      │                          │
//!      remove                 remove                    refresh
//!        ▼                      ▼                          ▼
//!    ExistingRemoved ◀──────────┘                   StaleDestroyed
//!        │ save                                            │
//!        ▼                                                 ▼
//!     Removed ◀────────────────────────────────────────────┘
//!
//!    New ──save──▶ Existing          (discard/remove: deleted outright)
//! ```

use arbor_spi::{
    ItemId, Name, NodeDefinition, NodeSnapshot, PropertyDefinition, PropertySnapshot, PropertyType,
    Value,
};
use serde::Serialize;

/// Lifecycle tag of an item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemStatus {
    /// Unmodified mirror of remote truth
    Existing,
    ExistingModified,
    /// Created locally, never persisted
    New,
    /// Marked for deletion, kept for rollback
    ExistingRemoved,
    /// Deletion persisted or observed remotely
    Removed,
    /// Remote copy changed under a locally modified state
    StaleModified,
    /// Remote copy destroyed under a locally modified state
    StaleDestroyed,
    /// Must be fetched again before use
    Invalidated,
}

impl ItemStatus {
    pub fn can_transition_to(self, to: ItemStatus) -> bool {
        use crate::state::ItemStatus::*;
        matches!(
            (self, to),
            (Existing, ExistingModified)
                | (Existing, ExistingRemoved)
                | (Existing, Invalidated)
                | (Existing, Removed)
                | (ExistingModified, Existing)
                | (ExistingModified, ExistingRemoved)
                | (ExistingModified, StaleModified)
                | (ExistingModified, StaleDestroyed)
                | (ExistingRemoved, Existing)
                | (ExistingRemoved, Removed)
                | (ExistingRemoved, StaleDestroyed)
                | (New, Existing)
                | (StaleModified, Invalidated)
                | (StaleModified, StaleDestroyed)
                | (StaleDestroyed, Removed)
                | (Invalidated, Existing)
                | (Invalidated, Removed)
        )
    }

    /// Visible to lookups and usable as an operation operand
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ItemStatus::Existing | ItemStatus::ExistingModified | ItemStatus::New
        )
    }

    pub fn is_removed(self) -> bool {
        matches!(self, ItemStatus::ExistingRemoved | ItemStatus::Removed)
    }

    pub fn is_stale(self) -> bool {
        matches!(self, ItemStatus::StaleModified | ItemStatus::StaleDestroyed)
    }
}

/// Named, non-owning reference from a node to a child item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildEntry {
    pub name: Name,
    pub id: ItemId,
}

impl ChildEntry {
    pub fn new(name: Name, id: ItemId) -> Self {
        Self { name, id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeState {
    pub(crate) id: ItemId,
    pub(crate) parent: Option<ItemId>,
    pub(crate) name: Name,
    pub(crate) status: ItemStatus,
    pub(crate) revision: Option<u64>,
    pub(crate) primary_type: Name,
    pub(crate) mixins: Vec<Name>,
    pub(crate) definition: Option<NodeDefinition>,
    pub(crate) children: Vec<ChildEntry>,
    pub(crate) properties: Vec<ChildEntry>,
}

impl NodeState {
    /// Unmodified mirror of a remote node
    pub(crate) fn from_snapshot(snapshot: NodeSnapshot, definition: Option<NodeDefinition>) -> Self {
        let entries = |pairs: Vec<(Name, ItemId)>| {
            pairs
                .into_iter()
                .map(|(name, id)| ChildEntry::new(name, id))
                .collect()
        };
        Self {
            id: snapshot.id,
            parent: snapshot.parent,
            name: snapshot.name,
            status: ItemStatus::Existing,
            revision: Some(snapshot.revision),
            primary_type: snapshot.primary_type,
            mixins: snapshot.mixins,
            definition,
            children: entries(snapshot.children),
            properties: entries(snapshot.properties),
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn parent(&self) -> Option<&ItemId> {
        self.parent.as_ref()
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn primary_type(&self) -> &Name {
        &self.primary_type
    }

    pub fn mixins(&self) -> &[Name] {
        &self.mixins
    }

    pub fn definition(&self) -> Option<&NodeDefinition> {
        self.definition.as_ref()
    }

    /// Every child reference, including ones marked for removal
    pub fn child_entries(&self) -> &[ChildEntry] {
        &self.children
    }

    /// Every property reference, including ones marked for removal
    pub fn property_entries(&self) -> &[ChildEntry] {
        &self.properties
    }

    /// Primary type followed by mixins
    pub fn effective_types(&self) -> Vec<Name> {
        std::iter::once(self.primary_type.clone())
            .chain(self.mixins.iter().cloned())
            .collect()
    }

    pub fn has_type(&self, node_type: &Name) -> bool {
        &self.primary_type == node_type || self.mixins.contains(node_type)
    }

    pub(crate) fn child_position(&self, id: &ItemId) -> Option<usize> {
        self.children.iter().position(|c| &c.id == id)
    }

    pub(crate) fn unlink(&mut self, id: &ItemId) {
        self.children.retain(|c| &c.id != id);
        self.properties.retain(|p| &p.id != id);
    }

    pub(crate) fn rebind_entry(&mut self, old: &ItemId, new: &ItemId) {
        for entry in self.children.iter_mut().chain(self.properties.iter_mut()) {
            if &entry.id == old {
                entry.id = new.clone();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyState {
    pub(crate) id: ItemId,
    pub(crate) parent: ItemId,
    pub(crate) name: Name,
    pub(crate) status: ItemStatus,
    pub(crate) revision: Option<u64>,
    pub(crate) property_type: PropertyType,
    pub(crate) multi_valued: bool,
    pub(crate) values: Vec<Value>,
    pub(crate) definition: Option<PropertyDefinition>,
}

impl PropertyState {
    pub(crate) fn from_snapshot(
        snapshot: PropertySnapshot,
        definition: Option<PropertyDefinition>,
    ) -> Self {
        Self {
            id: snapshot.id,
            parent: snapshot.parent,
            name: snapshot.name,
            status: ItemStatus::Existing,
            revision: Some(snapshot.revision),
            property_type: snapshot.property_type,
            multi_valued: snapshot.multi_valued,
            values: snapshot.values,
            definition,
        }
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn parent(&self) -> &ItemId {
        &self.parent
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    pub fn property_type(&self) -> PropertyType {
        self.property_type
    }

    pub fn is_multi_valued(&self) -> bool {
        self.multi_valued
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The only value of a single-valued property
    pub fn value(&self) -> Option<&Value> {
        if self.multi_valued {
            None
        } else {
            self.values.first()
        }
    }

    pub fn definition(&self) -> Option<&PropertyDefinition> {
        self.definition.as_ref()
    }
}

/// A node or a property
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ItemState {
    Node(NodeState),
    Property(PropertyState),
}

impl ItemState {
    pub fn id(&self) -> &ItemId {
        match self {
            ItemState::Node(n) => &n.id,
            ItemState::Property(p) => &p.id,
        }
    }

    pub fn parent(&self) -> Option<&ItemId> {
        match self {
            ItemState::Node(n) => n.parent.as_ref(),
            ItemState::Property(p) => Some(&p.parent),
        }
    }

    pub fn name(&self) -> &Name {
        match self {
            ItemState::Node(n) => &n.name,
            ItemState::Property(p) => &p.name,
        }
    }

    pub fn status(&self) -> ItemStatus {
        match self {
            ItemState::Node(n) => n.status,
            ItemState::Property(p) => p.status,
        }
    }

    pub fn revision(&self) -> Option<u64> {
        match self {
            ItemState::Node(n) => n.revision,
            ItemState::Property(p) => p.revision,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, ItemState::Node(_))
    }

    pub fn as_node(&self) -> Option<&NodeState> {
        match self {
            ItemState::Node(n) => Some(n),
            ItemState::Property(_) => None,
        }
    }

    pub fn as_property(&self) -> Option<&PropertyState> {
        match self {
            ItemState::Property(p) => Some(p),
            ItemState::Node(_) => None,
        }
    }

    /// Same content ignoring status and revision
    pub fn same_content(&self, other: &ItemState) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.set_status(ItemStatus::Existing);
        b.set_status(ItemStatus::Existing);
        a.set_revision(None);
        b.set_revision(None);
        a == b
    }

    pub(crate) fn set_status(&mut self, status: ItemStatus) {
        match self {
            ItemState::Node(n) => n.status = status,
            ItemState::Property(p) => p.status = status,
        }
    }

    pub(crate) fn set_revision(&mut self, revision: Option<u64>) {
        match self {
            ItemState::Node(n) => n.revision = revision,
            ItemState::Property(p) => p.revision = revision,
        }
    }

    pub(crate) fn set_id(&mut self, id: ItemId) {
        match self {
            ItemState::Node(n) => n.id = id,
            ItemState::Property(p) => p.id = id,
        }
    }

    pub(crate) fn set_parent(&mut self, parent: ItemId) {
        match self {
            ItemState::Node(n) => n.parent = Some(parent),
            ItemState::Property(p) => p.parent = parent,
        }
    }

    pub(crate) fn as_node_mut(&mut self) -> Option<&mut NodeState> {
        match self {
            ItemState::Node(n) => Some(n),
            ItemState::Property(_) => None,
        }
    }

    pub(crate) fn as_property_mut(&mut self) -> Option<&mut PropertyState> {
        match self {
            ItemState::Property(p) => Some(p),
            ItemState::Node(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ItemStatus::*;

    #[test]
    fn test_transition_table() {
        assert!(Existing.can_transition_to(ExistingModified));
        assert!(ExistingModified.can_transition_to(Existing));
        assert!(ExistingModified.can_transition_to(StaleModified));
        assert!(New.can_transition_to(Existing));

        assert!(!New.can_transition_to(ExistingModified));
        assert!(!New.can_transition_to(ExistingRemoved));
        assert!(!Removed.can_transition_to(Existing));
        assert!(!StaleDestroyed.can_transition_to(Existing));
        assert!(!Existing.can_transition_to(New));
    }

    #[test]
    fn test_removed_is_terminal() {
        for to in [
            Existing,
            ExistingModified,
            New,
            ExistingRemoved,
            Removed,
            StaleModified,
            StaleDestroyed,
            Invalidated,
        ] {
            assert!(!Removed.can_transition_to(to), "Removed -> {:?}", to);
        }
    }

    #[test]
    fn test_same_content_ignores_status() {
        let state = ItemState::Property(PropertyState {
            id: ItemId::new("p"),
            parent: ItemId::new("n"),
            name: Name::new("title"),
            status: Existing,
            revision: Some(3),
            property_type: PropertyType::String,
            multi_valued: false,
            values: vec![Value::from("a")],
            definition: None,
        });

        let mut touched = state.clone();
        touched.set_status(ExistingModified);
        touched.set_revision(Some(4));
        assert!(state.same_content(&touched));

        if let Some(p) = touched.as_property_mut() {
            p.values = vec![Value::from("b")];
        }
        assert!(!state.same_content(&touched));
    }
}
