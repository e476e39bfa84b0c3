//! # State Tree
//!
//! Arena of every item state a session has loaded or created, keyed by id.
//!
//! ## Ownership
//!
//! - A node owns its children by id only: `children`/`properties` are
//!   ordered `(name, id)` references resolved through the index
//! - The parent pointer on a child is a plain id lookup, never a handle
//! - A listed id that is not indexed names a remote item that has not been
//!   read through yet
//!
//! Listings keep entries of removed items so that a discard can put them
//! back; name lookups and collision checks skip them.

use crate::errors::{SessionError, SessionResult};
use crate::state::{ChildEntry, ItemState, ItemStatus, NodeState, PropertyState};
use arbor_spi::{ItemId, Name, NodeDefinition, PropertyDefinition, PropertyType, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct StateTree {
    root: ItemId,
    items: HashMap<ItemId, ItemState>,
}

impl StateTree {
    pub fn new(root: ItemId) -> Self {
        Self {
            root,
            items: HashMap::new(),
        }
    }

    pub fn root_id(&self) -> &ItemId {
        &self.root
    }

    /// Number of indexed states, whatever their status
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemState> {
        self.items.values()
    }

    /// Raw lookup, regardless of status
    pub fn peek(&self, id: &ItemId) -> Option<&ItemState> {
        self.items.get(id)
    }

    /// Lookup of a state callers may observe
    pub fn get(&self, id: &ItemId) -> SessionResult<&ItemState> {
        let state = self
            .items
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        match state.status() {
            ItemStatus::ExistingRemoved | ItemStatus::Removed => {
                Err(SessionError::NotFound(id.clone()))
            }
            ItemStatus::StaleDestroyed | ItemStatus::Invalidated => {
                Err(SessionError::StaleState(id.clone()))
            }
            _ if self.has_removed_ancestor(id) => Err(SessionError::NotFound(id.clone())),
            _ => Ok(state),
        }
    }

    pub fn node(&self, id: &ItemId) -> SessionResult<&NodeState> {
        self.get(id)?
            .as_node()
            .ok_or_else(|| SessionError::constraint(id, "not a node"))
    }

    pub fn property(&self, id: &ItemId) -> SessionResult<&PropertyState> {
        self.get(id)?
            .as_property()
            .ok_or_else(|| SessionError::constraint(id, "not a property"))
    }

    /// Lookup of a state an operation may act on
    pub fn live(&self, id: &ItemId) -> SessionResult<&ItemState> {
        let state = self.get(id)?;
        if state.status() == ItemStatus::StaleModified {
            return Err(SessionError::StaleState(id.clone()));
        }
        Ok(state)
    }

    pub fn live_node(&self, id: &ItemId) -> SessionResult<&NodeState> {
        self.live(id)?
            .as_node()
            .ok_or_else(|| SessionError::constraint(id, "not a node"))
    }

    pub fn live_property(&self, id: &ItemId) -> SessionResult<&PropertyState> {
        self.live(id)?
            .as_property()
            .ok_or_else(|| SessionError::constraint(id, "not a property"))
    }

    /// Whether a listed entry still counts for lookups
    fn is_listed_live(&self, id: &ItemId) -> bool {
        match self.items.get(id) {
            None => true,
            Some(state) => !matches!(
                state.status(),
                ItemStatus::ExistingRemoved | ItemStatus::Removed | ItemStatus::StaleDestroyed
            ),
        }
    }

    fn has_removed_ancestor(&self, id: &ItemId) -> bool {
        let mut cursor = self.items.get(id).and_then(|s| s.parent().cloned());
        while let Some(parent) = cursor {
            match self.items.get(&parent) {
                Some(state) if state.status().is_removed() => return true,
                Some(state) => cursor = state.parent().cloned(),
                None => return false,
            }
        }
        false
    }

    /// Child entries of `parent` named `name` that are not marked removed
    pub fn live_children_named<'a>(
        &'a self,
        parent: &'a NodeState,
        name: &'a Name,
    ) -> impl Iterator<Item = &'a ChildEntry> + 'a {
        parent
            .children
            .iter()
            .filter(move |c| &c.name == name && self.is_listed_live(&c.id))
    }

    pub fn live_property_named<'a>(
        &'a self,
        parent: &'a NodeState,
        name: &Name,
    ) -> Option<&'a ChildEntry> {
        parent
            .properties
            .iter()
            .find(|p| &p.name == name && self.is_listed_live(&p.id))
    }

    /// Live child entries of `parent` in order
    pub fn live_children<'a>(&'a self, parent: &'a NodeState) -> impl Iterator<Item = &'a ChildEntry> + 'a {
        parent.children.iter().filter(move |c| self.is_listed_live(&c.id))
    }

    pub(crate) fn check_node_collision(
        &self,
        parent: &NodeState,
        name: &Name,
        definition: &NodeDefinition,
        except: Option<&ItemId>,
    ) -> SessionResult<()> {
        for sibling in self.live_children_named(parent, name) {
            if Some(&sibling.id) == except {
                continue;
            }
            let sibling_allows = self
                .items
                .get(&sibling.id)
                .and_then(|s| s.as_node())
                .and_then(|n| n.definition.as_ref())
                .map_or(true, |d| d.allows_same_name_siblings);

            if !(definition.allows_same_name_siblings && sibling_allows) {
                return Err(SessionError::AlreadyExists {
                    parent: parent.id.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn check_property_collision(&self, parent: &NodeState, name: &Name) -> SessionResult<()> {
        match self.live_property_named(parent, name) {
            Some(_) => Err(SessionError::AlreadyExists {
                parent: parent.id.clone(),
                name: name.clone(),
            }),
            None => Ok(()),
        }
    }

    fn node_mut(&mut self, id: &ItemId) -> SessionResult<&mut NodeState> {
        self.items
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?
            .as_node_mut()
            .ok_or_else(|| SessionError::constraint(id, "not a node"))
    }

    pub(crate) fn property_mut(&mut self, id: &ItemId) -> SessionResult<&mut PropertyState> {
        self.items
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?
            .as_property_mut()
            .ok_or_else(|| SessionError::constraint(id, "not a property"))
    }

    /// Allocate a `New` node linked as the last child of `parent`
    pub(crate) fn create_node(
        &mut self,
        parent: &ItemId,
        name: Name,
        id: ItemId,
        primary_type: Name,
        definition: NodeDefinition,
    ) -> SessionResult<()> {
        if self.items.contains_key(&id) {
            return Err(SessionError::constraint(&id, "id already indexed"));
        }
        self.check_node_collision(self.live_node(parent)?, &name, &definition, None)?;

        self.node_mut(parent)?
            .children
            .push(ChildEntry::new(name.clone(), id.clone()));

        let node = NodeState {
            id: id.clone(),
            parent: Some(parent.clone()),
            name,
            status: ItemStatus::New,
            revision: None,
            primary_type,
            mixins: Vec::new(),
            definition: Some(definition),
            children: Vec::new(),
            properties: Vec::new(),
        };
        self.items.insert(id, ItemState::Node(node));
        Ok(())
    }

    /// Allocate a `New` property with `values` attached verbatim
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_property(
        &mut self,
        parent: &ItemId,
        name: Name,
        id: ItemId,
        property_type: PropertyType,
        multi_valued: bool,
        values: Vec<Value>,
        definition: PropertyDefinition,
    ) -> SessionResult<()> {
        if self.items.contains_key(&id) {
            return Err(SessionError::constraint(&id, "id already indexed"));
        }
        self.check_property_collision(self.live_node(parent)?, &name)?;

        self.node_mut(parent)?
            .properties
            .push(ChildEntry::new(name.clone(), id.clone()));

        let property = PropertyState {
            id: id.clone(),
            parent: parent.clone(),
            name,
            status: ItemStatus::New,
            revision: None,
            property_type,
            multi_valued,
            values,
            definition: Some(definition),
        };
        self.items.insert(id, ItemState::Property(property));
        Ok(())
    }

    /// Move `id` along one edge of the transition table
    pub fn transition(&mut self, id: &ItemId, to: ItemStatus) -> SessionResult<()> {
        let state = self
            .items
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        let from = state.status();
        if !from.can_transition_to(to) {
            return Err(SessionError::IllegalStateTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        state.set_status(to);
        Ok(())
    }

    /// Record a local change on `id`; `New` states stay `New`
    pub(crate) fn mark_modified(&mut self, id: &ItemId) -> SessionResult<()> {
        match self.peek(id).map(|s| s.status()) {
            Some(ItemStatus::New) | Some(ItemStatus::ExistingModified) => Ok(()),
            Some(_) => self.transition(id, ItemStatus::ExistingModified),
            None => Err(SessionError::NotFound(id.clone())),
        }
    }

    /// Ids of `id` and every loaded descendant, parents before children
    pub fn subtree(&self, id: &ItemId) -> Vec<ItemId> {
        let mut out = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            let Some(state) = self.items.get(&current) else {
                continue;
            };
            if let Some(node) = state.as_node() {
                for entry in node.children.iter().chain(node.properties.iter()).rev() {
                    if self.items.contains_key(&entry.id) {
                        stack.push(entry.id.clone());
                    }
                }
            }
            out.push(current);
        }
        out
    }

    /// Whether `ancestor` is `id` or lies on its parent chain
    pub fn is_ancestor(&self, ancestor: &ItemId, id: &ItemId) -> bool {
        let mut cursor = Some(id.clone());
        while let Some(current) = cursor {
            if &current == ancestor {
                return true;
            }
            cursor = self.items.get(&current).and_then(|s| s.parent().cloned());
        }
        false
    }

    /// Remove `id` and its loaded subtree.
    ///
    /// `New` states are deleted outright and unlinked from their parent;
    /// every other state is marked `ExistingRemoved` and kept. Returns the
    /// deleted ids.
    pub(crate) fn remove(&mut self, id: &ItemId) -> SessionResult<Vec<ItemId>> {
        self.live(id)?;
        if id == &self.root {
            return Err(SessionError::constraint(id, "the root node cannot be removed"));
        }

        let mut deleted = Vec::new();
        for current in self.subtree(id).into_iter().rev() {
            let Some(status) = self.peek(&current).map(|s| s.status()) else {
                continue;
            };
            match status {
                ItemStatus::New => {
                    if let Some(state) = self.items.remove(&current) {
                        if let Some(parent) = state.parent() {
                            if let Some(node) = self.items.get_mut(parent).and_then(|s| s.as_node_mut()) {
                                node.unlink(&current);
                            }
                        }
                    }
                    deleted.push(current);
                }
                ItemStatus::Existing | ItemStatus::ExistingModified => {
                    self.transition(&current, ItemStatus::ExistingRemoved)?;
                }
                ItemStatus::Invalidated => {
                    self.items.remove(&current);
                }
                ItemStatus::ExistingRemoved | ItemStatus::Removed => {}
                ItemStatus::StaleModified | ItemStatus::StaleDestroyed => {
                    return Err(SessionError::StaleState(current));
                }
            }
        }
        Ok(deleted)
    }

    /// Detach `node` from its parent and list it under `dest` as `name`
    pub(crate) fn relink(
        &mut self,
        node: &ItemId,
        dest: &ItemId,
        name: Name,
        definition: Option<NodeDefinition>,
    ) -> SessionResult<()> {
        let source = self
            .node_mut(node)?
            .parent
            .clone()
            .ok_or_else(|| SessionError::constraint(node, "the root node cannot be moved"))?;

        self.node_mut(&source)?.children.retain(|c| &c.id != node);
        self.node_mut(dest)?
            .children
            .push(ChildEntry::new(name.clone(), node.clone()));

        let moved = self.node_mut(node)?;
        moved.parent = Some(dest.clone());
        moved.name = name;
        if definition.is_some() {
            moved.definition = definition;
        }
        Ok(())
    }

    /// Place `child` right before `before`, or last
    pub(crate) fn reorder(
        &mut self,
        parent: &ItemId,
        child: &ItemId,
        before: Option<&ItemId>,
    ) -> SessionResult<()> {
        let node = self.node_mut(parent)?;
        let from = node
            .child_position(child)
            .ok_or_else(|| SessionError::NotFound(child.clone()))?;
        let entry = node.children.remove(from);

        let to = match before {
            Some(b) => match node.child_position(b) {
                Some(position) => position,
                None => {
                    node.children.insert(from, entry);
                    return Err(SessionError::NotFound(b.clone()));
                }
            },
            None => node.children.len(),
        };
        node.children.insert(to, entry);
        Ok(())
    }

    pub(crate) fn set_mixins(&mut self, id: &ItemId, mixins: Vec<Name>) -> SessionResult<()> {
        self.node_mut(id)?.mixins = mixins;
        Ok(())
    }

    pub(crate) fn set_values(
        &mut self,
        id: &ItemId,
        property_type: PropertyType,
        values: Vec<Value>,
    ) -> SessionResult<()> {
        let property = self.property_mut(id)?;
        property.property_type = property_type;
        property.values = values;
        Ok(())
    }

    /// Index a state, replacing whatever was indexed under its id
    pub(crate) fn insert(&mut self, state: ItemState) {
        self.items.insert(state.id().clone(), state);
    }

    /// Put back a captured pre-image; `None` deletes the state
    pub(crate) fn restore(&mut self, id: &ItemId, pre_image: Option<ItemState>) {
        match pre_image {
            Some(state) => {
                self.items.insert(id.clone(), state);
            }
            None => {
                self.items.remove(id);
            }
        }
    }

    /// Drop `id` and its loaded subtree from the index and from the parent listing
    pub(crate) fn evict(&mut self, id: &ItemId) {
        let parent = self.items.get(id).and_then(|s| s.parent().cloned());
        for current in self.subtree(id) {
            self.items.remove(&current);
        }
        if let Some(parent) = parent {
            if let Some(node) = self.items.get_mut(&parent).and_then(|s| s.as_node_mut()) {
                node.unlink(id);
            }
        }
    }

    /// Forget a listed entry the remote store no longer knows
    pub(crate) fn prune_listing(&mut self, id: &ItemId) {
        for state in self.items.values_mut() {
            if let ItemState::Node(node) = state {
                node.unlink(id);
            }
        }
    }

    /// Replace `old` by `new` in the index, parent pointers, listings and reference values
    pub(crate) fn rebind(&mut self, old: &ItemId, new: &ItemId) {
        if old == new {
            return;
        }
        if let Some(mut state) = self.items.remove(old) {
            state.set_id(new.clone());
            self.items.insert(new.clone(), state);
        }
        if &self.root == old {
            self.root = new.clone();
        }

        for state in self.items.values_mut() {
            if state.parent() == Some(old) {
                state.set_parent(new.clone());
            }
            match state {
                ItemState::Node(node) => node.rebind_entry(old, new),
                ItemState::Property(property) => {
                    for value in property.values.iter_mut() {
                        value.rebind_reference(old, new);
                    }
                }
            }
        }
    }

    pub(crate) fn set_revision(&mut self, id: &ItemId, revision: Option<u64>) {
        if let Some(state) = self.items.get_mut(id) {
            state.set_revision(revision);
        }
    }

    /// Path of `id` from the root, with `[n]` on same-name siblings past the first
    pub fn path(&self, id: &ItemId) -> SessionResult<String> {
        let mut segments = Vec::new();
        let mut cursor = id.clone();
        loop {
            let state = self.get(&cursor)?;
            let Some(parent_id) = state.parent().cloned() else {
                break;
            };
            let parent = self.node(&parent_id)?;

            let segment = match state {
                ItemState::Property(p) => p.name.to_string(),
                ItemState::Node(n) => {
                    let index = self
                        .live_children_named(parent, &n.name)
                        .position(|c| c.id == n.id)
                        .map_or(1, |i| i + 1);
                    if index > 1 {
                        format!("{}[{}]", n.name, index)
                    } else {
                        n.name.to_string()
                    }
                }
            };
            segments.push(segment);
            cursor = parent_id;
        }

        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_spi::NodeSnapshot;

    fn tree() -> StateTree {
        let root = ItemId::new("root");
        let mut tree = StateTree::new(root.clone());
        tree.insert(ItemState::Node(NodeState::from_snapshot(
            NodeSnapshot {
                id: root,
                parent: None,
                name: Name::new(""),
                revision: 1,
                primary_type: Name::new("nt:unstructured"),
                mixins: vec![],
                children: vec![],
                properties: vec![],
            },
            None,
        )));
        tree
    }

    fn add(tree: &mut StateTree, parent: &str, name: &str, id: &str, sns: bool) -> SessionResult<()> {
        let mut definition = NodeDefinition::residual();
        if sns {
            definition = definition.same_name_siblings();
        }
        tree.create_node(
            &ItemId::new(parent),
            Name::new(name),
            ItemId::new(id),
            Name::new("nt:unstructured"),
            definition,
        )?;
        Ok(())
    }

    #[test]
    fn test_create_node_is_new_and_linked() {
        let mut tree = tree();
        add(&mut tree, "root", "a", "n1", false).unwrap();

        let node = tree.node(&ItemId::new("n1")).unwrap();
        assert_eq!(node.status(), ItemStatus::New);
        assert_eq!(node.parent(), Some(&ItemId::new("root")));

        let root = tree.node(&ItemId::new("root")).unwrap();
        assert_eq!(root.child_entries().len(), 1);
        assert_eq!(root.child_entries()[0].name, Name::new("a"));
    }

    #[test]
    fn test_same_name_siblings() {
        let mut tree = tree();
        add(&mut tree, "root", "a", "n1", false).unwrap();

        let err = add(&mut tree, "root", "a", "n2", false).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists { .. }));

        // Both definitions must allow it
        let err = add(&mut tree, "root", "a", "n2", true).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists { .. }));

        add(&mut tree, "root", "b", "n3", true).unwrap();
        add(&mut tree, "root", "b", "n4", true).unwrap();
        assert_eq!(tree.path(&ItemId::new("n4")).unwrap(), "/b[2]");
        assert_eq!(tree.path(&ItemId::new("n3")).unwrap(), "/b");
    }

    #[test]
    fn test_illegal_transition() {
        let mut tree = tree();
        add(&mut tree, "root", "a", "n1", false).unwrap();

        let err = tree
            .transition(&ItemId::new("n1"), ItemStatus::ExistingRemoved)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::IllegalStateTransition {
                from: ItemStatus::New,
                to: ItemStatus::ExistingRemoved,
                ..
            }
        ));
    }

    #[test]
    fn test_remove_new_subtree_deletes() {
        let mut tree = tree();
        add(&mut tree, "root", "a", "n1", false).unwrap();
        add(&mut tree, "n1", "b", "n2", false).unwrap();

        let deleted = tree.remove(&ItemId::new("n1")).unwrap();
        assert_eq!(deleted, vec![ItemId::new("n2"), ItemId::new("n1")]);
        assert!(!tree.contains(&ItemId::new("n1")));
        assert!(!tree.contains(&ItemId::new("n2")));
        assert!(tree.node(&ItemId::new("root")).unwrap().child_entries().is_empty());
    }

    #[test]
    fn test_remove_existing_marks_subtree() {
        let mut tree = tree();
        add(&mut tree, "root", "a", "n1", false).unwrap();
        add(&mut tree, "n1", "b", "n2", false).unwrap();
        tree.transition(&ItemId::new("n1"), ItemStatus::Existing).unwrap();
        tree.transition(&ItemId::new("n2"), ItemStatus::Existing).unwrap();
        add(&mut tree, "n1", "c", "n3", false).unwrap();

        let deleted = tree.remove(&ItemId::new("n1")).unwrap();
        assert_eq!(deleted, vec![ItemId::new("n3")]);

        assert_eq!(
            tree.peek(&ItemId::new("n1")).unwrap().status(),
            ItemStatus::ExistingRemoved
        );
        assert_eq!(
            tree.peek(&ItemId::new("n2")).unwrap().status(),
            ItemStatus::ExistingRemoved
        );
        assert!(matches!(
            tree.get(&ItemId::new("n2")),
            Err(SessionError::NotFound(_))
        ));

        // Removed names no longer collide
        add(&mut tree, "root", "a", "n4", false).unwrap();
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut tree = tree();
        let err = tree.remove(&ItemId::new("root")).unwrap_err();
        assert!(matches!(err, SessionError::ConstraintViolation { .. }));
    }

    #[test]
    fn test_rebind_updates_every_reference() {
        let mut tree = tree();
        add(&mut tree, "root", "a", "local-1", false).unwrap();
        add(&mut tree, "local-1", "b", "local-2", false).unwrap();
        tree.create_property(
            &ItemId::new("root"),
            Name::new("link"),
            ItemId::new("local-3"),
            PropertyType::Reference,
            false,
            vec![Value::Reference(ItemId::new("local-1"))],
            PropertyDefinition::residual(PropertyType::Undefined),
        )
        .unwrap();

        tree.rebind(&ItemId::new("local-1"), &ItemId::new("item-1"));

        assert!(!tree.contains(&ItemId::new("local-1")));
        assert_eq!(tree.node(&ItemId::new("item-1")).unwrap().id(), &ItemId::new("item-1"));
        assert_eq!(
            tree.node(&ItemId::new("local-2")).unwrap().parent(),
            Some(&ItemId::new("item-1"))
        );
        assert_eq!(
            tree.node(&ItemId::new("root")).unwrap().child_entries()[0].id,
            ItemId::new("item-1")
        );
        assert_eq!(
            tree.property(&ItemId::new("local-3")).unwrap().value(),
            Some(&Value::Reference(ItemId::new("item-1")))
        );
    }

    #[test]
    fn test_reorder_and_relink() {
        let mut tree = tree();
        add(&mut tree, "root", "a", "n1", false).unwrap();
        add(&mut tree, "root", "b", "n2", false).unwrap();
        add(&mut tree, "root", "c", "n3", false).unwrap();

        tree.reorder(&ItemId::new("root"), &ItemId::new("n3"), Some(&ItemId::new("n1")))
            .unwrap();
        let names: Vec<_> = tree
            .node(&ItemId::new("root"))
            .unwrap()
            .child_entries()
            .iter()
            .map(|c| c.name.to_string())
            .collect();
        assert_eq!(names, vec!["c", "a", "b"]);

        tree.relink(&ItemId::new("n3"), &ItemId::new("n1"), Name::new("moved"), None)
            .unwrap();
        assert_eq!(tree.path(&ItemId::new("n3")).unwrap(), "/a/moved");
        assert!(tree.is_ancestor(&ItemId::new("n1"), &ItemId::new("n3")));
        assert!(!tree.is_ancestor(&ItemId::new("n2"), &ItemId::new("n3")));
    }
}
