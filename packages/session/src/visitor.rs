//! # Operation Visitors
//!
//! Double dispatch over the closed set of [`Operation`] variants.
//!
//! - [`Validator`] checks preconditions against the state tree and the
//!   constraint collaborators; it never mutates anything
//! - [`Applier`] captures the pre-image of every state before first touching
//!   it, then performs the mutation
//!
//! Save-time visitors live in [`crate::transaction`].
//!
//! [`Operation`]: crate::operation::Operation

use crate::constraints::{ConstraintChecker, Credentials, Permission};
use crate::errors::{SessionError, SessionResult};
use crate::identity::DefinitionLookup;
use crate::operation::{
    AddNode, AddProperty, Move, ReorderNodes, Remove, SetMixins, SetPropertyValue,
};
use crate::state::{ItemState, NodeState};
use crate::state_tree::StateTree;
use arbor_spi::{ItemId, PropertyType, Value};

/// One handler per operation variant
pub trait OperationVisitor {
    type Output;

    fn visit_add_node(&mut self, op: &AddNode) -> SessionResult<Self::Output>;

    fn visit_add_property(&mut self, op: &AddProperty) -> SessionResult<Self::Output>;

    fn visit_set_property_value(&mut self, op: &SetPropertyValue) -> SessionResult<Self::Output>;

    fn visit_remove(&mut self, op: &Remove) -> SessionResult<Self::Output>;

    fn visit_move(&mut self, op: &Move) -> SessionResult<Self::Output>;

    fn visit_reorder_nodes(&mut self, op: &ReorderNodes) -> SessionResult<Self::Output>;

    fn visit_set_mixins(&mut self, op: &SetMixins) -> SessionResult<Self::Output>;
}

/// Lock, version and access checks shared by submit-time and save-time validation
pub(crate) struct Guard<'a> {
    pub constraints: &'a dyn ConstraintChecker,
    pub credentials: &'a Credentials,
}

impl Guard<'_> {
    pub fn writable(&self, node: &NodeState) -> SessionResult<()> {
        if !self.constraints.lock_permits(node, self.credentials) {
            return Err(SessionError::LockConflict(node.id().clone()));
        }
        if !self.constraints.is_checked_out(node) {
            return Err(SessionError::VersionConflict(node.id().clone()));
        }
        Ok(())
    }

    pub fn granted(&self, item: &ItemState, permission: Permission) -> SessionResult<()> {
        if self.constraints.is_granted(item, permission, self.credentials) {
            Ok(())
        } else {
            Err(SessionError::AccessDenied {
                id: item.id().clone(),
                permission,
            })
        }
    }

    /// Writable node on which the caller holds `permission`
    pub fn modifiable(&self, tree: &StateTree, node: &ItemId, permission: Permission) -> SessionResult<()> {
        let state = tree.live(node)?;
        let node_state = state
            .as_node()
            .ok_or_else(|| SessionError::constraint(node, "not a node"))?;
        self.writable(node_state)?;
        self.granted(state, permission)
    }
}

/// Cardinality and value-format checks
pub(crate) fn check_values(
    id: &ItemId,
    property_type: PropertyType,
    multi_valued: bool,
    values: &[Value],
) -> SessionResult<()> {
    if property_type == PropertyType::Undefined {
        return Err(SessionError::constraint(id, "property type must be concrete"));
    }
    if !multi_valued && values.len() != 1 {
        return Err(SessionError::constraint(
            id,
            format!("single-valued property given {} values", values.len()),
        ));
    }
    if let Some(bad) = values.iter().find(|v| v.property_type() != property_type) {
        return Err(SessionError::constraint(
            id,
            format!("{} value in a {} property", bad.property_type(), property_type),
        ));
    }
    Ok(())
}

/// Submit-time precondition checks
pub struct Validator<'a> {
    tree: &'a StateTree,
    lookup: &'a DefinitionLookup,
    guard: Guard<'a>,
}

impl<'a> Validator<'a> {
    pub fn new(
        tree: &'a StateTree,
        lookup: &'a DefinitionLookup,
        constraints: &'a dyn ConstraintChecker,
        credentials: &'a Credentials,
    ) -> Self {
        Self {
            tree,
            lookup,
            guard: Guard {
                constraints,
                credentials,
            },
        }
    }

    fn fresh_id(&self, id: &ItemId) -> SessionResult<()> {
        if self.tree.contains(id) {
            return Err(SessionError::constraint(id, "id already in use"));
        }
        Ok(())
    }
}

impl OperationVisitor for Validator<'_> {
    type Output = ();

    fn visit_add_node(&mut self, op: &AddNode) -> SessionResult<()> {
        self.guard
            .modifiable(self.tree, op.parent(), Permission::AddNode)?;
        let parent = self.tree.live_node(op.parent())?;

        if op.definition().protected {
            return Err(SessionError::constraint(
                op.parent(),
                format!("child node '{}' is protected", op.name()),
            ));
        }
        if self.lookup.primary_type(op.node_type()).is_none() {
            return Err(SessionError::constraint(
                op.parent(),
                format!("'{}' is not a registered primary node type", op.node_type()),
            ));
        }
        let required = &op.definition().required_primary_types;
        if !required.is_empty() && !required.contains(op.node_type()) {
            return Err(SessionError::constraint(
                op.parent(),
                format!("node type {} not allowed for '{}'", op.node_type(), op.name()),
            ));
        }

        self.fresh_id(op.id())?;
        self.tree
            .check_node_collision(parent, op.name(), op.definition(), None)
    }

    fn visit_add_property(&mut self, op: &AddProperty) -> SessionResult<()> {
        self.guard
            .modifiable(self.tree, op.parent(), Permission::SetProperty)?;
        let parent = self.tree.live_node(op.parent())?;
        let definition = op.definition();

        if definition.protected {
            return Err(SessionError::constraint(
                op.parent(),
                format!("property '{}' is protected", op.name()),
            ));
        }
        if !definition.required_type.admits(op.property_type()) {
            return Err(SessionError::constraint(
                op.parent(),
                format!(
                    "property '{}' requires {}, declared {}",
                    op.name(),
                    definition.required_type,
                    op.property_type()
                ),
            ));
        }
        check_values(op.parent(), op.property_type(), definition.multiple, op.values())?;

        self.fresh_id(op.id())?;
        self.tree.check_property_collision(parent, op.name())
    }

    fn visit_set_property_value(&mut self, op: &SetPropertyValue) -> SessionResult<()> {
        let property = self.tree.live_property(op.property())?;
        self.guard
            .modifiable(self.tree, property.parent(), Permission::SetProperty)?;
        self.guard
            .granted(self.tree.live(op.property())?, Permission::SetProperty)?;

        if let Some(definition) = property.definition() {
            if definition.protected {
                return Err(SessionError::constraint(op.property(), "property is protected"));
            }
            if !definition.required_type.admits(op.property_type()) {
                return Err(SessionError::constraint(
                    op.property(),
                    format!("requires {}, given {}", definition.required_type, op.property_type()),
                ));
            }
        }
        check_values(
            op.property(),
            op.property_type(),
            property.is_multi_valued(),
            op.values(),
        )
    }

    fn visit_remove(&mut self, op: &Remove) -> SessionResult<()> {
        let item = self.tree.live(op.item())?;
        let parent = op
            .parent()
            .ok_or_else(|| SessionError::constraint(op.item(), "the root node cannot be removed"))?;

        self.guard
            .modifiable(self.tree, parent, Permission::RemoveItem)?;
        self.guard.granted(item, Permission::RemoveItem)?;

        let protected = match item {
            ItemState::Node(n) => {
                self.guard.writable(n)?;
                n.definition().is_some_and(|d| d.protected)
            }
            ItemState::Property(p) => p.definition().is_some_and(|d| d.protected),
        };
        if protected {
            return Err(SessionError::constraint(op.item(), "item is protected"));
        }

        for id in self.tree.subtree(op.item()) {
            if let Some(state) = self.tree.peek(&id) {
                if state.status().is_stale() {
                    return Err(SessionError::StaleState(id));
                }
            }
        }
        Ok(())
    }

    fn visit_move(&mut self, op: &Move) -> SessionResult<()> {
        let node = self.tree.live_node(op.node())?;
        let destination = self.tree.live_node(op.destination())?;

        self.guard.writable(node)?;
        self.guard
            .modifiable(self.tree, op.source(), Permission::RemoveItem)?;
        self.guard
            .modifiable(self.tree, op.destination(), Permission::AddNode)?;

        if node.definition().is_some_and(|d| d.protected) || op.definition().protected {
            return Err(SessionError::constraint(op.node(), "node is protected"));
        }
        if self.tree.is_ancestor(op.node(), op.destination()) {
            return Err(SessionError::constraint(
                op.node(),
                format!("cannot move below itself ({})", op.destination()),
            ));
        }
        let required = &op.definition().required_primary_types;
        if !required.is_empty() && !required.contains(node.primary_type()) {
            return Err(SessionError::constraint(
                op.node(),
                format!("node type {} not allowed at destination", node.primary_type()),
            ));
        }

        self.tree.check_node_collision(
            destination,
            op.new_name(),
            op.definition(),
            Some(op.node()),
        )
    }

    fn visit_reorder_nodes(&mut self, op: &ReorderNodes) -> SessionResult<()> {
        self.guard
            .modifiable(self.tree, op.parent(), Permission::AddNode)?;
        let parent = self.tree.live_node(op.parent())?;

        if !self.lookup.is_orderable(parent) {
            return Err(SessionError::UnsupportedOperation(format!(
                "children of {} are not orderable",
                op.parent()
            )));
        }

        let listed = |id: &ItemId| self.tree.live_children(parent).any(|c| &c.id == id);
        if !listed(op.child()) {
            return Err(SessionError::NotFound(op.child().clone()));
        }
        if let Some(before) = op.before() {
            if before == op.child() {
                return Err(SessionError::constraint(op.child(), "cannot order a node before itself"));
            }
            if !listed(before) {
                return Err(SessionError::NotFound(before.clone()));
            }
        }
        Ok(())
    }

    fn visit_set_mixins(&mut self, op: &SetMixins) -> SessionResult<()> {
        self.guard
            .modifiable(self.tree, op.node(), Permission::NodeTypeManagement)?;
        let node = self.tree.live_node(op.node())?;

        for (i, mixin) in op.mixins().iter().enumerate() {
            self.lookup.mixin(node, mixin)?;
            if op.mixins()[..i].contains(mixin) {
                return Err(SessionError::constraint(
                    op.node(),
                    format!("mixin {} listed twice", mixin),
                ));
            }
        }
        Ok(())
    }
}

/// Result of applying one operation
#[derive(Debug, Default)]
pub struct Applied {
    /// Pre-images in first-touch order; `None` when the state did not exist
    pub pre_images: Vec<(ItemId, Option<ItemState>)>,
    /// `New` states deleted outright by a removal
    pub deleted: Vec<ItemId>,
}

impl Applied {
    pub fn touched(&self) -> impl Iterator<Item = &ItemId> {
        self.pre_images.iter().map(|(id, _)| id)
    }
}

/// Mutates the state tree, remembering what every touched state looked like
pub struct Applier<'a> {
    tree: &'a mut StateTree,
    applied: Applied,
}

impl<'a> Applier<'a> {
    pub fn new(tree: &'a mut StateTree) -> Self {
        Self {
            tree,
            applied: Applied::default(),
        }
    }

    fn capture(&mut self, id: &ItemId) {
        if self.applied.pre_images.iter().any(|(seen, _)| seen == id) {
            return;
        }
        let pre_image = self.tree.peek(id).cloned();
        self.applied.pre_images.push((id.clone(), pre_image));
    }

    fn touch(&mut self, id: &ItemId) -> SessionResult<()> {
        self.capture(id);
        self.tree.mark_modified(id)
    }

    /// Put every touched state back the way it was
    pub fn abort(self) {
        for (id, pre_image) in self.applied.pre_images.into_iter().rev() {
            self.tree.restore(&id, pre_image);
        }
    }

    pub fn finish(self) -> Applied {
        self.applied
    }
}

impl OperationVisitor for Applier<'_> {
    type Output = ();

    fn visit_add_node(&mut self, op: &AddNode) -> SessionResult<()> {
        self.capture(op.parent());
        self.capture(op.id());
        self.tree.create_node(
            op.parent(),
            op.name().clone(),
            op.id().clone(),
            op.node_type().clone(),
            op.definition().clone(),
        )?;
        self.tree.mark_modified(op.parent())
    }

    fn visit_add_property(&mut self, op: &AddProperty) -> SessionResult<()> {
        self.capture(op.parent());
        self.capture(op.id());
        self.tree.create_property(
            op.parent(),
            op.name().clone(),
            op.id().clone(),
            op.property_type(),
            op.is_multi_valued(),
            op.values().to_vec(),
            op.definition().clone(),
        )?;
        self.tree.mark_modified(op.parent())
    }

    fn visit_set_property_value(&mut self, op: &SetPropertyValue) -> SessionResult<()> {
        self.capture(op.property());
        self.tree
            .set_values(op.property(), op.property_type(), op.values().to_vec())?;
        self.tree.mark_modified(op.property())
    }

    fn visit_remove(&mut self, op: &Remove) -> SessionResult<()> {
        for id in self.tree.subtree(op.item()) {
            self.capture(&id);
        }
        if let Some(parent) = op.parent() {
            self.capture(parent);
        }

        self.applied.deleted = self.tree.remove(op.item())?;

        match op.parent() {
            Some(parent) => self.tree.mark_modified(parent),
            None => Ok(()),
        }
    }

    fn visit_move(&mut self, op: &Move) -> SessionResult<()> {
        self.capture(op.node());
        self.capture(op.source());
        self.capture(op.destination());
        self.tree.relink(
            op.node(),
            op.destination(),
            op.new_name().clone(),
            Some(op.definition().clone()),
        )?;
        self.touch(op.node())?;
        self.touch(op.source())?;
        self.touch(op.destination())
    }

    fn visit_reorder_nodes(&mut self, op: &ReorderNodes) -> SessionResult<()> {
        self.capture(op.parent());
        self.tree.reorder(op.parent(), op.child(), op.before())?;
        self.tree.mark_modified(op.parent())
    }

    fn visit_set_mixins(&mut self, op: &SetMixins) -> SessionResult<()> {
        self.capture(op.node());
        self.tree.set_mixins(op.node(), op.mixins().to_vec())?;
        self.tree.mark_modified(op.node())
    }
}
