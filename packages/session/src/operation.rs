//! # Operations
//!
//! Immutable descriptions of one intended mutation of the state tree.
//!
//! ## Construction
//!
//! Every variant is built by a named `create` factory that takes already
//! resolved operands (states, not paths). Fields are private and there is no
//! deserialization, so an operation can never exist half-populated.
//!
//! ## Affected states
//!
//! Each operation knows the states it affects. The change log uses them for
//! rollback bookkeeping; the save coordinator re-validates them.
//!
//! | Variant            | Affected                                   |
//! |--------------------|--------------------------------------------|
//! | `AddNode`          | parent                                     |
//! | `AddProperty`      | parent                                     |
//! | `SetPropertyValue` | property                                   |
//! | `Remove`           | item, parent                               |
//! | `Move`             | node, source parent, destination parent    |
//! | `ReorderNodes`     | parent                                     |
//! | `SetMixins`        | node                                       |

use crate::errors::SessionResult;
use crate::state::{ItemState, NodeState, PropertyState};
use crate::visitor::OperationVisitor;
use arbor_spi::{ItemId, Name, NodeDefinition, PropertyDefinition, PropertyType, Value};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    AddNode(AddNode),
    AddProperty(AddProperty),
    SetPropertyValue(SetPropertyValue),
    Remove(Remove),
    Move(Move),
    ReorderNodes(ReorderNodes),
    SetMixins(SetMixins),
}

impl Operation {
    /// Dispatch to the visitor method for this variant
    pub fn accept<V: OperationVisitor + ?Sized>(&self, visitor: &mut V) -> SessionResult<V::Output> {
        match self {
            Operation::AddNode(op) => visitor.visit_add_node(op),
            Operation::AddProperty(op) => visitor.visit_add_property(op),
            Operation::SetPropertyValue(op) => visitor.visit_set_property_value(op),
            Operation::Remove(op) => visitor.visit_remove(op),
            Operation::Move(op) => visitor.visit_move(op),
            Operation::ReorderNodes(op) => visitor.visit_reorder_nodes(op),
            Operation::SetMixins(op) => visitor.visit_set_mixins(op),
        }
    }

    /// Debug name
    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddNode(_) => "add_node",
            Operation::AddProperty(_) => "add_property",
            Operation::SetPropertyValue(_) => "set_property_value",
            Operation::Remove(_) => "remove",
            Operation::Move(_) => "move",
            Operation::ReorderNodes(_) => "reorder_nodes",
            Operation::SetMixins(_) => "set_mixins",
        }
    }

    /// The item the operation creates or acts on
    pub fn subject(&self) -> &ItemId {
        match self {
            Operation::AddNode(op) => &op.id,
            Operation::AddProperty(op) => &op.id,
            Operation::SetPropertyValue(op) => &op.property,
            Operation::Remove(op) => &op.item,
            Operation::Move(op) => &op.node,
            Operation::ReorderNodes(op) => &op.child,
            Operation::SetMixins(op) => &op.node,
        }
    }

    /// States whose content the operation changes
    pub fn affected(&self) -> Vec<ItemId> {
        match self {
            Operation::AddNode(op) => vec![op.parent.clone()],
            Operation::AddProperty(op) => vec![op.parent.clone()],
            Operation::SetPropertyValue(op) => vec![op.property.clone()],
            Operation::Remove(op) => std::iter::once(op.item.clone())
                .chain(op.parent.clone())
                .collect(),
            Operation::Move(op) => {
                let mut ids = vec![op.node.clone(), op.source.clone()];
                if op.destination != op.source {
                    ids.push(op.destination.clone());
                }
                ids
            }
            Operation::ReorderNodes(op) => vec![op.parent.clone()],
            Operation::SetMixins(op) => vec![op.node.clone()],
        }
    }

    /// Every id the operation mentions
    pub fn references(&self) -> Vec<ItemId> {
        let mut ids = self.affected();
        ids.push(self.subject().clone());
        match self {
            Operation::ReorderNodes(op) => ids.extend(op.before.clone()),
            Operation::SetPropertyValue(op) => ids.push(op.parent.clone()),
            _ => {}
        }
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Add a child node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNode {
    parent: ItemId,
    name: Name,
    id: ItemId,
    node_type: Name,
    definition: NodeDefinition,
}

impl AddNode {
    pub fn create(
        parent: &NodeState,
        name: impl Into<Name>,
        id: ItemId,
        node_type: impl Into<Name>,
        definition: NodeDefinition,
    ) -> Self {
        Self {
            parent: parent.id().clone(),
            name: name.into(),
            id,
            node_type: node_type.into(),
            definition,
        }
    }

    pub fn parent(&self) -> &ItemId {
        &self.parent
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Session-local id of the node to create
    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn node_type(&self) -> &Name {
        &self.node_type
    }

    pub fn definition(&self) -> &NodeDefinition {
        &self.definition
    }
}

/// Add a property with its initial values
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddProperty {
    parent: ItemId,
    name: Name,
    id: ItemId,
    property_type: PropertyType,
    values: Vec<Value>,
    definition: PropertyDefinition,
}

impl AddProperty {
    pub fn create(
        parent: &NodeState,
        name: impl Into<Name>,
        id: ItemId,
        property_type: PropertyType,
        definition: PropertyDefinition,
        values: Vec<Value>,
    ) -> Self {
        Self {
            parent: parent.id().clone(),
            name: name.into(),
            id,
            property_type,
            values,
            definition,
        }
    }

    /// Same property created with different initial values
    pub(crate) fn with_values(&self, property_type: PropertyType, values: Vec<Value>) -> Self {
        Self {
            property_type,
            values,
            ..self.clone()
        }
    }

    pub fn parent(&self) -> &ItemId {
        &self.parent
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn property_type(&self) -> PropertyType {
        self.property_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn definition(&self) -> &PropertyDefinition {
        &self.definition
    }

    pub fn is_multi_valued(&self) -> bool {
        self.definition.multiple
    }
}

/// Replace the values of a property
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPropertyValue {
    property: ItemId,
    parent: ItemId,
    property_type: PropertyType,
    values: Vec<Value>,
}

impl SetPropertyValue {
    pub fn create(property: &PropertyState, property_type: PropertyType, values: Vec<Value>) -> Self {
        Self {
            property: property.id().clone(),
            parent: property.parent().clone(),
            property_type,
            values,
        }
    }

    pub fn property(&self) -> &ItemId {
        &self.property
    }

    pub fn parent(&self) -> &ItemId {
        &self.parent
    }

    pub fn property_type(&self) -> PropertyType {
        self.property_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Remove an item and everything below it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    item: ItemId,
    parent: Option<ItemId>,
}

impl Remove {
    pub fn create(item: &ItemState) -> Self {
        Self {
            item: item.id().clone(),
            parent: item.parent().cloned(),
        }
    }

    pub fn item(&self) -> &ItemId {
        &self.item
    }

    /// `None` only for the root node, which cannot be removed
    pub fn parent(&self) -> Option<&ItemId> {
        self.parent.as_ref()
    }
}

/// Relink a node under a new parent, possibly renaming it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Move {
    node: ItemId,
    source: ItemId,
    destination: ItemId,
    new_name: Name,
    definition: NodeDefinition,
}

impl Move {
    /// `None` for the root node, which cannot be moved
    pub fn create(
        node: &NodeState,
        destination: &NodeState,
        new_name: impl Into<Name>,
        definition: NodeDefinition,
    ) -> Option<Self> {
        Some(Self {
            node: node.id().clone(),
            source: node.parent()?.clone(),
            destination: destination.id().clone(),
            new_name: new_name.into(),
            definition,
        })
    }

    pub fn node(&self) -> &ItemId {
        &self.node
    }

    pub fn source(&self) -> &ItemId {
        &self.source
    }

    pub fn destination(&self) -> &ItemId {
        &self.destination
    }

    pub fn new_name(&self) -> &Name {
        &self.new_name
    }

    pub fn definition(&self) -> &NodeDefinition {
        &self.definition
    }
}

/// Place a child right before a sibling, or last
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderNodes {
    parent: ItemId,
    child: ItemId,
    before: Option<ItemId>,
}

impl ReorderNodes {
    pub fn create(parent: &NodeState, child: &ItemId, before: Option<&ItemId>) -> Self {
        Self {
            parent: parent.id().clone(),
            child: child.clone(),
            before: before.cloned(),
        }
    }

    pub fn parent(&self) -> &ItemId {
        &self.parent
    }

    pub fn child(&self) -> &ItemId {
        &self.child
    }

    pub fn before(&self) -> Option<&ItemId> {
        self.before.as_ref()
    }
}

/// Replace the mixin types of a node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMixins {
    node: ItemId,
    mixins: Vec<Name>,
}

impl SetMixins {
    pub fn create(node: &NodeState, mixins: Vec<Name>) -> Self {
        Self {
            node: node.id().clone(),
            mixins,
        }
    }

    pub fn node(&self) -> &ItemId {
        &self.node
    }

    pub fn mixins(&self) -> &[Name] {
        &self.mixins
    }
}

macro_rules! impl_from_variant {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Operation {
                fn from(op: $variant) -> Self {
                    Operation::$variant(op)
                }
            }
        )*
    };
}

impl_from_variant!(AddNode, AddProperty, SetPropertyValue, Remove, Move, ReorderNodes, SetMixins);
