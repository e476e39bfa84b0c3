//! # Item Definitions
//!
//! Structural metadata that governs which children and properties a node may
//! have. The session layer only consults this metadata through
//! [`DefinitionRegistry`]; owning and loading node types is somebody else's
//! job. [`StaticRegistry`] is an in-memory registry for tests and embedding.
//!
//! ## Lookup rules
//!
//! - Parent types are searched in order (primary type first, then mixins).
//! - A named definition wins over a residual (`name == None`) one.
//! - For properties, a definition whose multiplicity matches the hint is
//!   preferred; otherwise the first name/type match is returned so the caller
//!   can report the cardinality mismatch itself.

use crate::ids::Name;
use crate::value::PropertyType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Definition governing a property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDefinition {
    /// `None` for a residual definition matching any name
    pub name: Option<Name>,
    pub required_type: PropertyType,
    pub multiple: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub mandatory: bool,
}

impl PropertyDefinition {
    pub fn named(name: impl Into<Name>, required_type: PropertyType) -> Self {
        Self {
            name: Some(name.into()),
            required_type,
            multiple: false,
            protected: false,
            mandatory: false,
        }
    }

    pub fn residual(required_type: PropertyType) -> Self {
        Self {
            name: None,
            required_type,
            multiple: false,
            protected: false,
            mandatory: false,
        }
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    fn matches_name(&self, name: &Name) -> bool {
        self.name.as_ref().map_or(true, |n| n == name)
    }
}

/// Definition governing a child node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// `None` for a residual definition matching any name
    pub name: Option<Name>,
    pub default_primary_type: Option<Name>,
    /// Empty means any primary type is accepted
    #[serde(default)]
    pub required_primary_types: Vec<Name>,
    #[serde(default)]
    pub allows_same_name_siblings: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub mandatory: bool,
}

impl NodeDefinition {
    pub fn named(name: impl Into<Name>) -> Self {
        Self {
            name: Some(name.into()),
            default_primary_type: None,
            required_primary_types: Vec::new(),
            allows_same_name_siblings: false,
            protected: false,
            mandatory: false,
        }
    }

    pub fn residual() -> Self {
        Self {
            name: None,
            default_primary_type: None,
            required_primary_types: Vec::new(),
            allows_same_name_siblings: false,
            protected: false,
            mandatory: false,
        }
    }

    pub fn default_type(mut self, node_type: impl Into<Name>) -> Self {
        self.default_primary_type = Some(node_type.into());
        self
    }

    pub fn requires(mut self, node_type: impl Into<Name>) -> Self {
        self.required_primary_types.push(node_type.into());
        self
    }

    pub fn same_name_siblings(mut self) -> Self {
        self.allows_same_name_siblings = true;
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    fn matches_name(&self, name: &Name) -> bool {
        self.name.as_ref().map_or(true, |n| n == name)
    }

    fn admits_type(&self, node_type: &Name) -> bool {
        self.required_primary_types.is_empty() || self.required_primary_types.contains(node_type)
    }
}

/// A node type: the child and property definitions it declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeType {
    pub name: Name,
    #[serde(default)]
    pub mixin: bool,
    #[serde(default)]
    pub orderable_children: bool,
    #[serde(default)]
    pub child_nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
}

impl NodeType {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            mixin: false,
            orderable_children: false,
            child_nodes: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn mixin(name: impl Into<Name>) -> Self {
        Self {
            mixin: true,
            ..Self::new(name)
        }
    }

    pub fn orderable(mut self) -> Self {
        self.orderable_children = true;
        self
    }

    pub fn child(mut self, definition: NodeDefinition) -> Self {
        self.child_nodes.push(definition);
        self
    }

    pub fn property(mut self, definition: PropertyDefinition) -> Self {
        self.properties.push(definition);
        self
    }
}

/// Lookup service over node type metadata
pub trait DefinitionRegistry {
    /// Get a node type by name
    fn node_type(&self, name: &Name) -> Option<NodeType>;

    /// Definition for a child node `name` of primary type `node_type` under a
    /// parent carrying `parent_types`
    fn node_definition(
        &self,
        parent_types: &[Name],
        name: &Name,
        node_type: &Name,
    ) -> Option<NodeDefinition>;

    /// Definition for a property `name` declared as `declared` under a parent
    /// carrying `parent_types`
    fn property_definition(
        &self,
        parent_types: &[Name],
        name: &Name,
        declared: PropertyType,
        multi_valued: bool,
    ) -> Option<PropertyDefinition>;

    /// Whether children of a node carrying `parent_types` keep a client-defined order
    fn orderable_children(&self, parent_types: &[Name]) -> bool;
}

/// In-memory registry built from declared node types
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    types: HashMap<Name, NodeType>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a small set of commonly used node types
    pub fn with_defaults() -> Self {
        Self::new()
            .with_type(
                NodeType::new("nt:unstructured")
                    .orderable()
                    .child(
                        NodeDefinition::residual()
                            .default_type("nt:unstructured")
                            .same_name_siblings(),
                    )
                    .property(PropertyDefinition::residual(PropertyType::Undefined))
                    .property(PropertyDefinition::residual(PropertyType::Undefined).multiple()),
            )
            .with_type(
                NodeType::new("nt:folder")
                    .child(NodeDefinition::residual().default_type("nt:folder"))
                    .property(
                        PropertyDefinition::named("jcr:created", PropertyType::Date).protected(),
                    ),
            )
            .with_type(
                NodeType::new("nt:file")
                    .child(
                        NodeDefinition::named("jcr:content")
                            .default_type("nt:unstructured")
                            .mandatory(),
                    )
                    .property(
                        PropertyDefinition::named("jcr:created", PropertyType::Date).protected(),
                    ),
            )
            .with_type(NodeType::mixin("mix:referenceable").property(
                PropertyDefinition::named("jcr:uuid", PropertyType::String).protected(),
            ))
            .with_type(
                NodeType::mixin("mix:versionable")
                    .property(PropertyDefinition::named("jcr:isCheckedOut", PropertyType::Boolean).protected()),
            )
            .with_type(
                NodeType::mixin("mix:lockable")
                    .property(PropertyDefinition::named("jcr:lockOwner", PropertyType::String).protected()),
            )
            .with_type(
                NodeType::mixin("mix:title")
                    .property(PropertyDefinition::named("jcr:title", PropertyType::String))
                    .property(PropertyDefinition::named("jcr:description", PropertyType::String)),
            )
    }

    pub fn with_type(mut self, node_type: NodeType) -> Self {
        self.register(node_type);
        self
    }

    pub fn register(&mut self, node_type: NodeType) {
        self.types.insert(node_type.name.clone(), node_type);
    }

    fn declared<'a>(&'a self, parent_types: &'a [Name]) -> impl Iterator<Item = &'a NodeType> + 'a {
        parent_types.iter().filter_map(|name| self.types.get(name))
    }
}

impl DefinitionRegistry for StaticRegistry {
    fn node_type(&self, name: &Name) -> Option<NodeType> {
        self.types.get(name).cloned()
    }

    fn node_definition(
        &self,
        parent_types: &[Name],
        name: &Name,
        node_type: &Name,
    ) -> Option<NodeDefinition> {
        let candidates: Vec<&NodeDefinition> = self
            .declared(parent_types)
            .flat_map(|t| t.child_nodes.iter())
            .filter(|d| d.matches_name(name) && d.admits_type(node_type))
            .collect();

        candidates
            .iter()
            .find(|d| d.name.is_some())
            .or_else(|| candidates.first())
            .map(|d| (*d).clone())
    }

    fn property_definition(
        &self,
        parent_types: &[Name],
        name: &Name,
        declared: PropertyType,
        multi_valued: bool,
    ) -> Option<PropertyDefinition> {
        let candidates: Vec<&PropertyDefinition> = self
            .declared(parent_types)
            .flat_map(|t| t.properties.iter())
            .filter(|d| d.matches_name(name) && d.required_type.admits(declared))
            .collect();

        // Named before residual, matching multiplicity before any multiplicity
        let named: Vec<&PropertyDefinition> =
            candidates.iter().copied().filter(|d| d.name.is_some()).collect();
        let pool = if named.is_empty() { candidates } else { named };

        pool.iter()
            .find(|d| d.multiple == multi_valued)
            .or_else(|| pool.first())
            .map(|d| (*d).clone())
    }

    fn orderable_children(&self, parent_types: &[Name]) -> bool {
        self.declared(parent_types)
            .next()
            .is_some_and(|t| t.orderable_children)
    }
}
