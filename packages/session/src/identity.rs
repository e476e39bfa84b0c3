//! Definition lookup for item states
//!
//! Thin layer over a [`DefinitionRegistry`] that asks questions in terms of
//! loaded states (a parent's effective types, a snapshot's declared type)
//! and turns missing answers into constraint violations.

use crate::errors::{SessionError, SessionResult};
use crate::state::NodeState;
use arbor_spi::{
    DefinitionRegistry, Name, NodeDefinition, NodeSnapshot, NodeType, PropertyDefinition,
    PropertySnapshot, PropertyType,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct DefinitionLookup {
    registry: Arc<dyn DefinitionRegistry>,
}

impl DefinitionLookup {
    pub fn new(registry: Arc<dyn DefinitionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &dyn DefinitionRegistry {
        self.registry.as_ref()
    }

    /// A registered, non-mixin node type
    pub fn primary_type(&self, name: &Name) -> Option<NodeType> {
        self.registry.node_type(name).filter(|t| !t.mixin)
    }

    /// Type and definition for a new child `name` of `parent`.
    ///
    /// Without an explicit type, the default type of the first matching
    /// child definition is used.
    pub fn child_definition(
        &self,
        parent: &NodeState,
        name: &Name,
        node_type: Option<&Name>,
    ) -> SessionResult<(Name, NodeDefinition)> {
        let parent_types = parent.effective_types();

        let node_type = match node_type {
            Some(t) => t.clone(),
            None => self
                .default_child_type(&parent_types, name)
                .ok_or_else(|| {
                    SessionError::constraint(
                        parent.id(),
                        format!("no default node type for child '{}'", name),
                    )
                })?,
        };

        if self.primary_type(&node_type).is_none() {
            return Err(SessionError::constraint(
                parent.id(),
                format!("'{}' is not a registered primary node type", node_type),
            ));
        }

        let definition = self
            .registry
            .node_definition(&parent_types, name, &node_type)
            .ok_or_else(|| {
                SessionError::constraint(
                    parent.id(),
                    format!("no child node definition for '{}' of type {}", name, node_type),
                )
            })?;

        Ok((node_type, definition))
    }

    fn default_child_type(&self, parent_types: &[Name], name: &Name) -> Option<Name> {
        let declared: Vec<NodeDefinition> = parent_types
            .iter()
            .filter_map(|t| self.registry.node_type(t))
            .flat_map(|t| t.child_nodes)
            .filter(|d| d.name.as_ref().map_or(true, |n| n == name))
            .collect();

        declared
            .iter()
            .filter(|d| d.name.is_some())
            .chain(declared.iter().filter(|d| d.name.is_none()))
            .find_map(|d| d.default_primary_type.clone())
    }

    /// Definition for a property `name` declared as `declared` on `parent`
    pub fn property_definition(
        &self,
        parent: &NodeState,
        name: &Name,
        declared: PropertyType,
        multi_valued: bool,
    ) -> SessionResult<PropertyDefinition> {
        if declared == PropertyType::Undefined {
            return Err(SessionError::constraint(
                parent.id(),
                format!("property '{}' needs a concrete type", name),
            ));
        }

        self.registry
            .property_definition(&parent.effective_types(), name, declared, multi_valued)
            .ok_or_else(|| {
                SessionError::constraint(
                    parent.id(),
                    format!("no property definition for '{}' of type {}", name, declared),
                )
            })
    }

    /// A registered mixin type
    pub fn mixin(&self, node: &NodeState, name: &Name) -> SessionResult<NodeType> {
        match self.registry.node_type(name) {
            Some(t) if t.mixin => Ok(t),
            Some(_) => Err(SessionError::constraint(
                node.id(),
                format!("'{}' is not a mixin type", name),
            )),
            None => Err(SessionError::constraint(
                node.id(),
                format!("unknown mixin type '{}'", name),
            )),
        }
    }

    pub fn is_orderable(&self, node: &NodeState) -> bool {
        self.registry.orderable_children(&node.effective_types())
    }

    /// Definition of a node read through from the store, if the registry knows one
    pub fn for_node_snapshot(
        &self,
        parent: &NodeState,
        snapshot: &NodeSnapshot,
    ) -> Option<NodeDefinition> {
        self.registry
            .node_definition(&parent.effective_types(), &snapshot.name, &snapshot.primary_type)
    }

    pub fn for_property_snapshot(
        &self,
        parent: &NodeState,
        snapshot: &PropertySnapshot,
    ) -> Option<PropertyDefinition> {
        self.registry.property_definition(
            &parent.effective_types(),
            &snapshot.name,
            snapshot.property_type,
            snapshot.multi_valued,
        )
    }
}

impl std::fmt::Debug for DefinitionLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefinitionLookup").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ItemStatus;
    use arbor_spi::{ItemId, StaticRegistry};

    fn lookup() -> DefinitionLookup {
        DefinitionLookup::new(Arc::new(StaticRegistry::with_defaults()))
    }

    fn node(primary_type: &str, mixins: &[&str]) -> NodeState {
        NodeState {
            id: ItemId::new("n"),
            parent: None,
            name: Name::new(""),
            status: ItemStatus::Existing,
            revision: Some(1),
            primary_type: Name::new(primary_type),
            mixins: mixins.iter().map(|m| Name::new(*m)).collect(),
            definition: None,
            children: vec![],
            properties: vec![],
        }
    }

    #[test]
    fn test_default_child_type() {
        let lookup = lookup();
        let (node_type, definition) = lookup
            .child_definition(&node("nt:folder", &[]), &Name::new("docs"), None)
            .unwrap();
        assert_eq!(node_type, Name::new("nt:folder"));
        assert!(!definition.allows_same_name_siblings);

        let (node_type, _) = lookup
            .child_definition(&node("nt:file", &[]), &Name::new("jcr:content"), None)
            .unwrap();
        assert_eq!(node_type, Name::new("nt:unstructured"));
    }

    #[test]
    fn test_unknown_or_mixin_child_type() {
        let lookup = lookup();
        let parent = node("nt:unstructured", &[]);

        let err = lookup
            .child_definition(&parent, &Name::new("a"), Some(&Name::new("nt:missing")))
            .unwrap_err();
        assert!(matches!(err, SessionError::ConstraintViolation { .. }));

        let err = lookup
            .child_definition(&parent, &Name::new("a"), Some(&Name::new("mix:title")))
            .unwrap_err();
        assert!(matches!(err, SessionError::ConstraintViolation { .. }));
    }

    #[test]
    fn test_mixin_properties_become_visible() {
        let lookup = lookup();
        let plain = node("nt:folder", &[]);
        let titled = node("nt:folder", &["mix:title"]);

        assert!(lookup
            .property_definition(&plain, &Name::new("jcr:title"), PropertyType::String, false)
            .is_err());
        let definition = lookup
            .property_definition(&titled, &Name::new("jcr:title"), PropertyType::String, false)
            .unwrap();
        assert!(!definition.multiple);
    }

    #[test]
    fn test_mixin_lookup() {
        let lookup = lookup();
        let n = node("nt:unstructured", &[]);
        assert!(lookup.mixin(&n, &Name::new("mix:lockable")).is_ok());
        assert!(lookup.mixin(&n, &Name::new("nt:folder")).is_err());
        assert!(lookup.mixin(&n, &Name::new("mix:nothing")).is_err());
        assert!(lookup.is_orderable(&n));
        assert!(!lookup.is_orderable(&node("nt:folder", &[])));
    }
}
