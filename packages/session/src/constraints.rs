//! Client-side checks implied by locking, versioning and access control
//!
//! The servers behind these concerns are out of reach; the session only asks
//! yes/no questions before it lets an operation through, and again before a
//! save.

use crate::state::{ItemState, NodeState};
use arbor_spi::{ItemId, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

/// Identity of the caller a session acts for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub user_id: String,
}

impl Credentials {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    Read,
    AddNode,
    SetProperty,
    RemoveItem,
    /// Change primary type or mixins
    NodeTypeManagement,
}

/// Predicates consulted before an operation is applied or saved
pub trait ConstraintChecker {
    /// No lock held by somebody else covers `node`
    fn lock_permits(&self, node: &NodeState, credentials: &Credentials) -> bool;

    /// `node` is not checked in
    fn is_checked_out(&self, node: &NodeState) -> bool;

    fn is_granted(&self, item: &ItemState, permission: Permission, credentials: &Credentials) -> bool;
}

/// Checker that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl ConstraintChecker for Unrestricted {
    fn lock_permits(&self, _node: &NodeState, _credentials: &Credentials) -> bool {
        true
    }

    fn is_checked_out(&self, _node: &NodeState) -> bool {
        true
    }

    fn is_granted(&self, _item: &ItemState, _permission: Permission, _credentials: &Credentials) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct StaticConstraintsInner {
    locks: HashMap<ItemId, String>,
    checked_in: HashSet<ItemId>,
    denied: HashSet<(ItemId, Permission)>,
}

/// Table-driven checker; clones share the same tables
#[derive(Debug, Clone, Default)]
pub struct StaticConstraints {
    inner: Arc<RwLock<StaticConstraintsInner>>,
}

impl StaticConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, StaticConstraintsInner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("constraint tables poisoned".to_string()))
    }

    pub fn lock(&self, node: &ItemId, owner: impl Into<String>) -> StoreResult<()> {
        self.write()?.locks.insert(node.clone(), owner.into());
        Ok(())
    }

    pub fn unlock(&self, node: &ItemId) -> StoreResult<()> {
        self.write()?.locks.remove(node);
        Ok(())
    }

    pub fn check_in(&self, node: &ItemId) -> StoreResult<()> {
        self.write()?.checked_in.insert(node.clone());
        Ok(())
    }

    pub fn check_out(&self, node: &ItemId) -> StoreResult<()> {
        self.write()?.checked_in.remove(node);
        Ok(())
    }

    pub fn deny(&self, item: &ItemId, permission: Permission) -> StoreResult<()> {
        self.write()?.denied.insert((item.clone(), permission));
        Ok(())
    }
}

impl ConstraintChecker for StaticConstraints {
    fn lock_permits(&self, node: &NodeState, credentials: &Credentials) -> bool {
        self.inner.read().is_ok_and(|inner| {
            inner
                .locks
                .get(node.id())
                .map_or(true, |owner| owner == &credentials.user_id)
        })
    }

    fn is_checked_out(&self, node: &NodeState) -> bool {
        self.inner
            .read()
            .is_ok_and(|inner| !inner.checked_in.contains(node.id()))
    }

    fn is_granted(&self, item: &ItemState, permission: Permission, _credentials: &Credentials) -> bool {
        self.inner
            .read()
            .is_ok_and(|inner| !inner.denied.contains(&(item.id().clone(), permission)))
    }
}
