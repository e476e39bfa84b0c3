//! # Session
//!
//! One caller's transient view of a remote content tree.
//!
//! A Session owns its state tree and change log outright. Mutations are
//! validated and applied immediately, so reads always see pending work; a
//! save sends everything to the remote store as one batch.
//!
//! ## Design
//!
//! - Reads go through to the remote store on demand and cache the result
//! - Every mutation becomes an [`Operation`] and passes through [`Session::submit`]
//! - Saving is split in two halves ([`Session::begin_save`] /
//!   [`Session::complete_save`]) so the batch can be sent elsewhere; while a
//!   save is in flight every mutation fails
//! - A failed or cancelled save leaves the tree and the log as they were

use crate::change_log::ChangeLog;
use crate::config::SessionConfig;
use crate::constraints::{ConstraintChecker, Credentials, Unrestricted};
use crate::errors::{SessionError, SessionResult};
use crate::identity::DefinitionLookup;
use crate::operation::{
    AddNode, AddProperty, Move, Operation, ReorderNodes, Remove, SetMixins, SetPropertyValue,
};
use crate::state::{ItemState, ItemStatus, NodeState, PropertyState};
use crate::state_tree::StateTree;
use crate::transaction::{SaveReport, Transaction};
use crate::visitor::{Applier, Guard, Validator};
use arbor_spi::{
    Batch, BatchResult, DefinitionRegistry, FailureKind, IdGenerator, ItemId, ItemSnapshot, Name,
    PropertyType, RefreshOutcome, RemoteStore, StoreError, StoreResult, Value,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub struct Session {
    config: SessionConfig,
    credentials: Credentials,
    store: Box<dyn RemoteStore>,
    lookup: DefinitionLookup,
    constraints: Box<dyn ConstraintChecker>,
    tree: StateTree,
    log: ChangeLog,
    ids: IdGenerator,
    in_flight: Option<Transaction>,
}

impl Session {
    /// Open a session and read the root node through
    pub fn open(
        store: impl RemoteStore + 'static,
        registry: Arc<dyn DefinitionRegistry>,
        credentials: Credentials,
        config: SessionConfig,
    ) -> SessionResult<Self> {
        let root_id = store.root_id();
        let root = match store.fetch(&root_id)? {
            ItemSnapshot::Node(node) => node,
            ItemSnapshot::Property(_) => {
                return Err(SessionError::constraint(&root_id, "the root item is not a node"))
            }
        };

        let mut tree = StateTree::new(root_id);
        tree.insert(ItemState::Node(NodeState::from_snapshot(root, None)));

        let session_id = format!(
            "{}-{}",
            credentials.user_id,
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let ids = IdGenerator::new(&config.workspace, &session_id);
        debug!(workspace = %config.workspace, seed = ids.seed(), "Opened session");

        Ok(Self {
            config,
            credentials,
            store: Box::new(store),
            lookup: DefinitionLookup::new(registry),
            constraints: Box::new(Unrestricted),
            tree,
            log: ChangeLog::new(),
            ids,
            in_flight: None,
        })
    }

    /// Replace the lock, version and access checks
    pub fn with_constraints(mut self, constraints: impl ConstraintChecker + 'static) -> Self {
        self.constraints = Box::new(constraints);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.log.is_empty()
    }

    pub fn is_saving(&self) -> bool {
        self.in_flight.is_some()
    }

    fn ensure_idle(&self) -> SessionResult<()> {
        match self.in_flight {
            Some(_) => Err(SessionError::SaveInProgress),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn root(&self) -> &ItemId {
        self.tree.root_id()
    }

    /// Make sure `id` is indexed and usable, fetching it if needed
    fn ensure_loaded(&mut self, id: &ItemId) -> SessionResult<()> {
        match self.tree.peek(id).map(|s| s.status()) {
            None | Some(ItemStatus::Invalidated) => {}
            Some(_) => return Ok(()),
        }

        let snapshot = match self.store.fetch(id) {
            Ok(snapshot) => snapshot,
            Err(StoreError::NotFound(_)) => {
                self.tree.evict(id);
                self.tree.prune_listing(id);
                debug!(%id, "Pruned item missing from remote store");
                return Err(SessionError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let parent = match &snapshot {
            ItemSnapshot::Node(node) => node.parent.clone(),
            ItemSnapshot::Property(property) => Some(property.parent.clone()),
        };
        if let Some(parent) = parent {
            self.ensure_loaded(&parent)?;
        }

        debug!(%id, revision = snapshot.revision(), "Read item through");
        let state = self.state_from_snapshot(snapshot);
        self.tree.insert(state);
        Ok(())
    }

    fn state_from_snapshot(&self, snapshot: ItemSnapshot) -> ItemState {
        match snapshot {
            ItemSnapshot::Node(node) => {
                let definition = node
                    .parent
                    .as_ref()
                    .and_then(|p| self.tree.peek(p))
                    .and_then(|p| p.as_node())
                    .and_then(|p| self.lookup.for_node_snapshot(p, &node));
                ItemState::Node(NodeState::from_snapshot(node, definition))
            }
            ItemSnapshot::Property(property) => {
                let definition = self
                    .tree
                    .peek(&property.parent)
                    .and_then(|p| p.as_node())
                    .and_then(|p| self.lookup.for_property_snapshot(p, &property));
                ItemState::Property(PropertyState::from_snapshot(property, definition))
            }
        }
    }

    pub fn get(&mut self, id: &ItemId) -> SessionResult<&ItemState> {
        self.ensure_loaded(id)?;
        self.tree.get(id)
    }

    pub fn node(&mut self, id: &ItemId) -> SessionResult<&NodeState> {
        self.ensure_loaded(id)?;
        self.tree.node(id)
    }

    pub fn property(&mut self, id: &ItemId) -> SessionResult<&PropertyState> {
        self.ensure_loaded(id)?;
        self.tree.property(id)
    }

    /// First live child node of `parent` called `name`
    pub fn child_node(&mut self, parent: &ItemId, name: impl Into<Name>) -> SessionResult<&NodeState> {
        let name = name.into();
        loop {
            self.ensure_loaded(parent)?;
            let parent_state = self.tree.node(parent)?;
            let candidate = self
                .tree
                .live_children_named(parent_state, &name)
                .next()
                .map(|c| c.id.clone());

            let Some(id) = candidate else {
                return Err(SessionError::NotFound(ItemId::new(format!("{}/{}", parent, name))));
            };
            match self.ensure_loaded(&id) {
                Ok(()) => return self.tree.node(&id),
                // The listed child is gone remotely and was pruned; try the next one
                Err(SessionError::NotFound(missing)) if missing == id => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Live property of `node` called `name`
    pub fn property_of(&mut self, node: &ItemId, name: impl Into<Name>) -> SessionResult<&PropertyState> {
        let name = name.into();
        self.ensure_loaded(node)?;
        let node_state = self.tree.node(node)?;
        let id = self
            .tree
            .live_property_named(node_state, &name)
            .map(|p| p.id.clone())
            .ok_or_else(|| SessionError::NotFound(ItemId::new(format!("{}/{}", node, name))))?;

        self.ensure_loaded(&id)?;
        self.tree.property(&id)
    }

    pub fn path(&mut self, id: &ItemId) -> SessionResult<String> {
        self.ensure_loaded(id)?;
        self.tree.path(id)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Validate, apply and record one operation.
    ///
    /// On failure the tree and the log are unchanged.
    #[instrument(skip(self, operation), fields(op = operation.name(), subject = %operation.subject()))]
    pub fn submit(&mut self, operation: Operation) -> SessionResult<()> {
        self.ensure_idle()?;
        self.log.admit(
            &operation,
            self.config.value_conflict,
            self.config.max_change_log_entries,
        )?;

        let mut validator = Validator::new(
            &self.tree,
            &self.lookup,
            self.constraints.as_ref(),
            &self.credentials,
        );
        operation.accept(&mut validator)?;

        let mut applier = Applier::new(&mut self.tree);
        if let Err(e) = operation.accept(&mut applier) {
            applier.abort();
            return Err(e);
        }
        let applied = applier.finish();

        let recorded = self.log.record(&mut self.tree, operation, applied);
        debug!(?recorded, pending = self.log.len(), "Applied operation");
        Ok(())
    }

    /// Add a child node; without `node_type` the definition's default is used
    pub fn create_node(
        &mut self,
        parent: &ItemId,
        name: impl Into<Name>,
        node_type: Option<Name>,
    ) -> SessionResult<&NodeState> {
        self.ensure_idle()?;
        self.ensure_loaded(parent)?;
        let name = name.into();

        let parent_state = self.tree.live_node(parent)?;
        let (node_type, definition) =
            self.lookup
                .child_definition(parent_state, &name, node_type.as_ref())?;
        let id = self.ids.next_id();
        let op = AddNode::create(parent_state, name, id.clone(), node_type, definition);

        self.submit(op.into())?;
        self.tree.node(&id)
    }

    /// Add a single-valued property
    pub fn create_property(
        &mut self,
        parent: &ItemId,
        name: impl Into<Name>,
        value: Value,
    ) -> SessionResult<&PropertyState> {
        let property_type = value.property_type();
        self.add_property(parent, name.into(), property_type, vec![value], false)
    }

    /// Add a multi-valued property
    pub fn create_multi_property(
        &mut self,
        parent: &ItemId,
        name: impl Into<Name>,
        property_type: PropertyType,
        values: Vec<Value>,
    ) -> SessionResult<&PropertyState> {
        self.add_property(parent, name.into(), property_type, values, true)
    }

    fn add_property(
        &mut self,
        parent: &ItemId,
        name: Name,
        property_type: PropertyType,
        values: Vec<Value>,
        multi_valued: bool,
    ) -> SessionResult<&PropertyState> {
        self.ensure_idle()?;
        self.ensure_loaded(parent)?;

        let parent_state = self.tree.live_node(parent)?;
        let definition =
            self.lookup
                .property_definition(parent_state, &name, property_type, multi_valued)?;
        let id = self.ids.next_id();
        let op = AddProperty::create(parent_state, name, id.clone(), property_type, definition, values);

        self.submit(op.into())?;
        self.tree.property(&id)
    }

    pub fn set_value(&mut self, property: &ItemId, value: Value) -> SessionResult<()> {
        let property_type = value.property_type();
        self.set_values(property, property_type, vec![value])
    }

    pub fn set_values(
        &mut self,
        property: &ItemId,
        property_type: PropertyType,
        values: Vec<Value>,
    ) -> SessionResult<()> {
        self.ensure_idle()?;
        self.ensure_loaded(property)?;
        let op = SetPropertyValue::create(self.tree.live_property(property)?, property_type, values);
        self.submit(op.into())
    }

    /// Remove an item and everything below it
    pub fn remove(&mut self, id: &ItemId) -> SessionResult<()> {
        self.ensure_idle()?;
        self.ensure_loaded(id)?;
        let op = Remove::create(self.tree.live(id)?);
        self.submit(op.into())
    }

    /// Relink `node` under `destination` as `new_name`
    pub fn move_node(
        &mut self,
        node: &ItemId,
        destination: &ItemId,
        new_name: impl Into<Name>,
    ) -> SessionResult<()> {
        self.ensure_idle()?;
        self.ensure_loaded(node)?;
        self.ensure_loaded(destination)?;
        let new_name = new_name.into();

        let node_state = self.tree.live_node(node)?;
        let destination_state = self.tree.live_node(destination)?;
        let (_, definition) = self.lookup.child_definition(
            destination_state,
            &new_name,
            Some(node_state.primary_type()),
        )?;
        let op = Move::create(node_state, destination_state, new_name, definition)
            .ok_or_else(|| SessionError::constraint(node, "the root node cannot be moved"))?;

        self.submit(op.into())
    }

    /// Place `child` right before `before`, or last when `before` is `None`
    pub fn reorder(
        &mut self,
        parent: &ItemId,
        child: &ItemId,
        before: Option<&ItemId>,
    ) -> SessionResult<()> {
        self.ensure_idle()?;
        self.ensure_loaded(parent)?;
        let op = ReorderNodes::create(self.tree.live_node(parent)?, child, before);
        self.submit(op.into())
    }

    pub fn set_mixins(&mut self, node: &ItemId, mixins: Vec<Name>) -> SessionResult<()> {
        self.ensure_idle()?;
        self.ensure_loaded(node)?;
        let op = SetMixins::create(self.tree.live_node(node)?, mixins);
        self.submit(op.into())
    }

    pub fn add_mixin(&mut self, node: &ItemId, mixin: impl Into<Name>) -> SessionResult<()> {
        let mixin = mixin.into();
        let mut mixins = self.node(node)?.mixins().to_vec();
        if mixins.contains(&mixin) {
            return Ok(());
        }
        mixins.push(mixin);
        self.set_mixins(node, mixins)
    }

    /// Undo every pending change
    #[instrument(skip(self))]
    pub fn discard(&mut self) -> SessionResult<()> {
        self.ensure_idle()?;
        self.log.discard(&mut self.tree);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Staleness
    // ------------------------------------------------------------------

    /// Compare a loaded state with the remote copy and fold in the answer
    #[instrument(skip(self, id), fields(id = %id))]
    pub fn refresh(&mut self, id: &ItemId) -> SessionResult<()> {
        self.ensure_idle()?;
        let Some(state) = self.tree.peek(id) else {
            return Ok(());
        };
        let status = state.status();
        let Some(revision) = state.revision() else {
            return Ok(());
        };

        let outcome = self.store.refresh(id, revision)?;
        self.apply_refresh(id, status, outcome)
    }

    /// Refresh every loaded state that has a remote counterpart
    pub fn refresh_all(&mut self) -> SessionResult<()> {
        let ids: Vec<ItemId> = self
            .tree
            .iter()
            .filter(|s| s.revision().is_some())
            .map(|s| s.id().clone())
            .collect();
        for id in ids {
            self.refresh(&id)?;
        }
        Ok(())
    }

    /// Force the next access to `id` to read it through again
    pub fn invalidate(&mut self, id: &ItemId) -> SessionResult<()> {
        self.ensure_idle()?;
        self.tree.transition(id, ItemStatus::Invalidated)
    }

    fn apply_refresh(&mut self, id: &ItemId, status: ItemStatus, outcome: RefreshOutcome) -> SessionResult<()> {
        use crate::state::ItemStatus::*;

        match (status, outcome) {
            (Existing | Invalidated, RefreshOutcome::Modified(snapshot)) => {
                self.overwrite(snapshot);
                Ok(())
            }
            (Invalidated, RefreshOutcome::Unchanged) => self.tree.transition(id, Existing),
            (Existing | Invalidated, RefreshOutcome::Destroyed) => {
                self.tree.evict(id);
                self.tree.prune_listing(id);
                debug!(%id, "Evicted item destroyed remotely");
                Ok(())
            }
            (ExistingModified, RefreshOutcome::Modified(_)) => {
                warn!(%id, "Remote copy changed under local modifications");
                self.tree.transition(id, StaleModified)
            }
            (ExistingModified | ExistingRemoved | StaleModified, RefreshOutcome::Destroyed) => {
                warn!(%id, "Remote copy destroyed under local modifications");
                self.tree.transition(id, StaleDestroyed)
            }
            (ExistingRemoved, RefreshOutcome::Modified(_)) => {
                warn!(%id, "Remote copy changed under a pending removal");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Replace an unmodified state with the remote copy
    fn overwrite(&mut self, snapshot: ItemSnapshot) {
        let id = snapshot.id().clone();
        let fresh = self.state_from_snapshot(snapshot);

        let vanished: Vec<ItemId> = match (self.tree.peek(&id).and_then(|s| s.as_node()), fresh.as_node()) {
            (Some(old), Some(new)) => old
                .child_entries()
                .iter()
                .chain(old.property_entries())
                .filter(|e| {
                    !new.child_entries()
                        .iter()
                        .chain(new.property_entries())
                        .any(|n| n.id == e.id)
                })
                .filter(|e| {
                    self.tree.peek(&e.id).is_some_and(|s| {
                        matches!(s.status(), ItemStatus::Existing | ItemStatus::Invalidated)
                    })
                })
                .map(|e| e.id.clone())
                .collect(),
            _ => Vec::new(),
        };

        self.tree.insert(fresh);
        for gone in &vanished {
            self.tree.evict(gone);
        }
        debug!(%id, evicted = vanished.len(), "Refreshed item from remote copy");
    }

    /// Probe every affected, persisted state before a save
    fn check_freshness(&mut self) -> SessionResult<()> {
        let mut stale = None;
        for id in self.log.affected() {
            let Some(state) = self.tree.peek(&id) else {
                continue;
            };
            let status = state.status();
            let Some(revision) = state.revision() else {
                continue;
            };

            let outcome = self.store.refresh(&id, revision)?;
            if outcome == RefreshOutcome::Unchanged {
                continue;
            }
            self.apply_refresh(&id, status, outcome)?;

            let conflicting = status == ItemStatus::ExistingRemoved
                || self.tree.peek(&id).map_or(true, |s| s.status().is_stale());
            if conflicting && stale.is_none() {
                stale = Some(id);
            }
        }

        match stale {
            Some(id) => {
                warn!(%id, "Save blocked by stale state");
                Err(SessionError::StaleState(id))
            }
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------

    /// Persist every pending change as one batch
    #[instrument(skip(self))]
    pub fn save(&mut self) -> SessionResult<SaveReport> {
        let batch = self.begin_save()?;
        let result = if batch.is_empty() {
            Ok(BatchResult::applied(0))
        } else {
            self.store.submit_batch(&batch)
        };
        self.complete_save(result)
    }

    /// Prepare a save and hand out the batch to submit.
    ///
    /// Until [`Session::complete_save`] or [`Session::cancel_save`] runs,
    /// every mutation fails. Stale marks from the freshness check are set
    /// before the snapshot is taken, so they survive a failed save.
    pub fn begin_save(&mut self) -> SessionResult<Batch> {
        self.ensure_idle()?;
        if self.config.refresh_before_save {
            self.check_freshness()?;
        }

        let guard = Guard {
            constraints: self.constraints.as_ref(),
            credentials: &self.credentials,
        };
        let transaction = Transaction::prepare(&self.tree, &self.log, &self.lookup, guard)?;
        let batch = transaction.batch().clone();
        debug!(instructions = batch.len(), "Prepared save");

        self.in_flight = Some(transaction);
        Ok(batch)
    }

    /// Fold the remote store's answer into the session
    #[instrument(skip(self, result))]
    pub fn complete_save(&mut self, result: StoreResult<BatchResult>) -> SessionResult<SaveReport> {
        let transaction = self
            .in_flight
            .take()
            .ok_or_else(|| SessionError::UnsupportedOperation("no save in progress".to_string()))?;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                transaction.rollback(&mut self.tree);
                warn!(error = %e, "Save failed, rolled back");
                return Err(match e {
                    StoreError::OutcomeUnknown(reason) => SessionError::BatchOutcomeUnknown(reason),
                    other => SessionError::Store(other),
                });
            }
        };

        if !result.is_success() || result.outcomes.len() != transaction.batch().len() {
            transaction.rollback(&mut self.tree);
            let error = match result.first_failure() {
                Some((index, kind, message)) => SessionError::BatchRejected {
                    index,
                    kind,
                    message: message.to_string(),
                },
                None => SessionError::BatchRejected {
                    index: result.outcomes.len(),
                    kind: FailureKind::Other,
                    message: format!(
                        "expected {} outcomes, got {}",
                        transaction.batch().len(),
                        result.outcomes.len()
                    ),
                },
            };
            warn!(error = %error, "Save rejected, rolled back");
            return Err(error);
        }

        match transaction.commit(&mut self.tree, &mut self.log, &result) {
            Ok(report) => {
                info!(
                    submitted = report.submitted,
                    persisted = report.persisted.len(),
                    removed = report.removed.len(),
                    "Save committed"
                );
                Ok(report)
            }
            Err(e) => {
                transaction.rollback(&mut self.tree);
                warn!(error = %e, "Commit failed, rolled back");
                Err(e)
            }
        }
    }

    /// Abandon an in-flight save
    pub fn cancel_save(&mut self) -> SessionResult<()> {
        let transaction = self
            .in_flight
            .take()
            .ok_or_else(|| SessionError::UnsupportedOperation("no save in progress".to_string()))?;
        transaction.rollback(&mut self.tree);
        warn!("Save cancelled");
        Ok(())
    }
}
