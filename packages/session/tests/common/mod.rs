//! Shared fixtures for session integration tests

#![allow(dead_code)]

use arbor_session::{Credentials, ItemState, Session, SessionConfig};
use arbor_spi::{ItemId, MemoryStore, StaticRegistry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Route library logs to the test harness; `RUST_LOG` overrides the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}

pub fn store() -> MemoryStore {
    MemoryStore::new("nt:unstructured")
}

pub fn open(store: &MemoryStore) -> Session {
    open_with(store, SessionConfig::default())
}

pub fn open_with(store: &MemoryStore, config: SessionConfig) -> Session {
    init_tracing();
    Session::open(
        store.clone(),
        Arc::new(StaticRegistry::with_defaults()),
        Credentials::new("alice"),
        config,
    )
    .expect("open session")
}

/// Every state the session holds, keyed by id
pub fn states(session: &Session) -> BTreeMap<ItemId, ItemState> {
    session
        .tree()
        .iter()
        .map(|state| (state.id().clone(), state.clone()))
        .collect()
}

/// Names of the live children of `parent`, in order
pub fn child_names(session: &Session, parent: &ItemId) -> Vec<String> {
    let tree = session.tree();
    let node = tree.node(parent).expect("parent loaded");
    tree.live_children(node)
        .map(|entry| entry.name.to_string())
        .collect()
}
