//! # Arbor Session
//!
//! Client-side session layer over a hierarchical content repository.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ caller: create / set / remove / move / save │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ session: operations + transient state       │
//! │  - Validate against definitions/constraints │
//! │  - Apply to the state tree immediately      │
//! │  - Record in the change log (pre-images)    │
//! │  - Save as one batch, commit or roll back   │
//! └─────────────────────────────────────────────┘
//!                     ↓
//! ┌─────────────────────────────────────────────┐
//! │ spi: RemoteStore gateway, DefinitionRegistry│
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! 1. **Remote store is source of truth**: item states are a cache plus
//!    pending local edits
//! 2. **Closed operation set**: every mutation is one [`Operation`] variant,
//!    dispatched through [`OperationVisitor`]
//! 3. **All or nothing**: a save either commits every pending change or
//!    leaves the session exactly as it was
//! 4. **Arena ownership**: nodes refer to children by id, never by handle
//!
//! ## Usage
//!
//! ```rust,ignore
//! use arbor_session::{Credentials, Session, SessionConfig};
//! use arbor_spi::{MemoryStore, StaticRegistry, Value};
//! use std::sync::Arc;
//!
//! let store = MemoryStore::new("nt:unstructured");
//! let mut session = Session::open(
//!     store.clone(),
//!     Arc::new(StaticRegistry::with_defaults()),
//!     Credentials::new("alice"),
//!     SessionConfig::default(),
//! )?;
//!
//! let root = session.root().clone();
//! let page = session.create_node(&root, "page", None)?.id().clone();
//! session.create_property(&page, "title", Value::from("Hello"))?;
//!
//! let report = session.save()?;
//! let page = &report.reassigned[&page];
//! ```

mod change_log;
mod config;
mod constraints;
mod errors;
mod identity;
mod operation;
mod session;
mod state;
mod state_tree;
mod transaction;
mod visitor;

pub use change_log::{ChangeLog, LogEntry, Recorded};
pub use config::{ConfigError, SessionConfig, ValueConflict, DEFAULT_CONFIG_NAME};
pub use constraints::{ConstraintChecker, Credentials, Permission, StaticConstraints, Unrestricted};
pub use errors::{ErrorKind, SessionError, SessionResult};
pub use identity::DefinitionLookup;
pub use operation::{
    AddNode, AddProperty, Move, Operation, ReorderNodes, Remove, SetMixins, SetPropertyValue,
};
pub use session::Session;
pub use state::{ChildEntry, ItemState, ItemStatus, NodeState, PropertyState};
pub use state_tree::StateTree;
pub use transaction::{SaveReport, Transaction};
pub use visitor::{Applied, Applier, OperationVisitor, Validator};
