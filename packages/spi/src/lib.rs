//! # Arbor SPI
//!
//! Boundary vocabulary shared by the session layer and the collaborators it
//! consults but does not own:
//!
//! - identifiers and names ([`ItemId`], [`Name`], [`IdGenerator`])
//! - typed values ([`PropertyType`], [`Value`])
//! - item definitions and the [`DefinitionRegistry`] lookup service
//! - the [`RemoteStore`] gateway contract (batch submission, read-through
//!   fetch, staleness refresh)
//!
//! In-memory implementations ([`StaticRegistry`], [`MemoryStore`]) are
//! provided for tests and embedding.

pub mod definition;
pub mod error;
pub mod ids;
pub mod memory;
pub mod result;
pub mod store;
pub mod value;

pub use definition::*;
pub use error::*;
pub use ids::*;
pub use memory::MemoryStore;
pub use result::*;
pub use store::*;
pub use value::*;
