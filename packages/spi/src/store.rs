//! # Remote Store Gateway
//!
//! Contract between the session layer and the durable copy of the tree.
//!
//! The session never sees the storage format or transport. It sends one
//! [`Batch`] of primitive [`Instruction`]s per save and reads items back as
//! [`ItemSnapshot`]s. Instructions may refer to session-local ids of items
//! created earlier in the same batch; the store reports the ids it assigned
//! in [`BatchResult::reassigned`].

use crate::ids::{ItemId, Name};
use crate::result::StoreResult;
use crate::value::{PropertyType, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Primitive mutation understood by a remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Instruction {
    AddNode {
        parent: ItemId,
        id: ItemId,
        name: Name,
        primary_type: Name,
    },
    AddProperty {
        parent: ItemId,
        id: ItemId,
        name: Name,
        property_type: PropertyType,
        multi_valued: bool,
        values: Vec<Value>,
    },
    SetValue {
        id: ItemId,
        property_type: PropertyType,
        values: Vec<Value>,
    },
    Remove {
        id: ItemId,
    },
    Move {
        id: ItemId,
        new_parent: ItemId,
        new_name: Name,
    },
    Reorder {
        parent: ItemId,
        child: ItemId,
        before: Option<ItemId>,
    },
    SetMixins {
        id: ItemId,
        mixins: Vec<Name>,
    },
}

impl Instruction {
    /// The item this instruction primarily acts on
    pub fn target(&self) -> &ItemId {
        match self {
            Instruction::AddNode { id, .. }
            | Instruction::AddProperty { id, .. }
            | Instruction::SetValue { id, .. }
            | Instruction::Remove { id }
            | Instruction::Move { id, .. }
            | Instruction::SetMixins { id, .. } => id,
            Instruction::Reorder { child, .. } => child,
        }
    }
}

/// One unit of work submitted to the remote store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub instructions: Vec<Instruction>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// Why the remote store refused an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    NotFound,
    AlreadyExists,
    Constraint,
    LockConflict,
    VersionConflict,
    AccessDenied,
    Stale,
    Other,
}

/// Per-instruction outcome reported by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum InstructionOutcome {
    Applied,
    Failed { kind: FailureKind, message: String },
    NotAttempted,
}

/// Result of a batch the remote store answered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// One outcome per submitted instruction, in order
    pub outcomes: Vec<InstructionOutcome>,

    /// Session-local id -> id assigned by the store
    #[serde(default)]
    pub reassigned: BTreeMap<ItemId, ItemId>,

    /// New revision of every item the batch touched, keyed by persisted id
    #[serde(default)]
    pub revisions: BTreeMap<ItemId, u64>,
}

impl BatchResult {
    /// Successful result for `count` instructions
    pub fn applied(count: usize) -> Self {
        Self {
            outcomes: vec![InstructionOutcome::Applied; count],
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o, InstructionOutcome::Applied))
    }

    /// First failed instruction, with its index
    pub fn first_failure(&self) -> Option<(usize, FailureKind, &str)> {
        self.outcomes.iter().enumerate().find_map(|(i, o)| match o {
            InstructionOutcome::Failed { kind, message } => Some((i, *kind, message.as_str())),
            _ => None,
        })
    }
}

/// Authoritative copy of a node as held by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: ItemId,
    pub parent: Option<ItemId>,
    pub name: Name,
    pub revision: u64,
    pub primary_type: Name,
    #[serde(default)]
    pub mixins: Vec<Name>,
    #[serde(default)]
    pub children: Vec<(Name, ItemId)>,
    #[serde(default)]
    pub properties: Vec<(Name, ItemId)>,
}

/// Authoritative copy of a property as held by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySnapshot {
    pub id: ItemId,
    pub parent: ItemId,
    pub name: Name,
    pub revision: u64,
    pub property_type: PropertyType,
    pub multi_valued: bool,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ItemSnapshot {
    Node(NodeSnapshot),
    Property(PropertySnapshot),
}

impl ItemSnapshot {
    pub fn id(&self) -> &ItemId {
        match self {
            ItemSnapshot::Node(n) => &n.id,
            ItemSnapshot::Property(p) => &p.id,
        }
    }

    pub fn revision(&self) -> u64 {
        match self {
            ItemSnapshot::Node(n) => n.revision,
            ItemSnapshot::Property(p) => p.revision,
        }
    }
}

/// Answer to a staleness probe
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// The caller's revision is current
    Unchanged,
    /// The item changed remotely; here is the current copy
    Modified(ItemSnapshot),
    /// The item no longer exists remotely
    Destroyed,
}

/// Remote store abstraction for persistence and testing
pub trait RemoteStore {
    /// Id of the root node
    fn root_id(&self) -> ItemId;

    /// Submit one batch. `Err` means the outcome is unknown.
    fn submit_batch(&self, batch: &Batch) -> StoreResult<BatchResult>;

    /// Read an item through from the remote store
    fn fetch(&self, id: &ItemId) -> StoreResult<ItemSnapshot>;

    /// Compare `known_revision` with the remote copy of `id`
    fn refresh(&self, id: &ItemId, known_revision: u64) -> StoreResult<RefreshOutcome>;
}
