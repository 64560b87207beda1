//! revkb: a revisioned, branchable object store
//!
//! Every committed change produces one revision. Readers see a stable
//! snapshot, writers buffer changes locally and publish them atomically:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       KNOWLEDGE BASE                                │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  ┌─────────┐  reads   ┌──────────────┐  miss   ┌──────────────┐     │
//! │  │ Session │─────────►│ Object Cache │────────►│  Connection  │     │
//! │  │ (pinned)│          │ (weak, gen.) │         │     Pool     │     │
//! │  └────┬────┘          └──────────────┘         └──────┬───────┘     │
//! │       │ writes                 ▲ values chains        │             │
//! │       ▼                        │                      ▼             │
//! │  ┌─────────────┐  commit  ┌────┴─────────┐     ┌──────────────┐     │
//! │  │ Transaction │─────────►│    Commit    │────►│   Backend    │     │
//! │  │   Context   │          │  Coordinator │     │ (rows, seqs) │     │
//! │  └──────▲──────┘          └──────┬───────┘     └──────┬───────┘     │
//! │         │ merge                  ▼                    │ refetch     │
//! │         │                 ┌──────────────┐            │             │
//! │         └─────────────────│ Update Chain │◄───────────┘             │
//! │                           │  (r1→r2→…)   │──► listeners             │
//! │                           └──────────────┘                          │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Features
//!
//! - **Versioned**: every row carries a `[rev_min, rev_max]` validity range;
//!   any past revision can be read back
//! - **Isolated**: sessions read at a pinned revision and merge newer
//!   revisions explicitly, with structured conflict reports
//! - **Branchable**: branches copy only the types they fork and share the rest
//! - **Shared backends**: several knowledge bases over one backend converge by
//!   refetching each other's revisions
//!
//! ```no_run
//! use revkb_store::{attrs, KnowledgeBase, ObjectId, Schema, TypeDescriptor};
//!
//! let schema = Schema::new(vec![TypeDescriptor::new("Doc").primitive("title")])?;
//! let kb = KnowledgeBase::in_memory(schema)?;
//! let mut session = kb.session();
//! let doc = session.create(&"Doc".into(), Some(ObjectId(42)), attrs([("title", "a")]))?;
//! session.commit()?;
//! assert_eq!(session.get(&doc, "title")?, "a".into());
//! # Ok::<(), revkb_store::KbError>(())
//! ```

pub mod branch;
pub mod cache;
mod commit;
pub mod config;
pub mod error;
pub mod event;
pub mod flex;
pub mod item;
pub mod kb;
pub mod query;
mod refetch;
pub mod schema;
pub mod session;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod update_chain;
pub mod values;

#[cfg(test)]
mod tests;

pub use branch::{Branch, BranchRegistry};
pub use cache::{CacheStats, ObjectCache};
pub use config::{KbConfig, PoolConfig};
pub use error::{ConflictKind, KbError, MergeConflict, MergeConflicts, Result};
pub use event::{ChangeEvent, ChangeListener, CommitVeto, EventOrigin, ListenerPriority, ObjectChange};
pub use flex::{FlexAttributeStore, MemoryFlexStore};
pub use item::{ItemState, KnowledgeItem};
pub use kb::{KnowledgeBase, KnowledgeBaseBuilder};
pub use query::{CompiledQuery, Expr, QueryCompiler};
pub use schema::{AttributeDef, AttributeKind, Schema, SchemaDef, TypeDescriptor};
pub use session::Session;
pub use storage::{
    Connection, ConnectionPool, MemoryDatabase, MemoryPool, StorageError, StorageResult,
};
pub use transaction::{ContextState, TransactionContext};
pub use types::{
    attrs, AttrValue, Attributes, BranchId, Identity, ObjectId, ObjectKey, Revision, TypeName,
};
pub use update_chain::{UpdateChain, UpdateLink};
pub use values::{Lookup, UpdateOutcome, Values, ValuesChain};
