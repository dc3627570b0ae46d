//! Document model, search, and patching.
//!
//! Data flows leaves-first:
//!
//! 1. **[`host`]**: the host tree and the [`DocumentHost`] editing surface.
//! 2. **[`udv`]**: [`build_udv`] flattens the tree into an immutable
//!    [`Udv`] snapshot with positional [`Path`]s.
//! 3. **[`search`]**: [`SearchIndex`] answers literal and pattern queries
//!    with hits that carry stable ids.
//! 4. **[`patch`]**: [`apply_patch`] re-confirms a hit against the live
//!    host and applies the edit.
//! 5. **[`executor`]**: [`DocumentExecutor`] wires the above behind the
//!    `{ operation, payload }` request envelope.

pub mod executor;
pub mod host;
pub mod patch;
pub mod search;
pub mod udv;

pub use executor::{DocumentExecutor, ExecutorRequest, ExecutorResponse, Operation, SearchPayload};
pub use host::{DocumentHost, HostDocument, InMemoryDocument};
pub use patch::{PatchOutcome, PatchRequest, ResolveFailure, apply_patch};
pub use search::{Hit, SearchIndex, SearchMode, SearchOptions, SearchResult};
pub use udv::{Block, Path, Udv, build_udv};
