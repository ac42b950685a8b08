//! # tandem-core — algorithmic core of the Tandem collaboration backend
//!
//! The pure layer under the live server: no I/O, no async, no clocks.
//!
//! ```text
//! client edit (base_version = n)
//!       │
//!       ▼
//! ┌─────────────┐   history[n..]   ┌───────────────┐
//! │  OT engine   │ ◄─────────────── │ DocumentState │
//! │  transform() │ ───────────────► │ apply()       │
//! └─────────────┘    op' (clamped)  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`op`] — operation model (insert / delete / format-range)
//! - [`engine`] — operational transformation, the object under test
//! - [`document`] — materialized content, version counter, history
//! - [`access`] — roles, capability table, access gate

pub mod access;
pub mod document;
pub mod engine;
pub mod op;

pub use access::{authorize, AccessPolicy, LinkAccess, Role};
pub use document::{DocumentState, ReplayError};
pub use engine::{transform, TransformError};
pub use op::{OpKind, Operation, ShapeError};
