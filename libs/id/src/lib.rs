//! # fabric-id
//!
//! Typed identifiers, parsing, and validation for the fabric control plane.
//!
//! ## Design Principles
//!
//! - IDs are stable and system-generated; names are user-controlled labels
//! - All resource IDs are random UUID4 values in hyphenated lowercase form
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed to prevent mixing different resource types
//!
//! User IDs are the exception: they are issued by the identity provider and
//! are carried as opaque, non-empty strings.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
