//! `openlabs-core` — shared building blocks for range orchestration.
//!
//! Pure primitives only: identifiers, the domain error model and timestamp
//! validation. No IO lives here.

pub mod error;
pub mod id;
pub mod time;

pub use error::{DomainError, DomainResult};
pub use id::{BlueprintId, RangeId, UserId};
pub use time::{ensure_utc, parse_utc};
