//! Provider-agnostic join primitives.
//!
//! This crate holds the pieces of the join decision that never touch the
//! network: the [`Claims`] record a validator produces, the [`AllowRule`]
//! an administrator writes, and the matcher that decides between them.
//!
//! Attribute names are shared between claims and rules. A rule field named
//! `project_id` is compared against the claims attribute `project_id`; the
//! comparison is equality when the provider reports that attribute as a
//! scalar and membership when it reports it as a list.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod claims;
pub mod cmp;
pub mod rule;

pub use claims::Claims;
pub use cmp::known_fields_eq;
pub use rule::{AllowRule, first_match, matches};
