//! # hostsched-api
//!
//! Wire types for the hostsched placement scheduler.
//!
//! The scheduler service and its callers (the region service, the k8s
//! extender, operators) exchange these types as JSON. Two small parsers live
//! here as well because both sides need them:
//!
//! - [`parse_range`] turns CPU range strings such as `"0-3,8"` into sorted
//!   core lists.
//! - [`parse_schedtag_config`] turns `"ssd:require"` into a
//!   [`SchedtagConfig`].

mod error;
mod parse;
mod types;

pub use error::ParseError;
pub use parse::{parse_range, parse_schedtag_config, MAX_RANGE_VALUES};
pub use types::*;
