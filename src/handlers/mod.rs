//! HTTP handlers for tenant administration.

pub mod tenant;
pub use tenant::*;
