//! Request-side identity plumbing.

pub mod identity;
pub use identity::*;
