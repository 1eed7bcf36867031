//! PayWallet Common Types
//!
//! Shared types used across the ledger crates: identifiers, amounts,
//! transaction references, time sources and the error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod reference;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use reference::*;
pub use error::*;
pub use time::*;
