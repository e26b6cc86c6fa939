//! Utility modules for the PiggyChick server.
//!
//! # Modules
//!
//! - [`collate`]: Numeric-aware, case-insensitive label ordering
//! - [`ids`]: Stable short identifiers derived from canonical paths

pub mod collate;
pub mod ids;

pub use collate::{label_cmp, natural_cmp};
pub use ids::{is_short_id, short_id, SHORT_ID_LEN};
