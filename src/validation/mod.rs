//! Validation: turning raw agent output into canonical lead records.
//!
//! - [`lead`]: the [`LeadRecord`] type and the `"unknown"` literal
//! - [`format`]: email, phone and URL checks
//! - [`gate`]: the structuring/validation gate with bounded retries

pub mod format;
pub mod gate;
pub mod lead;

pub use gate::{canonicalize, Rejected, Validated, ValidationGate, Verdict};
pub use lead::{LeadRecord, UNKNOWN};
