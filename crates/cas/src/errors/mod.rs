//! Error handling for the store and action cache
//!
//! Every operation returns an explicit [`Result`]; nothing here aborts the
//! process. Each error carries enough context to be reported as-is plus a
//! [`RecoveryHint`] for operational tooling.

mod display;
mod types;

pub use types::*;
