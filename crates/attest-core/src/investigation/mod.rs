//! Collusion investigations.
//!
//! An investigation is opened against one witness pair, suspending it from
//! selection, and is resolved exactly once as `CLEARED` (suspension lifted)
//! or `CONFIRMED` (pair banned permanently). Resolution is a compare-and-set
//! on the stored status, so concurrent resolvers cannot overwrite each
//! other.

mod breach;
mod error;
mod investigator;
mod state;

pub use breach::{BreachRecord, BreachSource, MemoryBreachLog, breach_correlation};
pub use error::InvestigationError;
pub use investigator::{CORRELATION_TRIGGER_THRESHOLD, CollusionInvestigator, is_trigger_warranted};
pub use state::{Investigation, InvestigationPayload, InvestigationStatus, Resolution};
