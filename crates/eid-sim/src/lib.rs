//! eid-sim - Simulated eID card
//!
//! Implements [`CardSessionAdapter`](eid_core::CardSessionAdapter) with an
//! in-memory card: PIN retry counter, CAN suspension, PUK block, deactivated
//! eID function and a configurable server outcome for identifications.

pub mod card;
pub mod error;
pub mod profile;

pub use card::SimulatedCard;
pub use error::{SimError, SimResult};
pub use profile::{CardProfile, ServerOutcome, MAX_PIN_ATTEMPTS};
