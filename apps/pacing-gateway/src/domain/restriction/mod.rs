//! Restriction Classes and Admission Control
//!
//! Independent rate and concurrency policies enforced client-side so the
//! venue never has a reason to reject a request for pacing.

pub mod container;
pub mod manager;
pub mod policy;

pub use container::AccountingContainer;
pub use manager::{Admission, AdmissionReport, ClassUsage, KeyUsage, RestrictionManager};
pub use policy::{Keying, PolicyParseError, PolicyTable, RestrictionClass, RestrictionPolicy};
