//! Domain Layer - Requests, restrictions and range splitting.
//!
//! Pure request-lifecycle and admission logic. Nothing here performs I/O
//! or spawns threads; time enters through explicit parameters where tests
//! need control over it.

/// Data requests, parameters, result rows and the status machine.
pub mod request;

/// Restriction classes, policies and the restriction manager.
pub mod restriction;

/// Historical range splitting and split multi-requests.
pub mod splitter;
