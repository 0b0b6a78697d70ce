//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (auth endpoint, store, clock).
pub mod ports;

/// Application services for token lifecycle and tick ingestion.
pub mod services;
