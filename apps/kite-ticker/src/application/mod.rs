//! Application Layer - Port definitions.
//!
//! This layer defines the contracts the ticker client consumes from the
//! embedding application (credentials, token refresh, session exchange and
//! symbol lookup).

/// Port interfaces for external collaborators.
pub mod ports;
