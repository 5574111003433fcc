//! The `utils` module provides the pieces shared by every other module:
//! the error taxonomy and the logging glue between the transport and
//! `tracing`.

pub mod error;
pub mod logging;
