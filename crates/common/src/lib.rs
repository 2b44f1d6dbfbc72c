//! Shared domain types for the deployment controller.
//!
//! Everything in this crate is free of I/O: the error taxonomy used by every
//! service, the deterministic stack identity for a deployment, and the
//! fully-qualified image references produced by image ingestion.

pub mod error;
pub mod image_ref;
pub mod stack;

pub use error::{Error, ErrorClass, Result};
pub use image_ref::ImageReference;
pub use stack::StackIdentity;
