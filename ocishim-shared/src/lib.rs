//! Types shared between the ocishim execution core and the layers above it.

pub mod errors;
pub mod status;

pub use errors::{ShimError, ShimResult};
pub use status::{ContainerStatus, ProcessStatus, UNKNOWN_EXIT_CODE};
