pub mod constants;
mod driver;
mod guard;
pub mod options;
mod registry;
pub mod types;

pub use driver::RuntimeDriver;
pub use options::{
    CreateOptions, ExitMode, LoggingOptions, ProcessOptions, RuntimeLogFormat, RuntimeOptions,
    ShimOptions, StdioPaths,
};
pub use registry::Registry;
