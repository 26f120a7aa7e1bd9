pub mod config;
pub mod device;
pub mod error;

pub use config::{CheckpointMode, GPipeConfig};
pub use device::{Device, Stream};
pub use error::GPipeError;
