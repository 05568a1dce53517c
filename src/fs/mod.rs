pub mod error;
pub mod operations;
pub mod path;
pub mod properties;
pub mod stores;

pub use error::{AvmError, AvmResult};
pub use operations::AvmService;
pub use path::AvmPath;
