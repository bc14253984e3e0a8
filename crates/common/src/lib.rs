pub mod config;
pub mod error;
pub mod stream;

pub use error::{FerriteError, Result};
pub use stream::{StreamEntry, StreamEntryId};
