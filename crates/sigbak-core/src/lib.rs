pub mod config;
pub mod error;
pub mod types;

pub use error::{SigbakError, SigbakResult};
pub use types::{AttachmentKey, IdRemap, SessionState};
