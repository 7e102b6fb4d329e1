//! sigbak-stream: reading and writing encrypted backup files frame by frame
//!
//! Both directions are synchronous and strictly sequential; the frame
//! counter must advance in file order.

pub mod payload;
pub mod reader;
pub mod writer;

pub use payload::{BufferedPayload, FilePayload};
pub use reader::{BackupReader, BadFrame, ReaderOptions};
pub use writer::BackupWriter;
