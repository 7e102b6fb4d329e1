//! sigbak-frames: the decrypted frame layer of a backup stream
//!
//! Frames are protobuf messages. This crate decodes and encodes them by hand
//! over a minimal wire layer ([`wire`]); no schema compiler is involved.

pub mod frame;
pub mod payload;
pub mod reactions;
pub mod statement;
pub mod wire;

pub use frame::{
    looks_like_frame, parse_frame, AttachmentFrame, AvatarFrame, DatabaseVersionFrame, Frame,
    HeaderFrame, KeyValueFrame, KeyValueValue, SharedPrefFrame, StickerFrame,
};
pub use payload::{Payload, PayloadSource};
pub use reactions::{Reaction, ReactionList};
pub use statement::{format_double, SqlParam, SqlStatementFrame};
