//! RFC 6455 frame codec (component C1 of spec.md §4.1).
//!
//! Client→server frames must be masked; server→client frames are always
//! unmasked. No extensions (RSV bits), no fragmentation (continuation
//! frames are a protocol error, not a NeedMore condition).

pub mod coding;
mod frame;
mod mask;

pub use frame::{decode, encode, encode_close_payload, parse_close_payload, CloseFrame, Decoded, Frame};
pub use mask::{apply_mask, generate_mask};
