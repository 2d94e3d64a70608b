//! Protocol module containing the disk-drive frame types and their codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_request, decode_response, encode_request, encode_response, frame_checksum, FrameError,
};
pub use messages::*;
