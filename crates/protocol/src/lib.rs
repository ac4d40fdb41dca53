//! Chaincode wire protocol
//!
//! Typed envelope and payloads exchanged with the ledger peer over a single
//! duplex stream, plus the newline-delimited JSON codec used on that stream.

pub mod bytes_serde;
pub mod codec;
pub mod message;
pub mod payload;

pub use codec::{decode_frame, decode_line, encode_line, read_message, write_message, CodecError};
pub use message::{ChaincodeMessage, MessageType};
pub use payload::*;
