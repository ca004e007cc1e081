//! Wire protocol for peer communication.
//!
//! Frames are JSON text. Control commands travel in a `__command__` /
//! `__value__` envelope; everything else is an application message.

pub mod codec;

pub use codec::{room_joined, CodecError, Command, Frame, JOINED_ROOM_TOPIC};
