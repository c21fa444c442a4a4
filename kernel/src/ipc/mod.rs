//! Inter-process byte and key-event rings backing I/O redirection.

pub mod ring;

pub use ring::{ByteRing, KeyQueue};
