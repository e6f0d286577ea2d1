//! courier-core — message model, wire format, and cryptographic primitives.
//! All other Courier crates depend on this one.

pub mod chunking;
pub mod config;
pub mod crypto;
pub mod keystore;
pub mod message;
pub mod wire;

pub use message::{Headers, Message, MessageType};
