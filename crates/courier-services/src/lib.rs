//! courier-services — per-endpoint protocol state shared across connections:
//! peer keys, body encryption, chunk reassembly, and the handler contract.

pub mod chunk;
pub mod cipher;
pub mod handler;
pub mod peer_keys;

pub use chunk::{ChunkError, ChunkManager};
pub use cipher::{CipherError, FailurePolicy, MessageCipher};
pub use handler::{ChannelInfo, EchoHandler, RequestHandler};
pub use peer_keys::{PeerKey, PeerKeyCache, PeerKeyError};
