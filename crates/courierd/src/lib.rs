//! courierd — connection handling for the Courier protocol: framed
//! transport, the client dispatcher, and the server accept loop.

pub mod client;
pub mod server;
pub mod transport;

pub use client::{ClientDispatcher, ExchangeError};
pub use server::ServerHandler;
pub use transport::TransportError;
