//! Request handler trait: the contract between the server loop (which
//! reads, decrypts, and reassembles requests) and application logic
//! (which answers them).
//!
//! The server hands each handler exactly one complete request per logical
//! exchange. Fragmented uploads are composed before the handler sees them.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use courier_core::{Message, MessageType};

use crate::chunk::ChunkManager;

/// What a handler knows about the connection it is answering.
#[derive(Clone)]
pub struct ChannelInfo {
    pub peer: SocketAddr,
    /// The serving endpoint's own uid.
    pub server_uid: String,
    /// Owner id of the request. Empty until the request has been read.
    pub owner_id: String,
    /// Lets a handler publish download sources (`offer_bytes`, `offer_file`).
    pub chunks: Arc<ChunkManager>,
}

/// Application-level request handler.
///
/// Handlers run on the connection's task and should return promptly.
pub trait RequestHandler: Send + Sync {
    /// Answer one complete request.
    fn handle(&self, channel: &ChannelInfo, request: Message) -> Result<Message>;

    /// Called once per accepted connection, before anything is read.
    fn on_open(&self, _channel: &ChannelInfo) {}

    /// Called once per accepted connection when it closes, with the
    /// failure that ended it, if any.
    fn on_close(&self, _channel: &ChannelInfo, _failure: Option<&str>) {}
}

impl<F> RequestHandler for F
where
    F: Fn(&ChannelInfo, Message) -> Result<Message> + Send + Sync,
{
    fn handle(&self, channel: &ChannelInfo, request: Message) -> Result<Message> {
        self(channel, request)
    }
}

/// Default handler: answers every request with its own body.
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, _channel: &ChannelInfo, request: Message) -> Result<Message> {
        let kind = if request.is_file() {
            MessageType::File
        } else {
            MessageType::Text
        };
        let mut response = Message::new(kind, request.body);
        response.headers.extend(&request.headers);
        Ok(response)
    }
}
