//! Listener contracts
//!
//! Callbacks run on a dispatch lane owned by the listener, never on the
//! caller's thread or the USB callback thread. Each listener sees events in
//! the order they were produced.

use crate::error::ConnectionError;
use crate::state::ClientHandle;
use async_channel::{Receiver, Sender, unbounded};
use bytes::Bytes;
use tracing::debug;

/// Connection state notifications
pub trait ClientListener: Send + Sync {
    fn connection_established(&self, client: &ClientHandle);

    fn connection_lost(&self, client: &ClientHandle);

    /// A lifecycle or transfer failure was caught and logged
    fn connection_failed(&self, _client: &ClientHandle, _error: &ConnectionError) {}
}

/// Data notifications
///
/// Text callbacks carry the payload decoded as 7-bit ASCII. The raw-byte
/// callbacks are delivered first, with the same payload.
pub trait DataListener: Send + Sync {
    fn message_received(&self, message: &str);

    fn message_sent(&self, message: &str);

    fn data_received(&self, _data: &[u8]) {}

    fn data_sent(&self, _data: &[u8]) {}
}

/// Event forwarded by a [`ChannelListener`]
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionEstablished,
    ConnectionLost,
    ConnectionFailed(ConnectionError),
    MessageReceived(Bytes),
    MessageSent(Bytes),
}

/// Listener that forwards every notification into a channel
///
/// Register the same instance as both client and data listener to get a
/// single ordered stream per kind.
pub struct ChannelListener {
    tx: Sender<ClientEvent>,
}

impl ChannelListener {
    fn forward(&self, event: ClientEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Dropping client event, receiver gone: {}", e);
        }
    }
}

/// Create a channel-backed listener and the receiving end of its stream
pub fn channel_listener() -> (std::sync::Arc<ChannelListener>, Receiver<ClientEvent>) {
    let (tx, rx) = unbounded();
    (std::sync::Arc::new(ChannelListener { tx }), rx)
}

impl ClientListener for ChannelListener {
    fn connection_established(&self, _client: &ClientHandle) {
        self.forward(ClientEvent::ConnectionEstablished);
    }

    fn connection_lost(&self, _client: &ClientHandle) {
        self.forward(ClientEvent::ConnectionLost);
    }

    fn connection_failed(&self, _client: &ClientHandle, error: &ConnectionError) {
        self.forward(ClientEvent::ConnectionFailed(error.clone()));
    }
}

impl DataListener for ChannelListener {
    fn message_received(&self, _message: &str) {}

    fn message_sent(&self, _message: &str) {}

    fn data_received(&self, data: &[u8]) {
        self.forward(ClientEvent::MessageReceived(Bytes::copy_from_slice(data)));
    }

    fn data_sent(&self, data: &[u8]) {
        self.forward(ClientEvent::MessageSent(Bytes::copy_from_slice(data)));
    }
}
