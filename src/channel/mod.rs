//! Channel multiplexing and lifecycle.

pub(crate) mod registry;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

pub use crate::transport::ChannelOpenType as ChannelKind;
pub use registry::ChannelRegistry;

/// One of the five states a [`Channel`] moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// A message delivered to a channel's owner.
///
/// `Request` carries every channel-request the peer sends on this channel,
/// including `exit-status`, which the exec engine recognizes by name; this
/// registry does not special-case it.
#[derive(Debug)]
pub enum ChannelMessage {
    Data(Bytes),
    ExtendedData { ext_type: u32, data: Bytes },
    Eof,
    Closed,
    Request {
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
}

pub(crate) struct ChannelShared {
    pub(crate) local_id: u32,
    pub(crate) remote_id: u32,
    pub(crate) kind: ChannelKind,

    pub(crate) state: Mutex<ChannelState>,

    /// Remaining bytes we are allowed to send before suspending.
    send_window: AtomicU32,
    send_window_notify: tokio::sync::Notify,
    /// The peer's maximum packet size; outbound data is split to this.
    pub(crate) max_packet_size: u32,

    /// Our own advertised (initial) receive window; constant for the life
    /// of the channel, used to decide when a `WINDOW_ADJUST` is due.
    local_window_size: u32,
    /// Bytes consumed from our advertised window since the last adjust.
    recv_consumed: AtomicU32,

    pub(crate) inbound_tx: mpsc::Sender<ChannelMessage>,

    /// FIFO queue of pending channel-request acks, answered in the order
    /// sent. Each entry is tagged with an id from `next_request_id` so a
    /// cancelled caller can find and remove its own entry without
    /// disturbing the FIFO order of the others.
    pub(crate) request_queue:
        Mutex<std::collections::VecDeque<(u64, oneshot::Sender<crate::error::Result<bool>>)>>,
    pub(crate) next_request_id: std::sync::atomic::AtomicU64,

    eof_sent: AtomicBool,
    close_sent: AtomicBool,
}

impl ChannelShared {
    fn half_window(&self) -> u32 {
        self.local_window_size / 2
    }
}

/// A logical bidirectional byte stream multiplexed over the transport.
///
/// `Channel` is a cheap, `Clone`-free handle: operations go through the
/// [`ChannelRegistry`] that created it: the registry owns the authoritative
/// per-channel state, the `Channel` handle merely references it.
pub struct Channel {
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) registry: ChannelRegistry,
    pub(crate) inbound: tokio::sync::Mutex<mpsc::Receiver<ChannelMessage>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.shared.local_id)
            .field("remote_id", &self.shared.remote_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// The local channel id (this side's number for the channel).
    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    /// Receive the next message delivered to this channel (data, EOF,
    /// close, or an inbound channel-request such as `exit-status`).
    /// Returns `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<ChannelMessage> {
        self.inbound.lock().await.recv().await
    }

    /// The remote channel id (the peer's number for the channel).
    pub fn remote_id(&self) -> u32 {
        self.shared.remote_id
    }

    /// What kind of channel this is (session / direct-tcpip / forwarded-tcpip).
    pub fn kind(&self) -> &ChannelKind {
        &self.shared.kind
    }

    /// The channel's current lifecycle state.
    pub fn state(&self) -> ChannelState {
        *self.shared.state.lock()
    }

    /// Send data on this channel, suspending as needed for flow control.
    pub async fn send_data(&self, data: Bytes) -> crate::error::Result<()> {
        self.registry.send_data(self, data).await
    }

    /// Send a channel-request, optionally awaiting its reply.
    pub async fn send_request(
        &self,
        name: &str,
        payload: Bytes,
        want_reply: bool,
    ) -> crate::error::Result<()> {
        self.registry
            .send_request(self, name, payload, want_reply)
            .await
    }

    /// Half-close then fully close this channel. Idempotent.
    pub async fn close(&self) -> crate::error::Result<()> {
        self.registry.close_channel(self).await
    }

    /// Answer an inbound channel-request this side did not originate, with
    /// `CHANNEL_SUCCESS` (`accept = true`) or `CHANNEL_FAILURE`.
    pub async fn reply_to_request(&self, accept: bool) -> crate::error::Result<()> {
        self.registry.reply_to_request(self, accept).await
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        if *self.state.lock() != ChannelState::Closed {
            tracing::warn!(
                local_id = self.local_id,
                "channel dropped without being closed"
            );
        }
    }
}

pub(crate) use registry::PendingOpen;
