//! The boundary between this crate and the SSH transport (KEX, cipher, MAC,
//! user auth, and the SSH binary packet protocol itself) that this crate
//! deliberately excludes. Everything in this module is a black box as
//! far as this crate is concerned: callers supply an implementation (or the
//! in-memory mock used by this crate's own tests), and every other module
//! talks only to the [`Transport`] trait and the [`InboundEvent`] stream it
//! produces.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// The three channel types this crate opens or accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOpenType {
    /// An interactive or exec session channel.
    Session,
    /// An outbound TCP proxy channel initiated by this side.
    DirectTcpip {
        /// Host the remote side should connect out to.
        host: String,
        /// Port on `host`.
        port: u32,
        /// Host the connection originated from, for logging/ACLs.
        origin_host: String,
        /// Port on `origin_host`.
        origin_port: u32,
    },
    /// An inbound TCP channel delivering a connection accepted on behalf of
    /// a prior `tcpip-forward`.
    ForwardedTcpip {
        /// The bound host the listener was opened on.
        bound_host: String,
        /// The bound port the listener was opened on.
        bound_port: u32,
        /// Host the inbound TCP connection originated from.
        origin_host: String,
        /// Port on `origin_host`.
        origin_port: u32,
    },
}

/// Events the transport delivers to the channel registry and session
/// façade: the entire "transport decoder" half of the data flow.
#[derive(Debug)]
pub enum InboundEvent {
    /// The peer is opening a channel of its own (an inbound
    /// `forwarded-tcpip`, in this crate's usage).
    ChannelOpen {
        /// The peer's (remote, from our perspective) channel number.
        sender_channel: u32,
        /// What kind of channel the peer wants to open.
        channel_type: ChannelOpenType,
        /// The peer's advertised initial window.
        initial_window: u32,
        /// The peer's advertised maximum packet size.
        max_packet_size: u32,
    },
    /// Confirmation of a `CHANNEL_OPEN` this side sent.
    ChannelOpenConfirmation {
        /// The local channel id this confirmation answers.
        local_id: u32,
        /// The id the peer will use to refer to this channel.
        remote_id: u32,
        initial_window: u32,
        max_packet_size: u32,
    },
    /// Rejection of a `CHANNEL_OPEN` this side sent.
    ChannelOpenFailure {
        local_id: u32,
        reason: String,
    },
    /// Ordinary channel data.
    ChannelData { local_id: u32, data: Bytes },
    /// Extended channel data (stderr, when `ext_type == 1`).
    ChannelExtendedData {
        local_id: u32,
        ext_type: u32,
        data: Bytes,
    },
    /// The peer will send no more data on this channel.
    ChannelEof { local_id: u32 },
    /// The peer has closed this channel.
    ChannelClose { local_id: u32 },
    /// A channel-request from the peer (only meaningful for server-role
    /// channels; this crate's client role never receives these today, but
    /// the event exists for symmetry and the SFTP subsystem negotiation
    /// path).
    ChannelRequest {
        local_id: u32,
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    /// `CHANNEL_SUCCESS` answering a channel-request this side sent.
    ChannelSuccess { local_id: u32 },
    /// `CHANNEL_FAILURE` answering a channel-request this side sent.
    ChannelFailure { local_id: u32 },
    /// `CHANNEL_WINDOW_ADJUST` from the peer, increasing our send window.
    ChannelWindowAdjust { local_id: u32, bytes_to_add: u32 },
    /// An inbound global request (`tcpip-forward` et al., server role).
    GlobalRequest {
        name: String,
        want_reply: bool,
        payload: Bytes,
    },
    /// `REQUEST_SUCCESS` answering a global request this side sent.
    GlobalRequestSuccess { payload: Bytes },
    /// `REQUEST_FAILURE` answering a global request this side sent.
    GlobalRequestFailure,
    /// The transport connection was severed.
    Disconnected,
}

/// The black-box SSH transport dependency.
///
/// Implementations own the actual wire protocol (framing, KEX, cipher, MAC,
/// user auth) and are expected to run their own read loop that turns framed
/// SSH messages into [`InboundEvent`]s on the channel returned by
/// [`Transport::subscribe`]. Every method here is a fire-and-forget send;
/// request/reply correlation (futures, FIFO ordering, timeouts) is owned by
/// [`crate::channel::registry::ChannelRegistry`], not by the transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Take the receiving half of the inbound event stream. Called exactly
    /// once by the component driving the transport (normally
    /// [`crate::session::Session::connect`]/`accept`).
    fn subscribe(&self) -> mpsc::Receiver<InboundEvent>;

    /// Send `CHANNEL_OPEN` for a channel this side is initiating.
    async fn send_channel_open(
        &self,
        local_id: u32,
        channel_type: &ChannelOpenType,
        initial_window: u32,
        max_packet_size: u32,
    ) -> Result<()>;

    /// Accept an inbound `CHANNEL_OPEN` by sending
    /// `CHANNEL_OPEN_CONFIRMATION`.
    async fn send_channel_open_confirmation(
        &self,
        remote_id: u32,
        local_id: u32,
        initial_window: u32,
        max_packet_size: u32,
    ) -> Result<()>;

    /// Reject an inbound `CHANNEL_OPEN` by sending `CHANNEL_OPEN_FAILURE`.
    async fn send_channel_open_failure(&self, remote_id: u32, reason: &str) -> Result<()>;

    /// Send ordinary channel data.
    async fn send_channel_data(&self, remote_id: u32, data: &[u8]) -> Result<()>;

    /// Send extended channel data (stderr, when `ext_type == 1`).
    async fn send_channel_extended_data(
        &self,
        remote_id: u32,
        ext_type: u32,
        data: &[u8],
    ) -> Result<()>;

    /// Send `CHANNEL_EOF`.
    async fn send_channel_eof(&self, remote_id: u32) -> Result<()>;

    /// Send `CHANNEL_CLOSE`.
    async fn send_channel_close(&self, remote_id: u32) -> Result<()>;

    /// Send a channel-request.
    async fn send_channel_request(
        &self,
        remote_id: u32,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<()>;

    /// Answer an inbound channel-request with `CHANNEL_SUCCESS`.
    async fn send_channel_success(&self, remote_id: u32) -> Result<()>;

    /// Answer an inbound channel-request with `CHANNEL_FAILURE`.
    async fn send_channel_failure(&self, remote_id: u32) -> Result<()>;

    /// Send `CHANNEL_WINDOW_ADJUST`, advertising more receive window.
    async fn send_channel_window_adjust(&self, remote_id: u32, bytes_to_add: u32) -> Result<()>;

    /// Send a global request (`tcpip-forward`, `cancel-tcpip-forward`).
    async fn send_global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<()>;

    /// Answer an inbound global request with `REQUEST_SUCCESS`.
    async fn send_global_request_success(&self, payload: &[u8]) -> Result<()>;

    /// Answer an inbound global request with `REQUEST_FAILURE`.
    async fn send_global_request_failure(&self) -> Result<()>;
}
