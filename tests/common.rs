//! An in-memory `Transport` that wires two sessions directly together,
//! standing in for the real SSH wire protocol this crate doesn't implement.
//!
//! Every `send_*` method on one end is translated into the matching
//! `InboundEvent` on the other: wherever the sender's method takes a
//! `remote_id` (its name for the peer's idea of the channel), that becomes
//! `local_id` on the event the peer receives, since "the peer's id for this
//! channel" and "my own id for this channel" name the same number from
//! opposite sides.

#![allow(dead_code)]

use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use ssh_session::transport::{ChannelOpenType, InboundEvent, Transport};
use tokio::sync::mpsc;

pub struct PairedTransport {
    to_peer: mpsc::Sender<InboundEvent>,
    self_tx: mpsc::Sender<InboundEvent>,
    from_peer: StdMutex<Option<mpsc::Receiver<InboundEvent>>>,
}

/// Build two ends of an in-memory transport, already cross-wired.
pub fn paired() -> (std::sync::Arc<PairedTransport>, std::sync::Arc<PairedTransport>) {
    let (tx_a, rx_a) = mpsc::channel(256);
    let (tx_b, rx_b) = mpsc::channel(256);
    let a = std::sync::Arc::new(PairedTransport {
        to_peer: tx_b,
        self_tx: tx_a,
        from_peer: StdMutex::new(Some(rx_a)),
    });
    let b = std::sync::Arc::new(PairedTransport {
        to_peer: tx_a,
        self_tx: tx_b,
        from_peer: StdMutex::new(Some(rx_b)),
    });
    (a, b)
}

impl PairedTransport {
    fn emit(&self, event: InboundEvent) {
        // Best-effort: a full queue or a peer that dropped its receiver
        // means the simulated connection is gone, same as a real socket
        // write failing silently from this trait's fire-and-forget methods.
        let _ = self.to_peer.try_send(event);
    }

    /// Simulate this side's transport observing the connection drop: push
    /// `Disconnected` onto its own inbound stream, exactly as a real
    /// implementation's read loop would when the socket closes.
    pub fn sever(&self) {
        let _ = self.self_tx.try_send(InboundEvent::Disconnected);
    }
}

#[async_trait::async_trait]
impl Transport for PairedTransport {
    fn subscribe(&self) -> mpsc::Receiver<InboundEvent> {
        self.from_peer
            .lock()
            .unwrap()
            .take()
            .expect("subscribe() called more than once")
    }

    async fn send_channel_open(
        &self,
        local_id: u32,
        channel_type: &ChannelOpenType,
        initial_window: u32,
        max_packet_size: u32,
    ) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelOpen {
            sender_channel: local_id,
            channel_type: channel_type.clone(),
            initial_window,
            max_packet_size,
        });
        Ok(())
    }

    async fn send_channel_open_confirmation(
        &self,
        remote_id: u32,
        local_id: u32,
        initial_window: u32,
        max_packet_size: u32,
    ) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelOpenConfirmation {
            local_id: remote_id,
            remote_id: local_id,
            initial_window,
            max_packet_size,
        });
        Ok(())
    }

    async fn send_channel_open_failure(&self, remote_id: u32, reason: &str) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelOpenFailure {
            local_id: remote_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn send_channel_data(&self, remote_id: u32, data: &[u8]) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelData {
            local_id: remote_id,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    async fn send_channel_extended_data(
        &self,
        remote_id: u32,
        ext_type: u32,
        data: &[u8],
    ) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelExtendedData {
            local_id: remote_id,
            ext_type,
            data: Bytes::copy_from_slice(data),
        });
        Ok(())
    }

    async fn send_channel_eof(&self, remote_id: u32) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelEof { local_id: remote_id });
        Ok(())
    }

    async fn send_channel_close(&self, remote_id: u32) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelClose { local_id: remote_id });
        Ok(())
    }

    async fn send_channel_request(
        &self,
        remote_id: u32,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelRequest {
            local_id: remote_id,
            name: name.to_string(),
            want_reply,
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }

    async fn send_channel_success(&self, remote_id: u32) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelSuccess { local_id: remote_id });
        Ok(())
    }

    async fn send_channel_failure(&self, remote_id: u32) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelFailure { local_id: remote_id });
        Ok(())
    }

    async fn send_channel_window_adjust(&self, remote_id: u32, bytes_to_add: u32) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::ChannelWindowAdjust {
            local_id: remote_id,
            bytes_to_add,
        });
        Ok(())
    }

    async fn send_global_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::GlobalRequest {
            name: name.to_string(),
            want_reply,
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }

    async fn send_global_request_success(&self, payload: &[u8]) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::GlobalRequestSuccess {
            payload: Bytes::copy_from_slice(payload),
        });
        Ok(())
    }

    async fn send_global_request_failure(&self) -> ssh_session::error::Result<()> {
        self.emit(InboundEvent::GlobalRequestFailure);
        Ok(())
    }
}
