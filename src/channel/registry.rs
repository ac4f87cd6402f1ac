use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::transport::{ChannelOpenType, InboundEvent, Transport};

use super::{Channel, ChannelMessage, ChannelShared, ChannelState};

/// Bound on the per-channel inbound message queue. Generous enough that a
/// slow consumer doesn't stall the transport's single dispatch task for
/// ordinary interactive use, while still bounding memory.
const INBOUND_QUEUE_DEPTH: usize = 256;

pub(crate) struct PendingOpen {
    reply: oneshot::Sender<Result<(u32, u32, u32)>>,
}

/// Removes `local_id`'s entry from `pending_opens` on drop. Covers both
/// ordinary completion (the entry is already gone, removal is a no-op) and
/// the caller's future being dropped before the peer answers, which would
/// otherwise leak the entry for the life of the registry.
struct PendingOpenGuard {
    registry: ChannelRegistry,
    local_id: u32,
}

impl Drop for PendingOpenGuard {
    fn drop(&mut self) {
        self.registry.0.pending_opens.lock().remove(&self.local_id);
    }
}

/// Removes a channel-request's tagged entry from `request_queue` on drop,
/// by id rather than by position, so a cancelled caller's reply slot can be
/// pulled out without disturbing the FIFO order of requests still pending.
struct RequestQueueGuard {
    shared: Arc<ChannelShared>,
    id: u64,
}

impl Drop for RequestQueueGuard {
    fn drop(&mut self) {
        let mut queue = self.shared.request_queue.lock();
        if let Some(pos) = queue.iter().position(|(id, _)| *id == self.id) {
            queue.remove(pos);
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    next_local_id: AtomicU32,
    channels: Mutex<HashMap<u32, Arc<ChannelShared>>>,
    pending_opens: Mutex<HashMap<u32, PendingOpen>>,
}

/// Allocates channel ids, tracks window/packet size, and dispatches inbound
/// data to channel handlers.
///
/// Cheaply `Clone`-able; every [`Channel`] handle carries one of these
/// clones so its instance methods can call back into the registry.
#[derive(Clone)]
pub struct ChannelRegistry(Arc<Inner>);

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("open_channels", &self.0.channels.lock().len())
            .finish()
    }
}

impl ChannelRegistry {
    pub(crate) fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self(Arc::new(Inner {
            transport,
            config,
            next_local_id: AtomicU32::new(0),
            channels: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
        }))
    }

    fn alloc_local_id(&self) -> u32 {
        self.0.next_local_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a new channel of `kind`, suspending until the peer confirms or
    /// rejects it.
    pub async fn open_channel(&self, kind: ChannelOpenType) -> Result<Channel> {
        let local_id = self.alloc_local_id();
        let (tx, rx) = oneshot::channel();

        self.0
            .pending_opens
            .lock()
            .insert(local_id, PendingOpen { reply: tx });
        let _cleanup = PendingOpenGuard {
            registry: self.clone(),
            local_id,
        };

        self.0
            .transport
            .send_channel_open(
                local_id,
                &kind,
                self.0.config.window_size,
                self.0.config.max_packet_size,
            )
            .await?;

        let outcome = timeout(self.0.config.channel_open_timeout, rx).await;
        let (remote_id, initial_window, max_packet_size) = match outcome {
            Ok(Ok(Ok(ack))) => ack,
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(Error::Cancelled),
            Err(_) => return Err(Error::Timeout),
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let shared = Arc::new(ChannelShared {
            local_id,
            remote_id,
            kind,
            state: Mutex::new(ChannelState::Open),
            send_window: AtomicU32::new(initial_window),
            send_window_notify: tokio::sync::Notify::new(),
            max_packet_size,
            local_window_size: self.0.config.window_size,
            recv_consumed: AtomicU32::new(0),
            inbound_tx,
            request_queue: Mutex::new(std::collections::VecDeque::new()),
            next_request_id: std::sync::atomic::AtomicU64::new(0),
            eof_sent: std::sync::atomic::AtomicBool::new(false),
            close_sent: std::sync::atomic::AtomicBool::new(false),
        });

        self.0.channels.lock().insert(local_id, shared.clone());

        Ok(Channel {
            shared,
            registry: self.clone(),
            inbound: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// Finish accepting an inbound `CHANNEL_OPEN` (used by the port
    /// forwarding component for `forwarded-tcpip`).
    pub(crate) async fn accept_inbound(
        &self,
        sender_channel: u32,
        kind: ChannelOpenType,
        peer_initial_window: u32,
        peer_max_packet_size: u32,
    ) -> Result<Channel> {
        let local_id = self.alloc_local_id();

        self.0
            .transport
            .send_channel_open_confirmation(
                sender_channel,
                local_id,
                self.0.config.window_size,
                self.0.config.max_packet_size,
            )
            .await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let shared = Arc::new(ChannelShared {
            local_id,
            remote_id: sender_channel,
            kind,
            state: Mutex::new(ChannelState::Open),
            send_window: AtomicU32::new(peer_initial_window),
            send_window_notify: tokio::sync::Notify::new(),
            max_packet_size: peer_max_packet_size,
            local_window_size: self.0.config.window_size,
            recv_consumed: AtomicU32::new(0),
            inbound_tx,
            request_queue: Mutex::new(std::collections::VecDeque::new()),
            next_request_id: std::sync::atomic::AtomicU64::new(0),
            eof_sent: std::sync::atomic::AtomicBool::new(false),
            close_sent: std::sync::atomic::AtomicBool::new(false),
        });

        self.0.channels.lock().insert(local_id, shared.clone());

        Ok(Channel {
            shared,
            registry: self.clone(),
            inbound: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    /// Reject an inbound `CHANNEL_OPEN` outright (no local channel created).
    pub(crate) async fn reject_inbound(&self, sender_channel: u32, reason: &str) -> Result<()> {
        self.0
            .transport
            .send_channel_open_failure(sender_channel, reason)
            .await
    }

    fn get(&self, local_id: u32) -> Option<Arc<ChannelShared>> {
        self.0.channels.lock().get(&local_id).cloned()
    }

    /// Send data on `channel`, splitting at max packet size and suspending
    /// when the remote window is insufficient.
    pub async fn send_data(&self, channel: &Channel, mut data: Bytes) -> Result<()> {
        let shared = &channel.shared;
        if *shared.state.lock() == ChannelState::Closed {
            return Err(Error::ConnectionClosed);
        }
        while !data.is_empty() {
            let chunk_len = (data.len() as u32).min(shared.max_packet_size);

            loop {
                let available = shared.send_window.load(Ordering::Acquire);
                if available >= chunk_len {
                    break;
                }
                shared.send_window_notify.notified().await;
            }

            shared
                .send_window
                .fetch_sub(chunk_len, Ordering::AcqRel);

            let chunk = data.split_to(chunk_len as usize);
            self.0
                .transport
                .send_channel_data(shared.remote_id, &chunk)
                .await?;
        }
        Ok(())
    }

    /// `sendRequest(channel, name, payload, wantReply) -> future<Ack>`.
    pub async fn send_request(
        &self,
        channel: &Channel,
        name: &str,
        payload: Bytes,
        want_reply: bool,
    ) -> Result<()> {
        let shared = &channel.shared;
        if *shared.state.lock() == ChannelState::Closed {
            return Err(Error::ConnectionClosed);
        }

        let reply_rx = if want_reply {
            let (tx, rx) = oneshot::channel();
            let id = shared.next_request_id.fetch_add(1, Ordering::Relaxed);
            shared.request_queue.lock().push_back((id, tx));
            Some((
                rx,
                RequestQueueGuard {
                    shared: channel.shared.clone(),
                    id,
                },
            ))
        } else {
            None
        };

        self.0
            .transport
            .send_channel_request(shared.remote_id, name, want_reply, &payload)
            .await?;

        if let Some((rx, _cleanup)) = reply_rx {
            match rx.await {
                Ok(Ok(true)) => Ok(()),
                Ok(Ok(false)) => Err(Error::ProtocolViolation(format!(
                    "channel-request {name:?} failed"
                ))),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::ChannelClosed),
            }
        } else {
            Ok(())
        }
    }

    /// Answer an inbound channel-request this side did not originate (the
    /// server role: `pty-req`, `shell`, `exec`, `subsystem`, ...).
    pub async fn reply_to_request(&self, channel: &Channel, accept: bool) -> Result<()> {
        if accept {
            self.0.transport.send_channel_success(channel.shared.remote_id).await
        } else {
            self.0.transport.send_channel_failure(channel.shared.remote_id).await
        }
    }

    /// `closeChannel(channel)`: sends EOF then CLOSE. Idempotent.
    pub async fn close_channel(&self, channel: &Channel) -> Result<()> {
        let shared = &channel.shared;

        if !shared.eof_sent.swap(true, Ordering::AcqRel) {
            self.0.transport.send_channel_eof(shared.remote_id).await?;
            let mut state = shared.state.lock();
            *state = match *state {
                ChannelState::Open => ChannelState::HalfClosedLocal,
                ChannelState::HalfClosedRemote => ChannelState::Closed,
                other => other,
            };
        }

        if !shared.close_sent.swap(true, Ordering::AcqRel) {
            self.0
                .transport
                .send_channel_close(shared.remote_id)
                .await?;
        }

        Ok(())
    }

    /// Entry point for the session's dispatch loop: route a channel-scoped
    /// inbound event to its channel, or return it unconsumed if it is a
    /// global-scoped event (inbound channel-open, global request) that the
    /// caller (the session façade / forwarding component) must handle.
    pub(crate) async fn dispatch(&self, event: InboundEvent) -> Option<InboundEvent> {
        match event {
            InboundEvent::ChannelOpenConfirmation {
                local_id,
                remote_id,
                initial_window,
                max_packet_size,
            } => {
                if let Some(pending) = self.0.pending_opens.lock().remove(&local_id) {
                    let _ = pending
                        .reply
                        .send(Ok((remote_id, initial_window, max_packet_size)));
                }
                None
            }
            InboundEvent::ChannelOpenFailure { local_id, reason } => {
                if let Some(pending) = self.0.pending_opens.lock().remove(&local_id) {
                    let _ = pending.reply.send(Err(Error::ChannelOpenRejected(reason)));
                }
                None
            }
            InboundEvent::ChannelData { local_id, data } => {
                if let Some(shared) = self.get(local_id) {
                    self.account_inbound_bytes(&shared, data.len() as u32).await;
                    let _ = shared.inbound_tx.send(ChannelMessage::Data(data)).await;
                }
                None
            }
            InboundEvent::ChannelExtendedData {
                local_id,
                ext_type,
                data,
            } => {
                if let Some(shared) = self.get(local_id) {
                    self.account_inbound_bytes(&shared, data.len() as u32).await;
                    let _ = shared
                        .inbound_tx
                        .send(ChannelMessage::ExtendedData { ext_type, data })
                        .await;
                }
                None
            }
            InboundEvent::ChannelEof { local_id } => {
                if let Some(shared) = self.get(local_id) {
                    {
                        let mut state = shared.state.lock();
                        *state = match *state {
                            ChannelState::Open => ChannelState::HalfClosedRemote,
                            ChannelState::HalfClosedLocal => ChannelState::Closed,
                            other => other,
                        };
                    }
                    let _ = shared.inbound_tx.send(ChannelMessage::Eof).await;
                }
                None
            }
            InboundEvent::ChannelClose { local_id } => {
                if let Some(shared) = self.0.channels.lock().remove(&local_id) {
                    *shared.state.lock() = ChannelState::Closed;
                    let _ = shared.inbound_tx.send(ChannelMessage::Closed).await;
                    self.drain_requests(&shared, || Error::ChannelClosed);
                    if !shared.close_sent.swap(true, Ordering::AcqRel) {
                        let _ = self.0.transport.send_channel_close(shared.remote_id).await;
                    }
                }
                None
            }
            InboundEvent::ChannelRequest {
                local_id,
                name,
                want_reply,
                payload,
            } => {
                if let Some(shared) = self.get(local_id) {
                    let _ = shared
                        .inbound_tx
                        .send(ChannelMessage::Request {
                            name,
                            want_reply,
                            payload,
                        })
                        .await;
                }
                None
            }
            InboundEvent::ChannelSuccess { local_id } => {
                self.resolve_request(local_id, Ok(true));
                None
            }
            InboundEvent::ChannelFailure { local_id } => {
                self.resolve_request(local_id, Ok(false));
                None
            }
            InboundEvent::ChannelWindowAdjust {
                local_id,
                bytes_to_add,
            } => {
                if let Some(shared) = self.get(local_id) {
                    shared.send_window.fetch_add(bytes_to_add, Ordering::AcqRel);
                    shared.send_window_notify.notify_waiters();
                }
                None
            }
            other => Some(other),
        }
    }

    fn resolve_request(&self, local_id: u32, outcome: Result<bool>) {
        let Some(shared) = self.get(local_id) else {
            return;
        };
        let mut queue = shared.request_queue.lock();
        match queue.pop_front() {
            Some((_, tx)) => {
                let _ = tx.send(outcome);
            }
            None => {
                tracing::error!(local_id, "reply arrived with empty request queue");
                drop(queue);
                self.tear_down_on_violation(&shared, "stray channel-request reply");
            }
        }
    }

    fn drain_requests(&self, shared: &ChannelShared, mut make_err: impl FnMut() -> Error) {
        let mut queue = shared.request_queue.lock();
        while let Some((_, tx)) = queue.pop_front() {
            let _ = tx.send(Err(make_err()));
        }
    }

    /// Protocol violations are fatal to the affected channel: tear it down
    /// and drain its pending promises.
    fn tear_down_on_violation(&self, shared: &ChannelShared, detail: &str) {
        tracing::error!(local_id = shared.local_id, detail, "protocol violation");
        self.0.channels.lock().remove(&shared.local_id);
        *shared.state.lock() = ChannelState::Closed;
        self.drain_requests(shared, || Error::ProtocolViolation(detail.to_string()));
    }

    /// When local consumption exceeds half of the advertised window, send
    /// `WINDOW_ADJUST`.
    async fn account_inbound_bytes(&self, shared: &ChannelShared, len: u32) {
        let consumed = shared.recv_consumed.fetch_add(len, Ordering::AcqRel) + len;
        if consumed >= shared.half_window() {
            shared.recv_consumed.store(0, Ordering::Release);
            if let Err(e) = self
                .0
                .transport
                .send_channel_window_adjust(shared.remote_id, consumed)
                .await
            {
                tracing::warn!(?e, local_id = shared.local_id, "failed to send window adjust");
            }
        }
    }

    /// Fail every pending promise with `ConnectionClosed` and mark all
    /// channels closed: a transport disconnect is fatal to every pending
    /// promise.
    pub(crate) fn fail_all(&self) {
        for (_, pending) in self.0.pending_opens.lock().drain() {
            let _ = pending.reply.send(Err(Error::ConnectionClosed));
        }
        for (_, shared) in self.0.channels.lock().drain() {
            *shared.state.lock() = ChannelState::Closed;
            self.drain_requests(&shared, || Error::ConnectionClosed);
            let _ = shared.inbound_tx.try_send(ChannelMessage::Closed);
        }
    }
}
