//! The façade tying the channel registry, exec engine, SFTP, and port
//! forwarding to one transport and one dispatch loop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::Stream;
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelKind, ChannelRegistry};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::exec::{
    self, Command, ExecChunk, PtyInbound, PtyRequest, PtyStdin,
};
use crate::forward::{LocalForward, RemotePortForward};
#[cfg(feature = "sftp-server")]
use crate::sftp::SftpFilesystem;
use crate::sftp::SftpClient;
use crate::transport::{ChannelOpenType, InboundEvent, Transport};
use crate::wire::put_string;

/// Answers an inbound global request this side did not originate. Returning
/// `Some(payload)` sends `REQUEST_SUCCESS`; `None` sends `REQUEST_FAILURE`.
pub type GlobalRequestHandler =
    Arc<dyn Fn(String, Bytes) -> BoxFuture<'static, Option<Bytes>> + Send + Sync>;

/// Handles an inbound `CHANNEL_OPEN` of type `session`, for the server role
/// (hosting a shell, an exec, or an SFTP subsystem for the peer).
pub type SessionChannelHandler = Arc<dyn Fn(Channel) -> BoxFuture<'static, ()> + Send + Sync>;

struct Shared {
    transport: Arc<dyn Transport>,
    registry: ChannelRegistry,
    remote_forward: Arc<RemotePortForward>,
    subsystem_timeout: Duration,
    sftp_handshake_timeout: Duration,
    on_channel_open: Option<SessionChannelHandler>,
    on_global_request: Option<GlobalRequestHandler>,
    on_disconnect: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    disconnected: AtomicBool,
}

/// An established SSH session: the owner of the channel registry, the
/// remote-forward bookkeeping, and (for the server role) the handlers for
/// whatever the peer opens on us.
///
/// Cheap to clone; every clone refers to the same underlying dispatch task
/// and channel table.
#[derive(Clone)]
pub struct Session(Arc<Shared>);

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("disconnected", &self.0.disconnected.load(Ordering::SeqCst))
            .finish()
    }
}

impl Session {
    /// Establish a client-role session: no inbound channel-opens are
    /// expected, and any that arrive are rejected.
    pub fn connect(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self::new(transport, config, None, None)
    }

    /// Establish a server-role session: inbound `session` channel-opens are
    /// handed to `on_channel_open`.
    pub fn accept(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        on_channel_open: SessionChannelHandler,
    ) -> Self {
        Self::new(transport, config, Some(on_channel_open), None)
    }

    /// Like [`accept`](Session::accept), additionally answering inbound
    /// global requests other than `tcpip-forward`/`cancel-tcpip-forward`
    /// (which [`RemotePortForward`] already owns) through `on_global_request`.
    pub fn accept_with_global_requests(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        on_channel_open: SessionChannelHandler,
        on_global_request: GlobalRequestHandler,
    ) -> Self {
        Self::new(
            transport,
            config,
            Some(on_channel_open),
            Some(on_global_request),
        )
    }

    fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        on_channel_open: Option<SessionChannelHandler>,
        on_global_request: Option<GlobalRequestHandler>,
    ) -> Self {
        let subsystem_timeout = config.subsystem_timeout;
        let sftp_handshake_timeout = config.sftp_handshake_timeout;

        let mut events = transport.subscribe();
        let registry = ChannelRegistry::new(transport.clone(), config);
        let remote_forward = Arc::new(RemotePortForward::new(transport.clone(), registry.clone()));

        let shared = Arc::new(Shared {
            transport,
            registry,
            remote_forward,
            subsystem_timeout,
            sftp_handshake_timeout,
            on_channel_open,
            on_global_request,
            on_disconnect: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        });

        let session = Session(shared);
        let dispatch_session = session.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                dispatch_session.dispatch_event(event).await;
            }
            dispatch_session.fire_disconnect();
        });

        session
    }

    async fn dispatch_event(&self, event: InboundEvent) {
        let event = match self.0.registry.dispatch(event).await {
            Some(event) => event,
            None => return,
        };
        let event = match self.0.remote_forward.dispatch(event).await {
            Some(event) => event,
            None => return,
        };

        match event {
            InboundEvent::Disconnected => self.fire_disconnect(),
            InboundEvent::ChannelOpen {
                sender_channel,
                channel_type: ChannelOpenType::Session,
                initial_window,
                max_packet_size,
            } => {
                self.accept_session_channel(sender_channel, initial_window, max_packet_size)
                    .await
            }
            InboundEvent::ChannelOpen { sender_channel, .. } => {
                // `direct-tcpip` we do not accept inbound (only forwarded-tcpip,
                // already consumed above), and unrecognized kinds: refuse.
                let _ = self
                    .0
                    .registry
                    .reject_inbound(sender_channel, "administratively prohibited")
                    .await;
            }
            InboundEvent::GlobalRequest {
                name,
                want_reply,
                payload,
            } => self.handle_global_request(name, want_reply, payload).await,
            _ => {}
        }
    }

    async fn accept_session_channel(&self, sender_channel: u32, initial_window: u32, max_packet_size: u32) {
        let Some(handler) = self.0.on_channel_open.clone() else {
            let _ = self
                .0
                .registry
                .reject_inbound(sender_channel, "administratively prohibited")
                .await;
            return;
        };

        match self
            .0
            .registry
            .accept_inbound(sender_channel, ChannelOpenType::Session, initial_window, max_packet_size)
            .await
        {
            Ok(channel) => {
                tokio::spawn(handler(channel));
            }
            Err(e) => tracing::error!(error = %e, "failed to accept inbound session channel"),
        }
    }

    async fn handle_global_request(&self, name: String, want_reply: bool, payload: Bytes) {
        let Some(handler) = self.0.on_global_request.clone() else {
            if want_reply {
                let _ = self.transport_failure().await;
            }
            return;
        };

        let outcome = handler(name, payload).await;
        if !want_reply {
            return;
        }
        let result = match outcome {
            Some(reply) => self.transport_success(&reply).await,
            None => self.transport_failure().await,
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to answer global request");
        }
    }

    async fn transport_success(&self, payload: &Bytes) -> Result<()> {
        self.0.transport.send_global_request_success(payload).await
    }

    async fn transport_failure(&self) -> Result<()> {
        self.0.transport.send_global_request_failure().await
    }

    fn fire_disconnect(&self) {
        if self.0.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.registry.fail_all();
        self.0.remote_forward.fail_all();
        if let Some(callback) = self.0.on_disconnect.lock().take() {
            callback();
        }
    }

    /// Register a callback fired exactly once, the first time the transport
    /// is observed to have disconnected.
    pub fn on_disconnect(&self, callback: impl FnOnce() + Send + 'static) {
        *self.0.on_disconnect.lock() = Some(Box::new(callback));
    }

    /// Whether the transport has disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.0.disconnected.load(Ordering::SeqCst)
    }

    /// The channel registry backing this session, for callers that need
    /// lower-level access than the convenience methods below provide.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.0.registry
    }

    /// The remote-forward bookkeeping (`tcpip-forward`) for this session.
    pub fn remote_forward(&self) -> Arc<RemotePortForward> {
        self.0.remote_forward.clone()
    }

    /// A [`LocalForward`] bound to this session's registry.
    pub fn local_forward(&self) -> LocalForward {
        LocalForward::new(self.0.registry.clone())
    }

    /// Run `cmd` to completion, returning its (merged, if requested) output.
    pub async fn execute_command(&self, cmd: &Command) -> Result<Bytes> {
        exec::execute_command(&self.0.registry, cmd).await
    }

    /// Run `cmd`, returning a stream of tagged stdout/stderr chunks.
    pub async fn execute_command_stream(
        &self,
        cmd: &Command,
    ) -> Result<impl Stream<Item = Result<ExecChunk>>> {
        exec::execute_command_stream(&self.0.registry, cmd).await
    }

    /// Run `cmd`, returning independent stdout and stderr streams.
    pub async fn execute_command_pair(
        &self,
        cmd: &Command,
    ) -> Result<(impl Stream<Item = Result<Bytes>>, impl Stream<Item = Result<Bytes>>)> {
        exec::execute_command_pair(&self.0.registry, cmd).await
    }

    /// Open a PTY and a shell on it, handing the inbound/outbound halves to
    /// `handler` for the lifetime of its future.
    pub async fn with_pty<F, Fut, T>(&self, pty: PtyRequest, env: &[(String, String)], handler: F) -> Result<T>
    where
        F: FnOnce(PtyInbound, PtyStdin) -> Fut,
        Fut: Future<Output = T>,
    {
        exec::with_pty(&self.0.registry, pty, env, handler).await
    }

    /// Open an `sftp` subsystem channel and complete the `INIT`/`VERSION`
    /// handshake.
    pub async fn open_sftp(&self) -> Result<SftpClient> {
        let channel = self.0.registry.open_channel(ChannelKind::Session).await?;

        let mut payload = BytesMut::new();
        put_string(&mut payload, "sftp");
        tokio::time::timeout(
            self.0.subsystem_timeout,
            channel.send_request("subsystem", payload.freeze(), true),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        SftpClient::connect(channel, self.0.sftp_handshake_timeout).await
    }

    /// Serve the `sftp` subsystem on an already-open session channel, using
    /// `filesystem` to answer requests. Callers wire this in from their
    /// [`SessionChannelHandler`] after recognizing a `subsystem` request
    /// named `sftp` on the channel they were handed.
    #[cfg(feature = "sftp-server")]
    pub fn serve_sftp(&self, channel: Channel, filesystem: Arc<dyn SftpFilesystem>) -> crate::sftp::SftpServer {
        crate::sftp::SftpServer::new(channel, filesystem)
    }

    /// `openDirectTcpip`: open one outbound proxy channel without binding a
    /// local listener.
    pub async fn open_direct_tcpip(
        &self,
        target_host: impl Into<String>,
        target_port: u32,
        origin_host: impl Into<String>,
        origin_port: u32,
    ) -> Result<Channel> {
        self.local_forward()
            .open_direct_tcpip(target_host, target_port, origin_host, origin_port)
            .await
    }

    /// Close every open channel and stop accepting new work on this session.
    pub async fn close(&self) -> Result<()> {
        self.fire_disconnect();
        Ok(())
    }
}

