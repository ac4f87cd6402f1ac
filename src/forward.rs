//! TCP port forwarding: `direct-tcpip` (outbound, this side opens) and
//! `tcpip-forward`/`forwarded-tcpip` (remote, the peer opens channels back
//! at us for a binding we asked it to listen on).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;

use crate::channel::{Channel, ChannelMessage, ChannelRegistry};
use crate::error::{Error, Result};
use crate::transport::{ChannelOpenType, InboundEvent, Transport};
use crate::wire::put_string;

/// An inbound `forwarded-tcpip` channel delivered for one of
/// [`RemotePortForward`]'s bindings.
pub struct ForwardedConnection {
    pub channel: Channel,
    pub origin_host: String,
    pub origin_port: u32,
}

/// A per-binding callback, invoked once per accepted `forwarded-tcpip`
/// channel. The channel stays open until either side closes it; this crate
/// does not close it for the caller.
pub type ForwardHandler = Arc<dyn Fn(ForwardedConnection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Requests `tcpip-forward` on the peer and routes the `forwarded-tcpip`
/// channels it opens back to whichever handler was registered for the
/// `(host, bound_port)` the peer reports.
pub struct RemotePortForward {
    transport: Arc<dyn Transport>,
    registry: ChannelRegistry,
    pending: Mutex<VecDeque<oneshot::Sender<Result<Bytes>>>>,
    bindings: Mutex<HashMap<(String, u32), ForwardHandler>>,
}

impl RemotePortForward {
    pub(crate) fn new(transport: Arc<dyn Transport>, registry: ChannelRegistry) -> Self {
        Self {
            transport,
            registry,
            pending: Mutex::new(VecDeque::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    fn enqueue(&self) -> oneshot::Receiver<Result<Bytes>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(tx);
        rx
    }

    /// `tcpip-forward{host,port}`. Port `0` asks the peer to choose; the
    /// bound port it reports back is returned, and is what inbound channels
    /// will be keyed under.
    pub async fn bind(&self, host: impl Into<String>, port: u32, handler: ForwardHandler) -> Result<u32> {
        let host = host.into();
        let mut payload = BytesMut::new();
        put_string(&mut payload, &host);
        payload.put_u32(port);

        let rx = self.enqueue();
        self.transport
            .send_global_request("tcpip-forward", true, &payload)
            .await?;
        let response = rx.await.map_err(|_| Error::ConnectionClosed)??;

        let bound_port = if port != 0 {
            port
        } else {
            let bytes = response.get(0..4).ok_or(Error::InvalidResponse)?;
            u32::from_be_bytes(bytes.try_into().unwrap())
        };

        self.bindings.lock().insert((host, bound_port), handler);
        Ok(bound_port)
    }

    /// `cancel-tcpip-forward{host,port}`. In-flight channels already opened
    /// under the binding are unaffected; only new ones stop being routed.
    pub async fn cancel(&self, host: &str, port: u32) -> Result<()> {
        let mut payload = BytesMut::new();
        put_string(&mut payload, host);
        payload.put_u32(port);

        let rx = self.enqueue();
        self.transport
            .send_global_request("cancel-tcpip-forward", true, &payload)
            .await?;
        rx.await.map_err(|_| Error::ConnectionClosed)??;

        self.bindings.lock().remove(&(host.to_string(), port));
        Ok(())
    }

    fn resolve(&self, outcome: Result<Bytes>) {
        match self.pending.lock().pop_front() {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::error!("global-request reply arrived with empty pending queue"),
        }
    }

    /// Entry point for the session's dispatch loop, mirroring
    /// [`ChannelRegistry::dispatch`]: handle what belongs to this component,
    /// hand everything else back unconsumed.
    pub(crate) async fn dispatch(&self, event: InboundEvent) -> Option<InboundEvent> {
        match event {
            InboundEvent::GlobalRequestSuccess { payload } => {
                self.resolve(Ok(payload));
                None
            }
            InboundEvent::GlobalRequestFailure => {
                self.resolve(Err(Error::ProtocolViolation(
                    "global request rejected by peer".into(),
                )));
                None
            }
            InboundEvent::ChannelOpen {
                sender_channel,
                channel_type:
                    ChannelOpenType::ForwardedTcpip {
                        bound_host,
                        bound_port,
                        origin_host,
                        origin_port,
                    },
                initial_window,
                max_packet_size,
            } => {
                let handler = self
                    .bindings
                    .lock()
                    .get(&(bound_host.clone(), bound_port))
                    .cloned();

                match handler {
                    Some(handler) => {
                        let kind = ChannelOpenType::ForwardedTcpip {
                            bound_host,
                            bound_port,
                            origin_host: origin_host.clone(),
                            origin_port,
                        };
                        match self
                            .registry
                            .accept_inbound(sender_channel, kind, initial_window, max_packet_size)
                            .await
                        {
                            Ok(channel) => {
                                tokio::spawn(handler(ForwardedConnection {
                                    channel,
                                    origin_host,
                                    origin_port,
                                }));
                            }
                            Err(e) => tracing::error!(error = %e, "failed to accept forwarded-tcpip channel"),
                        }
                    }
                    None => {
                        let _ = self
                            .registry
                            .reject_inbound(sender_channel, "administratively prohibited")
                            .await;
                    }
                }
                None
            }
            other => Some(other),
        }
    }

    /// Fails every outstanding `bind`/`cancel` call; used when the
    /// transport disconnects.
    pub(crate) fn fail_all(&self) {
        let mut pending = self.pending.lock();
        while let Some(tx) = pending.pop_front() {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
    }
}

/// The client-side mirror of [`RemotePortForward`]: binds a local TCP
/// listener and pumps each accepted connection through a `direct-tcpip`
/// channel opened for it.
pub struct LocalForward {
    registry: ChannelRegistry,
}

impl LocalForward {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry }
    }

    /// `openDirectTcpip`: open one outbound proxy channel without binding a
    /// listener.
    pub async fn open_direct_tcpip(
        &self,
        target_host: impl Into<String>,
        target_port: u32,
        origin_host: impl Into<String>,
        origin_port: u32,
    ) -> Result<Channel> {
        self.registry
            .open_channel(ChannelOpenType::DirectTcpip {
                host: target_host.into(),
                port: target_port,
                origin_host: origin_host.into(),
                origin_port,
            })
            .await
    }

    /// Accepts connections on `listener` until it errors, opening one
    /// `direct-tcpip` channel per connection and pumping bytes both ways.
    pub async fn serve(
        &self,
        listener: TcpListener,
        target_host: impl Into<String>,
        target_port: u32,
    ) -> Result<()> {
        let target_host = target_host.into();
        loop {
            let (stream, origin) = listener.accept().await.map_err(Error::Io)?;
            let channel = self
                .open_direct_tcpip(
                    target_host.clone(),
                    target_port,
                    origin.ip().to_string(),
                    origin.port() as u32,
                )
                .await?;
            tokio::spawn(pump(stream, channel));
        }
    }

    /// Convenience one-shot bind: resolves `bind_addr`, then [`serve`]s it.
    ///
    /// [`serve`]: LocalForward::serve
    pub async fn listen(
        &self,
        bind_addr: impl ToSocketAddrs,
        target_host: impl Into<String>,
        target_port: u32,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await.map_err(Error::Io)?;
        self.serve(listener, target_host, target_port).await
    }
}

async fn pump(mut stream: TcpStream, channel: Channel) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => {
                        let _ = channel.close().await;
                        return;
                    }
                    Ok(n) => {
                        if channel.send_data(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            return;
                        }
                    }
                }
            }
            message = channel.recv() => {
                match message {
                    Some(ChannelMessage::Data(data)) => {
                        if stream.write_all(&data).await.is_err() {
                            return;
                        }
                    }
                    Some(ChannelMessage::ExtendedData { .. }) | Some(ChannelMessage::Request { .. }) => {}
                    Some(ChannelMessage::Eof) | Some(ChannelMessage::Closed) | None => {
                        let _ = stream.shutdown().await;
                        return;
                    }
                }
            }
        }
    }
}
