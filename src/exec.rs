//! Command execution and PTY sessions over a `session` channel: `exec`,
//! `shell`, `pty-req`, `env`, `window-change`, and `exit-status` framed as
//! channel-requests, with stdout/stderr split by extended-data type.

use std::future::Future;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;

use crate::channel::{Channel, ChannelKind, ChannelMessage, ChannelRegistry};
use crate::error::{Error, Result};
use crate::wire::put_string;

/// One chunk of output from a running remote command, tagged by which
/// stream it arrived on.
#[derive(Debug, Clone)]
pub enum ExecChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// A remote command to run, built the way [`crate::sftp::OpenOptions`]
/// builds an open call: chained `&mut self` setters over owned defaults.
#[derive(Debug, Clone)]
pub struct Command {
    line: String,
    merge_streams: bool,
    in_shell: bool,
    max_response_size: Option<usize>,
    env: Vec<(String, String)>,
}

impl Command {
    /// `line` is sent verbatim as the `exec` (or, in shell mode, the
    /// `shell` stdin) payload; this crate does no local shell quoting.
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            merge_streams: false,
            in_shell: false,
            max_response_size: None,
            env: Vec::new(),
        }
    }

    /// Fold stderr into the accumulated stdout buffer (only consulted by
    /// [`execute_command`]; the streaming variants always keep them apart).
    pub fn merge_streams(&mut self, value: bool) -> &mut Self {
        self.merge_streams = value;
        self
    }

    /// Run via `pty-req` + `shell` instead of a bare `exec`.
    pub fn in_shell(&mut self, value: bool) -> &mut Self {
        self.in_shell = value;
        self
    }

    /// Fail with [`Error::OutputTooLarge`] once the accumulated buffer
    /// would exceed this many bytes. Only consulted by [`execute_command`].
    pub fn max_response_size(&mut self, value: usize) -> &mut Self {
        self.max_response_size = Some(value);
        self
    }

    /// Queue an `env` channel-request to send before `exec`/`shell`.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A pseudo-terminal allocation request, sent as `pty-req`.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

fn encode_pty_req(req: &PtyRequest) -> Bytes {
    use bytes::BufMut;
    let mut buf = BytesMut::new();
    put_string(&mut buf, &req.term);
    buf.put_u32(req.cols);
    buf.put_u32(req.rows);
    buf.put_u32(req.width_px);
    buf.put_u32(req.height_px);
    put_string(&mut buf, ""); // encoded terminal modes, none set
    buf.freeze()
}

fn encode_window_change(cols: u32, rows: u32, width_px: u32, height_px: u32) -> Bytes {
    use bytes::BufMut;
    let mut buf = BytesMut::new();
    buf.put_u32(cols);
    buf.put_u32(rows);
    buf.put_u32(width_px);
    buf.put_u32(height_px);
    buf.freeze()
}

fn parse_exit_status(payload: &Bytes) -> Option<u32> {
    payload
        .get(0..4)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
}

async fn send_env(channel: &Channel, env: &[(String, String)]) {
    for (key, value) in env {
        let mut payload = BytesMut::new();
        put_string(&mut payload, key);
        put_string(&mut payload, value);
        if let Err(e) = channel.send_request("env", payload.freeze(), true).await {
            tracing::warn!(key, error = %e, "env channel-request rejected by peer");
        }
    }
}

/// Sends `env`, then either `exec` or `pty-req`+`shell`+the injected command
/// line, gated on `shell`'s `CHANNEL_SUCCESS` (already awaited by
/// `send_request` with `want_reply = true`, so the injection below can never
/// race the remote line discipline).
async fn start_command(channel: &Channel, cmd: &Command) -> Result<()> {
    send_env(channel, &cmd.env).await;

    if cmd.in_shell {
        channel.send_request("shell", Bytes::new(), true).await?;
        let injected = format!("{};exit\n", cmd.line);
        channel.send_data(Bytes::from(injected)).await?;
    } else {
        let mut payload = BytesMut::new();
        put_string(&mut payload, &cmd.line);
        channel.send_request("exec", payload.freeze(), true).await?;
    }
    Ok(())
}

fn append_checked(buf: &mut BytesMut, data: &[u8], max: Option<usize>) -> Result<()> {
    if let Some(max) = max {
        if buf.len() + data.len() > max {
            return Err(Error::OutputTooLarge);
        }
    }
    buf.extend_from_slice(data);
    Ok(())
}

/// Runs `cmd` to completion, buffering stdout (and stderr, when
/// `merge_streams` is set) and returning it once the channel reports EOF.
pub async fn execute_command(registry: &ChannelRegistry, cmd: &Command) -> Result<Bytes> {
    let channel = registry.open_channel(ChannelKind::Session).await?;
    start_command(&channel, cmd).await?;

    let mut out = BytesMut::new();
    let mut exit_code = None;

    loop {
        match channel.recv().await {
            Some(ChannelMessage::Data(data)) => {
                append_checked(&mut out, &data, cmd.max_response_size)?;
            }
            Some(ChannelMessage::ExtendedData { ext_type: 1, data }) if cmd.merge_streams => {
                append_checked(&mut out, &data, cmd.max_response_size)?;
            }
            Some(ChannelMessage::ExtendedData { .. }) => {}
            Some(ChannelMessage::Request { name, payload, .. }) if name == "exit-status" => {
                exit_code = parse_exit_status(&payload);
            }
            Some(ChannelMessage::Request { .. }) => {}
            Some(ChannelMessage::Eof) | Some(ChannelMessage::Closed) | None => break,
        }
    }
    let _ = channel.close().await;

    match exit_code {
        Some(code) if code != 0 => Err(Error::CommandFailed { exit_code: code }),
        _ => Ok(out.freeze()),
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl Stream<Item = T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
}

async fn drain_tagged(channel: Arc<Channel>, tx: mpsc::Sender<Result<ExecChunk>>) {
    let mut exit_code = None;
    loop {
        match channel.recv().await {
            Some(ChannelMessage::Data(data)) => {
                if tx.send(Ok(ExecChunk::Stdout(data))).await.is_err() {
                    return;
                }
            }
            Some(ChannelMessage::ExtendedData { ext_type: 1, data }) => {
                if tx.send(Ok(ExecChunk::Stderr(data))).await.is_err() {
                    return;
                }
            }
            Some(ChannelMessage::ExtendedData { .. }) => {}
            Some(ChannelMessage::Request { name, payload, .. }) if name == "exit-status" => {
                exit_code = parse_exit_status(&payload);
            }
            Some(ChannelMessage::Request { .. }) => {}
            Some(ChannelMessage::Eof) | Some(ChannelMessage::Closed) | None => {
                let _ = channel.close().await;
                if let Some(code) = exit_code {
                    if code != 0 {
                        let _ = tx.send(Err(Error::CommandFailed { exit_code: code })).await;
                    }
                }
                return;
            }
        }
    }
}

/// Runs `cmd`, returning a finite stream of tagged stdout/stderr chunks.
/// The stream's last item is `Err(CommandFailed)` if the remote exit status
/// was nonzero; otherwise it simply ends.
pub async fn execute_command_stream(
    registry: &ChannelRegistry,
    cmd: &Command,
) -> Result<impl Stream<Item = Result<ExecChunk>>> {
    let channel = registry.open_channel(ChannelKind::Session).await?;
    start_command(&channel, cmd).await?;

    let channel = Arc::new(channel);
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(drain_tagged(channel, tx));
    Ok(receiver_stream(rx))
}

async fn drain_split(
    channel: Arc<Channel>,
    stdout_tx: mpsc::Sender<Result<Bytes>>,
    stderr_tx: mpsc::Sender<Result<Bytes>>,
) {
    let mut exit_code = None;
    loop {
        match channel.recv().await {
            Some(ChannelMessage::Data(data)) => {
                let _ = stdout_tx.send(Ok(data)).await;
            }
            Some(ChannelMessage::ExtendedData { ext_type: 1, data }) => {
                let _ = stderr_tx.send(Ok(data)).await;
            }
            Some(ChannelMessage::ExtendedData { .. }) => {}
            Some(ChannelMessage::Request { name, payload, .. }) if name == "exit-status" => {
                exit_code = parse_exit_status(&payload);
            }
            Some(ChannelMessage::Request { .. }) => {}
            Some(ChannelMessage::Eof) | Some(ChannelMessage::Closed) | None => {
                let _ = channel.close().await;
                if let Some(code) = exit_code {
                    if code != 0 {
                        let _ = stdout_tx.send(Err(Error::CommandFailed { exit_code: code })).await;
                        let _ = stderr_tx.send(Err(Error::CommandFailed { exit_code: code })).await;
                    }
                }
                return;
            }
        }
    }
}

/// Like [`execute_command_stream`], but stdout and stderr arrive as two
/// independently-polled streams instead of one tagged one.
pub async fn execute_command_pair(
    registry: &ChannelRegistry,
    cmd: &Command,
) -> Result<(impl Stream<Item = Result<Bytes>>, impl Stream<Item = Result<Bytes>>)> {
    let channel = registry.open_channel(ChannelKind::Session).await?;
    start_command(&channel, cmd).await?;

    let channel = Arc::new(channel);
    let (stdout_tx, stdout_rx) = mpsc::channel(64);
    let (stderr_tx, stderr_rx) = mpsc::channel(64);
    tokio::spawn(drain_split(channel, stdout_tx, stderr_tx));
    Ok((receiver_stream(stdout_rx), receiver_stream(stderr_rx)))
}

/// The inbound half of a [`with_pty`] session: a lazily-pulled stream of
/// tagged output chunks, ending once the channel reports EOF or close.
pub struct PtyInbound {
    channel: Arc<Channel>,
}

impl PtyInbound {
    pub async fn next(&self) -> Option<ExecChunk> {
        loop {
            match self.channel.recv().await {
                Some(ChannelMessage::Data(data)) => return Some(ExecChunk::Stdout(data)),
                Some(ChannelMessage::ExtendedData { ext_type: 1, data }) => {
                    return Some(ExecChunk::Stderr(data))
                }
                Some(ChannelMessage::ExtendedData { .. }) => continue,
                Some(ChannelMessage::Request { .. }) => continue,
                Some(ChannelMessage::Eof) | Some(ChannelMessage::Closed) | None => return None,
            }
        }
    }
}

/// The outbound half of a [`with_pty`] session.
pub struct PtyStdin {
    channel: Arc<Channel>,
}

impl PtyStdin {
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.channel.send_data(Bytes::copy_from_slice(data)).await
    }

    /// Sends `window-change`, best-effort (`want_reply = false`, mirroring
    /// OpenSSH's own client).
    pub async fn resize(&self, cols: u32, rows: u32, width_px: u32, height_px: u32) -> Result<()> {
        self.channel
            .send_request(
                "window-change",
                encode_window_change(cols, rows, width_px, height_px),
                false,
            )
            .await
    }
}

/// Opens a PTY and a shell on it, then hands the inbound stream and an
/// outbound writer to `handler`. The channel is closed once `handler`'s
/// future resolves.
pub async fn with_pty<F, Fut, T>(
    registry: &ChannelRegistry,
    pty: PtyRequest,
    env: &[(String, String)],
    handler: F,
) -> Result<T>
where
    F: FnOnce(PtyInbound, PtyStdin) -> Fut,
    Fut: Future<Output = T>,
{
    let channel = registry.open_channel(ChannelKind::Session).await?;
    send_env(&channel, env).await;
    channel
        .send_request("pty-req", encode_pty_req(&pty), true)
        .await?;
    channel.send_request("shell", Bytes::new(), true).await?;

    let channel = Arc::new(channel);
    let inbound = PtyInbound {
        channel: channel.clone(),
    };
    let stdin = PtyStdin {
        channel: channel.clone(),
    };

    let result = handler(inbound, stdin).await;
    let _ = channel.close().await;
    Ok(result)
}
