//! Session-level lifecycle: exactly-once disconnect notification, and what
//! happens to requests already in flight when the transport goes away.

mod common;
use common::paired;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use ssh_session::channel::{ChannelKind, ChannelMessage};
use ssh_session::config::SessionConfig;
use ssh_session::error::Error;
use ssh_session::exec::Command;
use ssh_session::session::Session;
use ssh_session::sftp::{DirHandle, FileHandle, OpenOptions, SftpAttributes, SftpFilesystem};

#[tokio::test]
async fn disconnect_callback_fires_exactly_once() {
    let (transport, _peer) = paired();
    let session = Session::connect(transport.clone(), SessionConfig::default());

    let (fired_tx, fired_rx) = oneshot::channel();
    let fired_tx = StdMutex::new(Some(fired_tx));
    let count = Arc::new(AtomicUsize::new(0));
    let count_in_callback = count.clone();
    session.on_disconnect(move || {
        count_in_callback.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = fired_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });

    transport.sever();
    transport.sever();

    fired_rx.await.expect("callback should have fired");
    // Give the dispatch task a chance to process the second `Disconnected`
    // it already has queued, so a would-be second firing isn't missed.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(session.is_disconnected());
}

#[tokio::test]
async fn in_flight_exec_fails_with_connection_closed_on_disconnect() {
    let (client_transport, server_transport) = paired();

    let (saw_exec_tx, saw_exec_rx) = oneshot::channel();
    let saw_exec_tx = Arc::new(StdMutex::new(Some(saw_exec_tx)));

    let _server = Session::accept(
        server_transport,
        SessionConfig::default(),
        Arc::new(move |channel| {
            let saw_exec_tx = saw_exec_tx.clone();
            Box::pin(async move {
                // Acknowledge receipt of `exec`, but never reply to it, so
                // the client's request stays pending until it is torn down.
                loop {
                    match channel.recv().await {
                        Some(ChannelMessage::Request { name, .. }) if name == "exec" => {
                            if let Some(tx) = saw_exec_tx.lock().unwrap().take() {
                                let _ = tx.send(());
                            }
                            let _ = channel.recv().await;
                            return;
                        }
                        Some(_) => continue,
                        None => return,
                    }
                }
            })
        }),
    );

    let client = Session::connect(client_transport.clone(), SessionConfig::default());

    let exec_task = tokio::spawn(async move { client.execute_command(&Command::new("sleep 100")).await });

    saw_exec_rx.await.expect("peer should have observed the exec request");
    client_transport.sever();

    let result = exec_task.await.expect("exec task should not panic");
    assert!(
        matches!(result, Err(Error::ConnectionClosed)),
        "expected ConnectionClosed, got {result:?}"
    );
}

/// A file handle whose `read` never completes, standing in for a read that
/// is genuinely in flight when the connection drops.
struct BlockingFile {
    ready_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

#[async_trait::async_trait]
impl FileHandle for BlockingFile {
    async fn read(&mut self, _offset: u64, _len: u32) -> ssh_session::error::Result<Option<Bytes>> {
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        futures::future::pending::<()>().await;
        unreachable!("never resolves before the test ends the connection")
    }

    async fn write(&mut self, _offset: u64, _data: &[u8]) -> ssh_session::error::Result<()> {
        Ok(())
    }
}

struct MemDir {
    entries: Vec<ssh_session::sftp::DirEntry>,
}

#[async_trait::async_trait]
impl DirHandle for MemDir {
    async fn next_batch(&mut self) -> ssh_session::error::Result<Option<Vec<ssh_session::sftp::DirEntry>>> {
        Ok(Some(std::mem::take(&mut self.entries)))
    }
}

struct OneBlockingFileFs {
    ready_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

#[async_trait::async_trait]
impl SftpFilesystem for OneBlockingFileFs {
    async fn open_file(
        &self,
        _path: &str,
        _pflags: u32,
        _attrs: &SftpAttributes,
    ) -> ssh_session::error::Result<Box<dyn FileHandle>> {
        let ready_tx = self.ready_tx.lock().unwrap().take();
        Ok(Box::new(BlockingFile {
            ready_tx: StdMutex::new(ready_tx),
        }))
    }

    async fn open_directory(&self, _path: &str) -> ssh_session::error::Result<Box<dyn DirHandle>> {
        Ok(Box::new(MemDir { entries: Vec::new() }))
    }

    async fn real_path(&self, path: &str) -> ssh_session::error::Result<String> {
        Ok(path.to_string())
    }
}

#[tokio::test]
async fn pending_sftp_read_fails_with_connection_closed_on_disconnect() {
    let (client_transport, server_transport) = paired();

    let (ready_tx, ready_rx) = oneshot::channel();
    let fs: Arc<dyn SftpFilesystem> = Arc::new(OneBlockingFileFs {
        ready_tx: StdMutex::new(Some(ready_tx)),
    });

    let _server = Session::accept(
        server_transport,
        SessionConfig::default(),
        Arc::new(move |channel| {
            let fs = fs.clone();
            Box::pin(async move {
                loop {
                    match channel.recv().await {
                        Some(ChannelMessage::Request { name, want_reply, .. }) if name == "subsystem" => {
                            if want_reply {
                                let _ = channel.reply_to_request(true).await;
                            }
                            break;
                        }
                        Some(_) => continue,
                        None => return,
                    }
                }
                ssh_session::sftp::SftpServer::new(channel, fs).run().await.ok();
            })
        }),
    );

    let client = Session::connect(client_transport.clone(), SessionConfig::default());
    let sftp = client.open_sftp().await.expect("sftp handshake");

    let file = OpenOptions::new()
        .read(true)
        .open(&sftp, "/blocked")
        .await
        .expect("open for read");

    let read_task = tokio::spawn(async move { file.read(16).await });

    ready_rx.await.expect("server should have started the blocking read");
    client_transport.sever();

    let result = read_task.await.expect("read task should not panic");
    assert!(
        matches!(result, Err(Error::ConnectionClosed)),
        "expected ConnectionClosed, got {result:?}"
    );
}

/// Issuing a *new* operation on a channel after the connection has already
/// gone away must fail immediately instead of inserting a pending reply
/// nothing will ever resolve.
#[tokio::test]
async fn send_after_disconnect_fails_fast_instead_of_hanging() {
    let (client_transport, server_transport) = paired();

    let _server = Session::accept(
        server_transport,
        SessionConfig::default(),
        Arc::new(|channel| {
            Box::pin(async move {
                loop {
                    match channel.recv().await {
                        Some(_) => continue,
                        None => return,
                    }
                }
            })
        }),
    );

    let client = Session::connect(client_transport.clone(), SessionConfig::default());
    let channel = client
        .registry()
        .open_channel(ChannelKind::Session)
        .await
        .expect("open_channel");

    let (disc_tx, disc_rx) = oneshot::channel();
    let disc_tx = StdMutex::new(Some(disc_tx));
    client.on_disconnect(move || {
        if let Some(tx) = disc_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });

    client_transport.sever();
    disc_rx.await.expect("disconnect callback should fire");

    let send_data_result = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        channel.send_data(Bytes::from_static(b"late")),
    )
    .await
    .expect("send_data must not hang after disconnect");
    assert!(
        matches!(send_data_result, Err(Error::ConnectionClosed)),
        "expected ConnectionClosed, got {send_data_result:?}"
    );

    let send_request_result = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        channel.send_request("noop", Bytes::new(), true),
    )
    .await
    .expect("send_request must not hang after disconnect");
    assert!(
        matches!(send_request_result, Err(Error::ConnectionClosed)),
        "expected ConnectionClosed, got {send_request_result:?}"
    );
}

/// A channel-request whose awaiting future is dropped before the peer
/// replies (e.g. raced out of a `select!`) must not leave a dangling entry
/// in the request queue: a later request on the same channel must resolve
/// on its own ack, not hang behind a stale one nothing is still listening
/// for.
#[tokio::test]
async fn cancelled_channel_request_does_not_leak_its_queue_entry() {
    let (client_transport, server_transport) = paired();

    let (saw_first_tx, saw_first_rx) = oneshot::channel();
    let saw_first_tx = Arc::new(StdMutex::new(Some(saw_first_tx)));

    let _server = Session::accept(
        server_transport,
        SessionConfig::default(),
        Arc::new(move |channel| {
            let saw_first_tx = saw_first_tx.clone();
            Box::pin(async move {
                loop {
                    match channel.recv().await {
                        Some(ChannelMessage::Request { name, want_reply, .. }) => {
                            if name == "slow" {
                                if let Some(tx) = saw_first_tx.lock().unwrap().take() {
                                    let _ = tx.send(());
                                }
                                // Deliberately never ack: stands in for a
                                // reply that would have arrived too late to
                                // matter, since the local caller already
                                // cancelled its wait.
                                continue;
                            }
                            if want_reply {
                                let _ = channel.reply_to_request(true).await;
                            }
                        }
                        Some(_) => continue,
                        None => return,
                    }
                }
            })
        }),
    );

    let client = Session::connect(client_transport.clone(), SessionConfig::default());
    let channel = client
        .registry()
        .open_channel(ChannelKind::Session)
        .await
        .expect("open_channel");

    tokio::select! {
        result = channel.send_request("slow", Bytes::new(), true) => {
            panic!("slow request should have been cancelled, not resolved: {result:?}");
        }
        _ = async { let _ = saw_first_rx.await; } => {}
    }

    let second = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        channel.send_request("second", Bytes::new(), true),
    )
    .await
    .expect("second request must not hang behind the cancelled first one's stale queue entry");
    assert!(second.is_ok(), "expected Ok, got {second:?}");
}

/// A file handle that answers immediately, standing in for ordinary
/// (non-blocked) file I/O.
#[derive(Default)]
struct InstantFile {
    data: Vec<u8>,
}

#[async_trait::async_trait]
impl FileHandle for InstantFile {
    async fn read(&mut self, offset: u64, len: u32) -> ssh_session::error::Result<Option<Bytes>> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(None);
        }
        let end = (offset + len as usize).min(self.data.len());
        Ok(Some(Bytes::copy_from_slice(&self.data[offset..end])))
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> ssh_session::error::Result<()> {
        let offset = offset as usize;
        if self.data.len() < offset + data.len() {
            self.data.resize(offset + data.len(), 0);
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

struct InstantFs;

#[async_trait::async_trait]
impl SftpFilesystem for InstantFs {
    async fn open_file(
        &self,
        _path: &str,
        _pflags: u32,
        _attrs: &SftpAttributes,
    ) -> ssh_session::error::Result<Box<dyn FileHandle>> {
        Ok(Box::new(InstantFile::default()))
    }

    async fn open_directory(&self, _path: &str) -> ssh_session::error::Result<Box<dyn DirHandle>> {
        Ok(Box::new(MemDir { entries: Vec::new() }))
    }

    async fn real_path(&self, path: &str) -> ssh_session::error::Result<String> {
        Ok(path.to_string())
    }
}

/// A handle that is still open but whose underlying connection has died
/// must fail subsequent operations with `FileHandleInvalid`, without
/// hanging and without a network round trip, per the SFTP layer's liveness
/// contract.
#[tokio::test]
async fn sftp_operation_on_stale_handle_fails_with_file_handle_invalid() {
    let (client_transport, server_transport) = paired();

    let fs: Arc<dyn SftpFilesystem> = Arc::new(InstantFs);
    let _server = Session::accept(
        server_transport,
        SessionConfig::default(),
        Arc::new(move |channel| {
            let fs = fs.clone();
            Box::pin(async move {
                loop {
                    match channel.recv().await {
                        Some(ChannelMessage::Request { name, want_reply, .. }) if name == "subsystem" => {
                            if want_reply {
                                let _ = channel.reply_to_request(true).await;
                            }
                            break;
                        }
                        Some(_) => continue,
                        None => return,
                    }
                }
                ssh_session::sftp::SftpServer::new(channel, fs).run().await.ok();
            })
        }),
    );

    let client = Session::connect(client_transport.clone(), SessionConfig::default());
    let sftp = client.open_sftp().await.expect("sftp handshake");

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&sftp, "/late")
        .await
        .expect("open for write");

    let (disc_tx, disc_rx) = oneshot::channel();
    let disc_tx = StdMutex::new(Some(disc_tx));
    client.on_disconnect(move || {
        if let Some(tx) = disc_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });

    client_transport.sever();
    disc_rx.await.expect("disconnect callback should fire");
    // `on_disconnect` fires after `ChannelRegistry::fail_all` has already run
    // and pushed `ChannelMessage::Closed` onto the sftp channel's inbound
    // queue; give the sftp client's own reader task, a separate tokio task,
    // a couple of scheduling turns to drain it and flip its liveness flag.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let result = tokio::time::timeout(std::time::Duration::from_secs(2), file.write_all(b"late"))
        .await
        .expect("write_all must not hang once the connection is known dead");
    assert!(
        matches!(result, Err(Error::FileHandleInvalid)),
        "expected FileHandleInvalid, got {result:?}"
    );
}
