//! Client/server SFTP round trips over the in-memory paired transport.

mod common;
use common::paired;

use std::collections::HashMap;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio::sync::Mutex;

use ssh_session::channel::ChannelMessage;
use ssh_session::config::SessionConfig;
use ssh_session::session::Session;
use ssh_session::sftp::{DirHandle, FileHandle, OpenOptions, SftpAttributes, SftpFilesystem};

#[derive(Default)]
struct MemFile {
    data: Vec<u8>,
}

#[async_trait::async_trait]
impl FileHandle for MemFile {
    async fn read(&mut self, offset: u64, len: u32) -> ssh_session::error::Result<Option<bytes::Bytes>> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(None);
        }
        let end = (offset + len as usize).min(self.data.len());
        Ok(Some(bytes::Bytes::copy_from_slice(&self.data[offset..end])))
    }

    async fn write(&mut self, offset: u64, data: &[u8]) -> ssh_session::error::Result<()> {
        let offset = offset as usize;
        if self.data.len() < offset + data.len() {
            self.data.resize(offset + data.len(), 0);
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn attributes(&self) -> ssh_session::error::Result<SftpAttributes> {
        Ok(SftpAttributes::with_size(self.data.len() as u64))
    }
}

struct MemDir {
    entries: Vec<ssh_session::sftp::DirEntry>,
    served: bool,
}

#[async_trait::async_trait]
impl DirHandle for MemDir {
    async fn next_batch(&mut self) -> ssh_session::error::Result<Option<Vec<ssh_session::sftp::DirEntry>>> {
        if self.served {
            return Ok(None);
        }
        self.served = true;
        Ok(Some(std::mem::take(&mut self.entries)))
    }
}

/// A filesystem delegate backed by a single in-process `HashMap`, just
/// enough to exercise the server dispatcher end to end.
#[derive(Default)]
struct MemFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait::async_trait]
impl SftpFilesystem for MemFs {
    async fn open_file(
        &self,
        path: &str,
        _pflags: u32,
        _attrs: &SftpAttributes,
    ) -> ssh_session::error::Result<Box<dyn FileHandle>> {
        let data = self.files.lock().await.get(path).cloned().unwrap_or_default();
        Ok(Box::new(MemFile { data }))
    }

    async fn open_directory(&self, path: &str) -> ssh_session::error::Result<Box<dyn DirHandle>> {
        let names: Vec<_> = self
            .files
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(path))
            .map(|k| ssh_session::sftp::DirEntry {
                filename: k.clone(),
                longname: k.clone(),
                attrs: SftpAttributes::default(),
            })
            .collect();
        Ok(Box::new(MemDir {
            entries: names,
            served: false,
        }))
    }

    async fn real_path(&self, path: &str) -> ssh_session::error::Result<String> {
        Ok(path.to_string())
    }
}

async fn connected_pair() -> (Session, Session) {
    let (client_transport, server_transport) = paired();
    let server_fs: Arc<dyn SftpFilesystem> = Arc::new(MemFs::default());

    let server = Session::accept(
        server_transport,
        SessionConfig::default(),
        Arc::new(move |channel| {
            let fs = server_fs.clone();
            Box::pin(async move {
                loop {
                    match channel.recv().await {
                        Some(ChannelMessage::Request {
                            name, want_reply, ..
                        }) if name == "subsystem" => {
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

    let client = Session::connect(client_transport, SessionConfig::default());
    (client, server)
}

#[tokio::test]
async fn write_then_read_all_round_trips() {
    let (client, _server) = connected_pair().await;
    let sftp = client.open_sftp().await.expect("sftp handshake");

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&sftp, "/greeting")
        .await
        .expect("open for write");
    file.write_all(b"hello, sftp").await.expect("write");
    file.close().await.expect("close");

    let file = OpenOptions::new()
        .read(true)
        .open(&sftp, "/greeting")
        .await
        .expect("open for read");
    let contents = file.read_all().await.expect("read_all");
    assert_eq!(&contents[..], b"hello, sftp");
}

#[tokio::test]
async fn write_five_chunks_reads_back_five_thousand_bytes() {
    let (client, _server) = connected_pair().await;
    let sftp = client.open_sftp().await.expect("sftp handshake");

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&sftp, "/blocks")
        .await
        .expect("open for write");
    for value in 0u8..5 {
        file.write_all(&vec![value; 1000]).await.expect("write chunk");
    }
    file.close().await.expect("close");

    let file = OpenOptions::new()
        .read(true)
        .open(&sftp, "/blocks")
        .await
        .expect("open for read");
    let contents = file.read_all().await.expect("read_all");
    assert_eq!(contents.len(), 5000);
    for value in 0u8..5 {
        let start = value as usize * 1000;
        assert!(contents[start..start + 1000].iter().all(|&b| b == value));
    }
}

#[tokio::test]
async fn read_all_on_empty_file_is_empty_without_error() {
    let (client, _server) = connected_pair().await;
    let sftp = client.open_sftp().await.expect("sftp handshake");

    let file = OpenOptions::new()
        .read(true)
        .create(true)
        .open(&sftp, "/empty")
        .await
        .expect("open for read");
    let contents = file.read_all().await.expect("read_all");
    assert_eq!(contents.len(), 0);
}

#[tokio::test]
async fn realpath_is_idempotent() {
    let (client, _server) = connected_pair().await;
    let sftp = client.open_sftp().await.expect("sftp handshake");

    let once = sftp.realpath("/a/b").await.expect("realpath");
    let twice = sftp.realpath(&once).await.expect("realpath again");
    assert_eq!(once, twice);
}
