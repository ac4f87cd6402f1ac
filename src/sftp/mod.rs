//! SFTP: the SSH File Transfer Protocol (version 3) run over one channel's
//! `sftp` subsystem request.
//!
//! [`client`] drives the protocol from the requesting side; [`server`]
//! answers it from the serving side against a pluggable [`server::SftpFilesystem`].

mod attrs;
mod client;
mod file;
pub mod protocol;
#[cfg(feature = "sftp-server")]
mod server;

pub use attrs::SftpAttributes;
pub use client::{DirEntry, SftpClient};
pub use file::{OpenOptions, SftpFile};
pub use protocol::StatusCode;
#[cfg(feature = "sftp-server")]
pub use server::{DirHandle, FileHandle, SftpFilesystem, SftpServer};
