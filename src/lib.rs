//! Session-oriented services — interactive shells, command execution with
//! pseudo-terminals, SFTP, and TCP port forwarding — layered on a pluggable
//! SSH transport.
//!
//! This crate does not speak the SSH wire protocol itself: key exchange,
//! ciphers, MACs, and user authentication are the caller's responsibility,
//! supplied as an implementation of [`transport::Transport`]. Everything
//! above that boundary — channel multiplexing and flow control, the
//! exec/PTY surface, the SFTP client and server, and reverse/local port
//! forwarding — lives here.
//!
//! # Layout
//!
//! - [`channel`] allocates channel ids, tracks window/packet-size flow
//!   control, and dispatches inbound channel traffic.
//! - [`exec`] builds session channels and issues `exec`/`shell`/`pty-req`,
//!   splitting stdout/stderr and surfacing exit status.
//! - [`sftp`] drives the SFTP v3 protocol, both [`sftp::SftpClient`] (always
//!   available) and, behind the `sftp-server` feature,
//!   [`sftp::SftpServer`] answering against a pluggable
//!   [`sftp::SftpFilesystem`].
//! - [`forward`] opens `direct-tcpip` channels and negotiates
//!   `tcpip-forward`/`forwarded-tcpip` for the reverse direction.
//! - [`session`] is the façade: [`session::Session::connect`] and
//!   [`session::Session::accept`] tie a [`transport::Transport`] to all of
//!   the above and fire a disconnect callback exactly once.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(transport: std::sync::Arc<dyn ssh_session::transport::Transport>) -> ssh_session::error::Result<()> {
//! use ssh_session::{config::SessionConfig, exec::Command, session::Session};
//!
//! let session = Session::connect(transport, SessionConfig::default());
//! let output = session.execute_command(&Command::new("whoami")).await?;
//! println!("{}", String::from_utf8_lossy(&output));
//! # Ok(()) }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod channel;
pub mod config;
pub mod error;
pub mod exec;
pub mod forward;
pub mod session;
pub mod sftp;
pub mod transport;

mod wire;

pub use config::{AlgorithmPolicy, SessionBuilder, SessionConfig};
pub use error::{Error, Result};
pub use session::Session;
