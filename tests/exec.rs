//! Exec/PTY scenarios driven against a hand-written in-memory "remote
//! shell" that answers `exec` channel-requests the way a real `sshd` would.

mod common;
use common::paired;

use bytes::{BufMut, Bytes, BytesMut};
use pretty_assertions::assert_eq;

use ssh_session::channel::{Channel, ChannelMessage};
use ssh_session::config::SessionConfig;
use ssh_session::error::Error;
use ssh_session::exec::Command;
use ssh_session::session::Session;

fn exit_status_payload(code: u32) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32(code);
    buf.freeze()
}

/// Waits for `exec`, runs a scripted response (`stdout`, then `exit_code`),
/// and closes the channel — standing in for a remote shell.
async fn serve_one_exec(channel: Channel, stdout: &'static [u8], exit_code: u32) {
    loop {
        match channel.recv().await {
            Some(ChannelMessage::Request {
                name, want_reply, ..
            }) if name == "exec" => {
                if want_reply {
                    let _ = channel.reply_to_request(true).await;
                }
                break;
            }
            Some(ChannelMessage::Request {
                name, want_reply, ..
            }) if name == "env" => {
                if want_reply {
                    let _ = channel.reply_to_request(true).await;
                }
            }
            Some(_) => continue,
            None => return,
        }
    }

    if !stdout.is_empty() {
        let _ = channel.send_data(Bytes::from_static(stdout)).await;
    }
    let _ = channel
        .send_request("exit-status", exit_status_payload(exit_code), false)
        .await;
    let _ = channel.close().await;
}

fn server_session(
    transport: std::sync::Arc<common::PairedTransport>,
    stdout: &'static [u8],
    exit_code: u32,
) -> Session {
    Session::accept(
        transport,
        SessionConfig::default(),
        std::sync::Arc::new(move |channel| Box::pin(serve_one_exec(channel, stdout, exit_code))),
    )
}

#[tokio::test]
async fn echo_returns_exact_stdout() {
    let (client_transport, server_transport) = paired();
    let _server = server_session(server_transport, b"a\n", 0);
    let client = Session::connect(client_transport, SessionConfig::default());

    let output = client
        .execute_command(&Command::new("echo a"))
        .await
        .expect("command should succeed");
    assert_eq!(&output[..], b"a\n");
}

#[tokio::test]
async fn nonzero_exit_status_surfaces_as_command_failed() {
    let (client_transport, server_transport) = paired();
    let _server = server_session(server_transport, b"", 1);
    let client = Session::connect(client_transport, SessionConfig::default());

    let err = client
        .execute_command(&Command::new("false"))
        .await
        .expect_err("nonzero exit should fail");
    assert!(matches!(err, Error::CommandFailed { exit_code: 1 }));
}

#[tokio::test]
async fn output_too_large_is_rejected_before_the_overflowing_byte() {
    let (client_transport, server_transport) = paired();
    let _server = server_session(server_transport, b"abcdef", 0);
    let client = Session::connect(client_transport, SessionConfig::default());

    let mut cmd = Command::new("print-six-bytes");
    cmd.max_response_size(5);

    let err = client
        .execute_command(&cmd)
        .await
        .expect_err("output over the limit should fail");
    assert!(matches!(err, Error::OutputTooLarge));
}
