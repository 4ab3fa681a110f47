//! LinkBone telnet client against a local fake switch.

use ppms_daq::error::DaqError;
use ppms_daq::hardware::linkbone::GREETING;
use ppms_daq::hardware::{LinkBoneOptions, LinkBoneSwitch};
use ppms_daq::instrument::RelaySwitch;
use ppms_daq::topology::SwitchPort;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const STATUS_REPLY: &str = "Relay a: open\r\nRelay p: closed\r\n";

/// Accept one session, greet, and forward every received command.
///
/// Commands end with `\n` or a bare `\r`; the raw bytes are kept as well.
async fn fake_switch(
    greet: bool,
) -> (String, mpsc::UnboundedReceiver<String>, Arc<Mutex<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let raw = Arc::new(Mutex::new(Vec::new()));
    let received = raw.clone();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (mut read, mut write) = socket.into_split();
        if greet {
            write
                .write_all(format!("Welcome\r\n{}", GREETING).as_bytes())
                .await
                .unwrap();
        }
        let mut line = Vec::new();
        let mut byte = [0_u8; 1];
        while let Ok(1) = read.read(&mut byte).await {
            received.lock().unwrap().push(byte[0]);
            if byte[0] != b'\n' && byte[0] != b'\r' {
                line.push(byte[0]);
                continue;
            }
            if line.is_empty() {
                continue;
            }
            let command = String::from_utf8_lossy(&line).trim().to_string();
            line.clear();
            let reply = match command.as_str() {
                "ping" => "Pong.\r\n",
                "status" | "info" | "help" => STATUS_REPLY,
                _ => "OK\r\n",
            };
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
            if tx.send(command).is_err() {
                break;
            }
        }
    });

    (address, rx, raw)
}

fn options(keepalive: Option<Duration>) -> LinkBoneOptions {
    LinkBoneOptions {
        connect_timeout: Duration::from_secs(2),
        reply_timeout: Duration::from_millis(500),
        command_settle: Duration::from_millis(20),
        keepalive,
    }
}

#[tokio::test]
async fn commands_are_sent_as_lines() {
    let (address, mut rx, _) = fake_switch(true).await;
    let mut switch = LinkBoneSwitch::connect(&address, options(None))
        .await
        .unwrap();
    assert_eq!(switch.address(), address);

    let a = SwitchPort::new('a').unwrap();
    let p = SwitchPort::new('p').unwrap();
    switch.connect(a, p).await.unwrap();
    switch.reset().await.unwrap();

    assert_eq!(rx.recv().await.unwrap(), "on a,p");
    assert_eq!(rx.recv().await.unwrap(), "reset");
    switch.close().await.unwrap();
}

#[tokio::test]
async fn keepalive_pings_the_switch() {
    let (address, mut rx, _) = fake_switch(true).await;
    let mut switch = LinkBoneSwitch::connect(&address, options(Some(Duration::from_millis(50))))
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, "ping");

    // Commands still go through between pings.
    switch.reset().await.unwrap();
    let mut seen_reset = false;
    while let Ok(Some(line)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        if line == "reset" {
            seen_reset = true;
            break;
        }
        assert_eq!(line, "ping");
    }
    assert!(seen_reset);
    switch.close().await.unwrap();
}

#[tokio::test]
async fn status_query_uses_carriage_return() {
    let (address, mut rx, raw) = fake_switch(true).await;
    let mut switch = LinkBoneSwitch::connect(&address, options(None))
        .await
        .unwrap();

    let reply = switch.status().await.unwrap();
    assert_eq!(reply, STATUS_REPLY);
    assert_eq!(rx.recv().await.unwrap(), "status");
    assert!(raw.lock().unwrap().ends_with(b"status\r"));

    let reply = switch.info().await.unwrap();
    assert!(reply.contains("Relay p: closed"));
    assert_eq!(rx.recv().await.unwrap(), "info");
    switch.close().await.unwrap();
}

#[tokio::test]
async fn missing_greeting_is_an_io_error() {
    let (address, _rx, _) = fake_switch(false).await;
    let err = LinkBoneSwitch::connect(&address, options(None))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DaqError::InstrumentIo { .. }));
    assert!(err.to_string().contains("no greeting"));
}

#[tokio::test]
async fn refused_connection_is_an_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = LinkBoneSwitch::connect(&address, options(None))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DaqError::InstrumentIo { .. }));
}
