//! LinkBone relay matrix switch over telnet.
//!
//! The switch speaks a plain line protocol on TCP port 23. After connecting it
//! sends `Hello. Please enter your command:`; commands are text lines such as
//! `on a,b` or `reset`, answered with free-form text that is only logged. The
//! switch drops idle sessions, so a background task sends `ping` on a timer
//! and waits for `Pong.`.
//!
//! ## Configuration
//!
//! ```toml
//! [switch]
//! address = "192.168.0.8"
//! keepalive = "30s"
//! ```

use crate::error::{AppResult, DaqError};
use crate::instrument::RelaySwitch;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Text the switch sends once a session is open.
pub const GREETING: &str = "Hello. Please enter your command:";

const TELNET_PORT: u16 = 23;
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Timing parameters for a [`LinkBoneSwitch`] session.
#[derive(Debug, Clone)]
pub struct LinkBoneOptions {
    /// Limit for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Limit for the greeting and for each `Pong.`.
    pub reply_timeout: Duration,
    /// Pause after a command before its reply is drained.
    pub command_settle: Duration,
    /// Keep-alive period, `None` to disable pinging.
    pub keepalive: Option<Duration>,
}

impl Default for LinkBoneOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(5),
            command_settle: Duration::from_millis(100),
            keepalive: Some(Duration::from_secs(30)),
        }
    }
}

/// Telnet client for a LinkBone XLR/BNC switch.
pub struct LinkBoneSwitch {
    address: String,
    stream: Arc<Mutex<TcpStream>>,
    options: LinkBoneOptions,
    keepalive: Option<JoinHandle<()>>,
}

impl LinkBoneSwitch {
    /// Open a session, consume the greeting and start the keep-alive task.
    ///
    /// `address` is `host` or `host:port`; the telnet port is assumed when
    /// none is given.
    pub async fn connect(address: &str, options: LinkBoneOptions) -> AppResult<Self> {
        let address = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, TELNET_PORT)
        };

        let mut stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| DaqError::io(&address, "connection timed out"))?
            .map_err(|e| DaqError::io(&address, format!("cannot connect: {}", e)))?;

        read_until(&mut stream, GREETING, options.reply_timeout)
            .await
            .map_err(|e| DaqError::io(&address, format!("no greeting: {}", e)))?;
        info!("Telnet connection to LinkBone at {} established", address);

        let stream = Arc::new(Mutex::new(stream));
        let keepalive = options
            .keepalive
            .map(|period| spawn_keepalive(stream.clone(), address.clone(), period, options.reply_timeout));

        Ok(Self {
            address,
            stream,
            options,
            keepalive,
        })
    }

    /// Resolved `host:port` of the switch.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Query the relay state.
    pub async fn status(&mut self) -> AppResult<String> {
        self.informational("status").await
    }

    /// Query the device description.
    pub async fn info(&mut self) -> AppResult<String> {
        self.informational("info").await
    }

    /// Query the list of supported commands.
    pub async fn help(&mut self) -> AppResult<String> {
        self.informational("help").await
    }

    // Informational commands are terminated with a bare carriage return and
    // produce multi-line output that takes up to a second to arrive.
    async fn informational(&mut self, command: &str) -> AppResult<String> {
        let mut stream = self.stream.lock().await;
        stream
            .write_all(format!("{}\r", command).as_bytes())
            .await
            .map_err(|e| DaqError::io(&self.address, format!("write '{}' failed: {}", command, e)))?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let reply = drain(&mut *stream)
            .await
            .map_err(|e| DaqError::io(&self.address, format!("read failed: {}", e)))?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Stop the keep-alive task and shut the connection down.
    pub async fn close(&mut self) -> AppResult<()> {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        self.stream
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| DaqError::io(&self.address, format!("shutdown failed: {}", e)))
    }
}

impl Drop for LinkBoneSwitch {
    fn drop(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl RelaySwitch for LinkBoneSwitch {
    async fn send_command(&mut self, command: &str) -> AppResult<()> {
        let mut stream = self.stream.lock().await;
        stream
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| DaqError::io(&self.address, format!("write '{}' failed: {}", command, e)))?;
        tokio::time::sleep(self.options.command_settle).await;
        let reply = drain(&mut *stream)
            .await
            .map_err(|e| DaqError::io(&self.address, format!("read failed: {}", e)))?;
        debug!(
            command,
            reply = %String::from_utf8_lossy(&reply).trim(),
            "LinkBone command"
        );
        Ok(())
    }
}

fn spawn_keepalive(
    stream: Arc<Mutex<TcpStream>>,
    address: String,
    period: Duration,
    reply_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            let mut stream = stream.lock().await;
            if let Err(e) = stream.write_all(b"ping\n").await {
                warn!("LinkBone keep-alive to {} stopped: {}", address, e);
                return;
            }
            if let Err(e) = read_until(&mut *stream, "Pong.", reply_timeout).await {
                warn!("LinkBone keep-alive to {} stopped: {}", address, e);
                return;
            }
        }
    })
}

/// Read until the accumulated bytes end with `marker`.
async fn read_until<T: AsyncRead + Unpin>(
    stream: &mut T,
    marker: &str,
    limit: Duration,
) -> std::io::Result<Vec<u8>> {
    let marker = marker.as_bytes();
    let fut = async {
        let mut received = Vec::new();
        let mut byte = [0_u8; 1];
        while !received.ends_with(marker) {
            if stream.read(&mut byte).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ));
            }
            received.push(byte[0]);
        }
        Ok(received)
    };
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"))?
}

/// Read whatever has already arrived, without waiting for more.
async fn drain<T: AsyncRead + Unpin>(stream: &mut T) -> std::io::Result<Vec<u8>> {
    let mut received = Vec::new();
    let mut buf = [0_u8; 1024];
    loop {
        match tokio::time::timeout(DRAIN_POLL, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => return Ok(received),
            Ok(Ok(n)) => received.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => return Err(e),
        }
    }
}
