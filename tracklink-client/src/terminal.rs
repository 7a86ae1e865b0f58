//! Simulated terminal connection.

use crate::ack::Ack;
use crate::error::ClientError;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracklink_protocol::gt06::{self, types};
use tracklink_protocol::{AlarmReport, FrameBuilder, LocationFix, StatusReport};

/// Terminal configuration.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Hardware identity as 16 hex characters.
    pub device_id: String,
    /// Model code sent after the identity at login.
    pub model_code: Option<u16>,
    pub connect_timeout: Duration,
    /// How long to wait for each acknowledgment.
    pub ack_timeout: Duration,
}

impl TerminalConfig {
    pub fn new(addr: SocketAddr, device_id: impl Into<String>) -> Self {
        Self {
            addr,
            device_id: device_id.into(),
            model_code: None,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_model_code(mut self, model_code: u16) -> Self {
        self.model_code = Some(model_code);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

/// A tracking terminal talking to a tracklink server.
pub struct Terminal<S = TcpStream> {
    stream: S,
    config: TerminalConfig,
    buffer: BytesMut,
    next_serial: u16,
}

impl Terminal<TcpStream> {
    /// Opens a TCP connection to the configured server.
    pub async fn connect(config: TerminalConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, config))
    }
}

impl<S> Terminal<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already connected stream.
    pub fn from_stream(stream: S, config: TerminalConfig) -> Self {
        Self {
            stream,
            config,
            buffer: BytesMut::with_capacity(64),
            next_serial: 1,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Serial number the next frame will carry.
    pub fn next_serial(&self) -> u16 {
        self.next_serial
    }

    /// Logs in and waits for the server's verdict.
    pub async fn login(&mut self) -> Result<Ack, ClientError> {
        let info = gt06::encode_login_info(&self.config.device_id, self.config.model_code)?;
        self.send_frame(types::LOGIN, &info).await?;

        let ack = self.read_ack().await?;
        match ack.type_code {
            types::LOGIN => {
                tracing::debug!("Logged in as {}", self.config.device_id);
                Ok(ack)
            }
            types::LOGIN_REJECT => Err(ClientError::LoginRejected {
                device_id: self.config.device_id.clone(),
            }),
            actual => Err(ClientError::UnexpectedAck {
                expected: types::LOGIN,
                actual,
            }),
        }
    }

    /// Sends a location fix and waits for its acknowledgment.
    pub async fn send_location(&mut self, fix: &LocationFix) -> Result<Ack, ClientError> {
        self.send_frame(types::LOCATION, &gt06::encode_location_info(fix))
            .await?;
        self.expect_ack(types::LOCATION).await
    }

    /// Sends an alarm; the server acknowledges it like a location.
    pub async fn send_alarm(&mut self, report: &AlarmReport) -> Result<Ack, ClientError> {
        self.send_frame(types::ALARM, &gt06::encode_alarm_info(report))
            .await?;
        self.expect_ack(types::LOCATION).await
    }

    pub async fn heartbeat(&mut self, status: &StatusReport) -> Result<Ack, ClientError> {
        self.send_frame(types::HEARTBEAT, &gt06::encode_status_info(status))
            .await?;
        self.expect_ack(types::HEARTBEAT).await
    }

    /// Sends a status report. The server does not acknowledge these.
    pub async fn send_status(&mut self, status: &StatusReport) -> Result<u16, ClientError> {
        self.send_frame(types::STATUS, &gt06::encode_status_info(status))
            .await
    }

    /// Sends one frame and returns the serial it used.
    pub async fn send_frame(&mut self, type_code: u8, info: &[u8]) -> Result<u16, ClientError> {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);

        let frame = FrameBuilder::new(type_code)
            .info(info)
            .serial(serial)
            .encode()?;
        tracing::trace!("Sending type {:#04x} serial {} ({} bytes)", type_code, serial, frame.len());
        self.send_raw(&frame).await?;
        Ok(serial)
    }

    /// Writes bytes as-is, for malformed or hand-built traffic.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next acknowledgment.
    pub async fn read_ack(&mut self) -> Result<Ack, ClientError> {
        let timeout = self.config.ack_timeout;
        tokio::time::timeout(timeout, self.read_ack_inner())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn read_ack_inner(&mut self) -> Result<Ack, ClientError> {
        loop {
            if let Some(ack) = Ack::parse(&self.buffer)? {
                self.buffer.advance(crate::ack::ACK_LEN);
                return Ok(ack);
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    async fn expect_ack(&mut self, expected: u8) -> Result<Ack, ClientError> {
        let ack = self.read_ack().await?;
        if ack.type_code != expected {
            return Err(ClientError::UnexpectedAck {
                expected,
                actual: ack.type_code,
            });
        }
        Ok(ack)
    }

    /// Shuts down the write side of the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;
    use tracklink_core::DeviceRegistry;
    use tracklink_protocol::{
        AckChecksum, AckKind, Gt06Codec, ProtocolRegistry, TerminalInfo,
    };
    use tracklink_server::{ChannelQueue, JobKind, MessageHandler, Server, ServerConfig};

    const DEVICE: &str = "0123456789abcdef";

    fn config() -> TerminalConfig {
        TerminalConfig::new("127.0.0.1:5023".parse().unwrap(), DEVICE)
            .with_ack_timeout(Duration::from_secs(2))
    }

    fn frame(type_code: u8, info: &[u8], serial: u16) -> Vec<u8> {
        gt06::encode_frame(type_code, info, serial).unwrap().to_vec()
    }

    fn ack(kind: AckKind, serial: u16) -> Vec<u8> {
        gt06::encode_ack(kind, serial, AckChecksum::Computed).to_vec()
    }

    fn status() -> StatusReport {
        StatusReport {
            terminal: TerminalInfo::from_byte(0x44),
            voltage_level: Some(4),
            gsm_signal: Some(4),
            alarm_code: Some(0),
            language: Some(2),
        }
    }

    fn fix() -> LocationFix {
        LocationFix {
            fix_time: Some(Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap()),
            gps_info_len: 12,
            satellites: 7,
            latitude: 48.8566,
            longitude: 2.3522,
            speed_kmh: 0,
            heading: 0,
            positioned: true,
            valid: true,
            cell: None,
        }
    }

    #[tokio::test]
    async fn test_login_writes_frame_and_reads_ack() {
        let login_info = gt06::encode_login_info(DEVICE, None).unwrap();
        let mock = Builder::new()
            .write(&frame(types::LOGIN, &login_info, 1))
            .read(&ack(AckKind::LoginAccepted, 1))
            .build();

        let mut terminal = Terminal::from_stream(mock, config());
        let ack = terminal.login().await.unwrap();
        assert_eq!(ack.serial, 1);
        assert_eq!(terminal.next_serial(), 2);
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let login_info = gt06::encode_login_info(DEVICE, None).unwrap();
        let mock = Builder::new()
            .write(&frame(types::LOGIN, &login_info, 1))
            .read(&ack(AckKind::LoginRejected, 1))
            .build();

        let mut terminal = Terminal::from_stream(mock, config());
        assert!(matches!(
            terminal.login().await,
            Err(ClientError::LoginRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_ack_split_across_reads() {
        let status = status();
        let ack_bytes = ack(AckKind::Heartbeat, 1);
        let mock = Builder::new()
            .write(&frame(types::HEARTBEAT, &gt06::encode_status_info(&status), 1))
            .read(&ack_bytes[..3])
            .read(&ack_bytes[3..])
            .build();

        let mut terminal = Terminal::from_stream(mock, config());
        assert_eq!(terminal.heartbeat(&status).await.unwrap().type_code, types::HEARTBEAT);
    }

    #[tokio::test]
    async fn test_unexpected_ack() {
        let status = status();
        let mock = Builder::new()
            .write(&frame(types::HEARTBEAT, &gt06::encode_status_info(&status), 1))
            .read(&ack(AckKind::Location, 1))
            .build();

        let mut terminal = Terminal::from_stream(mock, config());
        assert!(matches!(
            terminal.heartbeat(&status).await,
            Err(ClientError::UnexpectedAck {
                expected: 0x13,
                actual: 0x12
            })
        ));
    }

    #[tokio::test]
    async fn test_connection_closed_while_waiting() {
        let status = status();
        let mock = Builder::new()
            .write(&frame(types::STATUS, &gt06::encode_status_info(&status), 1))
            .build();

        let mut terminal = Terminal::from_stream(mock, config());
        assert_eq!(terminal.send_status(&status).await.unwrap(), 1);
        assert!(matches!(
            terminal.read_ack().await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_device_id() {
        let mock = Builder::new().build();
        let config = TerminalConfig::new("127.0.0.1:5023".parse().unwrap(), "not-hex");
        let mut terminal = Terminal::from_stream(mock, config);
        assert!(matches!(
            terminal.login().await,
            Err(ClientError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(socket);
        });

        let config = TerminalConfig::new(addr, DEVICE)
            .with_connect_timeout(Duration::from_secs(1))
            .with_ack_timeout(Duration::from_millis(50));
        let mut terminal = Terminal::connect(config).await.unwrap();
        assert!(matches!(terminal.login().await, Err(ClientError::Timeout)));
        silent.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_against_server() {
        let devices = Arc::new(DeviceRegistry::new());
        let (queue, mut jobs) = ChannelQueue::bounded(8);
        let handler = MessageHandler::new(devices.clone()).with_queue(Arc::new(queue));
        let protocols = Arc::new(ProtocolRegistry::with_defaults(Gt06Codec::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(
            ServerConfig::new(addr),
            protocols,
            Arc::new(handler),
        ));
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        let config = TerminalConfig::new(addr, DEVICE).with_ack_timeout(Duration::from_secs(2));
        let mut terminal = Terminal::connect(config).await.unwrap();
        terminal.login().await.unwrap();
        terminal.heartbeat(&status()).await.unwrap();
        let ack = terminal.send_location(&fix()).await.unwrap();
        assert_eq!(ack.serial, 3);

        let job = jobs.recv().await.unwrap();
        assert_eq!(job.kind, JobKind::Location);
        assert_eq!(job.device_id, DEVICE);
        assert!(devices.get(DEVICE).unwrap().last_heartbeat.is_some());

        terminal.close().await.unwrap();
        server.shutdown();
    }
}
