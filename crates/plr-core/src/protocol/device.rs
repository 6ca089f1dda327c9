//! Device session
//!
//! Owns the transport halves: a reader task that feeds inbound chunks
//! through the frame assembler into the correlator, and a writer task
//! that drains a queue of outbound command frames. Each device command
//! is one method.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    checksum::ChecksumEngine,
    commands::{Command, Reply},
    correlator::{Correlator, ReplyHandle, RequestId},
    payload::{DeviceInfo, ExchangeData},
    serial::open_port,
    stream::{FrameAssembler, PlrCodec},
    ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_PUSH_CAPACITY, DEFAULT_TIMEOUT_MS, READ_CHUNK_SIZE,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, or the device closed the link
    Disconnected,
    /// Connected and ready
    Connected,
    /// Transport failed
    Error,
}

/// Device session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial port bound to the device (e.g. "/dev/rfcomm0")
    pub port_name: String,
    /// Baud rate (ignored by most RFCOMM ttys)
    pub baud_rate: u32,
    /// Per-request reply deadline; `None` waits forever
    pub reply_timeout_ms: Option<u64>,
    /// Reject inbound frames with a bad checksum
    pub verify_checksums: bool,
    /// How many pushes a slow subscriber may lag before it misses some
    pub push_channel_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            reply_timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            verify_checksums: true,
            push_channel_capacity: DEFAULT_PUSH_CAPACITY,
        }
    }
}

impl DeviceConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))
    }

    /// Load a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_ms.map(Duration::from_millis)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic elsewhere must not wedge the session
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A frame queued for the writer task
struct Outbound {
    id: RequestId,
    command: Command,
    frame: Vec<u8>,
}

/// A session with one PLR device
pub struct Device {
    correlator: Arc<Mutex<Correlator>>,
    /// Frames reach the wire in the order they were queued here
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    config: DeviceConfig,
}

impl Device {
    /// Open the configured serial port and start the session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: DeviceConfig) -> Result<Self, ProtocolError> {
        if config.port_name.is_empty() {
            return Err(ProtocolError::Config("no port configured".to_string()));
        }
        let port = open_port(&config.port_name, Some(config.baud_rate))?;
        tracing::info!("connected to {}", config.port_name);
        Ok(Self::from_transport(port, config))
    }

    /// Start a session over an already-open duplex byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_transport<T>(transport: T, config: DeviceConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);

        let checksums = Arc::new(ChecksumEngine::new());
        let correlator = Arc::new(Mutex::new(Correlator::new(
            checksums.clone(),
            config.push_channel_capacity,
        )));
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let state_tx = Arc::new(state_tx);

        let assembler = FrameAssembler::new(PlrCodec::new(checksums, config.verify_checksums));
        let reader = tokio::spawn(read_loop(
            read_half,
            assembler,
            correlator.clone(),
            state_tx.clone(),
        ));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            correlator.clone(),
            state_tx.clone(),
        ));

        Self {
            correlator,
            outbound: Mutex::new(Some(outbound_tx)),
            state_tx,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            config,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Configuration the session was started with
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Observe every measurement the device pushes
    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeData> {
        lock(&self.correlator).subscribe()
    }

    /// Wait for the next measurement push (e.g. the user pressing the button)
    pub async fn wait_for_next_measurement(&self) -> Result<ExchangeData, ProtocolError> {
        let handle = lock(&self.correlator).wait_for_next_measurement();
        handle.wait().await
    }

    /// Device name
    pub async fn name(&self) -> Result<String, ProtocolError> {
        match self.request(Command::Name).await? {
            Reply::Text(name) => Ok(name),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Device identification record
    pub async fn info(&self) -> Result<DeviceInfo, ProtocolError> {
        match self.request(Command::Info).await? {
            Reply::Info(info) => Ok(info),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Trigger a measurement; distance in millimetres
    pub async fn measure(&self) -> Result<f64, ProtocolError> {
        match self.request(Command::Measure).await? {
            Reply::Distance(distance) => Ok(distance),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Switch the laser on
    pub async fn laser_on(&self) -> Result<(), ProtocolError> {
        self.acknowledge(Command::LaserOn).await
    }

    /// Switch the laser off
    pub async fn laser_off(&self) -> Result<(), ProtocolError> {
        self.acknowledge(Command::LaserOff).await
    }

    /// Switch the display backlight on
    pub async fn backlight_on(&self) -> Result<(), ProtocolError> {
        self.acknowledge(Command::BacklightOn).await
    }

    /// Switch the display backlight off
    pub async fn backlight_off(&self) -> Result<(), ProtocolError> {
        self.acknowledge(Command::BacklightOff).await
    }

    /// Enable measurement pushes; returns the current exchange data
    pub async fn begin_receive(&self) -> Result<ExchangeData, ProtocolError> {
        match self.request(Command::BeginReceive).await? {
            Reply::Exchange(data) => Ok(data),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    async fn acknowledge(&self, command: Command) -> Result<(), ProtocolError> {
        match self.request(command).await? {
            Reply::Ack => Ok(()),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Send a command and wait for its reply.
    ///
    /// Dropping the future leaves the request queued: its frame is still
    /// written whole and its reply is consumed when it arrives.
    pub async fn request(&self, command: Command) -> Result<Reply, ProtocolError> {
        let handle = self.submit(command)?;

        let Some(timeout) = self.config.reply_timeout() else {
            return handle.wait().await;
        };

        let id = handle.id();
        match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "{:?} got no reply within {}ms",
                    command,
                    timeout.as_millis()
                );
                lock(&self.correlator).expire(id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Queue a command frame for writing without waiting for the reply
    pub fn submit(&self, command: Command) -> Result<ReplyHandle, ProtocolError> {
        let outbound = lock(&self.outbound);
        let tx = outbound.as_ref().ok_or(ProtocolError::NotConnected)?;

        // Enqueue and hand over under one lock so queue order is wire order
        let mut correlator = lock(&self.correlator);
        let submission = correlator.submit_command(command)?;
        let id = submission.handle.id();

        let queued = tx.send(Outbound {
            id,
            command,
            frame: submission.frame,
        });
        if queued.is_err() {
            correlator.fail(id, ProtocolError::Disconnected);
            return Err(ProtocolError::Disconnected);
        }
        Ok(submission.handle)
    }

    /// Close the session; everything outstanding resolves with `Disconnected`.
    ///
    /// Frames already queued are still written before the transport is shut
    /// down, for at most one reply timeout.
    pub async fn disconnect(&self) {
        lock(&self.outbound).take();
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        lock(&self.correlator).abandon_all();
        self.state_tx.send_replace(ConnectionState::Disconnected);

        let writer = lock(&self.writer).take();
        if let Some(mut writer) = writer {
            let grace = self
                .config
                .reply_timeout()
                .unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS));
            if tokio::time::timeout(grace, &mut writer).await.is_err() {
                tracing::debug!("writer still busy after {:?}, aborting", grace);
                writer.abort();
            }
        }
        tracing::info!("disconnected");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for task in [lock(&self.reader).take(), lock(&self.writer).take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Write queued frames in order until the session closes the queue
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    correlator: Arc<Mutex<Correlator>>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        tracing::trace!("tx {:?}: {:02x?}", item.command, item.frame);

        if let Err(e) = write_frame(&mut writer, &item.frame).await {
            tracing::warn!("write of {:?} failed: {}", item.command, e);
            let mut correlator = lock(&correlator);
            correlator.fail(item.id, e.into());
            correlator.abandon_all();
            state.send_replace(ConnectionState::Error);
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("shutdown: {}", e);
    }
}

/// Feed inbound chunks to the correlator until the transport ends
async fn read_loop<R>(
    mut reader: R,
    mut assembler: FrameAssembler,
    correlator: Arc<Mutex<Correlator>>,
    state: Arc<watch::Sender<ConnectionState>>,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let final_state = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::info!("device closed the connection");
                break ConnectionState::Disconnected;
            }
            Ok(n) => {
                tracing::trace!("rx {:02x?}", &chunk[..n]);
                let frames = assembler.push(&chunk[..n]);
                let mut correlator = lock(&correlator);
                for frame in frames {
                    match frame {
                        Ok(frame) => correlator.dispatch(frame),
                        Err(rejected) => correlator.dispatch_rejected(rejected),
                    }
                }
            }
            Err(e) => {
                tracing::warn!("transport error: {}", e);
                break ConnectionState::Error;
            }
        }
    };

    if assembler.buffered() > 0 {
        tracing::debug!("{} bytes of a partial frame discarded", assembler.buffered());
    }
    lock(&correlator).abandon_all();
    state.send_replace(final_state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_config_default() {
        let config = DeviceConfig::default();
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.reply_timeout_ms, Some(DEFAULT_TIMEOUT_MS));
        assert!(config.verify_checksums);
        assert!(config.port_name.is_empty());
    }

    #[test]
    fn test_device_config_partial_json() {
        let config =
            DeviceConfig::from_json_str(r#"{ "port_name": "/dev/rfcomm0", "reply_timeout_ms": null }"#)
                .unwrap();
        assert_eq!(config.port_name, "/dev/rfcomm0");
        assert_eq!(config.reply_timeout_ms, None);
        assert_eq!(config.push_channel_capacity, DEFAULT_PUSH_CAPACITY);
    }

    #[test]
    fn test_device_config_bad_json() {
        assert!(matches!(
            DeviceConfig::from_json_str("{ nope"),
            Err(ProtocolError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_requires_port() {
        assert!(matches!(
            Device::connect(DeviceConfig::default()),
            Err(ProtocolError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_session_starts_connected() {
        let (host, _device) = tokio::io::duplex(64);
        let session = Device::from_transport(host, DeviceConfig::default());
        assert_eq!(session.state(), ConnectionState::Connected);
    }
}
