//! # TinyBMS Serial Transport
//!
//! This module provides the half-duplex request/response transport used to
//! talk to the TinyBMS module over its serial link, including connecting to
//! the serial port, dispatching request frames, and collecting reply frames
//! with timeout and resynchronisation handling.
//!
//! The transport enforces a single outstanding request: concurrent callers
//! queue on the port mutex in FIFO order. Retry policy lives in the client;
//! the transport reports every failure verbatim.

use crate::constants::TINYBMS_SYNC_BYTE;
use crate::error::Error;
use crate::tinybms::frame::{try_parse_reply, ReplyFrame};
use log::{debug, trace, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Configuration for the serial connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Serial port path, e.g. "/dev/ttyUSB0".
    pub port: String,
    /// Wire speed; TinyBMS variants ship with 115200 or 9600 baud.
    pub baudrate: u32,
    /// Reply window for a single request.
    pub reply_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            port: "/dev/ttyUSB0".to_string(),
            baudrate: 115_200,
            reply_timeout: Duration::from_millis(800),
        }
    }
}

/// Counters for transport-level monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Requests written to the wire.
    pub requests_sent: u64,
    /// Replies parsed successfully.
    pub replies_received: u64,
    /// Requests that exhausted their reply window.
    pub timeouts: u64,
    /// Replies rejected by the frame codec.
    pub decode_errors: u64,
    /// Garbage bytes discarded while hunting for the 0xAA sync.
    pub resync_bytes_discarded: u64,
}

/// Half-duplex transport wrapping the serial port.
///
/// Generic over the port type so tests can substitute a mock; production
/// code uses [`SerialStream`].
pub struct TinyBmsTransport<P = SerialStream> {
    port: Mutex<P>,
    config: SerialConfig,
    stats: std::sync::Mutex<TransportStats>,
}

impl TinyBmsTransport<SerialStream> {
    /// Opens the configured serial port at 8N1 and wraps it in a transport.
    pub fn connect(config: SerialConfig) -> Result<Self, Error> {
        let port = tokio_serial::new(&config.port, config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(config.reply_timeout)
            .open_native_async()
            .map_err(|e| Error::Io(e.to_string()))?;
        debug!(
            "serial transport open on {} at {} baud",
            config.port, config.baudrate
        );
        Ok(Self::with_port(port, config))
    }
}

impl<P> TinyBmsTransport<P>
where
    P: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already-open port. Used directly by tests with a mock port.
    pub fn with_port(port: P, config: SerialConfig) -> Self {
        TinyBmsTransport {
            port: Mutex::new(port),
            config,
            stats: std::sync::Mutex::new(TransportStats::default()),
        }
    }

    /// Current transport counters.
    pub fn stats(&self) -> TransportStats {
        *self.stats.lock().unwrap()
    }

    /// Sends one request frame and reads exactly one reply frame.
    ///
    /// Holds the port for the whole exchange. On timeout or a decode error
    /// the RX buffer is drained so the next request starts clean.
    pub async fn exchange(&self, request: &[u8], expected_cmd: u8) -> Result<ReplyFrame, Error> {
        let mut port = self.port.lock().await;
        self.stats.lock().unwrap().requests_sent += 1;

        port.write_all(request).await?;
        port.flush().await?;
        trace!("tx {} bytes, awaiting cmd 0x{expected_cmd:02X}", request.len());

        let deadline = Instant::now() + self.config.reply_timeout;
        let mut buf: Vec<u8> = Vec::with_capacity(64);
        let mut chunk = [0u8; 64];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.stats.lock().unwrap().timeouts += 1;
                Self::drain_rx(&mut port).await;
                return Err(Error::Timeout(self.config.reply_timeout.as_millis() as u64));
            }

            let n = match timeout(remaining, port.read(&mut chunk)).await {
                Err(_) => {
                    self.stats.lock().unwrap().timeouts += 1;
                    Self::drain_rx(&mut port).await;
                    return Err(Error::Timeout(self.config.reply_timeout.as_millis() as u64));
                }
                Ok(Err(e)) => return Err(Error::Io(e.to_string())),
                Ok(Ok(n)) => n,
            };
            if n == 0 {
                continue;
            }
            buf.extend_from_slice(&chunk[..n]);

            // Resynchronise: garbage before the sync byte is discarded.
            let sync_at = buf.iter().position(|&b| b == TINYBMS_SYNC_BYTE);
            let discarded = sync_at.unwrap_or(buf.len());
            if discarded > 0 {
                self.stats.lock().unwrap().resync_bytes_discarded += discarded as u64;
                warn!("discarded {discarded} bytes before sync");
                buf.drain(..discarded);
            }

            match try_parse_reply(&buf, expected_cmd) {
                Ok(None) => continue,
                Ok(Some((frame, _consumed))) => {
                    self.stats.lock().unwrap().replies_received += 1;
                    return Ok(frame);
                }
                Err(e) => {
                    self.stats.lock().unwrap().decode_errors += 1;
                    Self::drain_rx(&mut port).await;
                    return Err(Error::Decode(e));
                }
            }
        }
    }

    /// Discards whatever is pending in the RX direction.
    async fn drain_rx(port: &mut P) {
        let mut scratch = [0u8; 256];
        loop {
            match timeout(Duration::from_millis(20), port.read(&mut scratch)).await {
                Ok(Ok(n)) if n > 0 => {
                    trace!("drained {n} stale bytes");
                }
                _ => break,
            }
        }
    }
}
