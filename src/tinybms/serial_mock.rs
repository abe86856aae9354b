//! Mock serial port implementation for testing
//!
//! This module provides a mock serial port that can be used to test the
//! TinyBMS serial communication without requiring actual hardware.

use crate::constants::{TINYBMS_CMD_ERROR, TINYBMS_CMD_READ, TINYBMS_CMD_WRITE, TINYBMS_SYNC_BYTE};
use crate::tinybms::frame::crc16;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Mock serial port that simulates the TinyBMS end of the link.
#[derive(Clone, Default)]
pub struct MockSerialPort {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    /// Data written to the port (outgoing requests).
    tx_buffer: Vec<u8>,
    /// Data to be read from the port (queued replies).
    rx_buffer: VecDeque<u8>,
    /// Error to return on the next I/O operation.
    next_error: Option<io::Error>,
    /// Woken when new RX data is queued.
    read_waker: Option<Waker>,
}

impl MockSerialPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue raw bytes to be read from the port.
    pub fn queue_rx_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.rx_buffer.extend(data);
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
    }

    /// Queue a well-formed read reply carrying `words`.
    pub fn queue_read_reply(&self, words: &[u16]) {
        let mut frame = vec![TINYBMS_SYNC_BYTE, TINYBMS_CMD_READ, (words.len() * 2) as u8];
        for w in words {
            frame.extend_from_slice(&w.to_le_bytes());
        }
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        self.queue_rx_data(&frame);
    }

    /// Queue a well-formed write echo reply.
    pub fn queue_write_echo(&self, address: u16, register_count: u8) {
        let mut frame = vec![TINYBMS_SYNC_BYTE, TINYBMS_CMD_WRITE];
        frame.extend_from_slice(&address.to_le_bytes());
        frame.push(0x00);
        frame.push(register_count);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        self.queue_rx_data(&frame);
    }

    /// Queue an error reply refusing `orig_cmd` with `code`.
    pub fn queue_error_reply(&self, orig_cmd: u8, code: u8) {
        let mut frame = vec![TINYBMS_SYNC_BYTE, TINYBMS_CMD_ERROR, orig_cmd, code];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        self.queue_rx_data(&frame);
    }

    /// Get data that was written to the port.
    pub fn get_tx_data(&self) -> Vec<u8> {
        self.inner.lock().unwrap().tx_buffer.clone()
    }

    /// Clear all buffers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.tx_buffer.clear();
        inner.rx_buffer.clear();
    }

    /// Set an error to be returned on the next operation.
    pub fn set_next_error(&self, error: io::Error) {
        self.inner.lock().unwrap().next_error = Some(error);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.next_error.take() {
            return Poll::Ready(Err(error));
        }

        let available = inner.rx_buffer.len().min(buf.remaining());
        if available == 0 {
            // Nothing queued: park until the test queues more data. A
            // timeout wrapping this read fires normally.
            inner.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let data: Vec<u8> = inner.rx_buffer.drain(..available).collect();
        buf.put_slice(&data);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(error) = inner.next_error.take() {
            return Poll::Ready(Err(error));
        }

        inner.tx_buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_serial_port_creation() {
        let port = MockSerialPort::new();
        assert_eq!(port.get_tx_data().len(), 0);
    }

    #[test]
    fn test_queue_and_read_data() {
        let port = MockSerialPort::new();
        port.queue_rx_data(&[0x01, 0x02, 0x03]);
        assert_eq!(port.inner.lock().unwrap().rx_buffer.len(), 3);
    }

    #[test]
    fn test_queue_read_reply_is_well_formed() {
        let port = MockSerialPort::new();
        port.queue_read_reply(&[0x1234]);

        let inner = port.inner.lock().unwrap();
        let frame: Vec<u8> = inner.rx_buffer.iter().copied().collect();
        assert_eq!(&frame[..5], &[0xAA, 0x03, 0x02, 0x34, 0x12]);
        let crc = crc16(&frame[..5]);
        assert_eq!(frame[5], (crc & 0xFF) as u8);
        assert_eq!(frame[6], (crc >> 8) as u8);
    }

    #[test]
    fn test_clear_buffers() {
        let port = MockSerialPort::new();
        port.queue_rx_data(&[1, 2, 3]);
        port.clear();
        assert_eq!(port.inner.lock().unwrap().rx_buffer.len(), 0);
    }
}
