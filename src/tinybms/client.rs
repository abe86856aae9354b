//! # TinyBMS Client
//!
//! High-level block reads and writes on top of the serial transport, plus
//! the poll cycle that turns the three canonical register blocks into
//! published [`LiveData`] snapshots.
//!
//! Retry policy lives here, not in the transport: corruption and timeouts
//! are retried with a backoff, device refusals and argument errors are not.

use crate::constants::{
    TINYBMS_BLOCK_LIVE_END, TINYBMS_BLOCK_LIVE_START, TINYBMS_BLOCK_SETTINGS_END,
    TINYBMS_BLOCK_SETTINGS_START, TINYBMS_BLOCK_STATS_END, TINYBMS_BLOCK_STATS_START,
    TINYBMS_CMD_READ, TINYBMS_CMD_WRITE, TINYBMS_MAX_READ_REGISTERS,
};
use crate::error::{DecodeError, Error};
use crate::model::live_data::LiveData;
use crate::model::store::LiveDataStore;
use crate::tinybms::frame::{encode_read, encode_write};
use crate::tinybms::registers::{catalogue, lookup, RegisterValue};
use crate::tinybms::serial::TinyBmsTransport;
use crate::util::now_ms;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::sleep;

/// Poll cadence and retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Interval between poll cycles.
    pub cycle: Duration,
    /// The settings block is re-read every this many live cycles.
    pub settings_every: u32,
    /// Attempts per block read.
    pub retries: u32,
    /// Delay between attempts.
    pub retry_backoff: Duration,
    /// Consecutive failed cycles before the link counts as disconnected.
    pub failure_threshold: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            cycle: Duration::from_millis(1000),
            settings_every: 5,
            retries: 3,
            retry_backoff: Duration::from_millis(100),
            failure_threshold: 5,
        }
    }
}

struct ClientState {
    /// Carries settings-block fields across cycles between settings reads.
    working: LiveData,
    cycle_count: u64,
    last_timestamp_ms: u64,
}

/// TinyBMS protocol client.
pub struct TinyBmsClient<P> {
    transport: Arc<TinyBmsTransport<P>>,
    store: LiveDataStore,
    config: PollConfig,
    state: Mutex<ClientState>,
}

impl<P> TinyBmsClient<P>
where
    P: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        transport: Arc<TinyBmsTransport<P>>,
        store: LiveDataStore,
        config: PollConfig,
    ) -> Self {
        TinyBmsClient {
            transport,
            store,
            config,
            state: Mutex::new(ClientState {
                working: LiveData::default(),
                cycle_count: 0,
                last_timestamp_ms: 0,
            }),
        }
    }

    /// Reads `count` consecutive registers starting at `start_addr` and
    /// pairs each with its catalogue descriptor.
    ///
    /// A count of zero returns an empty mapping without touching the wire.
    /// Registers without a descriptor are skipped; width-2 descriptors
    /// reassemble `(high_word << 16) | low_word`.
    pub async fn read_block(
        &self,
        start_addr: u16,
        count: usize,
    ) -> Result<BTreeMap<u16, RegisterValue>, Error> {
        if count == 0 {
            return Ok(BTreeMap::new());
        }
        if count > TINYBMS_MAX_READ_REGISTERS {
            return Err(Error::InvalidArg(format!(
                "block read of {count} registers exceeds {TINYBMS_MAX_READ_REGISTERS}"
            )));
        }

        let request = encode_read(start_addr, count as u8)?;
        let reply = self.transport.exchange(&request, TINYBMS_CMD_READ).await?;
        if reply.payload.len() != count {
            return Err(Error::Decode(DecodeError::BadLength(format!(
                "asked for {count} registers, reply carried {}",
                reply.payload.len()
            ))));
        }

        let end = start_addr + count as u16;
        let mut values = BTreeMap::new();
        for desc in catalogue() {
            if desc.address < start_addr || desc.address + desc.width as u16 > end {
                continue;
            }
            let offset = (desc.address - start_addr) as usize;
            let words = &reply.payload[offset..offset + desc.width as usize];
            values.insert(desc.address, desc.decode(words));
        }
        Ok(values)
    }

    /// Writes a user-facing value to one register, then reads it back and
    /// fails `VerifyMismatch` if the readback differs.
    pub async fn write_register(&self, address: u16, user_value: f64) -> Result<(), Error> {
        let desc = lookup(address).ok_or_else(|| {
            Error::InvalidArg(format!("no catalogue entry at 0x{address:04X}"))
        })?;
        let words = desc.encode_user_value(user_value)?;

        let request = encode_write(address, &words)?;
        let echo = self.transport.exchange(&request, TINYBMS_CMD_WRITE).await?;
        if echo.address != address || echo.register_count as usize != words.len() {
            return Err(Error::Other(format!(
                "write echo mismatch: 0x{:04X}/{} vs 0x{address:04X}/{}",
                echo.address,
                echo.register_count,
                words.len()
            )));
        }

        // Readback through the raw reply so raw words compare exactly.
        let verify_req = encode_read(address, words.len() as u8)?;
        let verify = self.transport.exchange(&verify_req, TINYBMS_CMD_READ).await?;
        for (i, (&written, &read_back)) in words.iter().zip(verify.payload.iter()).enumerate() {
            if written != read_back {
                return Err(Error::VerifyMismatch {
                    address: address + i as u16,
                    written,
                    read_back,
                });
            }
        }
        info!("register 0x{address:04X} written and verified");
        Ok(())
    }

    /// One poll cycle: live and statistics blocks every cycle, the settings
    /// block on the first and every Nth cycle. Publishes the merged snapshot
    /// on success; a fully failed cycle keeps the previous snapshot.
    pub async fn poll_cycle(&self) -> Result<LiveData, Error> {
        let (cycle_count, read_settings) = {
            let state = self.state.lock().unwrap();
            let n = self.config.settings_every.max(1) as u64;
            (state.cycle_count, state.cycle_count % n == 0)
        };

        let live = self
            .read_block_with_retry(
                TINYBMS_BLOCK_LIVE_START,
                (TINYBMS_BLOCK_LIVE_END - TINYBMS_BLOCK_LIVE_START) as usize,
            )
            .await?;
        let stats = self
            .read_block_with_retry(
                TINYBMS_BLOCK_STATS_START,
                (TINYBMS_BLOCK_STATS_END - TINYBMS_BLOCK_STATS_START) as usize,
            )
            .await?;
        let settings = if read_settings {
            Some(
                self.read_block_with_retry(
                    TINYBMS_BLOCK_SETTINGS_START,
                    (TINYBMS_BLOCK_SETTINGS_END - TINYBMS_BLOCK_SETTINGS_START) as usize,
                )
                .await?,
            )
        } else {
            None
        };

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            state.working.apply_registers(&live);
            state.working.apply_registers(&stats);
            if let Some(settings) = &settings {
                state.working.apply_registers(settings);
            }
            state.working.finalize_derived();
            // Snapshots carry strictly increasing timestamps even if the
            // wall clock stalls within one millisecond.
            let ts = now_ms().max(state.last_timestamp_ms + 1);
            state.last_timestamp_ms = ts;
            state.working.timestamp_ms = ts;
            state.cycle_count = cycle_count + 1;
            state.working.clone()
        };

        self.store.publish(snapshot.clone())?;
        debug!(
            "poll cycle {} published snapshot at {} ms",
            cycle_count, snapshot.timestamp_ms
        );
        Ok(snapshot)
    }

    /// Polls until `shutdown` flips true. A failed cycle is logged, counted
    /// against the connection status, and never tears the loop down.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let _ = self.store.set_connecting();
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_cycle().await {
                Ok(_) => {}
                Err(e) => {
                    warn!("poll cycle failed: {e}");
                    if let Err(lock_err) = self.store.record_poll_failure() {
                        warn!("{lock_err}");
                    }
                }
            }
            tokio::select! {
                _ = sleep(self.config.cycle) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("poller exiting");
    }

    /// Block read with bounded retries. Corruption and timeouts retry with
    /// a backoff; a device refusal or argument error surfaces immediately.
    async fn read_block_with_retry(
        &self,
        start_addr: u16,
        count: usize,
    ) -> Result<BTreeMap<u16, RegisterValue>, Error> {
        let attempts = self.config.retries.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.read_block(start_addr, count).await {
                Ok(values) => return Ok(values),
                Err(e @ Error::Decode(DecodeError::DeviceError(_)))
                | Err(e @ Error::InvalidArg(_)) => return Err(e),
                Err(e) => {
                    debug!(
                        "block 0x{start_addr:04X} attempt {}/{} failed: {e}",
                        attempt + 1,
                        attempts
                    );
                    last_err = Some(e);
                    if attempt + 1 < attempts {
                        sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("retry loop underflow".into())))
    }
}
