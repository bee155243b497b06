//! Hardware monitor sources.
//!
//! A [`MonitorSource`] hands the callbacks fresh per-channel readings. Two
//! sources exist:
//! - [`LinkMonitor`] speaks the monitor link protocol over a [`Connection`]
//! - [`SimulatedMonitor`] fabricates readings, with switchable faults for tests
//!
//! # Monitor link protocol
//!
//! ```text
//! request  (only when the connection is writable)
//!   u32 opcode          1 = read monitor
//!   u32 channel_count
//! response
//!   u64 counter
//!   channel_count x (u32 state, f32 vmon, f32 imon)
//! ```
//!
//! All integers are big-endian.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, warn};

use slc_core::wire;
use slc_core::{ChannelState, ChannelStatus};

use crate::error::CallbackError;
use crate::transport::{connect, Connection, Endpoint, TransportError};

/// Opcode of the read-monitor request.
pub const OPCODE_READ_MONITOR: u32 = 1;

/// Size of the response header (the counter).
const RESPONSE_HEADER_LEN: usize = 8;

/// Size of one channel entry in the response.
const CHANNEL_ENTRY_LEN: usize = 12;

/// One monitor sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorReading {
    /// Free-running hardware counter (event count for readout links)
    pub counter: u64,
    pub channels: Vec<ChannelStatus>,
}

/// Source of per-channel monitor readings.
#[async_trait]
pub trait MonitorSource: Send {
    /// Reads `channels` channel entries.
    async fn read_monitor(&mut self, channels: usize) -> Result<MonitorReading, CallbackError>;

    /// Switches channel outputs. Sources without output control ignore it.
    async fn set_output(&mut self, _on: bool) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// Link Monitor
// ============================================================================

/// Monitor source reading a hardware link.
///
/// Connects lazily on first use and drops the connection after any fault so
/// the next read reconnects. An exchange abandoned by a caller's timeout
/// also drops the connection, since its answer may still be in flight.
pub struct LinkMonitor {
    endpoint: Endpoint,
    conn: Option<Connection>,
    in_flight: bool,
}

impl LinkMonitor {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            conn: None,
            in_flight: false,
        }
    }

    /// Wraps an already open connection.
    pub fn with_connection(conn: Connection) -> Self {
        Self {
            endpoint: conn.endpoint().clone(),
            conn: Some(conn),
            in_flight: false,
        }
    }

    async fn exchange(
        conn: &mut Connection,
        channels: usize,
    ) -> Result<MonitorReading, CallbackError> {
        if conn.is_writable() {
            let count = u32::try_from(channels)
                .map_err(|_| CallbackError::BadData(format!("channel count {channels}")))?;
            let mut request = BytesMut::with_capacity(8);
            request.put_u32(OPCODE_READ_MONITOR);
            request.put_u32(count);
            conn.write_exact(&request).await?;
        }

        let len = RESPONSE_HEADER_LEN + channels * CHANNEL_ENTRY_LEN;
        let response = conn.read_exact(len).await?;
        decode_reading(&response, channels)
    }
}

#[async_trait]
impl MonitorSource for LinkMonitor {
    async fn read_monitor(&mut self, channels: usize) -> Result<MonitorReading, CallbackError> {
        if self.in_flight {
            debug!(endpoint = %self.endpoint, "Previous exchange abandoned, reopening monitor link");
            if let Some(mut conn) = self.conn.take() {
                conn.close().await;
            }
            self.in_flight = false;
        }
        if self.conn.is_none() {
            debug!(endpoint = %self.endpoint, "Opening monitor link");
            self.conn = Some(connect(&self.endpoint).await?);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(TransportError::Closed.into());
        };

        self.in_flight = true;
        let result = Self::exchange(conn, channels).await;
        self.in_flight = false;

        match result {
            Ok(reading) => Ok(reading),
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Monitor link fault, dropping connection");
                if let Some(mut conn) = self.conn.take() {
                    conn.close().await;
                }
                Err(e)
            }
        }
    }

    fn describe(&self) -> String {
        format!("link {}", self.endpoint)
    }
}

/// Decodes a monitor response body.
pub fn decode_reading(bytes: &[u8], channels: usize) -> Result<MonitorReading, CallbackError> {
    let mut buf = bytes;
    if buf.remaining() < RESPONSE_HEADER_LEN {
        return Err(CallbackError::BadData(format!(
            "response of {} bytes has no counter",
            buf.remaining()
        )));
    }
    let counter = buf.get_u64();
    let channels =
        wire::get_channels(&mut buf, channels).map_err(|e| CallbackError::BadData(e.to_string()))?;
    if buf.has_remaining() {
        return Err(CallbackError::BadData(format!(
            "{} trailing bytes in monitor response",
            buf.remaining()
        )));
    }
    Ok(MonitorReading { counter, channels })
}

/// Encodes a monitor response body; the counterpart of [`decode_reading`].
pub fn encode_reading(reading: &MonitorReading) -> BytesMut {
    let mut buf =
        BytesMut::with_capacity(RESPONSE_HEADER_LEN + reading.channels.len() * CHANNEL_ENTRY_LEN);
    buf.put_u64(reading.counter);
    for ch in &reading.channels {
        wire::put_channel(&mut buf, ch);
    }
    buf
}

// ============================================================================
// Simulated Monitor
// ============================================================================

const FAULT_NONE: u8 = 0;
const FAULT_ERROR: u8 = 1;
const FAULT_STALL: u8 = 2;

/// Switch for injecting faults into a [`SimulatedMonitor`] it no longer owns.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch(Arc<AtomicU8>);

impl FaultSwitch {
    /// Every read fails with a short read.
    pub fn fail(&self) {
        self.0.store(FAULT_ERROR, Ordering::SeqCst);
    }

    /// Every read hangs until cancelled.
    pub fn stall(&self) {
        self.0.store(FAULT_STALL, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(FAULT_NONE, Ordering::SeqCst);
    }

    fn get(&self) -> u8 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Monitor source fabricating plausible readings.
///
/// Channels read `setpoint` volts while outputs are on and zero otherwise;
/// the counter advances by `counter_step` per read.
pub struct SimulatedMonitor {
    setpoint: f32,
    output_on: bool,
    counter: u64,
    counter_step: u64,
    faults: FaultSwitch,
}

impl SimulatedMonitor {
    pub fn new(setpoint: f32) -> Self {
        Self {
            setpoint,
            output_on: false,
            counter: 0,
            counter_step: 100,
            faults: FaultSwitch::default(),
        }
    }

    /// Returns a switch that keeps working after the monitor is boxed away.
    pub fn fault_switch(&self) -> FaultSwitch {
        self.faults.clone()
    }
}

#[async_trait]
impl MonitorSource for SimulatedMonitor {
    async fn read_monitor(&mut self, channels: usize) -> Result<MonitorReading, CallbackError> {
        match self.faults.get() {
            FAULT_ERROR => {
                return Err(TransportError::ShortRead {
                    expected: RESPONSE_HEADER_LEN + channels * CHANNEL_ENTRY_LEN,
                    received: 0,
                }
                .into())
            }
            FAULT_STALL => loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            },
            _ => {}
        }

        self.counter = self.counter.wrapping_add(self.counter_step);
        let (state, vmon, imon) = if self.output_on {
            (ChannelState::On, self.setpoint, self.setpoint / 1000.0)
        } else {
            (ChannelState::Off, 0.0, 0.0)
        };

        Ok(MonitorReading {
            counter: self.counter,
            channels: vec![ChannelStatus::new(state, vmon, imon); channels],
        })
    }

    async fn set_output(&mut self, on: bool) -> Result<(), CallbackError> {
        if self.faults.get() == FAULT_ERROR {
            return Err(CallbackError::Device("output switch not responding".to_string()));
        }
        self.output_on = on;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated ({} V)", self.setpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StreamReader;

    #[test]
    fn test_decode_reading() {
        let reading = MonitorReading {
            counter: 42,
            channels: vec![
                ChannelStatus::new(ChannelState::On, 1500.0, 1.5),
                ChannelStatus::new(ChannelState::Trip, 0.0, 0.0),
            ],
        };
        let bytes = encode_reading(&reading);
        assert_eq!(bytes.len(), 8 + 2 * 12);
        assert_eq!(decode_reading(&bytes, 2).unwrap(), reading);
    }

    #[test]
    fn test_decode_reading_rejects_wrong_size() {
        let reading = MonitorReading {
            counter: 1,
            channels: vec![ChannelStatus::default(); 3],
        };
        let bytes = encode_reading(&reading);
        assert!(decode_reading(&bytes, 4).is_err());
        assert!(decode_reading(&bytes, 2).is_err());
        assert!(decode_reading(&bytes[..4], 0).is_err());
    }

    #[tokio::test]
    async fn test_link_monitor_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut reader = StreamReader::new(rd);
            let request = reader.read_exact(8).await.unwrap();
            let mut req = &request[..];
            assert_eq!(req.get_u32(), OPCODE_READ_MONITOR);
            let n = req.get_u32() as usize;

            let reading = MonitorReading {
                counter: 7,
                channels: vec![ChannelStatus::new(ChannelState::On, 900.0, 0.9); n],
            };
            wr.write_all(&encode_reading(&reading)).await.unwrap();
        });

        let endpoint = Endpoint::parse(&format!("127.0.0.1:{port}")).unwrap();
        let mut monitor = LinkMonitor::new(endpoint);
        let reading = monitor.read_monitor(3).await.unwrap();
        assert_eq!(reading.counter, 7);
        assert_eq!(reading.channels.len(), 3);
        assert_eq!(reading.channels[2].vmon, 900.0);
    }

    #[tokio::test]
    async fn test_link_monitor_reopens_after_abandoned_exchange() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            // First peer never answers
            let (_silent, _) = listener.accept().await.unwrap();
            let (sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.into_split();
            let mut reader = StreamReader::new(rd);
            reader.read_exact(8).await.unwrap();
            let reading = MonitorReading {
                counter: 11,
                channels: vec![ChannelStatus::new(ChannelState::Off, 0.0, 0.0); 2],
            };
            wr.write_all(&encode_reading(&reading)).await.unwrap();
            std::future::pending::<()>().await;
        });

        let endpoint = Endpoint::parse(&format!("127.0.0.1:{port}")).unwrap();
        let mut monitor = LinkMonitor::new(endpoint);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), monitor.read_monitor(2)).await;
        assert!(abandoned.is_err());

        let reading = tokio::time::timeout(Duration::from_secs(2), monitor.read_monitor(2))
            .await
            .expect("second exchange should use a fresh connection")
            .unwrap();
        assert_eq!(reading.counter, 11);
    }

    #[tokio::test]
    async fn test_simulated_monitor_follows_output() {
        let mut monitor = SimulatedMonitor::new(1200.0);
        let off = monitor.read_monitor(2).await.unwrap();
        assert!(off.channels.iter().all(|c| c.state == ChannelState::Off));

        monitor.set_output(true).await.unwrap();
        let on = monitor.read_monitor(2).await.unwrap();
        assert!(on.channels.iter().all(|c| c.vmon == 1200.0));
        assert!(on.counter > off.counter);
    }

    #[tokio::test]
    async fn test_fault_switch_after_boxing() {
        let monitor = SimulatedMonitor::new(1.0);
        let faults = monitor.fault_switch();
        let mut boxed: Box<dyn MonitorSource> = Box::new(monitor);

        faults.fail();
        assert!(boxed.read_monitor(1).await.is_err());
        faults.clear();
        assert!(boxed.read_monitor(1).await.is_ok());
    }
}
