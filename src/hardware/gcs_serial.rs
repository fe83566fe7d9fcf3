//! PI GCS motion controller link over a serial port.
//!
//! Protocol Overview:
//! - Format: `<COMMAND> <axis> [args]\n` (ASCII, newline terminated)
//! - Commands (`MOV`, `VEL`, `CTO`, ...) produce no reply
//! - Queries end in `?` and answer with one line, e.g. `POS? 1` -> `1=45.001200`
//! - Errors are latched by the controller and read back with `ERR?`
//!
//! # Example Usage
//!
//! ```no_run
//! use polar_daq::hardware::capabilities::GcsLink;
//! use polar_daq::hardware::gcs_serial::GcsSerialLink;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut link = GcsSerialLink::new("/dev/ttyUSB0", 115_200, Duration::from_secs(1));
//!     link.connect().await?;
//!     link.command("SVO 1 1").await?;
//!     println!("{}", link.query("POS? 1").await?);
//!     Ok(())
//! }
//! ```

use crate::hardware::capabilities::GcsLink;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace, warn};

/// Serial [`GcsLink`] to a PI rotation stage controller.
#[derive(Debug)]
pub struct GcsSerialLink {
    port_path: String,
    baud_rate: u32,
    reply_timeout: Duration,
    port: Option<BufReader<SerialStream>>,
}

impl GcsSerialLink {
    /// Describe a link; nothing is opened until [`GcsLink::connect`].
    ///
    /// # Arguments
    /// * `port_path` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Controller baud rate (115200 on the stage as shipped)
    /// * `reply_timeout` - How long a query waits for its reply line
    pub fn new(port_path: &str, baud_rate: u32, reply_timeout: Duration) -> Self {
        Self {
            port_path: port_path.to_string(),
            baud_rate,
            reply_timeout,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut BufReader<SerialStream>> {
        self.port
            .as_mut()
            .ok_or_else(|| anyhow!("GCS link {} not connected", self.port_path))
    }

    async fn send(&mut self, cmd: &str) -> Result<()> {
        let path = self.port_path.clone();
        let port = self.port()?;
        port.get_mut()
            .write_all(format!("{cmd}\n").as_bytes())
            .await
            .with_context(|| format!("GCS write '{cmd}' to {path} failed"))?;
        trace!(cmd, "GCS sent");
        Ok(())
    }
}

#[async_trait]
impl GcsLink for GcsSerialLink {
    async fn connect(&mut self) -> Result<()> {
        let port = tokio_serial::new(&self.port_path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open GCS serial port: {}", self.port_path))?;
        self.port = Some(BufReader::new(port));
        debug!(port = %self.port_path, baud = self.baud_rate, "GCS link open");
        Ok(())
    }

    async fn command(&mut self, cmd: &str) -> Result<()> {
        self.send(cmd).await
    }

    async fn query(&mut self, cmd: &str) -> Result<String> {
        let dropped = discard_pending(self.port()?).await;
        if dropped > 0 {
            warn!(cmd, dropped, "discarded stale GCS input before query");
        }
        self.send(cmd).await?;
        let timeout = self.reply_timeout;
        read_reply(self.port()?, cmd, timeout).await
    }
}

/// Drop everything already readable, buffered or not, without waiting for more.
///
/// A reply that arrives after its query timed out would otherwise be read as the
/// answer to the next query.
async fn discard_pending<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> usize {
    let mut dropped = 0;
    loop {
        match tokio::time::timeout(Duration::ZERO, reader.fill_buf()).await {
            Ok(Ok(buf)) if !buf.is_empty() => {
                let n = buf.len();
                reader.consume(n);
                dropped += n;
            }
            _ => return dropped,
        }
    }
}

/// Read one reply line within `timeout`. On timeout any partial line is dropped.
async fn read_reply<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    cmd: &str,
    timeout: Duration,
) -> Result<String> {
    let mut line = String::new();
    let read = match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Ok(read) => read.with_context(|| format!("GCS read after '{cmd}' failed"))?,
        Err(_) => {
            let partial = line.len() + discard_pending(reader).await;
            return Err(anyhow!(
                "no reply to '{cmd}' within {timeout:?} ({partial} bytes dropped)"
            ));
        }
    };
    if read == 0 {
        return Err(anyhow!("GCS port closed while waiting for '{cmd}'"));
    }
    let reply = line.trim().to_string();
    trace!(cmd, reply, "GCS reply");
    Ok(reply)
}
