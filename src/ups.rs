use crate::settings::Settings;
use crate::status::{self, ChargeState, DecodeError, StatusFields};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::{
    io::{self, Read},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum UPSError {
    #[error("no data from UPS within {0:?}")]
    Timeout(Duration),
    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to open serial device: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bad status frame: {0}")]
    Decode(#[from] DecodeError),
}

impl UPSError {
    /// Transport failures cannot heal by polling again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UPSError::Io(_) | UPSError::Serial(_))
    }
}

/// The three operations the frame reader needs from a byte channel.
pub trait SerialChannel {
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn discard_input(&mut self) -> io::Result<()>;
    /// Reads up to `max_bytes`, returning early if the device stops sending.
    fn read_up_to(&mut self, max_bytes: usize) -> io::Result<Vec<u8>>;
}

impl SerialChannel for Box<dyn SerialPort> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        Ok(self.clear(ClearBuffer::Input)?)
    }

    fn read_up_to(&mut self, max_bytes: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; max_bytes];
        let mut filled = 0;
        // The port timeout bounds each read, so a frame still in flight ends the chunk short.
        while filled < max_bytes {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// `None` waits for data forever.
    pub timeout: Option<Duration>,
    /// Time between discarding stale input and checking for fresh bytes.
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub fn unbounded(poll_interval: Duration) -> WaitPolicy {
        WaitPolicy {
            timeout: None,
            poll_interval,
        }
    }
}

/// Discards buffered input until fresh bytes show up on the channel.
pub fn wait_for_data<C>(channel: &mut C, wait: &WaitPolicy) -> Result<usize, UPSError>
where
    C: SerialChannel + ?Sized,
{
    let started = Instant::now();
    loop {
        channel.discard_input()?;
        if !wait.poll_interval.is_zero() {
            thread::sleep(wait.poll_interval);
        }

        let available = channel.bytes_available()?;
        if available > 0 {
            return Ok(available);
        }

        if let Some(limit) = wait.timeout {
            if started.elapsed() >= limit {
                return Err(UPSError::Timeout(limit));
            }
        }
    }
}

/// Reads the freshest chunk of at most `max_bytes` from the channel.
///
/// Anything buffered before the call is thrown away, so a chunk never holds data from an
/// earlier cycle. The returned chunk can be shorter than requested when the UPS is still
/// mid-transmission; the decoder locates frames by delimiter and copes with that.
pub fn read_chunk<C>(
    channel: &mut C,
    max_bytes: usize,
    wait: &WaitPolicy,
) -> Result<Vec<u8>, UPSError>
where
    C: SerialChannel + ?Sized,
{
    let available = wait_for_data(channel, wait)?;
    let chunk = channel.read_up_to(max_bytes)?;
    trace!(available, read = chunk.len(), "read chunk");
    Ok(chunk)
}

/// One decoded poll of the UPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub fields: StatusFields,
    pub state: ChargeState,
    pub line: String,
}

impl From<StatusFields> for Reading {
    fn from(fields: StatusFields) -> Reading {
        let state = fields.charge_state();
        let line = fields.status_line();
        Reading {
            fields,
            state,
            line,
        }
    }
}

pub struct UPS<C: SerialChannel> {
    channel: C,
    chunk_size: usize,
    wait: WaitPolicy,
}

impl UPS<Box<dyn SerialPort>> {
    pub fn open(settings: &Settings) -> Result<Self, UPSError> {
        // 8N1 without flow control, as the UPS expects.
        let port = serialport::new(&settings.device, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(settings.read_timeout_ms))
            .open()?;

        debug!(device = %settings.device, baud = settings.baud_rate, "opened serial device");
        Ok(UPS::new(port, settings.chunk_size, settings.wait_policy()))
    }
}

impl<C: SerialChannel> UPS<C> {
    pub fn new(channel: C, chunk_size: usize, wait: WaitPolicy) -> UPS<C> {
        UPS {
            channel,
            chunk_size,
            wait,
        }
    }

    /// Checks that the UPS is sending anything at all.
    pub fn probe(&mut self, timeout: Duration) -> Result<(), UPSError> {
        let wait = WaitPolicy {
            timeout: Some(timeout),
            poll_interval: self.wait.poll_interval,
        };
        wait_for_data(&mut self.channel, &wait)?;
        Ok(())
    }

    pub fn poll(&mut self) -> Result<Reading, UPSError> {
        let chunk = read_chunk(&mut self.channel, self.chunk_size, &self.wait)?;
        let fields = status::decode(&chunk)?;
        Ok(Reading::from(fields))
    }
}
