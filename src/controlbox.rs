//! Auxiliary control board on a serial line: two ADCs for the pressure
//! regulators and two DACs for their setpoints.
//!
//! Requests are `/ADC/run` and `/DAC/run`; the board answers with one line
//! such as `ADC 1f4, 3e8`. Raw counts are scaled by per-channel constants.

use crate::config::ControlBoxSection;
use crate::error::{HalError, HalResult};
use arrayvec::ArrayString;
use core::fmt::Write;
use tracing::{debug, warn};

const REQUEST_CAPACITY: usize = 32;

/// A line-oriented serial port.
pub trait SerialLink {
    /// Write `line` followed by a newline.
    fn write_line(&mut self, line: &str) -> HalResult<()>;

    /// Read one line, without its terminator.
    fn read_line(&mut self) -> HalResult<String>;

    fn bytes_waiting(&mut self) -> HalResult<usize>;

    /// Discard pending input, returning what was discarded.
    fn clear(&mut self) -> HalResult<Vec<u8>>;

    fn reopen(&mut self) -> HalResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Adc,
    Dac,
}

impl Channel {
    pub fn tag(&self) -> &'static str {
        match self {
            Channel::Adc => "ADC",
            Channel::Dac => "DAC",
        }
    }
}

pub struct ControlBox<L: SerialLink> {
    link: L,
    adc_scale: [f64; 2],
    dac_scale: [f64; 2],
}

impl<L: SerialLink> ControlBox<L> {
    pub fn new(link: L, config: &ControlBoxSection) -> Self {
        Self {
            link,
            adc_scale: config.adc_scale,
            dac_scale: config.dac_scale,
        }
    }

    pub fn get_adcs(&mut self) -> HalResult<(f64, f64)> {
        let (a, b) = self.query(Channel::Adc)?;
        Ok((a as f64 * self.adc_scale[0], b as f64 * self.adc_scale[1]))
    }

    pub fn get_dacs(&mut self) -> HalResult<(f64, f64)> {
        let (a, b) = self.query(Channel::Dac)?;
        Ok((a as f64 * self.dac_scale[0], b as f64 * self.dac_scale[1]))
    }

    pub fn adc0(&mut self) -> HalResult<f64> {
        self.get_adcs().map(|(a, _)| a)
    }

    pub fn adc1(&mut self) -> HalResult<f64> {
        self.get_adcs().map(|(_, b)| b)
    }

    pub fn dac0(&mut self) -> HalResult<f64> {
        self.get_dacs().map(|(a, _)| a)
    }

    pub fn dac1(&mut self) -> HalResult<f64> {
        self.get_dacs().map(|(_, b)| b)
    }

    pub fn into_inner(self) -> L {
        self.link
    }

    /// Raw counts for one request. A failed write is reported as is; a
    /// failed read reopens the port and retries the whole request once.
    fn query(&mut self, channel: Channel) -> HalResult<(u32, u32)> {
        let mut request = ArrayString::<REQUEST_CAPACITY>::new();
        write!(request, "/{}/run", channel.tag())
            .map_err(|_| HalError::Format("control box request too long".to_string()))?;

        self.clear_stale()?;
        self.link.write_line(&request)?;

        let line = match self.link.read_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(request = %request, error = %e, "control box read failed, reopening port");
                self.link.reopen().map_err(to_transport)?;
                self.clear_stale()?;
                self.link.write_line(&request).map_err(to_transport)?;
                self.link.read_line().map_err(to_transport)?
            }
        };
        debug!(request = %request, response = %line, "control box reply");
        parse_response(&line, channel)
    }

    fn clear_stale(&mut self) -> HalResult<()> {
        if self.link.bytes_waiting()? > 0 {
            let stale = self.link.clear()?;
            warn!(
                response = %String::from_utf8_lossy(&stale),
                "unknown/unparsed serial response"
            );
        }
        Ok(())
    }
}

fn to_transport(e: HalError) -> HalError {
    match e {
        HalError::Transport(_) => e,
        other => HalError::Transport(other.to_string()),
    }
}

/// Parse `"<TAG> <hex>, <hex>"`.
pub fn parse_response(line: &str, channel: Channel) -> HalResult<(u32, u32)> {
    let malformed = || HalError::Format(format!("malformed {} response {:?}", channel.tag(), line));

    let rest = line
        .trim_end()
        .strip_prefix(channel.tag())
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(malformed)?;
    let (first, second) = rest.split_once(", ").ok_or_else(malformed)?;
    let first = u32::from_str_radix(first.trim(), 16).map_err(|_| malformed())?;
    let second = u32::from_str_radix(second.trim(), 16).map_err(|_| malformed())?;
    Ok((first, second))
}
