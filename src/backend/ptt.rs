//! Serial PTT keying.
//!
//! VARA HF leaves transmitter keying to the host. This controller asserts
//! RTS, DTR, or both on a serial port, with a lead delay before the modem
//! starts and a tail delay before dropping carrier, covering radio relay
//! settling on both edges.

use crate::config::PttConfig;
use serialport::SerialPort;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttMethod {
    Rts,
    Dtr,
    Both,
}

impl PttMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rts" => Some(PttMethod::Rts),
            "dtr" => Some(PttMethod::Dtr),
            "both" => Some(PttMethod::Both),
            _ => None,
        }
    }
}

pub struct PttController {
    port: Box<dyn SerialPort>,
    method: PttMethod,
    pre_delay: Duration,
    post_delay: Duration,
    keyed: bool,
}

impl PttController {
    /// Open the serial port and force PTT off.
    pub fn open(cfg: &PttConfig) -> Result<Self, serialport::Error> {
        let method = PttMethod::parse(&cfg.method).unwrap_or(PttMethod::Both);
        let port = serialport::new(&cfg.port, cfg.baud)
            .timeout(Duration::from_secs(1))
            .open()?;
        let mut ptt = Self {
            port,
            method,
            pre_delay: Duration::from_secs_f64(cfg.pre_delay),
            post_delay: Duration::from_secs_f64(cfg.post_delay),
            keyed: true, // force the unkey below to actually clear the pins
        };
        ptt.unkey();
        info!(target: "hamstr::tnc", "PTT ready on {} via {:?}", cfg.port, method);
        Ok(ptt)
    }

    pub fn is_keyed(&self) -> bool {
        self.keyed
    }

    fn set_pins(&mut self, level: bool) {
        let rts = matches!(self.method, PttMethod::Rts | PttMethod::Both);
        let dtr = matches!(self.method, PttMethod::Dtr | PttMethod::Both);
        if rts {
            if let Err(e) = self.port.write_request_to_send(level) {
                warn!(target: "hamstr::tnc", "PTT RTS set failed: {e}");
            }
        }
        if dtr {
            if let Err(e) = self.port.write_data_terminal_ready(level) {
                warn!(target: "hamstr::tnc", "PTT DTR set failed: {e}");
            }
        }
    }

    /// Key the transmitter, then hold for the pre-delay.
    pub async fn key(&mut self) {
        if self.keyed {
            return;
        }
        self.set_pins(true);
        self.keyed = true;
        debug!(target: "hamstr::tnc", "PTT keyed");
        if !self.pre_delay.is_zero() {
            tokio::time::sleep(self.pre_delay).await;
        }
    }

    /// Hold for the tail delay, then drop the transmitter.
    pub async fn unkey_async(&mut self) {
        if self.keyed && !self.post_delay.is_zero() {
            tokio::time::sleep(self.post_delay).await;
        }
        self.unkey();
    }

    /// Drop PTT immediately. Used on teardown paths where a delay would
    /// keep a dead transmitter keyed.
    pub fn unkey(&mut self) {
        if !self.keyed {
            return;
        }
        self.set_pins(false);
        self.keyed = false;
        debug!(target: "hamstr::tnc", "PTT unkeyed");
    }
}

impl Drop for PttController {
    fn drop(&mut self) {
        self.unkey();
    }
}
