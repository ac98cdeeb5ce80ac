//! Serial port transport.

use std::io::Read;
use std::thread::sleep;
use std::time::Duration;

use serialport::SerialPort;

use super::Transport;
use crate::error::Result;

const SERIAL_TIMEOUT_MS: u64 = 1000;

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baud: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baud);
        let port = serialport::new(port, baud)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()?;
        Ok(SerialTransport { port })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.port.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        std::io::Write::write_all(&mut self.port, data)?;
        self.port.flush()?;
        Ok(())
    }

    fn avail(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn flush(&mut self) -> Result<()> {
        let waiting = self.avail()?;
        if waiting > 0 {
            let discarded = self.read_n(waiting)?;
            log::trace!("discarding {} bytes: {}", waiting, hex::encode(&discarded));
        }
        Ok(())
    }

    fn pulse_dtr(&mut self, millis: u64) -> Result<()> {
        self.port.write_data_terminal_ready(true)?;
        sleep(Duration::from_millis(millis));
        self.port.write_data_terminal_ready(false)?;
        log::trace!("pulsed DTR for {}ms", millis);
        Ok(())
    }

    fn pulse_break(&mut self, millis: u64) -> Result<()> {
        self.port.set_break()?;
        sleep(Duration::from_millis(millis));
        self.port.clear_break()?;
        log::trace!("pulsed break for {}ms", millis);
        Ok(())
    }
}
