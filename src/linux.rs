use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{Options, Programmer, SerialPort};

impl SerialPort<IoErrorKind> for Serial {
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(|e| {
            let e: std::io::Error = e.into();
            e.kind()
        })
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, 8N1 without flow control
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        port.0.write_settings(&settings)?;

        // Reads return immediately, polling and the response timeout are
        // applied by the programmer
        port.0.set_timeout(Duration::from_millis(0))?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
