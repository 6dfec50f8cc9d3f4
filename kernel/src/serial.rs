//! COM1 serial console.
//!
//! The 16550 UART at `0x3F8` is the kernel's console: the log macros,
//! `DebugWrite`/`DebugRead` and the panic path all end up here. The driver
//! is byte-oriented and offers both non-blocking (`try_put`/`try_read`) and
//! blocking (`put`/`read`) operations.

use core::fmt;

use conquer_once::spin::Lazy;
use spin::Mutex;

use crate::arch;

const COM1: u16 = 0x3F8;

/// Line status register bits.
const LSR_DATA_READY: u8 = 0x01;
const LSR_TRANSMIT_EMPTY: u8 = 0x20;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    /// # Safety
    /// `base` must be the I/O base of a 16550-compatible UART.
    pub const unsafe fn new(base: u16) -> Self {
        SerialPort { base }
    }

    pub fn init(&mut self) {
        arch::outb(self.base + 1, 0x00); // Disable all interrupts
        arch::outb(self.base + 3, 0x80); // Enable DLAB (set baud rate divisor)
        arch::outb(self.base, 0x03); // Set divisor to 3 (lo byte) 38400 baud
        arch::outb(self.base + 1, 0x00); //                  (hi byte)
        arch::outb(self.base + 3, 0x03); // 8 bits, no parity, one stop bit
        arch::outb(self.base + 2, 0xC7); // Enable FIFO, clear them, with 14-byte threshold
        arch::outb(self.base + 4, 0x0B); // IRQs enabled, RTS/DSR set
    }

    fn received(&self) -> bool {
        arch::inb(self.base + 5) & LSR_DATA_READY != 0
    }

    fn transmit_empty(&self) -> bool {
        arch::inb(self.base + 5) & LSR_TRANSMIT_EMPTY != 0
    }

    /// Non-blocking read of one byte, if one is pending.
    pub fn try_read(&mut self) -> Option<u8> {
        if self.received() {
            Some(arch::inb(self.base))
        } else {
            None
        }
    }

    /// Non-blocking write. Returns false if the transmit register is busy.
    pub fn try_put(&mut self, byte: u8) -> bool {
        if self.transmit_empty() {
            arch::outb(self.base, byte);
            true
        } else {
            false
        }
    }

    /// Blocking read of one byte.
    pub fn read(&mut self) -> u8 {
        while !self.received() {}
        arch::inb(self.base)
    }

    /// Blocking write of one byte.
    pub fn put(&mut self, byte: u8) {
        while !self.transmit_empty() {}
        arch::outb(self.base, byte);
    }

    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            self.put(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        SerialPort::write_str(self, s);
        Ok(())
    }
}

/// The console UART.
pub static SERIAL1: Lazy<Mutex<SerialPort>> = Lazy::new(|| {
    let mut serial_port = unsafe { SerialPort::new(COM1) };
    serial_port.init();
    Mutex::new(serial_port)
});

/// Global print! macro that writes to the serial console.
///
/// The lock is taken with interrupts disabled so a timer tick cannot
/// deadlock against a half-finished line.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {{
        $crate::arch::without_interrupts(|| {
            let _ = ::core::fmt::Write::write_fmt(
                &mut *$crate::serial::SERIAL1.lock(),
                format_args!($($arg)*)
            );
        });
    }};
}

/// Global println! macro that writes to the serial console.
#[macro_export]
macro_rules! serial_println {
    () => {
        $crate::serial_print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*));
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // The host port stub reads as "transmit empty, nothing received".
    #[test]
    fn host_port_accepts_writes_and_has_no_input() {
        let mut port = unsafe { SerialPort::new(COM1) };
        assert!(port.try_put(b'x'));
        assert!(port.try_read().is_none());
    }
}
