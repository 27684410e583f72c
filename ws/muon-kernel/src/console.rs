//! Kernel console: a list of sinks behind the `log` facade.
//!
//! Sinks are the one place the kernel uses trait objects. The serial sink
//! writes to the 16550 UART; the ring sink keeps the last few KiB of log
//! output in memory for post-mortem inspection.

use arrayvec::ArrayString;
use core::fmt::Write;
use log::{
    LevelFilter,
    Log,
    Metadata,
    Record,
};
use spin::Mutex;

/// A console output device.
pub trait ConsoleSink: Send {
    fn write(&mut self, msg: &str);
}

/// Sink writing to the legacy COM1 UART.
pub struct SerialSink {
    #[cfg(not(test))]
    port: uart_16550::SerialPort,
}

impl SerialSink {
    /// COM1 base port.
    pub const COM1: u16 = 0x3f8;

    pub fn new() -> Self {
        #[cfg(not(test))]
        {
            let mut port = unsafe { uart_16550::SerialPort::new(Self::COM1) };
            port.init();
            Self { port }
        }
        #[cfg(test)]
        Self {}
    }
}

impl ConsoleSink for SerialSink {
    fn write(&mut self, msg: &str) {
        #[cfg(not(test))]
        let _ = self.port.write_str(msg);
        #[cfg(test)]
        let _ = msg;
    }
}

const RING_SIZE: usize = 4096;

/// In-memory ring buffer sink.
pub struct RingSink {
    buf: [u8; RING_SIZE],
    pos: usize,
}

impl RingSink {
    pub const fn new() -> Self {
        Self {
            buf: [0; RING_SIZE],
            pos: 0,
        }
    }
}

impl ConsoleSink for RingSink {
    fn write(&mut self, msg: &str) {
        for &byte in msg.as_bytes() {
            self.buf[self.pos % RING_SIZE] = byte;
            self.pos += 1;
        }
    }
}

const MAX_SINKS: usize = 4;

struct Console {
    sinks: Mutex<arrayvec::ArrayVec<&'static mut dyn ConsoleSink, MAX_SINKS>>,
}

// The sink list is only mutated under the lock.
unsafe impl Sync for Console {}

static CONSOLE: Console = Console {
    sinks: Mutex::new(arrayvec::ArrayVec::new_const()),
};

impl Console {
    fn fmt_msg(record: &Record) -> ArrayString<512> {
        let mut buf = ArrayString::new();

        let res = writeln!(
            &mut buf,
            "[{:>5}] {}: {}",
            record.level().as_str(),
            record.target(),
            record.args(),
        );

        if res.is_err() {
            let msg_too_long = "<LOG MSG TOO LONG; TRUNCATED>\n";
            unsafe { buf.set_len(buf.len() - msg_too_long.len()) };
            let _ = buf.write_str(msg_too_long);
        }

        buf
    }
}

impl Log for Console {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let msg = Self::fmt_msg(record);
        for sink in self.sinks.lock().iter_mut() {
            sink.write(msg.as_str());
        }
    }

    fn flush(&self) {}
}

/// Registers a sink. Sinks must live forever; the kernel never tears its
/// console down.
pub fn add_sink(sink: &'static mut dyn ConsoleSink) {
    let _ = CONSOLE.sinks.lock().try_push(sink);
}

/// Installs the console as the `log` backend. Called once during bring-up.
pub fn init(max_level: LevelFilter) {
    let _ = log::set_logger(&CONSOLE);
    log::set_max_level(max_level);
}

/// Panic path: write directly to every sink, bypassing the `log` filter.
pub fn panic_write(msg: &str) {
    for sink in CONSOLE.sinks.lock().iter_mut() {
        sink.write(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_wraps() {
        let mut ring = RingSink::new();
        for _ in 0..RING_SIZE {
            ring.write("ab");
        }
        assert_eq!(2 * RING_SIZE, ring.pos);
    }
}
