//! `log` backend that writes straight to fd 2.
//!
//! Records are formatted into a fixed stack buffer and emitted with one
//! `write(2)` call, so logging from the fault handler neither allocates nor
//! touches thread-local state (the loaded image may own the TLS register by
//! then).

use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::rt;

const LINE_CAPACITY: usize = 512;

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = LineBuffer::new();
        let _ = write!(line, "[lazyload {:<5}] {}", record.level(), record.args());
        rt::rt_write_stderr(line.finish());
    }

    fn flush(&self) {}
}

pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}

/// Truncating line buffer. The last byte is kept for the newline.
struct LineBuffer {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    fn new() -> Self {
        LineBuffer {
            bytes: [0u8; LINE_CAPACITY],
            len: 0,
        }
    }

    fn finish(&mut self) -> &[u8] {
        self.bytes[self.len] = b'\n';
        &self.bytes[..=self.len]
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - 1 - self.len;
        let take = s.len().min(room);
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}
