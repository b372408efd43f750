//! Kernel output: serial-backed `print!` macros, the VGA mirror, and the
//! `log` facade sink.

pub mod uart;
pub mod vga;

use core::fmt::Write;

use log::{LevelFilter, Metadata, Record};

// print! & println! implementations

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::out::__print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn __print(args: core::fmt::Arguments) {
    // a handler printing while this core holds a sink would deadlock
    let saved = amd64::interrupts::save_and_disable_interrupts();
    uart::UART_COM1.0.lock().write_fmt(args).unwrap_or(());
    vga::mirror(args);
    amd64::interrupts::restore_interrupts(saved);
}

/// Raw byte output for the write syscall.
pub fn write_bytes(bytes: &[u8]) {
    let saved = amd64::interrupts::save_and_disable_interrupts();
    {
        let mut uart = uart::UART_COM1.0.lock();
        for &byte in bytes {
            uart.write_byte(byte);
        }
    }
    amd64::interrupts::restore_interrupts(saved);
}

struct SerialLog;

impl log::Log for SerialLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:>5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static SERIAL_LOG: SerialLog = SerialLog;

/// Route the `log` facade to the serial port. Touches COM1 for the first
/// time, which runs its self-test.
pub fn init_logging(level: LevelFilter) {
    log::set_logger(&SERIAL_LOG).expect("logger installed twice");
    log::set_max_level(level);
}
