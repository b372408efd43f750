//! PS/2 controller and keyboard bring-up.
//!
//! Polled init only: controller self-test, port enable, keyboard reset, and
//! scan-code set selection. The interrupt-driven input path belongs to the
//! keyboard driver proper.

use amd64::ports::{inb, outb};

const DATA_PORT: u16 = 0x60;
const STATUS_PORT: u16 = 0x64;
const COMMAND_PORT: u16 = 0x64;

const STATUS_OUTPUT_FULL: u8 = 1 << 0;
const STATUS_INPUT_FULL: u8 = 1 << 1;

const CMD_SELF_TEST: u8 = 0xAA;
const CMD_ENABLE_PORT1: u8 = 0xAE;

const SELF_TEST_OK: u8 = 0x55;

const KBD_CMD_RESET: u8 = 0xFF;
const KBD_CMD_SCANCODE_SET: u8 = 0xF0;
const KBD_ACK: u8 = 0xFA;
const KBD_SELF_TEST_OK: u8 = 0xAA;

const SCANCODE_SET_2: u8 = 0x02;

const SPIN_LIMIT: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ps2Error {
    SelfTestFailed,
    TimedOut,
    UnsupportedScanCodeSet,
    ControllerError,
}

fn wait_output() -> Result<(), Ps2Error> {
    for _ in 0..SPIN_LIMIT {
        if unsafe { inb(STATUS_PORT) } & STATUS_OUTPUT_FULL != 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(Ps2Error::TimedOut)
}

fn wait_input() -> Result<(), Ps2Error> {
    for _ in 0..SPIN_LIMIT {
        if unsafe { inb(STATUS_PORT) } & STATUS_INPUT_FULL == 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(Ps2Error::TimedOut)
}

fn read_data() -> Result<u8, Ps2Error> {
    wait_output()?;
    Ok(unsafe { inb(DATA_PORT) })
}

fn write_command(cmd: u8) -> Result<(), Ps2Error> {
    wait_input()?;
    unsafe { outb(COMMAND_PORT, cmd) };
    Ok(())
}

fn write_device(byte: u8) -> Result<(), Ps2Error> {
    wait_input()?;
    unsafe { outb(DATA_PORT, byte) };
    Ok(())
}

fn expect_ack() -> Result<(), Ps2Error> {
    match read_data()? {
        KBD_ACK => Ok(()),
        _ => Err(Ps2Error::ControllerError),
    }
}

/// Non-blocking scancode read for the keyboard interrupt handler.
pub fn read_scancode() -> Option<u8> {
    unsafe {
        if inb(STATUS_PORT) & STATUS_OUTPUT_FULL != 0 {
            Some(inb(DATA_PORT))
        } else {
            None
        }
    }
}

/// Controller self-test, first-port enable, keyboard reset, and scan-code
/// set 2 selection.
pub fn init() -> Result<(), Ps2Error> {
    // drain anything stale
    while unsafe { inb(STATUS_PORT) } & STATUS_OUTPUT_FULL != 0 {
        unsafe { inb(DATA_PORT) };
    }

    write_command(CMD_SELF_TEST)?;
    if read_data()? != SELF_TEST_OK {
        return Err(Ps2Error::SelfTestFailed);
    }

    write_command(CMD_ENABLE_PORT1)?;

    write_device(KBD_CMD_RESET)?;
    expect_ack()?;
    if read_data()? != KBD_SELF_TEST_OK {
        return Err(Ps2Error::SelfTestFailed);
    }

    write_device(KBD_CMD_SCANCODE_SET)?;
    expect_ack()?;
    write_device(SCANCODE_SET_2)?;
    match read_data()? {
        KBD_ACK => {}
        0xFE => return Err(Ps2Error::UnsupportedScanCodeSet),
        _ => return Err(Ps2Error::ControllerError),
    }

    log::info!("ps2: keyboard online, scan-code set 2");
    Ok(())
}
