//! Port-mapped 16550-family UART driver; the kernel's serial log sink.

// references & sources:
// https://en.wikibooks.org/wiki/Serial_Programming/8250_UART_Programming
// https://www.lammertbies.nl/comm/info/serial-uart

use core::fmt::Write;

use amd64::ports::{inb, outb, Port, PortData, ReadOnlyPort, WriteOnlyPort};
use spin::{Lazy, Mutex};

// standard x86-64 port-mapped UART devices
pub const COM1: u16 = 0x3f8;
pub const COM2: u16 = 0x2f8;

pub static UART_COM1: Lazy<(Mutex<UartPort>, UartChipVersion)> = Lazy::new(|| {
    let (port, ver) = unsafe { UartPort::new(COM1) }.expect("UART COM1 initialization failed!");
    (Mutex::new(port), ver)
});

// register offsets
const THBR_OFFSET: u16 = 0;
const RBR_OFFSET: u16 = 0;
const DLL_OFFSET: u16 = 0;
const IER_OFFSET: u16 = 1;
const DLH_OFFSET: u16 = 1;
const IIR_OFFSET: u16 = 2;
const FCR_OFFSET: u16 = 2;
const LCR_OFFSET: u16 = 3;
const MCR_OFFSET: u16 = 4;
const LSR_OFFSET: u16 = 5;
const SCR_OFFSET: u16 = 7;

/// UART chip versions differentiated by this implementation. Newer chips
/// are supersets; the port masks protect reserved bits on older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UartChipVersion {
    V8250 = 8250,
    V16450 = 16450,
    V16550 = 16550,
    V16550A = 16551,
    V16750 = 16750,
}

macro_rules! impl_u8_portdata_for_bitflags {
    ($name:ident) => {
        impl PortData for $name {
            unsafe fn port_read(port: u16, mask: Self) -> (Self, Self) {
                let (val, msk) = u8::port_read(port, mask.bits);
                ($name::from_bits_unchecked(val), $name::from_bits_unchecked(msk))
            }

            unsafe fn port_write(port: u16, data: Self, mask: Self) -> Self {
                $name::from_bits_unchecked(u8::port_write(port, data.bits, mask.bits))
            }
        }
    };
}

bitflags::bitflags! {
    /// Interrupt Enable Register (IER) flags.
    #[repr(transparent)]
    pub struct IER: u8 {
        const RECEIVED_DATA_AVAILABLE  = 1 << 0;
        const TRANSMITTER_EMPTY        = 1 << 1;
        const RECEIVER_LINE_STATUS     = 1 << 2;
        const MODEM_STATUS             = 1 << 3;
        /// UART 16750 only
        const ENABLE_SLEEP_MODE        = 1 << 4;
        /// UART 16750 only
        const ENABLE_LOW_POWER_MODE    = 1 << 5;
    }

    /// FIFO Control Register (FCR) flags. Not available pre-16550.
    #[repr(transparent)]
    pub struct FCR: u8 {
        const ENABLE_FIFOS        = 1 << 0;
        const CLEAR_RECEIVE_FIFO  = 1 << 1;
        const CLEAR_TRANSMIT_FIFO = 1 << 2;
        /// UART 16750 only
        const ENABLE_64_BYTE_FIFO = 1 << 5;
        const TRIGGER_LEVEL_MASK  = 0b11000000;
        const TRIGGER_LEVEL_1     = 0b00000000;
    }

    /// Line Control Register (LCR) flags.
    ///
    /// The DLAB bit is treated as reserved here; use
    /// `UartPort::set_baud_rate` instead.
    #[repr(transparent)]
    pub struct LCR: u8 {
        const WORD_LENGTH_MASK   = 0b00000011;
        const WORD_LENGTH_8_BITS = 0b00000011;
        const STOP_BIT_LEN_2     = 1 << 2;
        const PARITY_ENABLED     = 1 << 3;
        const NO_PARITY          = 0b00000000;
        const DIVISOR_LATCH_ACCESS_BIT = 1 << 7;
    }

    /// Modem Control Register (MCR) flags.
    #[repr(transparent)]
    pub struct MCR: u8 {
        const DATA_TERMINAL_READY = 1 << 0;
        const REQUEST_TO_SEND     = 1 << 1;
        const AUXILIARY_OUTPUT_1  = 1 << 2;
        /// Required to enable interrupts on some chips.
        const AUXILIARY_OUTPUT_2  = 1 << 3;
        const LOOPBACK_ENABLED    = 1 << 4;
        /// UART 16750 only
        const AUTOFLOW_CONTROL    = 1 << 5;
    }

    /// Line Status Register (LSR) flags.
    #[repr(transparent)]
    pub struct LSR: u8 {
        const DATA_READY          = 1 << 0;
        const OVERRUN_ERROR       = 1 << 1;
        const PARITY_ERROR        = 1 << 2;
        const FRAMING_ERROR       = 1 << 3;
        const BREAK_INTERRUPT     = 1 << 4;
        /// THR (or the transmit FIFO) can take another byte.
        const EMPTY_TRANSMITTER_HOLDING_REGISTER = 1 << 5;
        const EMPTY_DATA_HOLDING_REGISTERS       = 1 << 6;
        const FIFO_ERRONEOUS_DATA = 1 << 7;
    }
}
impl_u8_portdata_for_bitflags!(IER);
impl_u8_portdata_for_bitflags!(FCR);
impl_u8_portdata_for_bitflags!(LCR);
impl_u8_portdata_for_bitflags!(MCR);
impl_u8_portdata_for_bitflags!(LSR);

/// # Safety:
/// Caller must ensure `port` is a valid UART serial port.
unsafe fn identify_uart(port: u16) -> UartChipVersion {
    // https://en.wikibooks.org/wiki/Serial_Programming/8250_UART_Programming#Software_Identification_of_the_UART
    outb(port + FCR_OFFSET, 0xE7);
    let iir = inb(port + IIR_OFFSET);
    if iir & (1 << 6) != 0 {
        if iir & (1 << 7) != 0 {
            if iir & (1 << 5) != 0 {
                UartChipVersion::V16750
            } else {
                UartChipVersion::V16550A
            }
        } else {
            UartChipVersion::V16550
        }
    } else {
        outb(port + SCR_OFFSET, 0x2A);
        if inb(port + SCR_OFFSET) == 0x2A {
            UartChipVersion::V16450
        } else {
            UartChipVersion::V8250
        }
    }
}

/// A port-mapped UART chip with reserved bits masked per detected version.
pub struct UartPort {
    /// Transmission Holding Buffer register
    thbr: WriteOnlyPort<u8>,
    /// Receiver Buffer register
    rbr: ReadOnlyPort<u8>,
    /// Divisor Latch bytes
    dll: Port<u8>,
    dlh: Port<u8>,
    ier: Port<IER>,
    fcr: WriteOnlyPort<FCR>,
    lcr: Port<LCR>,
    mcr: Port<MCR>,
    lsr: ReadOnlyPort<LSR>,
}

impl UartPort {
    /// Initialize a serial port connection. Returns `Err` when the UART
    /// loopback read/write chip test fails.
    ///
    /// # Safety:
    /// Caller should guarantee `port_addr` is a valid serial port.
    pub unsafe fn new(port_addr: u16) -> Result<(Self, UartChipVersion), &'static str> {
        let ver = identify_uart(port_addr);

        let ier_mask = if ver >= UartChipVersion::V16750 {
            IER::all()
        } else {
            IER::all() & !(IER::ENABLE_SLEEP_MODE | IER::ENABLE_LOW_POWER_MODE)
        };
        // the 16550's FIFO is broken and cannot be safely used
        let fcr_mask = if ver >= UartChipVersion::V16550A { FCR::all() } else { FCR::empty() };
        let mcr_mask = if ver >= UartChipVersion::V16750 {
            MCR::all()
        } else {
            MCR::all() & !MCR::AUTOFLOW_CONTROL
        };

        let mut uart = UartPort {
            thbr: WriteOnlyPort::new(port_addr + THBR_OFFSET, u8::MAX),
            rbr: ReadOnlyPort::new(port_addr + RBR_OFFSET, u8::MAX),
            dll: Port::new(port_addr + DLL_OFFSET, u8::MAX),
            dlh: Port::new(port_addr + DLH_OFFSET, u8::MAX),
            ier: Port::new(port_addr + IER_OFFSET, ier_mask),
            fcr: WriteOnlyPort::new(port_addr + FCR_OFFSET, fcr_mask),
            lcr: Port::new(port_addr + LCR_OFFSET, LCR::all()),
            mcr: Port::new(port_addr + MCR_OFFSET, mcr_mask),
            lsr: ReadOnlyPort::new(port_addr + LSR_OFFSET, LSR::all()),
        };

        uart.reset_to_default();
        uart.test()?;

        Ok((uart, ver))
    }

    pub fn reset_to_default(&mut self) {
        unsafe {
            self.set_baud_rate(115200);
            self.ier.write(IER::empty()); // polled operation
            self.lcr.write(LCR::WORD_LENGTH_8_BITS | LCR::NO_PARITY);
            self.mcr.write(
                MCR::DATA_TERMINAL_READY
                    | MCR::REQUEST_TO_SEND
                    | MCR::AUXILIARY_OUTPUT_1
                    | MCR::AUXILIARY_OUTPUT_2,
            );
            self.fcr.write(
                FCR::ENABLE_FIFOS
                    | FCR::CLEAR_RECEIVE_FIFO
                    | FCR::CLEAR_TRANSMIT_FIFO
                    | FCR::TRIGGER_LEVEL_1,
            );
        }
    }

    fn test(&mut self) -> Result<(), &'static str> {
        unsafe {
            let mcr = self.mcr.read().0;
            self.mcr.write(mcr | MCR::LOOPBACK_ENABLED);

            // byte sent must equal byte received
            self.thbr.write(0x2B);
            if self.rbr.read().0 != 0x2B {
                return Err("UART loopback R/W test failed");
            }

            self.mcr.write(mcr);
            Ok(())
        }
    }

    fn set_baud_rate(&mut self, baud_rate: u32) {
        const UART_FREQUENCY: u32 = 115200;

        let divisor_latch = (UART_FREQUENCY / baud_rate) as u16;
        unsafe {
            let lcr = self.lcr.read().0;
            self.lcr.write(lcr | LCR::DIVISOR_LATCH_ACCESS_BIT);
            self.dll.write((divisor_latch & 0xFF) as u8);
            self.dlh.write((divisor_latch >> 8) as u8);
            self.lcr.write(lcr);
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        while !self.lsr.read().0.contains(LSR::EMPTY_TRANSMITTER_HOLDING_REGISTER) {
            core::hint::spin_loop();
        }
        unsafe {
            self.thbr.write(byte);
        }
    }

    /// Blocking receive.
    pub fn read_byte(&mut self) -> u8 {
        while !self.lsr.read().0.contains(LSR::DATA_READY) {
            core::hint::spin_loop();
        }
        self.rbr.read().0
    }

    /// Non-blocking receive.
    pub fn try_read_byte(&mut self) -> Option<u8> {
        if self.lsr.read().0.contains(LSR::DATA_READY) {
            Some(self.rbr.read().0)
        } else {
            None
        }
    }
}

impl Write for UartPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}
