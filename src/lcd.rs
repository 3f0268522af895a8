/*
 *  lcd.rs
 *
 *  PostBox - posts on glass
 *  (c) 2024-26 PostBox contributors
 *
 *  HD44780 character LCD behind a PCF8574 I2C backpack, driven with
 *  the 4-bit nibble protocol.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use linux_embedded_hal::{Delay, I2cdev};
use log::debug;

use crate::error::Fault;

// PCF8574 backpack pin mapping
const RS: u8 = 0x01;
const EN: u8 = 0x04;
const BACKLIGHT: u8 = 0x08;

// controller commands
const CLEAR_DISPLAY: u8 = 0x01;
const ENTRY_MODE_SET: u8 = 0x04;
const DISPLAY_CONTROL: u8 = 0x08;
const FUNCTION_SET: u8 = 0x20;
const SET_CGRAM_ADDR: u8 = 0x40;
const SET_DDRAM_ADDR: u8 = 0x80;

// entry mode flags
const ENTRY_LEFT: u8 = 0x02;

// display control flags
const DISPLAY_ON: u8 = 0x04;

// function set flags
const TWO_LINE: u8 = 0x08;
const FONT_5X10: u8 = 0x04;

/// DDRAM base address per row. Four rows is the controller's maximum.
const ROW_OFFSETS: [u8; 4] = [0x00, 0x40, 0x14, 0x54];

// settle delays: the controller is not guaranteed ready before these
const SETTLE_NIBBLE_MS: u32 = 2;
const SETTLE_COMMAND_MS: u32 = 10;

/// Register select for a transfer.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Reg {
    Cmd,
    Data,
}

/// Open display handle: the bus connection, the device address, and
/// the geometry. Created once per initialization attempt and dropped
/// by the supervisor on any detected fault.
///
/// Generic over the bus and delay provider so the wire protocol can be
/// exercised against a recording bus without hardware.
pub struct Lcd<I2C, D> {
    i2c: I2C,
    delay: D,
    address: u8,
    cols: u8,
    rows: u8,
    /// Only `set_backlight`/`on`/`off` may flip this.
    backlight: bool,
}

impl Lcd<I2cdev, Delay> {
    /// Open the Linux I2C bus and run the controller bring-up.
    pub fn open(bus: &str, address: u8, cols: u8, rows: u8) -> Result<Self, Fault> {
        let i2c = I2cdev::new(bus)
            .map_err(|e| Fault::Bus(format!("failed to open {}: {}", bus, e)))?;
        let mut lcd = Lcd::new(i2c, Delay {}, address, cols, rows)?;
        lcd.init()?;
        Ok(lcd)
    }
}

impl<I2C, D> Lcd<I2C, D>
where
    I2C: I2c,
    D: DelayNs,
{
    pub fn new(i2c: I2C, delay: D, address: u8, cols: u8, rows: u8) -> Result<Self, Fault> {
        if rows == 0 || rows as usize > ROW_OFFSETS.len() {
            return Err(Fault::Protocol(format!("unsupported row count {}", rows)));
        }
        if cols == 0 {
            return Err(Fault::Protocol("column count must be > 0".to_string()));
        }
        if address > 0x7F {
            return Err(Fault::Protocol(format!("invalid 7-bit address 0x{:02X}", address)));
        }
        Ok(Lcd {
            i2c,
            delay,
            address,
            cols,
            rows,
            backlight: false,
        })
    }

    /// Controller bring-up. The chip wakes in 8-bit mode: two 8-bit
    /// function pulses force a known state, a third drops it to 4-bit,
    /// then the working mode is programmed command by command.
    pub fn init(&mut self) -> Result<(), Fault> {
        debug!("initializing LCD {}x{} at 0x{:02X}", self.cols, self.rows, self.address);
        self.write_nibble(0x30, Reg::Cmd)?;
        self.delay.delay_ms(1000);
        self.write_nibble(0x30, Reg::Cmd)?;
        self.delay.delay_ms(200);
        self.write_nibble(0x20, Reg::Cmd)?;
        self.delay.delay_ms(100);

        self.send(FUNCTION_SET | TWO_LINE | FONT_5X10, Reg::Cmd)?;
        self.delay.delay_ms(SETTLE_COMMAND_MS);
        self.send(DISPLAY_CONTROL | DISPLAY_ON, Reg::Cmd)?; // cursor off
        self.delay.delay_ms(SETTLE_COMMAND_MS);
        self.send(ENTRY_MODE_SET | ENTRY_LEFT, Reg::Cmd)?;
        self.delay.delay_ms(SETTLE_COMMAND_MS);
        self.send(CLEAR_DISPLAY, Reg::Cmd)?;
        self.delay.delay_ms(SETTLE_COMMAND_MS);
        self.set_backlight(true)?;
        self.delay.delay_ms(SETTLE_COMMAND_MS);
        debug!("LCD initialized");
        Ok(())
    }

    pub fn cols(&self) -> u8 {
        self.cols
    }

    pub fn rows(&self) -> u8 {
        self.rows
    }

    pub fn clear(&mut self) -> Result<(), Fault> {
        self.send(CLEAR_DISPLAY, Reg::Cmd)
    }

    /// Park the cursor at DDRAM address zero. This needs a live bus
    /// round-trip but leaves the displayed content untouched, which
    /// makes it the liveness probe of choice.
    pub fn home(&mut self) -> Result<(), Fault> {
        self.send(SET_DDRAM_ADDR, Reg::Cmd)
    }

    /// Write `text` on `row`, truncated to the display width. The row
    /// address command always precedes the character writes.
    pub fn write_line(&mut self, text: &str, row: u8) -> Result<(), Fault> {
        if row >= self.rows {
            return Err(Fault::Protocol(format!("line index {} out of range", row)));
        }
        self.send(SET_DDRAM_ADDR | ROW_OFFSETS[row as usize], Reg::Cmd)?;
        for ch in text.chars().take(self.cols as usize) {
            self.send(charset_byte(ch), Reg::Data)?;
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub fn set_cursor(&mut self, x: u8, y: u8) -> Result<(), Fault> {
        if x >= self.cols || y >= self.rows {
            return Err(Fault::Protocol(format!("cursor ({},{}) out of range", x, y)));
        }
        self.send(SET_DDRAM_ADDR | (ROW_OFFSETS[y as usize] + x), Reg::Cmd)
    }

    /// Upload a custom 5x8 glyph into CGRAM slot 0..=7, then return
    /// the address pointer to DDRAM so ordinary writes continue.
    #[allow(dead_code)]
    pub fn create_glyph(&mut self, slot: u8, bitmap: &[u8; 8]) -> Result<(), Fault> {
        if slot > 7 {
            return Err(Fault::Protocol(format!("glyph slot {} out of range", slot)));
        }
        self.send(SET_CGRAM_ADDR | (slot << 3), Reg::Cmd)?;
        for line in bitmap {
            self.send(*line, Reg::Data)?;
        }
        self.send(SET_DDRAM_ADDR, Reg::Cmd)
    }

    pub fn set_backlight(&mut self, lit: bool) -> Result<(), Fault> {
        self.backlight = lit;
        // push the new backlight bit onto the wire
        self.send(DISPLAY_CONTROL | DISPLAY_ON, Reg::Cmd)
    }

    #[allow(dead_code)]
    pub fn on(&mut self) -> Result<(), Fault> {
        self.backlight = true;
        self.send(DISPLAY_CONTROL | DISPLAY_ON, Reg::Cmd)
    }

    #[allow(dead_code)]
    pub fn off(&mut self) -> Result<(), Fault> {
        self.backlight = false;
        self.send(DISPLAY_CONTROL, Reg::Cmd)
    }

    /// One byte as two nibble transactions, high nibble first.
    fn send(&mut self, byte: u8, reg: Reg) -> Result<(), Fault> {
        self.write_nibble(byte, reg)?;
        self.write_nibble(byte << 4, reg)
    }

    /// One nibble transaction: assert the data bits, pulse the enable
    /// line, release it. Each write is followed by the minimum settle
    /// delay the controller's timing requires.
    fn write_nibble(&mut self, value: u8, reg: Reg) -> Result<(), Fault> {
        let bits = (value & 0xF0) | self.ctrl_bits(reg);
        self.raw_write(bits)?;
        self.delay.delay_ms(SETTLE_NIBBLE_MS);
        self.raw_write(bits | EN)?;
        self.delay.delay_ms(SETTLE_NIBBLE_MS);
        self.raw_write(bits)?;
        self.delay.delay_ms(SETTLE_NIBBLE_MS);
        Ok(())
    }

    fn ctrl_bits(&self, reg: Reg) -> u8 {
        let mut bits = if self.backlight { BACKLIGHT } else { 0 };
        if reg == Reg::Data {
            bits |= RS;
        }
        bits
    }

    fn raw_write(&mut self, bits: u8) -> Result<(), Fault> {
        self.i2c
            .write(self.address, &[bits])
            .map_err(|e| Fault::Bus(format!("i2c write failed: {:?}", e)))
    }
}

/// Map a character onto the controller's 8-bit charset. The layout
/// engine already strips anything above 0xFF; anything that slips
/// through renders as '?'.
fn charset_byte(ch: char) -> u8 {
    let code = ch as u32;
    if code <= 0xFF { code as u8 } else { b'?' }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{EN, RS};
    use embedded_hal::delay::DelayNs;
    use embedded_hal::i2c::{self, ErrorType, I2c, Operation};
    use std::sync::{Arc, Mutex};

    /// Records every byte put on the wire, optionally failing writes.
    pub struct RecordingBus {
        written: Arc<Mutex<Vec<u8>>>,
        fail_writes: bool,
    }

    impl RecordingBus {
        pub fn new() -> Self {
            RecordingBus {
                written: Arc::new(Mutex::new(Vec::new())),
                fail_writes: false,
            }
        }

        pub fn failing() -> Self {
            RecordingBus {
                written: Arc::new(Mutex::new(Vec::new())),
                fail_writes: true,
            }
        }

        /// Shared handle onto the wire log, kept by the test before
        /// the bus moves into the driver.
        pub fn log(&self) -> Arc<Mutex<Vec<u8>>> {
            Arc::clone(&self.written)
        }
    }

    #[derive(Debug)]
    pub struct SimulatedBusError;

    impl i2c::Error for SimulatedBusError {
        fn kind(&self) -> i2c::ErrorKind {
            i2c::ErrorKind::Other
        }
    }

    impl ErrorType for RecordingBus {
        type Error = SimulatedBusError;
    }

    impl I2c for RecordingBus {
        fn transaction(
            &mut self,
            _address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), SimulatedBusError> {
            if self.fail_writes {
                return Err(SimulatedBusError);
            }
            let mut written = self.written.lock().unwrap();
            for op in operations.iter() {
                if let Operation::Write(bytes) = op {
                    written.extend_from_slice(bytes);
                }
            }
            Ok(())
        }
    }

    pub struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    /// The nibble values latched by each enable pulse, with the
    /// register-select state: (nibble, is_data).
    pub fn enable_pulses(written: &[u8]) -> Vec<(u8, bool)> {
        written
            .iter()
            .copied()
            .filter(|b| b & EN != 0)
            .map(|b| (b & 0xF0, b & RS != 0))
            .collect()
    }

    /// Pair up latched nibbles into full-byte transactions:
    /// (byte, is_data). `skip` discards leading unpaired bring-up
    /// pulses.
    pub fn transactions(written: &[u8], skip: usize) -> Vec<(u8, bool)> {
        enable_pulses(written)[skip..]
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| (pair[0].0 | (pair[1].0 >> 4), pair[0].1))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{enable_pulses, transactions, NoDelay, RecordingBus};
    use super::*;

    fn test_lcd(cols: u8, rows: u8) -> (Lcd<RecordingBus, NoDelay>, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let bus = RecordingBus::new();
        let log = bus.log();
        let lcd = Lcd::new(bus, NoDelay, 0x27, cols, rows).unwrap();
        (lcd, log)
    }

    #[test]
    fn test_geometry_is_validated() {
        assert!(Lcd::new(RecordingBus::new(), NoDelay, 0x27, 20, 5).is_err());
        assert!(Lcd::new(RecordingBus::new(), NoDelay, 0x27, 0, 4).is_err());
        assert!(Lcd::new(RecordingBus::new(), NoDelay, 0x90, 20, 4).is_err());
        assert!(Lcd::new(RecordingBus::new(), NoDelay, 0x27, 16, 2).is_ok());
    }

    #[test]
    fn test_bring_up_sequence() {
        let (mut lcd, log) = test_lcd(20, 4);
        lcd.init().unwrap();

        let pulses = enable_pulses(&log.lock().unwrap());
        // three raw pulses: 8-bit, 8-bit, drop to 4-bit
        assert_eq!(&pulses[..3], &[(0x30, false), (0x30, false), (0x20, false)]);

        let cmds = transactions(&log.lock().unwrap(), 3);
        assert_eq!(
            cmds,
            vec![
                (FUNCTION_SET | TWO_LINE | FONT_5X10, false),
                (DISPLAY_CONTROL | DISPLAY_ON, false),
                (ENTRY_MODE_SET | ENTRY_LEFT, false),
                (CLEAR_DISPLAY, false),
                (DISPLAY_CONTROL | DISPLAY_ON, false),
            ]
        );
    }

    #[test]
    fn test_write_line_sets_row_address_before_characters() {
        let (mut lcd, log) = test_lcd(20, 4);
        lcd.write_line("Hi", 1).unwrap();

        let txs = transactions(&log.lock().unwrap(), 0);
        assert_eq!(
            txs,
            vec![(SET_DDRAM_ADDR | 0x40, false), (b'H', true), (b'i', true)]
        );
    }

    #[test]
    fn test_write_line_truncates_to_display_width() {
        let (mut lcd, log) = test_lcd(20, 4);
        lcd.write_line("this line is far too long for a twenty column panel", 0).unwrap();

        let txs = transactions(&log.lock().unwrap(), 0);
        let chars = txs.iter().filter(|(_, is_data)| *is_data).count();
        assert_eq!(chars, 20);
    }

    #[test]
    fn test_write_line_rejects_bad_row() {
        let (mut lcd, log) = test_lcd(20, 2);
        assert!(matches!(lcd.write_line("x", 2), Err(Fault::Protocol(_))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_home_is_idempotent_and_writes_no_characters() {
        let (mut lcd, log) = test_lcd(20, 4);
        lcd.home().unwrap();
        let first = transactions(&log.lock().unwrap(), 0);
        lcd.home().unwrap();
        let both = transactions(&log.lock().unwrap(), 0);

        assert_eq!(first, vec![(SET_DDRAM_ADDR, false)]);
        assert_eq!(both, vec![(SET_DDRAM_ADDR, false), (SET_DDRAM_ADDR, false)]);
        assert!(both.iter().all(|(_, is_data)| !is_data));
    }

    #[test]
    fn test_glyph_upload_returns_to_ddram() {
        let (mut lcd, log) = test_lcd(20, 4);
        let bitmap = [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11, 0x00];
        lcd.create_glyph(2, &bitmap).unwrap();

        let txs = transactions(&log.lock().unwrap(), 0);
        assert_eq!(txs[0], (SET_CGRAM_ADDR | (2 << 3), false));
        assert_eq!(txs.len(), 10);
        assert!(txs[1..9].iter().all(|(_, is_data)| *is_data));
        assert_eq!(txs[9], (SET_DDRAM_ADDR, false));

        assert!(matches!(lcd.create_glyph(8, &bitmap), Err(Fault::Protocol(_))));
    }

    #[test]
    fn test_backlight_bit_follows_explicit_state_only() {
        let (mut lcd, log) = test_lcd(20, 4);
        lcd.clear().unwrap();
        assert!(log.lock().unwrap().iter().all(|b| b & BACKLIGHT == 0));

        log.lock().unwrap().clear();
        lcd.set_backlight(true).unwrap();
        lcd.clear().unwrap();
        assert!(log.lock().unwrap().iter().all(|b| b & BACKLIGHT != 0));
    }

    #[test]
    fn test_bus_failure_surfaces_as_bus_fault() {
        let mut lcd = Lcd::new(RecordingBus::failing(), NoDelay, 0x27, 20, 4).unwrap();
        assert!(matches!(lcd.clear(), Err(Fault::Bus(_))));
    }
}
