use serde::{Deserialize, Serialize};

/// Standard joypad: an 8-bit parallel-in, serial-out shift register.
/// Bit order is A, B, Select, Start, Up, Down, Left, Right.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Controller {
    buttons: u8,
    shift: u8,
    strobe: bool,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buttons(&self) -> u8 {
        self.buttons
    }

    pub fn set_buttons(&mut self, buttons: u8) {
        self.buttons = buttons;
        if self.strobe {
            self.shift = buttons;
        }
    }

    /// $4016 write. While strobe is high the register keeps reloading.
    pub fn write_strobe(&mut self, value: u8) {
        self.strobe = value & 0x01 != 0;
        self.shift = self.buttons;
    }

    /// Serial read; after eight reads the register returns 1s.
    pub fn read(&mut self) -> u8 {
        let bit = if self.strobe {
            self.buttons & 0x01
        } else {
            let bit = self.shift & 0x01;
            self.shift = (self.shift >> 1) | 0x80;
            bit
        };
        0x40 | bit
    }
}
