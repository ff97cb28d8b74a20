use serde::{Deserialize, Serialize};

use super::mapper::{Mapper, Mirroring};

const NAME_TABLE_SIZE: usize = 0x400;
const VRAM_SIZE: usize = 4 * NAME_TABLE_SIZE;
const PALETTE_SIZE: usize = 32;

/// PPU address space: pattern tables through the mapper, four logical
/// nametables over 4 KB of console RAM, and palette RAM.
///
/// Only the first 2 KB of `vram` is reachable unless the cartridge asks for
/// four-screen mirroring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PictureBus {
    #[serde(with = "crate::nes::state::base64_array")]
    vram: [u8; VRAM_SIZE],
    palette: [u8; PALETTE_SIZE],
    mirroring: Mirroring,
    name_tables: [usize; 4],
}

impl Default for PictureBus {
    fn default() -> Self {
        let mut bus = Self {
            vram: [0; VRAM_SIZE],
            palette: [0x0F; PALETTE_SIZE],
            mirroring: Mirroring::Horizontal,
            name_tables: [0; 4],
        };
        bus.update_mirroring(Mirroring::Horizontal);
        bus
    }
}

impl PictureBus {
    pub fn new(mirroring: Mirroring) -> Self {
        let mut bus = Self::default();
        bus.update_mirroring(mirroring);
        bus
    }

    pub fn mirroring(&self) -> Mirroring {
        self.mirroring
    }

    /// Recomputes the physical offset behind each of the four logical
    /// nametables.
    pub fn update_mirroring(&mut self, mirroring: Mirroring) {
        const A: usize = 0;
        const B: usize = NAME_TABLE_SIZE;

        self.mirroring = mirroring;
        self.name_tables = match mirroring {
            Mirroring::Horizontal => [A, A, B, B],
            Mirroring::Vertical => [A, B, A, B],
            Mirroring::OneScreenLower => [A; 4],
            Mirroring::OneScreenUpper => [B; 4],
            Mirroring::FourScreen => [0, B, 2 * B, 3 * B],
        };
    }

    pub fn read(&self, mapper: &Mapper, addr: u16) -> u8 {
        match addr & 0x3FFF {
            addr @ 0x0000..=0x1FFF => mapper.read_graphics(addr),
            addr @ 0x2000..=0x3EFF => self.vram[self.name_table_index(addr)],
            addr => self.palette[palette_index(addr)],
        }
    }

    pub fn write(&mut self, mapper: &mut Mapper, addr: u16, value: u8) {
        match addr & 0x3FFF {
            addr @ 0x0000..=0x1FFF => mapper.write_graphics(addr, value),
            addr @ 0x2000..=0x3EFF => {
                let index = self.name_table_index(addr);
                self.vram[index] = value;
            }
            addr => self.palette[palette_index(addr)] = value,
        }
    }

    /// Palette entry for a 5-bit pixel index, backdrop mirrors applied.
    pub fn read_palette(&self, index: u8) -> u8 {
        self.palette[palette_index(0x3F00 | index as u16)]
    }

    fn name_table_index(&self, addr: u16) -> usize {
        let offset = (addr as usize - 0x2000) % VRAM_SIZE;
        self.name_tables[offset / NAME_TABLE_SIZE] + (offset % NAME_TABLE_SIZE)
    }
}

/// $3F10/$3F14/$3F18/$3F1C alias the background entries below them.
fn palette_index(addr: u16) -> usize {
    let mut index = (addr as usize) % PALETTE_SIZE;
    if index >= 16 && (index & 0x03) == 0 {
        index -= 16;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::Cartridge;

    fn chr_ram_mapper() -> Mapper {
        Mapper::new(Cartridge {
            mapper_id: 0,
            mirroring: Mirroring::Horizontal,
            has_extended_ram: false,
            prg_rom: vec![0; 0x4000],
            chr_rom: Vec::new(),
        })
        .unwrap()
    }

    #[test]
    fn horizontal_mirroring_shares_left_right_pairs() {
        let mut mapper = chr_ram_mapper();
        let mut bus = PictureBus::new(Mirroring::Horizontal);

        bus.write(&mut mapper, 0x2005, 0x11);
        bus.write(&mut mapper, 0x2805, 0x22);
        assert_eq!(bus.read(&mapper, 0x2405), 0x11);
        assert_eq!(bus.read(&mapper, 0x2C05), 0x22);
        assert_eq!(bus.read(&mapper, 0x3005), 0x11);
    }

    #[test]
    fn vertical_and_one_screen_mirroring() {
        let mut mapper = chr_ram_mapper();
        let mut bus = PictureBus::new(Mirroring::Vertical);

        bus.write(&mut mapper, 0x2010, 0x33);
        bus.write(&mut mapper, 0x2410, 0x44);
        assert_eq!(bus.read(&mapper, 0x2810), 0x33);
        assert_eq!(bus.read(&mapper, 0x2C10), 0x44);

        bus.update_mirroring(Mirroring::OneScreenUpper);
        for base in [0x2000u16, 0x2400, 0x2800, 0x2C00] {
            assert_eq!(bus.read(&mapper, base + 0x10), 0x44);
        }

        bus.update_mirroring(Mirroring::FourScreen);
        bus.write(&mut mapper, 0x2C10, 0x55);
        assert_eq!(bus.read(&mapper, 0x2810), 0x00);
        assert_eq!(bus.read(&mapper, 0x2C10), 0x55);
    }

    #[test]
    fn palette_backdrop_aliases() {
        let mut mapper = chr_ram_mapper();
        let mut bus = PictureBus::new(Mirroring::Horizontal);

        bus.write(&mut mapper, 0x3F10, 0x21);
        assert_eq!(bus.read(&mapper, 0x3F00), 0x21);
        assert_eq!(bus.read_palette(0x10), 0x21);
        bus.write(&mut mapper, 0x3F25, 0x16);
        assert_eq!(bus.read(&mapper, 0x3F05), 0x16);
    }

    #[test]
    fn pattern_space_goes_through_mapper() {
        let mut mapper = chr_ram_mapper();
        let mut bus = PictureBus::new(Mirroring::Horizontal);

        bus.write(&mut mapper, 0x1234, 0x9C);
        assert_eq!(mapper.read_graphics(0x1234), 0x9C);
        assert_eq!(bus.read(&mapper, 0x5234), 0x9C);
    }
}
