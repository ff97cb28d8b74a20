use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::cartridge::{CHR_BANK_SIZE, Cartridge, PRG_BANK_SIZE};

const PRG_SLOT_SIZE: usize = 0x2000;
const CHR_SLOT_SIZE: usize = 0x0400;
const PRG_SLOTS: usize = 4;
const CHR_SLOTS: usize = 8;
const CHR_RAM_SIZE: usize = 0x2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    FourScreen,
    OneScreenLower,
    OneScreenUpper,
}

pub fn mapper_name(mapper_id: u8) -> &'static str {
    match mapper_id {
        0 => "NROM",
        1 => "SxROM (MMC1)",
        2 => "UxROM",
        3 => "CNROM",
        4 => "TxROM (MMC3)",
        7 => "AxROM",
        11 => "Color Dreams",
        66 => "GxROM",
        _ => "Unsupported",
    }
}

/// Board-specific registers. Adding a board means adding a variant here and
/// an arm in every `match self.board`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Board {
    Nrom,
    Sxrom(SxromRegisters),
    Uxrom { prg_bank: u8 },
    Cnrom { chr_bank: u8 },
    Mmc3(Mmc3Registers),
    Axrom { prg_bank: u8 },
    ColorDreams { prg_bank: u8, chr_bank: u8 },
    Gxrom { prg_bank: u8, chr_bank: u8 },
}

impl Board {
    fn for_mapper_id(mapper_id: u8) -> Option<Self> {
        let board = match mapper_id {
            0 => Board::Nrom,
            1 => Board::Sxrom(SxromRegisters::default()),
            2 => Board::Uxrom { prg_bank: 0 },
            3 => Board::Cnrom { chr_bank: 0 },
            4 => Board::Mmc3(Mmc3Registers::default()),
            7 => Board::Axrom { prg_bank: 0 },
            11 => Board::ColorDreams {
                prg_bank: 0,
                chr_bank: 0,
            },
            66 => Board::Gxrom {
                prg_bank: 0,
                chr_bank: 0,
            },
            _ => return None,
        };
        Some(board)
    }

    fn mapper_id(&self) -> u8 {
        match self {
            Board::Nrom => 0,
            Board::Sxrom(_) => 1,
            Board::Uxrom { .. } => 2,
            Board::Cnrom { .. } => 3,
            Board::Mmc3(_) => 4,
            Board::Axrom { .. } => 7,
            Board::ColorDreams { .. } => 11,
            Board::Gxrom { .. } => 66,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SxromRegisters {
    shift_register: u8,
    write_count: u8,
    prg_mode: u8,
    chr_4k_mode: bool,
    prg_bank: u8,
    chr_bank0: u8,
    chr_bank1: u8,
}

impl Default for SxromRegisters {
    fn default() -> Self {
        Self {
            shift_register: 0,
            write_count: 0,
            prg_mode: 3,
            chr_4k_mode: false,
            prg_bank: 0,
            chr_bank0: 0,
            chr_bank1: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mmc3Registers {
    bank_select: u8,
    bank_regs: [u8; 8],
    irq_latch: u8,
    irq_counter: u8,
    irq_reload: bool,
    irq_enabled: bool,
    irq_pending: bool,
}

/// Snapshot of everything a mapper mutates at runtime. The ROM image itself
/// is stored once, in the cartridge section of a save state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperState {
    pub board: Board,
    pub mirroring: Mirroring,
    pub prg_slots: [usize; PRG_SLOTS],
    pub chr_slots: [usize; CHR_SLOTS],
    #[serde(with = "crate::nes::state::base64_vec")]
    pub chr_ram: Vec<u8>,
}

/// Physical offsets backing each 8 KB program slot ($8000-$FFFF) and each
/// 1 KB graphics slot ($0000-$1FFF). Every offset is reduced modulo the
/// backing memory size, so no header can produce an out-of-bounds index.
struct BankLayout {
    prg_len: usize,
    chr_len: usize,
    prg: [usize; PRG_SLOTS],
    chr: [usize; CHR_SLOTS],
}

impl BankLayout {
    fn new(prg_len: usize, chr_len: usize) -> Self {
        Self {
            prg_len: prg_len.max(1),
            chr_len: chr_len.max(1),
            prg: [0; PRG_SLOTS],
            chr: [0; CHR_SLOTS],
        }
    }

    fn prg_banks_16k(&self) -> usize {
        (self.prg_len / 0x4000).max(1)
    }

    fn prg_banks_8k(&self) -> usize {
        (self.prg_len / PRG_SLOT_SIZE).max(1)
    }

    fn prg_8k(&mut self, slot: usize, bank: usize) {
        self.prg[slot] = (bank * PRG_SLOT_SIZE) % self.prg_len;
    }

    fn prg_16k(&mut self, half: usize, bank: usize) {
        let base = bank * 0x4000;
        self.prg[half * 2] = base % self.prg_len;
        self.prg[half * 2 + 1] = (base + PRG_SLOT_SIZE) % self.prg_len;
    }

    fn prg_32k(&mut self, bank: usize) {
        let base = bank * 0x8000;
        for (slot, offset) in self.prg.iter_mut().enumerate() {
            *offset = (base + slot * PRG_SLOT_SIZE) % self.prg_len;
        }
    }

    fn chr_1k(&mut self, slot: usize, bank: usize) {
        self.chr[slot] = (bank * CHR_SLOT_SIZE) % self.chr_len;
    }

    fn chr_4k(&mut self, half: usize, bank: usize) {
        let base = bank * 0x1000;
        for i in 0..4 {
            self.chr[half * 4 + i] = (base + i * CHR_SLOT_SIZE) % self.chr_len;
        }
    }

    fn chr_8k(&mut self, bank: usize) {
        let base = bank * 0x2000;
        for (slot, offset) in self.chr.iter_mut().enumerate() {
            *offset = (base + slot * CHR_SLOT_SIZE) % self.chr_len;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapper {
    cartridge: Cartridge,
    chr_ram: Vec<u8>,
    board: Board,
    mirroring: Mirroring,
    prg_slots: [usize; PRG_SLOTS],
    chr_slots: [usize; CHR_SLOTS],
}

impl Mapper {
    pub fn new(cartridge: Cartridge) -> Result<Self> {
        check_rom_size("PRG", cartridge.prg_rom.len(), PRG_BANK_SIZE)?;
        if !cartridge.chr_rom.is_empty() {
            check_rom_size("CHR", cartridge.chr_rom.len(), CHR_BANK_SIZE)?;
        }
        let Some(board) = Board::for_mapper_id(cartridge.mapper_id) else {
            bail!(
                "mapper {} ({}) is not implemented",
                cartridge.mapper_id,
                mapper_name(cartridge.mapper_id)
            );
        };

        let chr_ram = if cartridge.uses_chr_ram() {
            vec![0; CHR_RAM_SIZE]
        } else {
            Vec::new()
        };
        let mirroring = cartridge.mirroring;
        let mut mapper = Self {
            cartridge,
            chr_ram,
            board,
            mirroring,
            prg_slots: [0; PRG_SLOTS],
            chr_slots: [0; CHR_SLOTS],
        };
        mapper.update_banks();
        Ok(mapper)
    }

    pub fn cartridge(&self) -> &Cartridge {
        &self.cartridge
    }

    pub fn mapper_id(&self) -> u8 {
        self.board.mapper_id()
    }

    pub fn name(&self) -> &'static str {
        mapper_name(self.mapper_id())
    }

    pub fn name_table_mirroring(&self) -> Mirroring {
        self.mirroring
    }

    pub fn has_extended_ram(&self) -> bool {
        self.cartridge.has_extended_ram || matches!(self.board, Board::Sxrom(_) | Board::Mmc3(_))
    }

    pub fn irq_pending(&self) -> bool {
        match &self.board {
            Board::Mmc3(regs) => regs.irq_pending,
            _ => false,
        }
    }

    pub fn read_program(&self, addr: u16) -> u8 {
        if addr < 0x8000 {
            return 0;
        }
        let slot = ((addr as usize) - 0x8000) / PRG_SLOT_SIZE;
        let index = self.prg_slots[slot] + (addr as usize & (PRG_SLOT_SIZE - 1));
        let prg = &self.cartridge.prg_rom;
        prg[index % prg.len()]
    }

    pub fn write_program(&mut self, addr: u16, value: u8) {
        if addr < 0x8000 {
            return;
        }

        match &mut self.board {
            Board::Nrom => {
                log::debug!("write ${value:02X} to NROM program space ${addr:04X} ignored");
                return;
            }
            Board::Sxrom(regs) => {
                if let Some(mirroring) = regs.write(addr, value) {
                    self.mirroring = mirroring;
                }
            }
            Board::Uxrom { prg_bank } => *prg_bank = value,
            Board::Cnrom { chr_bank } => *chr_bank = value & 0x03,
            Board::Mmc3(regs) => {
                if let Some(mirroring) = regs.write(addr, value) {
                    if self.cartridge.mirroring != Mirroring::FourScreen {
                        self.mirroring = mirroring;
                    }
                }
            }
            Board::Axrom { prg_bank } => {
                *prg_bank = value & 0x07;
                self.mirroring = if (value & 0x10) != 0 {
                    Mirroring::OneScreenUpper
                } else {
                    Mirroring::OneScreenLower
                };
            }
            Board::ColorDreams { prg_bank, chr_bank } => {
                *prg_bank = value & 0x03;
                *chr_bank = value >> 4;
            }
            Board::Gxrom { prg_bank, chr_bank } => {
                *prg_bank = (value >> 4) & 0x03;
                *chr_bank = value & 0x03;
            }
        }

        self.update_banks();
    }

    pub fn read_graphics(&self, addr: u16) -> u8 {
        let index = self.chr_index(addr);
        if self.cartridge.uses_chr_ram() {
            self.chr_ram[index % self.chr_ram.len()]
        } else {
            let chr = &self.cartridge.chr_rom;
            chr[index % chr.len()]
        }
    }

    pub fn write_graphics(&mut self, addr: u16, value: u8) {
        if !self.cartridge.uses_chr_ram() {
            log::debug!("write ${value:02X} to CHR ROM ${addr:04X} ignored");
            return;
        }
        let index = self.chr_index(addr) % self.chr_ram.len();
        self.chr_ram[index] = value;
    }

    /// Clocked by the PPU once per rendered scanline.
    pub fn clock_scanline(&mut self) {
        if let Board::Mmc3(regs) = &mut self.board {
            regs.clock_irq_counter();
        }
    }

    pub fn state(&self) -> MapperState {
        MapperState {
            board: self.board.clone(),
            mirroring: self.mirroring,
            prg_slots: self.prg_slots,
            chr_slots: self.chr_slots,
            chr_ram: self.chr_ram.clone(),
        }
    }

    /// Applies a snapshot. Bank tables are recomputed from the restored
    /// registers rather than trusted from the snapshot.
    pub fn restore(&mut self, state: MapperState) -> Result<()> {
        if state.board.mapper_id() != self.cartridge.mapper_id {
            bail!(
                "mapper state is for mapper {}, cartridge uses mapper {}",
                state.board.mapper_id(),
                self.cartridge.mapper_id
            );
        }
        if state.chr_ram.len() != self.chr_ram.len() {
            bail!(
                "CHR RAM snapshot is {} bytes, expected {}",
                state.chr_ram.len(),
                self.chr_ram.len()
            );
        }
        if let Board::Sxrom(regs) = &state.board {
            if regs.write_count >= 5 {
                bail!("SxROM shift register holds {} bits, at most 4 allowed", regs.write_count);
            }
        }

        self.board = state.board;
        self.mirroring = state.mirroring;
        self.chr_ram = state.chr_ram;
        self.update_banks();
        Ok(())
    }

    fn chr_index(&self, addr: u16) -> usize {
        let addr = addr as usize & 0x1FFF;
        self.chr_slots[addr / CHR_SLOT_SIZE] + (addr & (CHR_SLOT_SIZE - 1))
    }

    fn chr_len(&self) -> usize {
        if self.cartridge.uses_chr_ram() {
            self.chr_ram.len()
        } else {
            self.cartridge.chr_rom.len()
        }
    }

    fn update_banks(&mut self) {
        let mut layout = BankLayout::new(self.cartridge.prg_rom.len(), self.chr_len());

        match &self.board {
            Board::Nrom => {
                layout.prg_32k(0);
                layout.chr_8k(0);
            }
            Board::Sxrom(regs) => {
                let bank = regs.prg_bank as usize;
                match regs.prg_mode {
                    0 | 1 => layout.prg_32k(bank >> 1),
                    2 => {
                        layout.prg_16k(0, 0);
                        layout.prg_16k(1, bank);
                    }
                    _ => {
                        layout.prg_16k(0, bank);
                        let last = layout.prg_banks_16k() - 1;
                        layout.prg_16k(1, last);
                    }
                }
                if regs.chr_4k_mode {
                    layout.chr_4k(0, regs.chr_bank0 as usize);
                    layout.chr_4k(1, regs.chr_bank1 as usize);
                } else {
                    layout.chr_8k((regs.chr_bank0 >> 1) as usize);
                }
            }
            Board::Uxrom { prg_bank } => {
                layout.prg_16k(0, *prg_bank as usize);
                let last = layout.prg_banks_16k() - 1;
                layout.prg_16k(1, last);
                layout.chr_8k(0);
            }
            Board::Cnrom { chr_bank } => {
                layout.prg_32k(0);
                layout.chr_8k(*chr_bank as usize);
            }
            Board::Mmc3(regs) => {
                let count = layout.prg_banks_8k();
                let second_last = count.saturating_sub(2);
                let r6 = regs.bank_regs[6] as usize;
                let r7 = regs.bank_regs[7] as usize;
                if (regs.bank_select & 0x40) == 0 {
                    layout.prg_8k(0, r6);
                    layout.prg_8k(2, second_last);
                } else {
                    layout.prg_8k(0, second_last);
                    layout.prg_8k(2, r6);
                }
                layout.prg_8k(1, r7);
                layout.prg_8k(3, count - 1);

                let r = regs.bank_regs.map(|b| b as usize);
                let two_k = [r[0] & !1, (r[0] & !1) + 1, r[1] & !1, (r[1] & !1) + 1];
                let one_k = [r[2], r[3], r[4], r[5]];
                let (low, high) = if (regs.bank_select & 0x80) == 0 {
                    (two_k, one_k)
                } else {
                    (one_k, two_k)
                };
                for i in 0..4 {
                    layout.chr_1k(i, low[i]);
                    layout.chr_1k(i + 4, high[i]);
                }
            }
            Board::Axrom { prg_bank } => {
                layout.prg_32k(*prg_bank as usize);
                layout.chr_8k(0);
            }
            Board::ColorDreams { prg_bank, chr_bank } | Board::Gxrom { prg_bank, chr_bank } => {
                layout.prg_32k(*prg_bank as usize);
                layout.chr_8k(*chr_bank as usize);
            }
        }

        self.prg_slots = layout.prg;
        self.chr_slots = layout.chr;
    }
}

/// ROM sizes must be whole iNES banks, at least one and at most 255.
fn check_rom_size(kind: &str, len: usize, bank_size: usize) -> Result<()> {
    if len == 0 || len % bank_size != 0 || len / bank_size > u8::MAX as usize {
        bail!(
            "{kind} ROM is {len} bytes, expected 1 to 255 banks of {} KB",
            bank_size / 1024
        );
    }
    Ok(())
}

impl SxromRegisters {
    /// Serial port write. Returns the new mirroring when the control register
    /// is committed.
    fn write(&mut self, addr: u16, value: u8) -> Option<Mirroring> {
        if (value & 0x80) != 0 {
            self.shift_register = 0;
            self.write_count = 0;
            self.prg_mode = 3;
            return None;
        }

        self.shift_register = (self.shift_register >> 1) | ((value & 0x01) << 4);
        self.write_count += 1;
        if self.write_count < 5 {
            return None;
        }

        let data = self.shift_register;
        self.shift_register = 0;
        self.write_count = 0;

        match addr {
            0x8000..=0x9FFF => {
                self.chr_4k_mode = (data & 0x10) != 0;
                self.prg_mode = (data >> 2) & 0x03;
                Some(match data & 0x03 {
                    0 => Mirroring::OneScreenLower,
                    1 => Mirroring::OneScreenUpper,
                    2 => Mirroring::Vertical,
                    _ => Mirroring::Horizontal,
                })
            }
            0xA000..=0xBFFF => {
                self.chr_bank0 = data;
                None
            }
            0xC000..=0xDFFF => {
                self.chr_bank1 = data;
                None
            }
            _ => {
                // Bit 4 is the PRG RAM chip enable, which this board ignores.
                self.prg_bank = data & 0x0F;
                None
            }
        }
    }
}

impl Mmc3Registers {
    fn write(&mut self, addr: u16, value: u8) -> Option<Mirroring> {
        let even = (addr & 1) == 0;
        match (addr, even) {
            (0x8000..=0x9FFF, true) => self.bank_select = value,
            (0x8000..=0x9FFF, false) => {
                let target = (self.bank_select & 0x07) as usize;
                self.bank_regs[target] = value;
            }
            (0xA000..=0xBFFF, true) => {
                return Some(if (value & 0x01) == 0 {
                    Mirroring::Vertical
                } else {
                    Mirroring::Horizontal
                });
            }
            (0xA000..=0xBFFF, false) => {}
            (0xC000..=0xDFFF, true) => self.irq_latch = value,
            (0xC000..=0xDFFF, false) => self.irq_reload = true,
            (_, true) => {
                self.irq_enabled = false;
                self.irq_pending = false;
            }
            (_, false) => self.irq_enabled = true,
        }
        None
    }

    fn clock_irq_counter(&mut self) {
        if self.irq_counter == 0 || self.irq_reload {
            self.irq_counter = self.irq_latch;
            self.irq_reload = false;
        } else {
            self.irq_counter -= 1;
        }

        if self.irq_counter == 0 && self.irq_enabled {
            self.irq_pending = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned_banks(total_size: usize, bank_size: usize) -> Vec<u8> {
        let mut data = vec![0u8; total_size];
        for (bank, chunk) in data.chunks_mut(bank_size).enumerate() {
            chunk.fill((bank as u8).wrapping_add(1));
        }
        data
    }

    fn make_cart(mapper_id: u8, prg_rom: Vec<u8>, chr_rom: Vec<u8>) -> Cartridge {
        Cartridge {
            mapper_id,
            mirroring: Mirroring::Horizontal,
            has_extended_ram: false,
            prg_rom,
            chr_rom,
        }
    }

    fn sxrom_write(mapper: &mut Mapper, addr: u16, value: u8) {
        for bit in 0..5 {
            mapper.write_program(addr, (value >> bit) & 0x01);
        }
    }

    #[test]
    fn unknown_mapper_is_rejected() {
        let cart = make_cart(200, vec![0; 0x4000], vec![0; 0x2000]);
        assert!(Mapper::new(cart).is_err());
    }

    #[test]
    fn nrom_mirrors_single_program_bank() {
        let mut prg = vec![0u8; 0x4000];
        prg[0x0123] = 0xAB;
        let mapper = Mapper::new(make_cart(0, prg, vec![0; 0x2000])).unwrap();

        assert_eq!(mapper.read_program(0x8123), 0xAB);
        assert_eq!(mapper.read_program(0xC123), 0xAB);
    }

    #[test]
    fn nrom_uses_chr_ram_when_cartridge_has_none() {
        let mut mapper = Mapper::new(make_cart(0, vec![0; 0x8000], Vec::new())).unwrap();
        mapper.write_graphics(0x1FFF, 0x5A);
        assert_eq!(mapper.read_graphics(0x1FFF), 0x5A);
    }

    #[test]
    fn chr_rom_writes_are_dropped() {
        let chr = patterned_banks(0x2000, 0x2000);
        let mut mapper = Mapper::new(make_cart(0, vec![0; 0x8000], chr)).unwrap();
        mapper.write_graphics(0x0010, 0xFF);
        assert_eq!(mapper.read_graphics(0x0010), 1);
    }

    #[test]
    fn uxrom_keeps_last_bank_fixed() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(2, prg, Vec::new())).unwrap();

        for bank in 0..4u8 {
            mapper.write_program(0x8000, bank);
            for addr in [0x8000u16, 0x9FFF, 0xA000, 0xBFFF] {
                assert_eq!(mapper.read_program(addr), bank + 1);
            }
            for addr in [0xC000u16, 0xDFFF, 0xFFFF] {
                assert_eq!(mapper.read_program(addr), 4);
            }
        }
    }

    #[test]
    fn out_of_range_bank_wraps_to_image_size() {
        let prg = patterned_banks(3 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(2, prg, Vec::new())).unwrap();

        mapper.write_program(0x8000, 0xFF);
        // 0xFF * 16K modulo 48K lands on bank 0.
        assert_eq!(mapper.read_program(0x8000), 1);
        assert_eq!(mapper.read_program(0xC000), 3);
    }

    #[test]
    fn cnrom_switches_chr_bank_with_two_bits() {
        let prg = patterned_banks(0x8000, 0x4000);
        let chr = patterned_banks(4 * 0x2000, 0x2000);
        let mut mapper = Mapper::new(make_cart(3, prg, chr)).unwrap();

        for value in 0..8u8 {
            mapper.write_program(0xFFFF, value);
            let expected = (value & 0x03) + 1;
            assert_eq!(mapper.read_graphics(0x0000), expected);
            assert_eq!(mapper.read_graphics(0x1FFF), expected);
        }
        assert_eq!(mapper.read_program(0x8000), 1);
        assert_eq!(mapper.read_program(0xC000), 2);
    }

    #[test]
    fn sxrom_control_register_sets_mirroring() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, Vec::new())).unwrap();

        let cases = [
            (0b00, Mirroring::OneScreenLower),
            (0b01, Mirroring::OneScreenUpper),
            (0b10, Mirroring::Vertical),
            (0b11, Mirroring::Horizontal),
        ];
        for (bits, expected) in cases {
            sxrom_write(&mut mapper, 0x8000, 0x0C | bits);
            assert_eq!(mapper.name_table_mirroring(), expected);
        }
    }

    #[test]
    fn sxrom_program_modes() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, Vec::new())).unwrap();

        // Power-on mode 3: switchable $8000, last bank at $C000.
        sxrom_write(&mut mapper, 0xE000, 1);
        assert_eq!(mapper.read_program(0x8000), 2);
        assert_eq!(mapper.read_program(0xC000), 4);

        // Mode 2: first bank fixed at $8000, switchable $C000.
        sxrom_write(&mut mapper, 0x8000, 0x08);
        assert_eq!(mapper.read_program(0x8000), 1);
        assert_eq!(mapper.read_program(0xC000), 2);

        // Mode 0: 32 KB switching ignores the low bank bit.
        sxrom_write(&mut mapper, 0x8000, 0x00);
        sxrom_write(&mut mapper, 0xE000, 3);
        assert_eq!(mapper.read_program(0x8000), 3);
        assert_eq!(mapper.read_program(0xC000), 4);
    }

    #[test]
    fn sxrom_reset_write_forces_fixed_last_bank() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, Vec::new())).unwrap();

        sxrom_write(&mut mapper, 0x8000, 0x00);
        assert_eq!(mapper.read_program(0xC000), 2);

        mapper.write_program(0x8000, 1);
        mapper.write_program(0x8000, 0x80);
        assert_eq!(mapper.read_program(0xC000), 4);

        // The partial write before the reset must not leak into the next value.
        sxrom_write(&mut mapper, 0xE000, 2);
        assert_eq!(mapper.read_program(0x8000), 3);
    }

    #[test]
    fn sxrom_chr_modes() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let chr = patterned_banks(8 * 0x1000, 0x1000);
        let mut mapper = Mapper::new(make_cart(1, prg, chr)).unwrap();

        sxrom_write(&mut mapper, 0x8000, 0x10 | 0x0C);
        sxrom_write(&mut mapper, 0xA000, 5);
        sxrom_write(&mut mapper, 0xC000, 2);
        assert_eq!(mapper.read_graphics(0x0000), 6);
        assert_eq!(mapper.read_graphics(0x1000), 3);

        sxrom_write(&mut mapper, 0x8000, 0x0C);
        assert_eq!(mapper.read_graphics(0x0000), 5);
        assert_eq!(mapper.read_graphics(0x1000), 6);
    }

    #[test]
    fn mmc3_banks_and_scanline_irq() {
        let prg = patterned_banks(8 * 0x2000, 0x2000);
        let chr = patterned_banks(8 * 0x0400, 0x0400);
        let mut mapper = Mapper::new(make_cart(4, prg, chr)).unwrap();

        mapper.write_program(0x8000, 0x06);
        mapper.write_program(0x8001, 0x02);
        mapper.write_program(0x8000, 0x07);
        mapper.write_program(0x8001, 0x03);
        assert_eq!(mapper.read_program(0x8000), 3);
        assert_eq!(mapper.read_program(0xA000), 4);
        assert_eq!(mapper.read_program(0xC000), 7);
        assert_eq!(mapper.read_program(0xE000), 8);

        mapper.write_program(0x8000, 0x42);
        assert_eq!(mapper.read_program(0x8000), 7);
        assert_eq!(mapper.read_program(0xC000), 3);

        mapper.write_program(0xA000, 0x01);
        assert_eq!(mapper.name_table_mirroring(), Mirroring::Horizontal);

        mapper.write_program(0xC000, 0x01);
        mapper.write_program(0xC001, 0x00);
        mapper.write_program(0xE001, 0x00);
        mapper.clock_scanline();
        assert!(!mapper.irq_pending());
        mapper.clock_scanline();
        assert!(mapper.irq_pending());
        mapper.write_program(0xE000, 0x00);
        assert!(!mapper.irq_pending());
    }

    #[test]
    fn axrom_selects_one_screen_page() {
        let prg = patterned_banks(2 * 0x8000, 0x8000);
        let mut mapper = Mapper::new(make_cart(7, prg, Vec::new())).unwrap();

        mapper.write_program(0x8000, 0x11);
        assert_eq!(mapper.read_program(0x8000), 2);
        assert_eq!(mapper.name_table_mirroring(), Mirroring::OneScreenUpper);
        mapper.write_program(0x8000, 0x00);
        assert_eq!(mapper.name_table_mirroring(), Mirroring::OneScreenLower);
    }

    #[test]
    fn gxrom_switches_prg_and_chr() {
        let prg = patterned_banks(2 * 0x8000, 0x8000);
        let chr = patterned_banks(2 * 0x2000, 0x2000);
        let mut mapper = Mapper::new(make_cart(66, prg, chr)).unwrap();

        mapper.write_program(0x8000, 0x11);
        assert_eq!(mapper.read_program(0x8000), 2);
        assert_eq!(mapper.read_graphics(0x0000), 2);
    }

    #[test]
    fn state_restore_recomputes_banks() {
        let prg = patterned_banks(4 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(2, prg, Vec::new())).unwrap();
        mapper.write_program(0x8000, 2);
        mapper.write_graphics(0x0000, 0x77);
        let mut state = mapper.state();
        state.prg_slots = [0; PRG_SLOTS];

        let mut fresh = Mapper::new(mapper.cartridge().clone()).unwrap();
        fresh.restore(state).unwrap();
        assert_eq!(fresh.read_program(0x8000), 3);
        assert_eq!(fresh.read_graphics(0x0000), 0x77);

        let foreign = Board::Cnrom { chr_bank: 0 };
        let mut bad = mapper.state();
        bad.board = foreign;
        assert!(fresh.restore(bad).is_err());
    }

    #[test]
    fn rom_sizes_must_be_whole_banks() {
        let empty = make_cart(0, Vec::new(), vec![0; 0x2000]);
        assert!(Mapper::new(empty).is_err());

        let half_bank = make_cart(0, vec![0; 0x2000], vec![0; 0x2000]);
        assert!(Mapper::new(half_bank).is_err());

        let too_many = make_cart(2, vec![0; 256 * 0x4000], Vec::new());
        assert!(Mapper::new(too_many).is_err());

        let odd_chr = make_cart(0, vec![0; 0x4000], vec![0; 0x1000]);
        assert!(Mapper::new(odd_chr).is_err());
    }

    #[test]
    fn sxrom_restore_rejects_overfull_shift_register() {
        let prg = patterned_banks(2 * 0x4000, 0x4000);
        let mut mapper = Mapper::new(make_cart(1, prg, Vec::new())).unwrap();
        let mut state = mapper.state();
        if let Board::Sxrom(regs) = &mut state.board {
            regs.write_count = 255;
        }
        assert!(mapper.restore(state).is_err());

        mapper.write_program(0x8000, 1);
        let state = mapper.state();
        assert!(mapper.restore(state).is_ok());
    }

    #[test]
    fn color_dreams_switches_prg_and_chr() {
        let prg = patterned_banks(4 * 0x8000, 0x8000);
        let chr = patterned_banks(16 * 0x2000, 0x2000);
        let mut mapper = Mapper::new(make_cart(11, prg, chr)).unwrap();
        assert_eq!(mapper.name(), "Color Dreams");

        mapper.write_program(0x8000, 0x72);
        assert_eq!(mapper.read_program(0x8000), 3);
        assert_eq!(mapper.read_program(0xFFFF), 3);
        assert_eq!(mapper.read_graphics(0x0000), 8);
        assert_eq!(mapper.read_graphics(0x1FFF), 8);

        mapper.write_program(0xC000, 0xF3);
        assert_eq!(mapper.read_program(0x8000), 4);
        assert_eq!(mapper.read_graphics(0x1000), 16);
    }

    /// Checks the first and last byte of every 256-byte page of both
    /// windows. PRG is tagged per 8 KB bank and CHR per 1 KB bank.
    fn assert_window(mapper: &Mapper, prg_banks: [usize; 4], chr_banks: [usize; 8], case: &str) {
        for page in (0x8000..=0xFF00u16).step_by(0x100) {
            let expected = (prg_banks[(page as usize - 0x8000) / 0x2000] as u8).wrapping_add(1);
            for addr in [page, page | 0xFF] {
                assert_eq!(mapper.read_program(addr), expected, "{case}: PRG ${addr:04X}");
            }
        }
        for page in (0x0000..0x2000u16).step_by(0x100) {
            let expected = (chr_banks[page as usize / 0x400] as u8).wrapping_add(1);
            for addr in [page, page | 0xFF] {
                assert_eq!(mapper.read_graphics(addr), expected, "{case}: CHR ${addr:04X}");
            }
        }
    }

    fn prg_32k(bank: usize) -> [usize; 4] {
        std::array::from_fn(|slot| bank * 4 + slot)
    }

    fn chr_8k(bank: usize) -> [usize; 8] {
        std::array::from_fn(|slot| bank * 8 + slot)
    }

    #[test]
    fn every_bank_window_matches_selected_bank() {
        let tagged = |mapper_id, prg_size, chr_size| {
            let cart = make_cart(
                mapper_id,
                patterned_banks(prg_size, 0x2000),
                patterned_banks(chr_size, 0x400),
            );
            Mapper::new(cart).unwrap()
        };

        let nrom = tagged(0, 0x8000, 0x2000);
        assert_window(&nrom, prg_32k(0), chr_8k(0), "NROM");

        let mut uxrom = tagged(2, 8 * 0x4000, 0x2000);
        for bank in 0..8 {
            uxrom.write_program(0x8000, bank as u8);
            let prg = [2 * bank, 2 * bank + 1, 14, 15];
            assert_window(&uxrom, prg, chr_8k(0), &format!("UxROM bank {bank}"));
        }

        let mut cnrom = tagged(3, 0x8000, 4 * 0x2000);
        for value in 0..=255u8 {
            cnrom.write_program(0x8000, value);
            let chr = chr_8k((value & 0x03) as usize);
            assert_window(&cnrom, prg_32k(0), chr, &format!("CNROM ${value:02X}"));
        }

        let mut axrom = tagged(7, 8 * 0x8000, 0x2000);
        for value in 0..=255u8 {
            axrom.write_program(0x8000, value);
            let prg = prg_32k((value & 0x07) as usize);
            assert_window(&axrom, prg, chr_8k(0), &format!("AxROM ${value:02X}"));
        }

        let mut color_dreams = tagged(11, 4 * 0x8000, 16 * 0x2000);
        for value in 0..=255u8 {
            color_dreams.write_program(0x8000, value);
            let prg = prg_32k((value & 0x03) as usize);
            let chr = chr_8k((value >> 4) as usize);
            assert_window(&color_dreams, prg, chr, &format!("Color Dreams ${value:02X}"));
        }

        let mut gxrom = tagged(66, 4 * 0x8000, 4 * 0x2000);
        for value in 0..=255u8 {
            gxrom.write_program(0x8000, value);
            let prg = prg_32k(((value >> 4) & 0x03) as usize);
            let chr = chr_8k((value & 0x03) as usize);
            assert_window(&gxrom, prg, chr, &format!("GxROM ${value:02X}"));
        }
    }

    #[test]
    fn every_sxrom_window_matches_selected_bank() {
        let prg = patterned_banks(16 * 0x4000, 0x2000);
        let chr = patterned_banks(32 * 0x1000, 0x400);
        let mut mapper = Mapper::new(make_cart(1, prg, chr)).unwrap();

        for prg_mode in 0..4u8 {
            for chr_4k in [false, true] {
                let control = 0x03 | (prg_mode << 2) | ((chr_4k as u8) << 4);
                sxrom_write(&mut mapper, 0x8000, control);

                for bank in 0..16usize {
                    sxrom_write(&mut mapper, 0xE000, bank as u8);
                    let chr_bank0 = (bank * 3) % 32;
                    let chr_bank1 = (bank * 7 + 1) % 32;
                    sxrom_write(&mut mapper, 0xA000, chr_bank0 as u8);
                    sxrom_write(&mut mapper, 0xC000, chr_bank1 as u8);

                    let prg = match prg_mode {
                        0 | 1 => prg_32k(bank >> 1),
                        2 => [0, 1, 2 * bank, 2 * bank + 1],
                        _ => [2 * bank, 2 * bank + 1, 30, 31],
                    };
                    let chr = if chr_4k {
                        std::array::from_fn(|slot| {
                            let base = if slot < 4 { chr_bank0 } else { chr_bank1 };
                            base * 4 + slot % 4
                        })
                    } else {
                        chr_8k(chr_bank0 >> 1)
                    };
                    let case = format!("SxROM mode {prg_mode} chr4k {chr_4k} bank {bank}");
                    assert_window(&mapper, prg, chr, &case);
                }
            }
        }
    }

    #[test]
    fn every_mmc3_window_matches_selected_bank() {
        let prg = patterned_banks(16 * 0x2000, 0x2000);
        let chr = patterned_banks(256 * 0x400, 0x400);
        let mut mapper = Mapper::new(make_cart(4, prg, chr)).unwrap();

        for mode in [0x00u8, 0x40, 0x80, 0xC0] {
            for value in 0..=255usize {
                let regs: [usize; 8] = std::array::from_fn(|reg| match reg {
                    6 => value % 16,
                    7 => (value / 16 + 3) % 16,
                    _ => (value + 37 * reg) % 256,
                });
                for (reg, &bank) in regs.iter().enumerate() {
                    mapper.write_program(0x8000, mode | reg as u8);
                    mapper.write_program(0x8001, bank as u8);
                }

                let prg = if mode & 0x40 == 0 {
                    [regs[6], regs[7], 14, 15]
                } else {
                    [14, regs[7], regs[6], 15]
                };
                let two_k = [regs[0] & !1, (regs[0] & !1) + 1, regs[1] & !1, (regs[1] & !1) + 1];
                let one_k = [regs[2], regs[3], regs[4], regs[5]];
                let (low, high) = if mode & 0x80 == 0 {
                    (two_k, one_k)
                } else {
                    (one_k, two_k)
                };
                let chr = std::array::from_fn(|slot| if slot < 4 { low[slot] } else { high[slot - 4] });
                assert_window(&mapper, prg, chr, &format!("MMC3 mode ${mode:02X} value {value}"));
            }
        }
    }
}
