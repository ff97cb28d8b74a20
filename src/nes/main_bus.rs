use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::EventLog;
use super::apu::Apu;
use super::controller::Controller;
use super::cpu::CpuBus;
use super::mapper::Mapper;
use super::picture_bus::PictureBus;
use super::ppu::Ppu;

pub const RAM_SIZE: usize = 0x0800;
pub const EXTENDED_RAM_SIZE: usize = 0x2000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusCounters {
    pub reads: u64,
    pub writes: u64,
    pub oam_dma_transfers: u64,
    pub rejected_dma: u64,
    pub unregistered_accesses: u64,
}

/// CPU-side memory owned by the console: 2 KB of internal RAM and the
/// optional 8 KB cartridge work RAM at $6000.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainBus {
    #[serde(with = "crate::nes::state::base64_array")]
    ram: [u8; RAM_SIZE],
    #[serde(with = "crate::nes::state::base64_vec")]
    extended_ram: Vec<u8>,
    oam_dma_pending: bool,
    #[serde(skip)]
    counters: BusCounters,
}

impl Default for MainBus {
    fn default() -> Self {
        Self::new(false)
    }
}

impl MainBus {
    pub fn new(extended_ram: bool) -> Self {
        Self {
            ram: [0; RAM_SIZE],
            extended_ram: if extended_ram {
                vec![0; EXTENDED_RAM_SIZE]
            } else {
                Vec::new()
            },
            oam_dma_pending: false,
            counters: BusCounters::default(),
        }
    }

    pub fn has_extended_ram(&self) -> bool {
        !self.extended_ram.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.has_extended_ram() && self.extended_ram.len() != EXTENDED_RAM_SIZE {
            bail!(
                "work RAM is {} bytes, expected {EXTENDED_RAM_SIZE}",
                self.extended_ram.len()
            );
        }
        Ok(())
    }

    pub fn counters(&self) -> BusCounters {
        self.counters
    }

    /// Side-effect free read of RAM, work RAM and program space. I/O
    /// registers read as 0.
    pub fn peek(&self, mapper: &Mapper, addr: u16) -> u8 {
        match addr {
            0x0000..=0x1FFF => self.ram[addr as usize & (RAM_SIZE - 1)],
            0x6000..=0x7FFF => self
                .extended_ram
                .get(addr as usize - 0x6000)
                .copied()
                .unwrap_or(0),
            0x8000..=0xFFFF => mapper.read_program(addr),
            _ => 0,
        }
    }

    fn oam_page(&self, mapper: &Mapper, page: u8) -> Option<[u8; 256]> {
        let base = (page as u16) << 8;
        match page {
            0x00..=0x1F | 0x80..=0xFF => {}
            0x60..=0x7F if self.has_extended_ram() => {}
            _ => return None,
        }
        let mut bytes = [0u8; 256];
        for (offset, slot) in bytes.iter_mut().enumerate() {
            *slot = self.peek(mapper, base + offset as u16);
        }
        Some(bytes)
    }
}

/// Borrowed view of every component reachable from the CPU address space.
/// Built fresh for each CPU step so the CPU never owns its peripherals.
pub struct CpuBusView<'a> {
    pub bus: &'a mut MainBus,
    pub picture_bus: &'a mut PictureBus,
    pub ppu: &'a mut Ppu,
    pub apu: &'a mut Apu,
    pub mapper: &'a mut Mapper,
    pub controllers: &'a mut [Controller; 2],
    pub events: &'a mut EventLog,
}

impl CpuBusView<'_> {
    fn unregistered(&mut self, kind: &str, addr: u16) {
        self.bus.counters.unregistered_accesses += 1;
        log::debug!("unregistered {kind} at ${addr:04X}");
    }

    fn oam_dma(&mut self, page: u8) {
        match self.bus.oam_page(self.mapper, page) {
            Some(bytes) => {
                self.ppu.write_oam_dma(&bytes);
                self.bus.oam_dma_pending = true;
                self.bus.counters.oam_dma_transfers += 1;
            }
            None => {
                self.bus.counters.rejected_dma += 1;
                log::warn!("OAM DMA from page ${page:02X} rejected");
                self.events
                    .push(format!("OAM DMA from page ${page:02X} rejected"));
            }
        }
    }
}

impl CpuBus for CpuBusView<'_> {
    fn read(&mut self, addr: u16) -> u8 {
        self.bus.counters.reads += 1;
        match addr {
            0x0000..=0x1FFF => self.bus.ram[addr as usize & (RAM_SIZE - 1)],
            0x2000..=0x3FFF => self.ppu.read_register(addr, self.picture_bus, self.mapper),
            0x4015 => self.apu.read_status(),
            0x4016 => self.controllers[0].read(),
            0x4017 => self.controllers[1].read(),
            0x4000..=0x401F => {
                self.unregistered("read", addr);
                0
            }
            0x4020..=0x5FFF => {
                self.unregistered("expansion ROM read", addr);
                0
            }
            0x6000..=0x7FFF => {
                if !self.bus.has_extended_ram() {
                    self.unregistered("work RAM read", addr);
                }
                self.bus.peek(self.mapper, addr)
            }
            _ => self.mapper.read_program(addr),
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.bus.counters.writes += 1;
        match addr {
            0x0000..=0x1FFF => self.bus.ram[addr as usize & (RAM_SIZE - 1)] = value,
            0x2000..=0x3FFF => {
                self.ppu
                    .write_register(addr, value, self.picture_bus, self.mapper)
            }
            0x4014 => self.oam_dma(value),
            0x4016 => {
                for controller in self.controllers.iter_mut() {
                    controller.write_strobe(value);
                }
            }
            0x4000..=0x4013 | 0x4015 | 0x4017 => self.apu.write_register(addr, value),
            0x4018..=0x401F => self.unregistered("write", addr),
            0x4020..=0x5FFF => self.unregistered("expansion ROM write", addr),
            0x6000..=0x7FFF => match self.bus.extended_ram.get_mut(addr as usize - 0x6000) {
                Some(slot) => *slot = value,
                None => self.unregistered("work RAM write", addr),
            },
            _ => {
                self.mapper.write_program(addr, value);
                let mirroring = self.mapper.name_table_mirroring();
                if mirroring != self.picture_bus.mirroring() {
                    self.picture_bus.update_mirroring(mirroring);
                }
            }
        }
    }

    fn irq_line(&self) -> bool {
        self.apu.irq_pending() || self.mapper.irq_pending()
    }

    fn take_oam_dma(&mut self) -> bool {
        std::mem::take(&mut self.bus.oam_dma_pending)
    }
}
