pub mod apu;
mod blip;
pub mod cartridge;
pub mod controller;
pub mod cpu;
pub mod main_bus;
pub mod mapper;
mod palette;
pub mod picture_bus;
pub mod ppu;
pub mod state;

use anyhow::{Context, Result, bail};
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};

use apu::{Apu, AudioFrame};
use cartridge::Cartridge;
use controller::Controller;
use cpu::Cpu;
use main_bus::{CpuBusView, MainBus};
use mapper::Mapper;
use picture_bus::PictureBus;
use ppu::Ppu;

pub const BUTTON_A: u8 = 0x01;
pub const BUTTON_B: u8 = 0x02;
pub const BUTTON_SELECT: u8 = 0x04;
pub const BUTTON_START: u8 = 0x08;
pub const BUTTON_UP: u8 = 0x10;
pub const BUTTON_DOWN: u8 = 0x20;
pub const BUTTON_LEFT: u8 = 0x40;
pub const BUTTON_RIGHT: u8 = 0x80;

/// CPU cycles in one NTSC frame (262 lines x 341 dots / 3, rounded).
pub const CYCLES_PER_FRAME: u32 = 29_781;
pub const PPU_CYCLES_PER_CPU_CYCLE: u32 = 3;
const DMC_DMA_STALL_CYCLES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub sample_rate: u32,
    pub event_log_capacity: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            sample_rate: apu::DEFAULT_SAMPLE_RATE,
            event_log_capacity: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugCounters {
    pub frames: u64,
    pub cpu_cycles: u64,
    pub ppu_cycles: u64,
    pub apu_cycles: u64,
    pub nmi_serviced: u64,
    pub irq_serviced: u64,
    pub unknown_opcodes: u64,
    pub oam_dma_transfers: u64,
    pub rejected_dma: u64,
    pub dmc_dma_transfers: u64,
    pub unregistered_accesses: u64,
}

/// Bounded ring of human-readable debug events, oldest dropped first.
#[derive(Debug, Clone)]
pub struct EventLog {
    capacity: usize,
    events: VecDeque<String>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push<S: Into<String>>(&mut self, event: S) {
        if self.capacity == 0 {
            return;
        }
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.into());
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

/// Every component of a running machine. Cloning yields a fully independent
/// copy, which is what backup/restore relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Console {
    mapper: Mapper,
    bus: MainBus,
    picture_bus: PictureBus,
    cpu: Cpu,
    ppu: Ppu,
    apu: Apu,
    controllers: [Controller; 2],
    source: Option<PathBuf>,
}

impl Console {
    /// Builds a powered-off machine around `cartridge`. Fails only if the
    /// cartridge's mapper is unsupported.
    pub fn new(cartridge: Cartridge, sample_rate: u32, source: Option<PathBuf>) -> Result<Self> {
        let mapper = Mapper::new(cartridge)?;
        Ok(Self {
            bus: MainBus::new(mapper.has_extended_ram()),
            picture_bus: PictureBus::new(mapper.name_table_mirroring()),
            cpu: Cpu::new(),
            ppu: Ppu::new(),
            apu: Apu::new(sample_rate),
            controllers: Default::default(),
            mapper,
            source,
        })
    }

    pub fn cartridge(&self) -> &Cartridge {
        self.mapper.cartridge()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn main_bus(&self) -> &MainBus {
        &self.bus
    }

    pub fn picture_bus(&self) -> &PictureBus {
        &self.picture_bus
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn apu(&self) -> &Apu {
        &self.apu
    }

    pub fn controllers(&self) -> &[Controller; 2] {
        &self.controllers
    }

    fn reset(&mut self, events: &mut EventLog) {
        self.ppu.reset();
        self.apu.reset();
        let (cpu, mut view) = self.split(events);
        cpu.reset(&mut view);
    }

    fn split<'a>(&'a mut self, events: &'a mut EventLog) -> (&'a mut Cpu, CpuBusView<'a>) {
        (
            &mut self.cpu,
            CpuBusView {
                bus: &mut self.bus,
                picture_bus: &mut self.picture_bus,
                ppu: &mut self.ppu,
                apu: &mut self.apu,
                mapper: &mut self.mapper,
                controllers: &mut self.controllers,
                events,
            },
        )
    }
}

/// Top-level machine driver. Holds at most one live console and one backup
/// copy of it; everything is stepped synchronously by the caller.
pub struct Emulator {
    config: EmulatorConfig,
    console: Option<Console>,
    backup: Option<Console>,
    frames: u64,
    dmc_dma_transfers: u64,
    events: EventLog,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    pub fn new() -> Self {
        Self::with_config(EmulatorConfig::default())
    }

    pub fn with_config(config: EmulatorConfig) -> Self {
        let config = EmulatorConfig {
            sample_rate: config.sample_rate.max(apu::MIN_SAMPLE_RATE),
            ..config
        };
        Self {
            events: EventLog::new(config.event_log_capacity),
            config,
            console: None,
            backup: None,
            frames: 0,
            dmc_dma_transfers: 0,
        }
    }

    pub fn config(&self) -> EmulatorConfig {
        self.config
    }

    pub fn console(&self) -> Option<&Console> {
        self.console.as_ref()
    }

    pub fn has_cartridge(&self) -> bool {
        self.console.is_some()
    }

    pub fn mapper_name(&self) -> Option<&'static str> {
        self.console.as_ref().map(|console| console.mapper.name())
    }

    pub fn load_rom(&mut self, path: &Path) -> Result<()> {
        let cartridge = Cartridge::from_file(path)?;
        self.insert(cartridge, Some(path.to_path_buf()))
    }

    pub fn load_cartridge(&mut self, cartridge: Cartridge) -> Result<()> {
        self.insert(cartridge, None)
    }

    /// Builds and resets the new machine before touching the live one, so a
    /// failed load leaves the previous cartridge running.
    fn insert(&mut self, cartridge: Cartridge, source: Option<PathBuf>) -> Result<()> {
        let mut console = Console::new(cartridge, self.config.sample_rate, source)?;
        self.events.clear();
        console.reset(&mut self.events);

        let message = format!(
            "cartridge loaded: {} (mapper {}), PC=${:04X}",
            console.mapper.name(),
            console.mapper.mapper_id(),
            console.cpu.pc
        );
        log::info!("{message}");
        self.events.push(message);

        self.console = Some(console);
        self.backup = None;
        self.frames = 0;
        self.dmc_dma_transfers = 0;
        Ok(())
    }

    pub fn remove_cartridge(&mut self) {
        if self.console.take().is_some() {
            log::info!("cartridge removed");
            self.events.push("cartridge removed");
        }
        self.backup = None;
    }

    /// Re-homes the CPU through its reset vector and resets PPU and APU.
    pub fn reset(&mut self) {
        let Some(console) = self.console.as_mut() else {
            return;
        };
        console.reset(&mut self.events);
        let message = format!("reset, PC=${:04X}", console.cpu.pc);
        log::info!("{message}");
        self.events.push(message);
    }

    /// Three PPU dots, one CPU cycle, one APU cycle, in that order.
    pub fn run_cycle(&mut self) {
        let Some(console) = self.console.as_mut() else {
            return;
        };

        for _ in 0..PPU_CYCLES_PER_CPU_CYCLE {
            console.ppu.tick(&mut console.picture_bus, &mut console.mapper);
            if console.ppu.take_nmi() {
                console.cpu.set_nmi();
            }
        }

        let unknown_opcodes = console.cpu.unknown_opcodes;
        let (cpu, mut view) = console.split(&mut self.events);
        cpu.step(&mut view);
        if console.cpu.unknown_opcodes != unknown_opcodes {
            if let Some((opcode, pc)) = console.cpu.last_unknown_opcode() {
                self.events
                    .push(format!("unknown opcode ${opcode:02X} at ${pc:04X}"));
            }
        }

        console.apu.step();
        if let Some(addr) = console.apu.take_dmc_dma_request() {
            let value = console.bus.peek(&console.mapper, addr);
            console.apu.complete_dmc_dma(value);
            console.cpu.stall(DMC_DMA_STALL_CYCLES);
            self.dmc_dma_transfers += 1;
            self.events
                .push(format!("DMC DMA ${addr:04X} -> ${value:02X}"));
        }
    }

    /// Runs `CYCLES_PER_FRAME` cycles and closes the audio frame.
    pub fn run_frame(&mut self) {
        if self.console.is_none() {
            return;
        }
        for _ in 0..CYCLES_PER_FRAME {
            self.run_cycle();
        }
        self.end_audio_frame();
        self.frames += 1;
    }

    /// Renders the samples recorded since the last close into the audio
    /// frame. Frames left open for `apu::MAX_FRAME_CLOCKS` close on their own.
    pub fn end_audio_frame(&mut self) {
        if let Some(console) = self.console.as_mut() {
            console.apu.end_frame();
        }
    }

    /// Snapshots the whole machine into the single backup slot.
    pub fn backup_state(&mut self) {
        let Some(console) = self.console.as_ref() else {
            return;
        };
        self.backup = Some(console.clone());
        log::info!("state backed up at CPU cycle {}", console.cpu.cycles);
        self.events.push("state backed up");
    }

    /// Replaces the live machine with a copy of the backup. The backup stays
    /// in place so it can be restored again.
    pub fn restore_state(&mut self) {
        let (Some(console), Some(backup)) = (self.console.as_mut(), self.backup.as_ref()) else {
            return;
        };
        console.clone_from(backup);
        log::info!("state restored to CPU cycle {}", console.cpu.cycles);
        self.events.push("state restored");
    }

    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    pub fn save_state(&self) -> Result<String> {
        let Some(console) = self.console.as_ref() else {
            bail!("no cartridge loaded");
        };
        state::save(console)
    }

    /// Replaces the live machine with the one described by `json`. On any
    /// error the current machine is left untouched.
    pub fn load_state(&mut self, json: &str) -> Result<()> {
        let mut console = state::load(json, self.console.as_ref(), self.config.sample_rate)?;
        if console.apu.sample_rate() != self.config.sample_rate {
            console.apu.set_sample_rate(self.config.sample_rate);
        }

        let same_cartridge = self
            .console
            .as_ref()
            .is_some_and(|current| current.cartridge() == console.cartridge());
        if !same_cartridge {
            self.backup = None;
        }

        let message = format!("state loaded at CPU cycle {}", console.cpu.cycles);
        log::info!("{message}");
        self.events.push(message);
        self.console = Some(console);
        Ok(())
    }

    pub fn save_state_to_file(&self, path: &Path) -> Result<()> {
        let json = self.save_state()?;
        fs::write(path, json)
            .with_context(|| format!("failed to write state: {}", path.display()))
    }

    pub fn load_state_from_file(&mut self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read state: {}", path.display()))?;
        self.load_state(&json)
            .with_context(|| format!("failed to load state: {}", path.display()))
    }

    /// Sets the held buttons of controller `port` (0 or 1).
    pub fn set_buttons(&mut self, port: usize, buttons: u8) {
        let Some(console) = self.console.as_mut() else {
            return;
        };
        match console.controllers.get_mut(port) {
            Some(controller) => controller.set_buttons(buttons),
            None => log::debug!("controller port {port} does not exist"),
        }
    }

    /// Side-effect free read of CPU memory, for callers mapping console
    /// state to outputs after a frame.
    pub fn peek_ram(&self, addr: u16) -> u8 {
        self.console
            .as_ref()
            .map_or(0, |console| console.bus.peek(&console.mapper, addr))
    }

    pub fn frame_buffer(&self) -> Option<&[u8]> {
        self.console.as_ref().map(|console| console.ppu.frame_buffer())
    }

    pub fn audio_frame(&self) -> Option<&AudioFrame> {
        self.console.as_ref().map(|console| console.apu.audio_frame())
    }

    pub fn take_audio_frame(&mut self) -> Option<AudioFrame> {
        self.console
            .as_mut()
            .map(|console| console.apu.take_audio_frame())
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.config.sample_rate = sample_rate.max(apu::MIN_SAMPLE_RATE);
        if let Some(console) = self.console.as_mut() {
            console.apu.set_sample_rate(self.config.sample_rate);
        }
    }

    pub fn debug_counters(&self) -> DebugCounters {
        let mut counters = DebugCounters {
            frames: self.frames,
            dmc_dma_transfers: self.dmc_dma_transfers,
            ..DebugCounters::default()
        };
        if let Some(console) = self.console.as_ref() {
            let bus = console.bus.counters();
            counters.cpu_cycles = console.cpu.cycles;
            counters.ppu_cycles = console.ppu.debug_counters().ticks;
            counters.apu_cycles = console.apu.cycles();
            counters.nmi_serviced = console.cpu.nmi_serviced;
            counters.irq_serviced = console.cpu.irq_serviced;
            counters.unknown_opcodes = console.cpu.unknown_opcodes;
            counters.oam_dma_transfers = bus.oam_dma_transfers;
            counters.rejected_dma = bus.rejected_dma;
            counters.unregistered_accesses = bus.unregistered_accesses;
        }
        counters
    }

    pub fn recent_events(&self, limit: usize) -> Vec<String> {
        self.events.recent(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::mapper::Mirroring;

    /// NROM-256 image whose reset handler enables NMI and spins; the NMI
    /// handler bumps $0010.
    fn spin_cartridge() -> Cartridge {
        let mut prg_rom = vec![0xEA; 0x8000];
        let reset = [
            0x78, // SEI
            0xA9, 0x80, // LDA #$80
            0x8D, 0x00, 0x20, // STA $2000
            0x4C, 0x06, 0x80, // JMP $8006
        ];
        prg_rom[..reset.len()].copy_from_slice(&reset);
        let nmi = [0xE6, 0x10, 0x40]; // INC $10; RTI
        prg_rom[0x1000..0x1003].copy_from_slice(&nmi);
        prg_rom[0x7FFA..].copy_from_slice(&[0x00, 0x90, 0x00, 0x80, 0x00, 0x80]);
        Cartridge {
            mapper_id: 0,
            mirroring: Mirroring::Vertical,
            has_extended_ram: false,
            prg_rom,
            chr_rom: vec![0; 0x2000],
        }
    }

    #[test]
    fn event_log_drops_oldest() {
        let mut log = EventLog::new(2);
        log.push("a");
        log.push("b");
        log.push("c");
        assert_eq!(log.recent(5), ["c", "b"]);
        assert_eq!(log.recent(1), ["c"]);
    }

    #[test]
    fn operations_without_cartridge_are_noops() {
        let mut emu = Emulator::new();
        emu.run_frame();
        emu.reset();
        emu.backup_state();
        emu.restore_state();
        emu.set_buttons(0, BUTTON_A);
        assert!(!emu.has_backup());
        assert_eq!(emu.peek_ram(0x0010), 0);
        assert!(emu.save_state().is_err());
        assert_eq!(emu.debug_counters(), DebugCounters::default());
    }

    #[test]
    fn load_resets_through_vector() {
        let mut emu = Emulator::new();
        emu.load_cartridge(spin_cartridge()).unwrap();
        assert_eq!(emu.console().unwrap().cpu().pc, 0x8000);
        assert_eq!(emu.mapper_name(), Some("NROM"));
        assert!(!emu.recent_events(1).is_empty());
    }

    #[test]
    fn failed_load_keeps_previous_console() {
        let mut emu = Emulator::new();
        emu.load_cartridge(spin_cartridge()).unwrap();
        emu.run_frame();
        let before = emu.console().cloned();

        let mut unsupported = spin_cartridge();
        unsupported.mapper_id = 5;
        assert!(emu.load_cartridge(unsupported).is_err());
        assert_eq!(emu.console().cloned(), before);

        let mut empty = spin_cartridge();
        empty.prg_rom.clear();
        assert!(emu.load_cartridge(empty).is_err());
        let mut partial_bank = spin_cartridge();
        partial_bank.prg_rom.truncate(0x2000);
        assert!(emu.load_cartridge(partial_bank).is_err());
        assert_eq!(emu.console().cloned(), before);
    }

    #[test]
    fn saved_state_loads_into_fresh_emulator() {
        let mut cartridge = spin_cartridge();
        cartridge.prg_rom.drain(..0x4000);
        cartridge.chr_rom.clear();

        let mut emu = Emulator::new();
        emu.load_cartridge(cartridge).unwrap();
        emu.run_frame();
        let json = emu.save_state().unwrap();

        let mut fresh = Emulator::new();
        fresh.load_state(&json).unwrap();
        assert_eq!(fresh.console().unwrap().cpu(), emu.console().unwrap().cpu());
        assert_eq!(
            fresh.console().unwrap().cartridge(),
            emu.console().unwrap().cartridge()
        );
    }

    #[test]
    fn frames_deliver_nmi() {
        let mut emu = Emulator::new();
        emu.load_cartridge(spin_cartridge()).unwrap();
        for _ in 0..3 {
            emu.run_frame();
        }
        let counters = emu.debug_counters();
        assert_eq!(counters.frames, 3);
        assert!(counters.nmi_serviced >= 2);
        assert_eq!(emu.peek_ram(0x0010) as u64, counters.nmi_serviced);
    }

    #[test]
    fn buttons_reach_selected_port() {
        let mut emu = Emulator::new();
        emu.load_cartridge(spin_cartridge()).unwrap();
        emu.set_buttons(1, BUTTON_START | BUTTON_LEFT);
        emu.set_buttons(2, BUTTON_A);
        let console = emu.console().unwrap();
        assert_eq!(console.controllers()[0].buttons(), 0);
        assert_eq!(console.controllers()[1].buttons(), BUTTON_START | BUTTON_LEFT);
    }

    #[test]
    fn remove_cartridge_drops_backup() {
        let mut emu = Emulator::new();
        emu.load_cartridge(spin_cartridge()).unwrap();
        emu.backup_state();
        assert!(emu.has_backup());
        emu.remove_cartridge();
        assert!(!emu.has_cartridge());
        assert!(!emu.has_backup());
    }

    #[test]
    fn sample_rate_applies_to_live_apu() {
        let mut emu = Emulator::with_config(EmulatorConfig {
            sample_rate: 22_050,
            ..EmulatorConfig::default()
        });
        emu.load_cartridge(spin_cartridge()).unwrap();
        emu.run_frame();
        let frame = emu.audio_frame().unwrap();
        assert!(frame.len().abs_diff(367) <= 1);

        emu.set_sample_rate(100);
        assert_eq!(emu.sample_rate(), apu::MIN_SAMPLE_RATE);
        assert_eq!(emu.console().unwrap().apu().sample_rate(), apu::MIN_SAMPLE_RATE);
    }

    #[test]
    fn cycle_stepping_keeps_audio_bounded() {
        let mut emu = Emulator::new();
        emu.load_cartridge(spin_cartridge()).unwrap();
        for _ in 0..5 * CYCLES_PER_FRAME {
            emu.run_cycle();
            assert!(emu.console().unwrap().apu().open_frame_clocks() < apu::MAX_FRAME_CLOCKS);
        }
        assert!(!emu.audio_frame().unwrap().is_empty());

        emu.take_audio_frame();
        emu.end_audio_frame();
        assert_eq!(emu.console().unwrap().apu().open_frame_clocks(), 0);
        assert!(!emu.audio_frame().unwrap().is_empty());
    }
}
