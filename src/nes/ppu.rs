use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::mapper::Mapper;
use super::palette::NES_PALETTE;
use super::picture_bus::PictureBus;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;
pub const SCANLINES_PER_FRAME: u16 = 262;
pub const DOTS_PER_SCANLINE: u16 = 341;

const PRE_RENDER_SCANLINE: u16 = 261;
const POST_RENDER_SCANLINE: u16 = 240;
const VBLANK_SCANLINE: u16 = 241;
const MAPPER_CLOCK_DOT: u16 = 260;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;

const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

const SPRITE_ATTR_PRIORITY: u8 = 0x20;
const SPRITE_ATTR_FLIP_H: u8 = 0x40;
const SPRITE_ATTR_FLIP_V: u8 = 0x80;

/// Which part of the frame a scanline belongs to. Always derived from the
/// scanline counter, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    PreRender,
    Render,
    PostRender,
    VerticalBlank,
}

impl Pipeline {
    fn for_scanline(scanline: u16) -> Self {
        match scanline {
            0..POST_RENDER_SCANLINE => Pipeline::Render,
            POST_RENDER_SCANLINE => Pipeline::PostRender,
            VBLANK_SCANLINE..PRE_RENDER_SCANLINE => Pipeline::VerticalBlank,
            _ => Pipeline::PreRender,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PpuDebugCounters {
    pub ticks: u64,
    pub vblank_entries: u64,
    pub nmi_edges: u64,
    pub sprite0_hits: u64,
    pub sprite_overflows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ppu {
    scanline: u16,
    cycle: u16,
    odd_frame: bool,

    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    #[serde(with = "crate::nes::state::base64_array")]
    oam: [u8; 256],

    write_toggle: bool,
    v: u16,
    t: u16,
    fine_x: u8,
    read_buffer: u8,
    open_bus: u8,

    nmi_line: bool,
    nmi_pending: bool,
    vblank_suppress: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    sprite_count: usize,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_x: [u8; 8],
    sprite_attributes: [u8; 8],
    sprite_indices: [u8; 8],

    debug: PpuDebugCounters,

    #[serde(skip, default = "blank_frame")]
    frame_buffer: Vec<u8>,
}

fn blank_frame() -> Vec<u8> {
    vec![0; FRAME_WIDTH * FRAME_HEIGHT * 4]
}

impl Default for Ppu {
    fn default() -> Self {
        Self {
            scanline: PRE_RENDER_SCANLINE,
            cycle: 0,
            odd_frame: false,
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            write_toggle: false,
            v: 0,
            t: 0,
            fine_x: 0,
            read_buffer: 0,
            open_bus: 0,
            nmi_line: false,
            nmi_pending: false,
            vblank_suppress: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            sprite_count: 0,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_x: [0; 8],
            sprite_attributes: [0; 8],
            sprite_indices: [0; 8],
            debug: PpuDebugCounters::default(),
            frame_buffer: blank_frame(),
        }
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns to the pre-render line with cleared registers. OAM survives.
    pub fn reset(&mut self) {
        let oam = self.oam;
        *self = Self::default();
        self.oam = oam;
    }

    /// 256x240 RGBA pixels.
    pub fn frame_buffer(&self) -> &[u8] {
        &self.frame_buffer
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::for_scanline(self.scanline)
    }

    /// Rejects restored counters and latches outside what the hardware can hold.
    pub fn validate(&self) -> Result<()> {
        if self.scanline >= SCANLINES_PER_FRAME || self.cycle >= DOTS_PER_SCANLINE {
            bail!("dot {} of scanline {} does not exist", self.cycle, self.scanline);
        }
        if self.fine_x > 7 {
            bail!("fine X scroll {} out of range", self.fine_x);
        }
        if self.sprite_count > self.sprite_x.len() {
            bail!("{} sprites loaded, at most 8 fit on a line", self.sprite_count);
        }
        Ok(())
    }

    pub fn scanline_cycle(&self) -> (u16, u16) {
        (self.scanline, self.cycle)
    }

    pub fn debug_counters(&self) -> PpuDebugCounters {
        self.debug
    }

    pub fn peek_oam(&self, index: u8) -> u8 {
        self.oam[index as usize]
    }

    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_pending)
    }

    pub fn read_register(&mut self, addr: u16, bus: &PictureBus, mapper: &Mapper) -> u8 {
        let value = match 0x2000 | (addr & 0x0007) {
            0x2002 => {
                // Reading right before VBL start suppresses the flag and NMI for this frame.
                if self.scanline == VBLANK_SCANLINE && self.cycle == 1 {
                    self.vblank_suppress = true;
                }

                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                self.update_nmi_line();
                value
            }
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                let value = bus.read(mapper, ppu_addr);
                let result = if ppu_addr >= 0x3F00 {
                    self.read_buffer = bus.read(mapper, ppu_addr - 0x1000);
                    value
                } else {
                    std::mem::replace(&mut self.read_buffer, value)
                };

                self.increment_vram_addr_cpu_access();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn write_register(
        &mut self,
        addr: u16,
        value: u8,
        bus: &mut PictureBus,
        mapper: &mut Mapper,
    ) {
        self.open_bus = value;
        match 0x2000 | (addr & 0x0007) {
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
                self.update_nmi_line();
            }
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x03E0) | (((value as u16) >> 3) << 5);
                    self.t = (self.t & !0x7000) | (((value as u16) & 0x07) << 12);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | (value as u16);
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2007 => {
                bus.write(mapper, self.v & 0x3FFF, value);
                self.increment_vram_addr_cpu_access();
            }
            _ => {}
        }
    }

    pub fn write_oam_dma(&mut self, bytes: &[u8; 256]) {
        for byte in bytes {
            self.oam[self.oam_addr as usize] = *byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    /// Processes one dot and advances the scanline/dot counters.
    pub fn tick(&mut self, bus: &mut PictureBus, mapper: &mut Mapper) {
        self.debug.ticks = self.debug.ticks.wrapping_add(1);

        match self.pipeline() {
            Pipeline::PreRender => {
                if self.cycle == 1 {
                    self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
                    self.vblank_suppress = false;
                    self.update_nmi_line();
                }
                self.fetch_background(bus, mapper, false);
                if self.rendering_enabled() && (280..=304).contains(&self.cycle) {
                    self.copy_vertical_bits();
                }
            }
            Pipeline::Render => {
                if self.cycle == 0 {
                    self.evaluate_sprites(bus, mapper);
                }
                if (1..=256).contains(&self.cycle) {
                    let (x, y) = ((self.cycle - 1) as usize, self.scanline as usize);
                    self.render_pixel(bus, x, y);
                }
                self.fetch_background(bus, mapper, true);
            }
            Pipeline::PostRender => {}
            Pipeline::VerticalBlank => {
                if self.scanline == VBLANK_SCANLINE && self.cycle == 1 {
                    self.debug.vblank_entries = self.debug.vblank_entries.wrapping_add(1);
                    if !self.vblank_suppress {
                        self.status |= STATUS_VBLANK;
                    }
                    self.vblank_suppress = false;
                    self.update_nmi_line();
                }
            }
        }

        self.advance();
    }

    fn advance(&mut self) {
        // Odd frames drop the last pre-render dot while rendering.
        if self.pipeline() == Pipeline::PreRender
            && self.odd_frame
            && self.cycle == 339
            && self.rendering_enabled()
        {
            self.cycle = 340;
        }

        self.cycle += 1;
        if self.cycle >= DOTS_PER_SCANLINE {
            self.cycle = 0;
            self.scanline += 1;
            if self.scanline >= SCANLINES_PER_FRAME {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    /// Tile fetches and scroll updates shared by the pre-render and visible lines.
    fn fetch_background(&mut self, bus: &PictureBus, mapper: &mut Mapper, visible_line: bool) {
        if !self.rendering_enabled() {
            return;
        }

        if (1..=256).contains(&self.cycle) || (321..=336).contains(&self.cycle) {
            self.shift_background_registers();

            match (self.cycle - 1) & 0x07 {
                0 => {
                    self.load_background_shifters();
                    self.next_tile_id = bus.read(mapper, 0x2000 | (self.v & 0x0FFF));
                }
                2 => {
                    let addr = 0x23C0
                        | (self.v & 0x0C00)
                        | ((self.v >> 4) & 0x0038)
                        | ((self.v >> 2) & 0x0007);
                    let attr = bus.read(mapper, addr);
                    let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                    self.next_tile_attr = (attr >> shift) & 0x03;
                }
                4 => {
                    let addr = self.background_pattern_addr();
                    self.next_tile_lsb = bus.read(mapper, addr);
                }
                6 => {
                    let addr = self.background_pattern_addr() + 8;
                    self.next_tile_msb = bus.read(mapper, addr);
                }
                7 => self.increment_coarse_x(),
                _ => {}
            }
        }

        if visible_line && (1..=256).contains(&self.cycle) {
            self.shift_sprite_registers();
        }

        match self.cycle {
            256 => self.increment_y(),
            257 => {
                self.load_background_shifters();
                self.copy_horizontal_bits();
            }
            MAPPER_CLOCK_DOT => mapper.clock_scanline(),
            _ => {}
        }
    }

    fn background_pattern_addr(&self) -> u16 {
        let fine_y = (self.v >> 12) & 0x07;
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        table + (self.next_tile_id as u16) * 16 + fine_y
    }

    fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn update_nmi_line(&mut self) {
        let line = (self.ctrl & CTRL_NMI_ENABLE) != 0 && (self.status & STATUS_VBLANK) != 0;
        if line && !self.nmi_line {
            self.nmi_pending = true;
            self.debug.nmi_edges = self.debug.nmi_edges.wrapping_add(1);
        }
        self.nmi_line = line;
    }

    fn render_pixel(&mut self, bus: &PictureBus, x: usize, y: usize) {
        let (bg_pixel, bg_palette) = self.background_sample(x);
        let (spr_pixel, spr_palette, spr_behind_bg, sprite0) = self.sprite_sample(x);
        let bg_opaque = bg_pixel != 0;

        if sprite0 && bg_opaque && x < 255 && (self.status & STATUS_SPRITE_ZERO_HIT) == 0 {
            self.status |= STATUS_SPRITE_ZERO_HIT;
            self.debug.sprite0_hits = self.debug.sprite0_hits.wrapping_add(1);
        }

        let palette_index = if spr_pixel != 0 && (!bg_opaque || !spr_behind_bg) {
            0x10 | (spr_palette << 2) | spr_pixel
        } else if bg_opaque {
            (bg_palette << 2) | bg_pixel
        } else {
            0
        };

        let color = NES_PALETTE[(bus.read_palette(palette_index) & 0x3F) as usize];
        let pixel = (y * FRAME_WIDTH + x) * 4;
        self.frame_buffer[pixel..pixel + 3].copy_from_slice(&color);
        self.frame_buffer[pixel + 3] = 0xFF;
    }

    fn background_sample(&self, x: usize) -> (u8, u8) {
        if (self.mask & MASK_SHOW_BG) == 0 || (x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0) {
            return (0, 0);
        }

        let bit = 0x8000u16 >> self.fine_x;

        let p0 = ((self.bg_shift_pattern_lo & bit) != 0) as u8;
        let p1 = ((self.bg_shift_pattern_hi & bit) != 0) as u8;
        let a0 = ((self.bg_shift_attr_lo & bit) != 0) as u8;
        let a1 = ((self.bg_shift_attr_hi & bit) != 0) as u8;

        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    /// First opaque sprite pixel under `x`: (pixel, palette, behind background, is sprite 0).
    fn sprite_sample(&self, x: usize) -> (u8, u8, bool, bool) {
        if (self.mask & MASK_SHOW_SPRITES) == 0
            || (x < 8 && (self.mask & MASK_SHOW_SPRITE_LEFT) == 0)
        {
            return (0, 0, false, false);
        }

        for i in 0..self.sprite_count {
            if self.sprite_x[i] != 0 {
                continue;
            }

            let p0 = (self.sprite_patterns_lo[i] & 0x80) >> 7;
            let p1 = (self.sprite_patterns_hi[i] & 0x80) >> 6;
            let pixel = p0 | p1;
            if pixel == 0 {
                continue;
            }

            let attributes = self.sprite_attributes[i];
            return (
                pixel,
                attributes & 0x03,
                (attributes & SPRITE_ATTR_PRIORITY) != 0,
                self.sprite_indices[i] == 0,
            );
        }

        (0, 0, false, false)
    }

    fn shift_background_registers(&mut self) {
        self.bg_shift_pattern_lo <<= 1;
        self.bg_shift_pattern_hi <<= 1;
        self.bg_shift_attr_lo <<= 1;
        self.bg_shift_attr_hi <<= 1;
    }

    fn shift_sprite_registers(&mut self) {
        for i in 0..self.sprite_count {
            if self.sprite_x[i] > 0 {
                self.sprite_x[i] -= 1;
            } else {
                self.sprite_patterns_lo[i] <<= 1;
                self.sprite_patterns_hi[i] <<= 1;
            }
        }
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;

        let attr_lo = if (self.next_tile_attr & 0x01) != 0 { 0xFF } else { 0x00 };
        let attr_hi = if (self.next_tile_attr & 0x02) != 0 { 0xFF } else { 0x00 };
        self.bg_shift_attr_lo = (self.bg_shift_attr_lo & 0xFF00) | attr_lo;
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi & 0xFF00) | attr_hi;
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v = self.v.wrapping_add(0x1000);
            return;
        }

        self.v &= !0x7000;
        let mut y = (self.v & 0x03E0) >> 5;
        if y == 29 {
            y = 0;
            self.v ^= 0x0800;
        } else if y == 31 {
            y = 0;
        } else {
            y += 1;
        }

        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    fn sprite_height(&self) -> u16 {
        if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        }
    }

    /// Loads up to eight sprites for the current line. A ninth in-range
    /// sprite sets the overflow flag.
    fn evaluate_sprites(&mut self, bus: &PictureBus, mapper: &Mapper) {
        self.sprite_count = 0;
        let scanline = self.scanline;
        let sprite_height = self.sprite_height();

        for i in 0..64 {
            let base = i * 4;
            let top = self.oam[base] as u16 + 1;
            if scanline < top || scanline - top >= sprite_height {
                continue;
            }

            if self.sprite_count >= 8 {
                if self.rendering_enabled() && (self.status & STATUS_SPRITE_OVERFLOW) == 0 {
                    self.status |= STATUS_SPRITE_OVERFLOW;
                    self.debug.sprite_overflows = self.debug.sprite_overflows.wrapping_add(1);
                }
                break;
            }

            let tile_index = self.oam[base + 1];
            let attributes = self.oam[base + 2];

            let mut row = scanline - top;
            if (attributes & SPRITE_ATTR_FLIP_V) != 0 {
                row = sprite_height - 1 - row;
            }

            let (table, tile) = if sprite_height == 16 {
                (
                    ((tile_index & 0x01) as u16) * 0x1000,
                    ((tile_index & 0xFE) as u16) + row / 8,
                )
            } else if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                (0x1000, tile_index as u16)
            } else {
                (0x0000, tile_index as u16)
            };

            let addr = table + tile * 16 + (row & 0x07);
            let mut low = bus.read(mapper, addr);
            let mut high = bus.read(mapper, addr + 8);
            if (attributes & SPRITE_ATTR_FLIP_H) != 0 {
                low = low.reverse_bits();
                high = high.reverse_bits();
            }

            let idx = self.sprite_count;
            self.sprite_patterns_lo[idx] = low;
            self.sprite_patterns_hi[idx] = high;
            self.sprite_x[idx] = self.oam[base + 3];
            self.sprite_attributes[idx] = attributes;
            self.sprite_indices[idx] = i as u8;
            self.sprite_count += 1;
        }
    }

    fn increment_vram_addr_cpu_access(&mut self) {
        let rendering_line = matches!(self.pipeline(), Pipeline::Render | Pipeline::PreRender);
        if self.rendering_enabled() && rendering_line {
            self.increment_coarse_x();
            self.increment_y();
        } else if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            self.v = self.v.wrapping_add(32);
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::Cartridge;
    use crate::nes::mapper::Mirroring;

    const DOTS_PER_FRAME: usize = SCANLINES_PER_FRAME as usize * DOTS_PER_SCANLINE as usize;

    fn setup() -> (Ppu, PictureBus, Mapper) {
        let mapper = Mapper::new(Cartridge {
            mapper_id: 0,
            mirroring: Mirroring::Vertical,
            has_extended_ram: false,
            prg_rom: vec![0; 0x4000],
            chr_rom: Vec::new(),
        })
        .unwrap();
        (Ppu::new(), PictureBus::new(Mirroring::Vertical), mapper)
    }

    /// Solid tile 1 (colour 1) in pattern table 0 and a nametable full of it.
    fn fill_background(bus: &mut PictureBus, mapper: &mut Mapper) {
        for row in 0..8 {
            bus.write(mapper, 0x0010 + row, 0xFF);
        }
        for offset in 0..960 {
            bus.write(mapper, 0x2000 + offset, 0x01);
        }
        bus.write(mapper, 0x3F00, 0x0F);
        bus.write(mapper, 0x3F01, 0x30);
        bus.write(mapper, 0x3F11, 0x16);
    }

    fn run_dots(ppu: &mut Ppu, bus: &mut PictureBus, mapper: &mut Mapper, dots: usize) {
        for _ in 0..dots {
            ppu.tick(bus, mapper);
        }
    }

    fn pixel(ppu: &Ppu, x: usize, y: usize) -> [u8; 3] {
        let idx = (y * FRAME_WIDTH + x) * 4;
        let mut rgb = [0; 3];
        rgb.copy_from_slice(&ppu.frame_buffer()[idx..idx + 3]);
        rgb
    }

    #[test]
    fn pipeline_follows_scanline() {
        let (mut ppu, mut bus, mut mapper) = setup();
        assert_eq!(ppu.pipeline(), Pipeline::PreRender);

        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_SCANLINE as usize);
        assert_eq!(ppu.scanline_cycle(), (0, 0));
        assert_eq!(ppu.pipeline(), Pipeline::Render);

        run_dots(&mut ppu, &mut bus, &mut mapper, 240 * DOTS_PER_SCANLINE as usize);
        assert_eq!(ppu.pipeline(), Pipeline::PostRender);

        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_SCANLINE as usize);
        assert_eq!(ppu.pipeline(), Pipeline::VerticalBlank);
    }

    #[test]
    fn vblank_raises_nmi_once() {
        let (mut ppu, mut bus, mut mapper) = setup();
        ppu.write_register(0x2000, CTRL_NMI_ENABLE, &mut bus, &mut mapper);

        while ppu.scanline_cycle() != (VBLANK_SCANLINE, 2) {
            ppu.tick(&mut bus, &mut mapper);
        }
        assert!(ppu.take_nmi());
        assert!(!ppu.take_nmi());

        run_dots(&mut ppu, &mut bus, &mut mapper, 100);
        assert!(!ppu.take_nmi());

        assert_ne!(ppu.read_register(0x2002, &bus, &mapper) & STATUS_VBLANK, 0);
        assert_eq!(ppu.read_register(0x2002, &bus, &mapper) & STATUS_VBLANK, 0);
        assert_eq!(ppu.debug_counters().nmi_edges, 1);
    }

    #[test]
    fn odd_frames_are_one_dot_shorter_when_rendering() {
        let (mut ppu, mut bus, mut mapper) = setup();
        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_FRAME);
        assert_eq!(ppu.scanline_cycle(), (PRE_RENDER_SCANLINE, 0));

        ppu.write_register(0x2001, MASK_SHOW_BG, &mut bus, &mut mapper);
        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_FRAME);
        assert_eq!(ppu.scanline_cycle(), (PRE_RENDER_SCANLINE, 1));
    }

    #[test]
    fn renders_background_tile() {
        let (mut ppu, mut bus, mut mapper) = setup();
        fill_background(&mut bus, &mut mapper);
        ppu.write_register(0x2001, MASK_SHOW_BG | MASK_SHOW_BG_LEFT, &mut bus, &mut mapper);

        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_FRAME);
        assert_eq!(pixel(&ppu, 10, 10), NES_PALETTE[0x30]);
        assert_eq!(pixel(&ppu, 200, 100), NES_PALETTE[0x30]);

        ppu.write_register(0x2001, 0, &mut bus, &mut mapper);
        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_FRAME);
        assert_eq!(pixel(&ppu, 10, 10), NES_PALETTE[0x0F]);
    }

    #[test]
    fn sprite_zero_hit_and_priority() {
        let (mut ppu, mut bus, mut mapper) = setup();
        fill_background(&mut bus, &mut mapper);
        ppu.write_oam_dma(&{
            let mut oam = [0xFF; 256];
            oam[..4].copy_from_slice(&[20, 0x01, 0x00, 30]);
            oam
        });
        let mask = MASK_SHOW_BG | MASK_SHOW_SPRITES | MASK_SHOW_BG_LEFT | MASK_SHOW_SPRITE_LEFT;
        ppu.write_register(0x2001, mask, &mut bus, &mut mapper);

        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_FRAME);
        assert_ne!(ppu.status & STATUS_SPRITE_ZERO_HIT, 0);
        assert_eq!(ppu.debug_counters().sprite0_hits, 1);
        assert_eq!(pixel(&ppu, 32, 24), NES_PALETTE[0x16]);
        assert_eq!(pixel(&ppu, 32, 40), NES_PALETTE[0x30]);
    }

    #[test]
    fn ninth_sprite_sets_overflow() {
        let (mut ppu, mut bus, mut mapper) = setup();
        let mut oam = [0xFF; 256];
        for sprite in 0..9 {
            oam[sprite * 4] = 50;
            oam[sprite * 4 + 3] = (sprite * 10) as u8;
        }
        ppu.write_oam_dma(&oam);
        ppu.write_register(0x2001, MASK_SHOW_SPRITES, &mut bus, &mut mapper);

        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_FRAME);
        assert_ne!(ppu.status & STATUS_SPRITE_OVERFLOW, 0);
    }

    #[test]
    fn data_port_reads_are_buffered_except_palette() {
        let (mut ppu, mut bus, mut mapper) = setup();
        bus.write(&mut mapper, 0x2400, 0xAB);
        bus.write(&mut mapper, 0x2401, 0xCD);
        bus.write(&mut mapper, 0x3F03, 0x2A);

        ppu.write_register(0x2006, 0x24, &mut bus, &mut mapper);
        ppu.write_register(0x2006, 0x00, &mut bus, &mut mapper);
        let _ = ppu.read_register(0x2007, &bus, &mapper);
        assert_eq!(ppu.read_register(0x2007, &bus, &mapper), 0xAB);
        assert_eq!(ppu.read_register(0x2007, &bus, &mapper), 0xCD);

        ppu.write_register(0x2006, 0x3F, &mut bus, &mut mapper);
        ppu.write_register(0x2006, 0x03, &mut bus, &mut mapper);
        assert_eq!(ppu.read_register(0x2007, &bus, &mapper), 0x2A);
    }

    #[test]
    fn data_port_writes_honour_increment_mode() {
        let (mut ppu, mut bus, mut mapper) = setup();
        ppu.write_register(0x2000, CTRL_VRAM_INC_32, &mut bus, &mut mapper);
        ppu.write_register(0x2006, 0x20, &mut bus, &mut mapper);
        ppu.write_register(0x2006, 0x00, &mut bus, &mut mapper);
        ppu.write_register(0x2007, 0x11, &mut bus, &mut mapper);
        ppu.write_register(0x2007, 0x22, &mut bus, &mut mapper);

        assert_eq!(bus.read(&mapper, 0x2000), 0x11);
        assert_eq!(bus.read(&mapper, 0x2020), 0x22);
    }

    #[test]
    fn restored_scanline_drives_pipeline() {
        let (mut ppu, mut bus, mut mapper) = setup();
        let mut json = serde_json::to_value(&ppu).unwrap();
        json["scanline"] = 250.into();
        json["pipeline"] = "Render".into();
        ppu = serde_json::from_value(json).unwrap();

        assert!(ppu.validate().is_ok());
        assert_eq!(ppu.pipeline(), Pipeline::VerticalBlank);
        run_dots(&mut ppu, &mut bus, &mut mapper, DOTS_PER_FRAME);
        assert_eq!(ppu.scanline_cycle(), (250, 0));
    }

    #[test]
    fn validate_rejects_impossible_counters() {
        let ppu = Ppu::new();
        assert!(ppu.validate().is_ok());

        let mut bad = ppu.clone();
        bad.scanline = 300;
        assert!(bad.validate().is_err());
        let mut bad = ppu.clone();
        bad.cycle = DOTS_PER_SCANLINE;
        assert!(bad.validate().is_err());
        let mut bad = ppu.clone();
        bad.fine_x = 16;
        assert!(bad.validate().is_err());
        let mut bad = ppu.clone();
        bad.sprite_count = 9;
        assert!(bad.validate().is_err());
    }
}
