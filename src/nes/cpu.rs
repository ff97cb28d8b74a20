use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;
const INTERRUPT_CYCLES: u32 = 7;
const OAM_DMA_CYCLES: u32 = 513;
/// Longest stall a live CPU can owe: an interrupt or instruction, an OAM DMA
/// and a few DMC fetches.
const MAX_SKIP_CYCLES: u32 = 1024;

/// Base cost of every opcode, unofficial ones included. Page-crossing and
/// branch penalties are added on top.
#[rustfmt::skip]
const OPERATION_CYCLES: [u8; 256] = [
    7, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 6, 2, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5,
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4,
    2, 5, 2, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4,
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6,
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7,
];

/// CPU-visible side of the machine. The orchestrator implements this over
/// borrowed components; tests use a flat 64 KB array.
pub trait CpuBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, value: u8);
    /// Level of the shared IRQ line (APU frame/DMC and mapper sources).
    fn irq_line(&self) -> bool;
    /// True once after a write to the sprite DMA register.
    fn take_oam_dma(&mut self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub sp: u8,
    pub pc: u16,

    pub cycles: u64,
    skip_cycles: u32,
    pending_nmi: bool,
    halted: bool,

    pub nmi_serviced: u64,
    pub irq_serviced: u64,
    pub unknown_opcodes: u64,
    last_unknown: Option<(u8, u16)>,
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            sp: 0xFD,
            pc: 0,
            cycles: 0,
            skip_cycles: 0,
            pending_nmi: false,
            halted: false,
            nmi_serviced: 0,
            irq_serviced: 0,
            unknown_opcodes: 0,
            last_unknown: None,
        }
    }
}

impl Cpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self, bus: &mut impl CpuBus) {
        *self = Self::default();
        self.pc = self.read_u16(bus, RESET_VECTOR);
    }

    pub fn set_nmi(&mut self) {
        self.pending_nmi = true;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn last_unknown_opcode(&self) -> Option<(u8, u16)> {
        self.last_unknown
    }

    /// Rejects a restored stall no running CPU could have accumulated.
    pub fn validate(&self) -> Result<()> {
        if self.skip_cycles > MAX_SKIP_CYCLES {
            bail!("{} stall cycles pending, at most {MAX_SKIP_CYCLES} possible", self.skip_cycles);
        }
        Ok(())
    }

    /// Adds stall cycles before the next instruction boundary.
    pub fn stall(&mut self, cycles: u32) {
        self.skip_cycles += cycles;
    }

    /// Advances one CPU cycle. A whole instruction executes on its first
    /// cycle; the remaining cycles of its cost are burned as skips.
    pub fn step(&mut self, bus: &mut impl CpuBus) {
        self.cycles = self.cycles.wrapping_add(1);

        if self.skip_cycles > 1 {
            self.skip_cycles -= 1;
            return;
        }
        self.skip_cycles = 0;

        if self.halted {
            return;
        }

        if self.pending_nmi {
            self.pending_nmi = false;
            self.interrupt(bus, NMI_VECTOR);
            self.nmi_serviced = self.nmi_serviced.wrapping_add(1);
            return;
        }

        if bus.irq_line() && !self.get_flag(FLAG_INTERRUPT) {
            self.interrupt(bus, IRQ_VECTOR);
            self.irq_serviced = self.irq_serviced.wrapping_add(1);
            return;
        }

        let opcode_pc = self.pc;
        let opcode = self.fetch_byte(bus);
        let penalty = self.execute(bus, opcode, opcode_pc);
        let cost = OPERATION_CYCLES[opcode as usize] as u32 + penalty;
        self.skip_cycles += cost;

        // The DMA halts the CPU after the write, the instruction's last cycle.
        // A write on an odd cycle costs one extra alignment cycle.
        if bus.take_oam_dma() {
            let write_cycle = self.cycles.wrapping_add(cost as u64).wrapping_sub(1);
            self.skip_cycles += OAM_DMA_CYCLES + (write_cycle & 0x01) as u32;
        }
    }

    fn interrupt(&mut self, bus: &mut impl CpuBus, vector: u16) {
        self.push_u16(bus, self.pc);
        self.push(bus, (self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = self.read_u16(bus, vector);
        self.skip_cycles += INTERRUPT_CYCLES;
    }

    /// Runs one decoded instruction and returns its variable cycle penalty.
    fn execute(&mut self, bus: &mut impl CpuBus, opcode: u8, opcode_pc: u16) -> u32 {
        if let Some(penalty) = self.exec_unofficial(bus, opcode) {
            return penalty;
        }

        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;

        match opcode & 0x03 {
            0x01 => self.exec_group1(bus, aaa, bbb),
            0x02 => self.exec_group2(bus, opcode, aaa, bbb, opcode_pc),
            0x00 => self.exec_group0(bus, opcode, opcode_pc),
            _ => {
                self.note_unknown_opcode(opcode, opcode_pc);
                0
            }
        }
    }

    fn exec_group1(&mut self, bus: &mut impl CpuBus, aaa: u8, bbb: u8) -> u32 {
        let is_store = aaa == 4;

        if bbb == 2 {
            // STA immediate is the two-byte NOP $89.
            let value = self.fetch_byte(bus);
            if !is_store {
                self.exec_group1_alu(aaa, value);
            }
            return 0;
        }

        let (addr, page_crossed) = match bbb {
            0 => (self.addr_indx(bus), false),
            1 => (self.addr_zp(bus), false),
            3 => (self.addr_abs(bus), false),
            4 => self.addr_indy(bus),
            5 => (self.addr_zpx(bus), false),
            6 => self.addr_absy(bus),
            _ => self.addr_absx(bus),
        };

        if is_store {
            bus.write(addr, self.a);
            return 0;
        }

        let value = bus.read(addr);
        self.exec_group1_alu(aaa, value);
        page_crossed as u32
    }

    fn exec_group1_alu(&mut self, aaa: u8, value: u8) {
        match aaa {
            0 => self.ora(value),
            1 => self.and(value),
            2 => self.eor(value),
            3 => self.adc(value),
            5 => {
                self.a = value;
                self.update_zn(self.a);
            }
            6 => self.compare(self.a, value),
            7 => self.sbc(value),
            _ => {}
        }
    }

    fn exec_group2(
        &mut self,
        bus: &mut impl CpuBus,
        opcode: u8,
        aaa: u8,
        bbb: u8,
        opcode_pc: u16,
    ) -> u32 {
        match opcode {
            0x8A => {
                self.a = self.x;
                self.update_zn(self.a);
                return 0;
            }
            0x9A => {
                self.sp = self.x;
                return 0;
            }
            0xAA => {
                self.x = self.a;
                self.update_zn(self.x);
                return 0;
            }
            0xBA => {
                self.x = self.sp;
                self.update_zn(self.x);
                return 0;
            }
            0xCA => {
                self.x = self.x.wrapping_sub(1);
                self.update_zn(self.x);
                return 0;
            }
            0x82 | 0xC2 | 0xE2 => {
                self.fetch_byte(bus);
                return 0;
            }
            0x1A | 0x3A | 0x5A | 0x7A | 0xDA | 0xEA | 0xFA => return 0,
            0x02 | 0x12 | 0x22 | 0x32 | 0x42 | 0x52 | 0x62 | 0x72 | 0x92 | 0xB2 | 0xD2 | 0xF2 => {
                self.halted = true;
                log::warn!("CPU jammed by opcode ${opcode:02X} at ${opcode_pc:04X}");
                return 0;
            }
            _ => {}
        }

        match aaa {
            4 => self.exec_stx(bus, bbb),
            5 => self.exec_ldx(bus, bbb),
            6 => self.exec_rmw(bus, bbb, RmwOp::Dec),
            7 => self.exec_rmw(bus, bbb, RmwOp::Inc),
            0 => self.exec_rmw(bus, bbb, RmwOp::Asl),
            1 => self.exec_rmw(bus, bbb, RmwOp::Rol),
            2 => self.exec_rmw(bus, bbb, RmwOp::Lsr),
            _ => self.exec_rmw(bus, bbb, RmwOp::Ror),
        }
    }

    fn exec_stx(&mut self, bus: &mut impl CpuBus, bbb: u8) -> u32 {
        let addr = match bbb {
            1 => self.addr_zp(bus),
            3 => self.addr_abs(bus),
            5 => self.addr_zpy(bus),
            // $9E SHX: store X & (high byte + 1).
            _ => {
                let (addr, _) = self.addr_absy(bus);
                let value = self.x & ((addr >> 8) as u8).wrapping_add(1);
                bus.write(addr, value);
                return 0;
            }
        };
        bus.write(addr, self.x);
        0
    }

    fn exec_ldx(&mut self, bus: &mut impl CpuBus, bbb: u8) -> u32 {
        let (value, penalty) = match bbb {
            0 => (self.fetch_byte(bus), 0),
            1 => {
                let addr = self.addr_zp(bus);
                (bus.read(addr), 0)
            }
            3 => {
                let addr = self.addr_abs(bus);
                (bus.read(addr), 0)
            }
            5 => {
                let addr = self.addr_zpy(bus);
                (bus.read(addr), 0)
            }
            _ => {
                let (addr, page) = self.addr_absy(bus);
                (bus.read(addr), page as u32)
            }
        };
        self.x = value;
        self.update_zn(self.x);
        penalty
    }

    fn exec_rmw(&mut self, bus: &mut impl CpuBus, bbb: u8, op: RmwOp) -> u32 {
        if bbb == 2 {
            self.a = self.apply_rmw(op, self.a);
            return 0;
        }

        let addr = match bbb {
            1 => self.addr_zp(bus),
            3 => self.addr_abs(bus),
            5 => self.addr_zpx(bus),
            _ => self.addr_absx(bus).0,
        };

        let value = bus.read(addr);
        let out = self.apply_rmw(op, value);
        bus.write(addr, out);
        0
    }

    fn apply_rmw(&mut self, op: RmwOp, value: u8) -> u8 {
        match op {
            RmwOp::Asl => self.asl(value),
            RmwOp::Rol => self.rol(value),
            RmwOp::Lsr => self.lsr(value),
            RmwOp::Ror => self.ror(value),
            RmwOp::Dec => {
                let out = value.wrapping_sub(1);
                self.update_zn(out);
                out
            }
            RmwOp::Inc => {
                let out = value.wrapping_add(1);
                self.update_zn(out);
                out
            }
        }
    }

    fn exec_unofficial(&mut self, bus: &mut impl CpuBus, opcode: u8) -> Option<u32> {
        match opcode {
            // SHY absolute,X
            0x9C => {
                let (addr, _) = self.addr_absx(bus);
                let value = self.y & ((addr >> 8) as u8).wrapping_add(1);
                bus.write(addr, value);
                return Some(0);
            }
            // LAS absolute,Y
            0xBB => {
                let (addr, page) = self.addr_absy(bus);
                let value = bus.read(addr) & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.update_zn(value);
                return Some(page as u32);
            }
            _ => {}
        }

        if (opcode & 0x03) != 0x03 {
            return None;
        }

        let aaa = opcode >> 5;
        let bbb = (opcode >> 2) & 0x07;

        if bbb == 2 {
            let imm = self.fetch_byte(bus);
            match aaa {
                // ANC
                0 | 1 => {
                    self.a &= imm;
                    self.update_zn(self.a);
                    self.set_flag(FLAG_CARRY, (self.a & 0x80) != 0);
                }
                // ALR
                2 => {
                    self.a &= imm;
                    self.a = self.lsr(self.a);
                }
                // ARR
                3 => {
                    self.a &= imm;
                    let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                    self.a = (self.a >> 1) | carry_in;
                    self.update_zn(self.a);
                    self.set_flag(FLAG_CARRY, (self.a & 0x40) != 0);
                    self.set_flag(
                        FLAG_OVERFLOW,
                        (((self.a >> 6) & 0x01) ^ ((self.a >> 5) & 0x01)) != 0,
                    );
                }
                // ANE, unstable on hardware
                4 => {
                    self.a = (self.a | 0xEE) & self.x & imm;
                    self.update_zn(self.a);
                }
                // LXA, unstable on hardware
                5 => {
                    self.a = (self.a | 0xEE) & imm;
                    self.x = self.a;
                    self.update_zn(self.a);
                }
                // AXS
                6 => {
                    let in_ax = self.a & self.x;
                    self.set_flag(FLAG_CARRY, in_ax >= imm);
                    self.x = in_ax.wrapping_sub(imm);
                    self.update_zn(self.x);
                }
                _ => self.sbc(imm),
            }
            return Some(0);
        }

        match aaa {
            4 => {
                let addr = match bbb {
                    0 => self.addr_indx(bus),
                    1 => self.addr_zp(bus),
                    3 => self.addr_abs(bus),
                    5 => self.addr_zpy(bus),
                    // $93/$9F SHA, $9B TAS
                    _ => {
                        let (addr, _) = if bbb == 4 {
                            self.addr_indy(bus)
                        } else {
                            self.addr_absy(bus)
                        };
                        if bbb == 6 {
                            self.sp = self.a & self.x;
                        }
                        let high = ((addr >> 8) as u8).wrapping_add(1);
                        let value = if bbb == 6 { self.sp } else { self.a & self.x } & high;
                        bus.write(addr, value);
                        return Some(0);
                    }
                };
                bus.write(addr, self.a & self.x);
                Some(0)
            }
            5 => {
                let (addr, penalty) = match bbb {
                    0 => (self.addr_indx(bus), false),
                    1 => (self.addr_zp(bus), false),
                    3 => (self.addr_abs(bus), false),
                    4 => self.addr_indy(bus),
                    5 => (self.addr_zpy(bus), false),
                    _ => self.addr_absy(bus),
                };
                let value = bus.read(addr);
                self.a = value;
                self.x = value;
                self.update_zn(value);
                Some(penalty as u32)
            }
            _ => {
                let addr = match bbb {
                    0 => self.addr_indx(bus),
                    1 => self.addr_zp(bus),
                    3 => self.addr_abs(bus),
                    4 => self.addr_indy(bus).0,
                    5 => self.addr_zpx(bus),
                    6 => self.addr_absy(bus).0,
                    _ => self.addr_absx(bus).0,
                };
                let op = match aaa {
                    0 => UnofficialRmwOp::Slo,
                    1 => UnofficialRmwOp::Rla,
                    2 => UnofficialRmwOp::Sre,
                    3 => UnofficialRmwOp::Rra,
                    6 => UnofficialRmwOp::Dcp,
                    _ => UnofficialRmwOp::Isc,
                };
                self.exec_unofficial_rmw(bus, addr, op);
                Some(0)
            }
        }
    }

    fn exec_unofficial_rmw(&mut self, bus: &mut impl CpuBus, addr: u16, op: UnofficialRmwOp) {
        let value = bus.read(addr);

        let out = match op {
            UnofficialRmwOp::Slo => {
                let shifted = self.asl(value);
                self.a |= shifted;
                self.update_zn(self.a);
                shifted
            }
            UnofficialRmwOp::Rla => {
                let shifted = self.rol(value);
                self.a &= shifted;
                self.update_zn(self.a);
                shifted
            }
            UnofficialRmwOp::Sre => {
                let shifted = self.lsr(value);
                self.a ^= shifted;
                self.update_zn(self.a);
                shifted
            }
            UnofficialRmwOp::Rra => {
                let shifted = self.ror(value);
                self.adc(shifted);
                shifted
            }
            UnofficialRmwOp::Dcp => {
                let decremented = value.wrapping_sub(1);
                self.compare(self.a, decremented);
                decremented
            }
            UnofficialRmwOp::Isc => {
                let incremented = value.wrapping_add(1);
                self.sbc(incremented);
                incremented
            }
        };

        bus.write(addr, out);
    }

    fn exec_group0(&mut self, bus: &mut impl CpuBus, opcode: u8, opcode_pc: u16) -> u32 {
        match opcode {
            0x00 => {
                self.pc = self.pc.wrapping_add(1);
                self.push_u16(bus, self.pc);
                self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED);
                self.set_flag(FLAG_INTERRUPT, true);
                self.pc = self.read_u16(bus, IRQ_VECTOR);
            }
            0x08 => self.push(bus, self.p | FLAG_BREAK | FLAG_UNUSED),
            0x10 => return self.branch(bus, !self.get_flag(FLAG_NEGATIVE)),
            0x18 => self.set_flag(FLAG_CARRY, false),
            0x20 => {
                let addr = self.fetch_word(bus);
                self.push_u16(bus, self.pc.wrapping_sub(1));
                self.pc = addr;
            }
            0x24 | 0x2C => {
                let addr = if opcode == 0x24 {
                    self.addr_zp(bus)
                } else {
                    self.addr_abs(bus)
                };
                let value = bus.read(addr);
                self.bit(value);
            }
            0x28 => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
            }
            0x30 => return self.branch(bus, self.get_flag(FLAG_NEGATIVE)),
            0x38 => self.set_flag(FLAG_CARRY, true),
            0x40 => {
                self.p = (self.pop(bus) & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16(bus);
            }
            0x48 => self.push(bus, self.a),
            0x4C => self.pc = self.fetch_word(bus),
            0x50 => return self.branch(bus, !self.get_flag(FLAG_OVERFLOW)),
            0x58 => self.set_flag(FLAG_INTERRUPT, false),
            0x60 => self.pc = self.pop_u16(bus).wrapping_add(1),
            0x68 => {
                self.a = self.pop(bus);
                self.update_zn(self.a);
            }
            0x6C => {
                let ptr = self.fetch_word(bus);
                self.pc = self.read_u16_bug(bus, ptr);
            }
            0x70 => return self.branch(bus, self.get_flag(FLAG_OVERFLOW)),
            0x78 => self.set_flag(FLAG_INTERRUPT, true),
            0x84 => {
                let addr = self.addr_zp(bus);
                bus.write(addr, self.y);
            }
            0x88 => {
                self.y = self.y.wrapping_sub(1);
                self.update_zn(self.y);
            }
            0x8C => {
                let addr = self.addr_abs(bus);
                bus.write(addr, self.y);
            }
            0x90 => return self.branch(bus, !self.get_flag(FLAG_CARRY)),
            0x94 => {
                let addr = self.addr_zpx(bus);
                bus.write(addr, self.y);
            }
            0x98 => {
                self.a = self.y;
                self.update_zn(self.a);
            }
            0xA0 => {
                self.y = self.fetch_byte(bus);
                self.update_zn(self.y);
            }
            0xA4 => {
                let addr = self.addr_zp(bus);
                self.y = bus.read(addr);
                self.update_zn(self.y);
            }
            0xA8 => {
                self.y = self.a;
                self.update_zn(self.y);
            }
            0xAC => {
                let addr = self.addr_abs(bus);
                self.y = bus.read(addr);
                self.update_zn(self.y);
            }
            0xB0 => return self.branch(bus, self.get_flag(FLAG_CARRY)),
            0xB4 => {
                let addr = self.addr_zpx(bus);
                self.y = bus.read(addr);
                self.update_zn(self.y);
            }
            0xB8 => self.set_flag(FLAG_OVERFLOW, false),
            0xBC => {
                let (addr, page) = self.addr_absx(bus);
                self.y = bus.read(addr);
                self.update_zn(self.y);
                return page as u32;
            }
            0xC0 | 0xE0 => {
                let value = self.fetch_byte(bus);
                let register = if opcode == 0xC0 { self.y } else { self.x };
                self.compare(register, value);
            }
            0xC4 | 0xE4 => {
                let addr = self.addr_zp(bus);
                let value = bus.read(addr);
                let register = if opcode == 0xC4 { self.y } else { self.x };
                self.compare(register, value);
            }
            0xCC | 0xEC => {
                let addr = self.addr_abs(bus);
                let value = bus.read(addr);
                let register = if opcode == 0xCC { self.y } else { self.x };
                self.compare(register, value);
            }
            0xC8 => {
                self.y = self.y.wrapping_add(1);
                self.update_zn(self.y);
            }
            0xD0 => return self.branch(bus, !self.get_flag(FLAG_ZERO)),
            0xD8 => self.set_flag(FLAG_DECIMAL, false),
            0xE8 => {
                self.x = self.x.wrapping_add(1);
                self.update_zn(self.x);
            }
            0xF0 => return self.branch(bus, self.get_flag(FLAG_ZERO)),
            0xF8 => self.set_flag(FLAG_DECIMAL, true),

            0x80 => {
                self.fetch_byte(bus);
            }
            0x04 | 0x44 | 0x64 => {
                let addr = self.addr_zp(bus);
                let _ = bus.read(addr);
            }
            0x14 | 0x34 | 0x54 | 0x74 | 0xD4 | 0xF4 => {
                let addr = self.addr_zpx(bus);
                let _ = bus.read(addr);
            }
            0x0C => {
                let addr = self.addr_abs(bus);
                let _ = bus.read(addr);
            }
            0x1C | 0x3C | 0x5C | 0x7C | 0xDC | 0xFC => {
                let (addr, page) = self.addr_absx(bus);
                let _ = bus.read(addr);
                return page as u32;
            }

            _ => self.note_unknown_opcode(opcode, opcode_pc),
        }
        0
    }

    fn note_unknown_opcode(&mut self, opcode: u8, pc: u16) {
        self.unknown_opcodes = self.unknown_opcodes.wrapping_add(1);
        self.last_unknown = Some((opcode, pc));
        log::debug!("unknown opcode ${opcode:02X} at ${pc:04X}, executed as NOP");
    }

    fn fetch_byte(&mut self, bus: &mut impl CpuBus) -> u8 {
        let byte = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.fetch_byte(bus) as u16;
        let hi = self.fetch_byte(bus) as u16;
        (hi << 8) | lo
    }

    fn read_u16(&mut self, bus: &mut impl CpuBus, addr: u16) -> u16 {
        let lo = bus.read(addr) as u16;
        let hi = bus.read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    /// Indirect JMP never carries into the high byte of the pointer.
    fn read_u16_bug(&mut self, bus: &mut impl CpuBus, addr: u16) -> u16 {
        let lo = bus.read(addr) as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = bus.read(hi_addr) as u16;
        (hi << 8) | lo
    }

    fn push(&mut self, bus: &mut impl CpuBus, value: u8) {
        bus.write(0x0100 | self.sp as u16, value);
        self.sp = self.sp.wrapping_sub(1);
    }

    fn pop(&mut self, bus: &mut impl CpuBus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | self.sp as u16)
    }

    fn push_u16(&mut self, bus: &mut impl CpuBus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    fn pop_u16(&mut self, bus: &mut impl CpuBus) -> u16 {
        let lo = self.pop(bus) as u16;
        let hi = self.pop(bus) as u16;
        (hi << 8) | lo
    }

    pub fn get_flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn addr_zp(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_byte(bus) as u16
    }

    fn addr_zpx(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_byte(bus).wrapping_add(self.x) as u16
    }

    fn addr_zpy(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_byte(bus).wrapping_add(self.y) as u16
    }

    fn addr_abs(&mut self, bus: &mut impl CpuBus) -> u16 {
        self.fetch_word(bus)
    }

    fn addr_absx(&mut self, bus: &mut impl CpuBus) -> (u16, bool) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(self.x as u16);
        (addr, (base & 0xFF00) != (addr & 0xFF00))
    }

    fn addr_absy(&mut self, bus: &mut impl CpuBus) -> (u16, bool) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(self.y as u16);
        (addr, (base & 0xFF00) != (addr & 0xFF00))
    }

    fn addr_indx(&mut self, bus: &mut impl CpuBus) -> u16 {
        let zp = self.fetch_byte(bus).wrapping_add(self.x);
        self.read_zp_u16(bus, zp)
    }

    fn addr_indy(&mut self, bus: &mut impl CpuBus) -> (u16, bool) {
        let zp = self.fetch_byte(bus);
        let ptr = self.read_zp_u16(bus, zp);
        let addr = ptr.wrapping_add(self.y as u16);
        (addr, (ptr & 0xFF00) != (addr & 0xFF00))
    }

    fn read_zp_u16(&mut self, bus: &mut impl CpuBus, addr: u8) -> u16 {
        let lo = bus.read(addr as u16) as u16;
        let hi = bus.read(addr.wrapping_add(1) as u16) as u16;
        (hi << 8) | lo
    }

    fn branch(&mut self, bus: &mut impl CpuBus, condition: bool) -> u32 {
        let offset = self.fetch_byte(bus) as i8;
        if !condition {
            return 0;
        }
        let old_pc = self.pc;
        self.pc = old_pc.wrapping_add(offset as i16 as u16);
        if (old_pc & 0xFF00) != (self.pc & 0xFF00) {
            2
        } else {
            1
        }
    }

    fn ora(&mut self, value: u8) {
        self.a |= value;
        self.update_zn(self.a);
    }

    fn and(&mut self, value: u8) {
        self.a &= value;
        self.update_zn(self.a);
    }

    fn eor(&mut self, value: u8) {
        self.a ^= value;
        self.update_zn(self.a);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(register.wrapping_sub(value));
    }

    fn adc(&mut self, value: u8) {
        let carry_in = self.get_flag(FLAG_CARRY) as u16;
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = self.get_flag(FLAG_CARRY) as u8;
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

#[derive(Clone, Copy)]
enum RmwOp {
    Asl,
    Rol,
    Lsr,
    Ror,
    Dec,
    Inc,
}

#[derive(Clone, Copy)]
enum UnofficialRmwOp {
    Slo,
    Rla,
    Sre,
    Rra,
    Dcp,
    Isc,
}
