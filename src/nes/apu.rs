use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use super::blip::BlipBuffer;

pub const CPU_CLOCK_HZ: f64 = 1_789_772.727_272_727_3;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const CHANNEL_COUNT: usize = 5;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [u8; 4] = [0b0100_0000, 0b0110_0000, 0b0111_1000, 0b1001_1111];

const TRIANGLE_SEQUENCE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

const STEP_1: u32 = 7_457;
const STEP_2: u32 = 14_913;
const STEP_3: u32 = 22_371;
const FOUR_STEP_LAST: u32 = 29_829;
const FOUR_STEP_WRAP: u32 = 29_830;
const FIVE_STEP_LAST: u32 = 37_281;
const FIVE_STEP_WRAP: u32 = 37_282;

// Output amplitude per channel level, scaled so the summed stream stays
// within i16 and approximates the console's mixer weights.
const CHANNEL_WEIGHTS: [i32; CHANNEL_COUNT] = [246, 246, 279, 162, 110];
/// An audio frame left open this long is closed without waiting for the host.
pub const MAX_FRAME_CLOCKS: u32 = 2 * super::CYCLES_PER_FRAME;

pub const PULSE1: usize = 0;
pub const PULSE2: usize = 1;
pub const TRIANGLE: usize = 2;
pub const NOISE: usize = 3;
pub const DMC: usize = 4;

/// Samples produced by one `end_frame`: one stream per channel plus their sum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioFrame {
    pub channels: [Vec<i16>; CHANNEL_COUNT],
    pub mixed: Vec<i16>,
}

impl AudioFrame {
    pub fn len(&self) -> usize {
        self.mixed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mixed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Apu {
    pulse1: PulseChannel,
    pulse2: PulseChannel,
    triangle: TriangleChannel,
    noise: NoiseChannel,
    dmc: DmcChannel,

    frame_counter: u32,
    five_step_mode: bool,
    frame_irq_inhibit: bool,
    frame_irq_flag: bool,
    pending_frame_write: Option<PendingFrameWrite>,

    cycles: u64,
    sample_rate: u32,
    frame_clock: u32,
    levels: [i32; CHANNEL_COUNT],
    outputs: [BlipBuffer; CHANNEL_COUNT],
    dmc_dma_request: Option<u16>,

    #[serde(skip)]
    audio: AudioFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PendingFrameWrite {
    value: u8,
    delay: u8,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl Apu {
    pub fn new(sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(MIN_SAMPLE_RATE);
        Self {
            pulse1: PulseChannel::new(true),
            pulse2: PulseChannel::new(false),
            triangle: TriangleChannel::default(),
            noise: NoiseChannel::default(),
            dmc: DmcChannel::default(),
            frame_counter: 0,
            five_step_mode: false,
            frame_irq_inhibit: false,
            frame_irq_flag: false,
            pending_frame_write: None,
            cycles: 0,
            sample_rate,
            frame_clock: 0,
            levels: [0; CHANNEL_COUNT],
            outputs: std::array::from_fn(|_| BlipBuffer::new(CPU_CLOCK_HZ, sample_rate)),
            dmc_dma_request: None,
            audio: AudioFrame::default(),
        }
    }

    /// Power-on state at the current sample rate. Pending output is dropped.
    pub fn reset(&mut self) {
        *self = Self::new(self.sample_rate);
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(MIN_SAMPLE_RATE);
        self.outputs = std::array::from_fn(|_| BlipBuffer::new(CPU_CLOCK_HZ, self.sample_rate));
        self.levels = [0; CHANNEL_COUNT];
        self.frame_clock = 0;
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// CPU cycles recorded since the audio frame was last closed.
    pub fn open_frame_clocks(&self) -> u32 {
        self.frame_clock
    }

    /// Rejects restored values the channels cannot step through.
    pub fn validate(&self) -> Result<()> {
        for (name, pulse) in [("pulse 1", &self.pulse1), ("pulse 2", &self.pulse2)] {
            if pulse.duty > 3 || pulse.duty_step > 7 {
                bail!("{name} duty {} step {} out of range", pulse.duty, pulse.duty_step);
            }
            if pulse.sweep_shift > 7 || pulse.timer_period > 0x07FF {
                bail!(
                    "{name} sweep shift {} or period {:#06X} out of range",
                    pulse.sweep_shift,
                    pulse.timer_period
                );
            }
            pulse.envelope.validate(name)?;
        }
        self.noise.envelope.validate("noise")?;

        if self.triangle.step > 31 || self.triangle.timer_period > 0x07FF {
            bail!(
                "triangle step {} or period {:#06X} out of range",
                self.triangle.step,
                self.triangle.timer_period
            );
        }
        if !DMC_RATE_TABLE.contains(&self.dmc.timer_period) || self.dmc.output_level > 127 {
            bail!(
                "DMC period {} or level {} out of range",
                self.dmc.timer_period,
                self.dmc.output_level
            );
        }

        let wrap = if self.five_step_mode { FIVE_STEP_WRAP } else { FOUR_STEP_WRAP };
        if self.frame_counter >= wrap {
            bail!("frame counter {} past its sequence end {wrap}", self.frame_counter);
        }
        if self.sample_rate < MIN_SAMPLE_RATE {
            bail!("sample rate {} below {MIN_SAMPLE_RATE} Hz", self.sample_rate);
        }
        if self.frame_clock >= MAX_FRAME_CLOCKS {
            bail!("audio frame open for {} clocks", self.frame_clock);
        }
        for (channel, level) in self.levels.iter().enumerate() {
            if !(0..=255 * CHANNEL_WEIGHTS[channel]).contains(level) {
                bail!("channel {channel} level {level} out of range");
            }
        }
        for (channel, output) in self.outputs.iter().enumerate() {
            output
                .validate(CPU_CLOCK_HZ, self.sample_rate, MAX_FRAME_CLOCKS)
                .map_err(|err| err.context(format!("channel {channel} audio buffer")))?;
        }
        Ok(())
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000 => self.pulse1.write_control(value),
            0x4001 => self.pulse1.write_sweep(value),
            0x4002 => self.pulse1.write_timer_low(value),
            0x4003 => self.pulse1.write_timer_high(value),

            0x4004 => self.pulse2.write_control(value),
            0x4005 => self.pulse2.write_sweep(value),
            0x4006 => self.pulse2.write_timer_low(value),
            0x4007 => self.pulse2.write_timer_high(value),

            0x4008 => self.triangle.write_linear(value),
            0x400A => self.triangle.write_timer_low(value),
            0x400B => self.triangle.write_timer_high(value),

            0x400C => self.noise.write_control(value),
            0x400E => self.noise.write_period(value),
            0x400F => self.noise.write_length(value),

            0x4010 => self.dmc.write_control(value),
            0x4011 => self.dmc.output_level = value & 0x7F,
            0x4012 => self.dmc.sample_addr = value,
            0x4013 => self.dmc.sample_length = value,

            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    /// $4015 read. Acknowledges the frame IRQ.
    pub fn read_status(&mut self) -> u8 {
        let status = self.peek_status();
        self.frame_irq_flag = false;
        status
    }

    pub fn peek_status(&self) -> u8 {
        let mut status = self.pulse1.length.active() as u8;
        status |= (self.pulse2.length.active() as u8) << 1;
        status |= (self.triangle.length.active() as u8) << 2;
        status |= (self.noise.length.active() as u8) << 3;
        status |= (self.dmc.playback_active() as u8) << 4;
        status |= (self.frame_irq_flag as u8) << 6;
        status |= (self.dmc.irq_flag as u8) << 7;
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq_flag || self.dmc.irq_flag
    }

    /// Advances one CPU cycle.
    pub fn step(&mut self) {
        self.cycles = self.cycles.wrapping_add(1);

        if let Some(mut pending) = self.pending_frame_write {
            pending.delay = pending.delay.saturating_sub(1);
            if pending.delay == 0 {
                self.pending_frame_write = None;
                self.apply_frame_counter_write(pending.value);
            } else {
                self.pending_frame_write = Some(pending);
            }
        }

        if self.cycles & 1 == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
            self.noise.clock_timer();
        }
        self.triangle.clock_timer();
        self.dmc.clock_timer();
        self.request_dmc_dma();

        self.clock_frame_counter();
        self.record_levels();
    }

    /// Closes the audio frame and renders every channel's samples.
    pub fn end_frame(&mut self) {
        let mut frame = AudioFrame::default();
        for (output, samples) in self.outputs.iter_mut().zip(frame.channels.iter_mut()) {
            output.end_frame(self.frame_clock);
            output.read_samples(samples);
        }
        self.frame_clock = 0;

        let len = frame.channels.iter().map(Vec::len).min().unwrap_or(0);
        frame.mixed = (0..len)
            .map(|i| {
                frame
                    .channels
                    .iter()
                    .fold(0i16, |acc, channel| acc.saturating_add(channel[i]))
            })
            .collect();
        self.audio = frame;
    }

    pub fn audio_frame(&self) -> &AudioFrame {
        &self.audio
    }

    pub fn take_audio_frame(&mut self) -> AudioFrame {
        std::mem::take(&mut self.audio)
    }

    /// Address of a DMC sample byte the bus must fetch, if one is due.
    pub fn take_dmc_dma_request(&mut self) -> Option<u16> {
        self.dmc_dma_request.take()
    }

    pub fn complete_dmc_dma(&mut self, value: u8) {
        self.dmc.load_sample_byte(value);
        self.request_dmc_dma();
    }

    fn request_dmc_dma(&mut self) {
        if self.dmc.needs_dma() && self.dmc_dma_request.is_none() {
            self.dmc_dma_request = Some(self.dmc.current_addr);
        }
    }

    fn record_levels(&mut self) {
        let raw = [
            self.pulse1.output(),
            self.pulse2.output(),
            self.triangle.output(),
            self.noise.output(),
            self.dmc.output_level,
        ];
        for channel in 0..CHANNEL_COUNT {
            let level = raw[channel] as i32 * CHANNEL_WEIGHTS[channel];
            let delta = level - self.levels[channel];
            if delta != 0 {
                self.outputs[channel].add_delta(self.frame_clock, delta);
                self.levels[channel] = level;
            }
        }
        self.frame_clock += 1;
        if self.frame_clock >= MAX_FRAME_CLOCKS {
            self.end_frame();
        }
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq_flag = false;

        self.pulse1.length.set_enabled(value & 0x01 != 0);
        self.pulse2.length.set_enabled(value & 0x02 != 0);
        self.triangle.length.set_enabled(value & 0x04 != 0);
        self.noise.length.set_enabled(value & 0x08 != 0);

        self.dmc.enabled = value & 0x10 != 0;
        if !self.dmc.enabled {
            self.dmc.stop();
        } else if !self.dmc.playback_active() {
            self.dmc.restart_sample();
            self.request_dmc_dma();
        }
    }

    fn write_frame_counter(&mut self, value: u8) {
        if value & 0x40 != 0 {
            self.frame_irq_flag = false;
        }
        let delay = if self.cycles & 1 == 0 { 3 } else { 4 };
        self.pending_frame_write = Some(PendingFrameWrite { value, delay });
    }

    fn apply_frame_counter_write(&mut self, value: u8) {
        self.five_step_mode = value & 0x80 != 0;
        self.frame_irq_inhibit = value & 0x40 != 0;
        if self.frame_irq_inhibit {
            self.frame_irq_flag = false;
        }
        self.frame_counter = 0;
        if self.five_step_mode {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn clock_frame_counter(&mut self) {
        self.frame_counter += 1;

        match (self.five_step_mode, self.frame_counter) {
            (_, STEP_1 | STEP_3) => self.clock_quarter_frame(),
            (_, STEP_2) | (true, FIVE_STEP_LAST) => {
                self.clock_quarter_frame();
                self.clock_half_frame();
            }
            (false, FOUR_STEP_LAST) => {
                self.clock_quarter_frame();
                self.clock_half_frame();
                self.raise_frame_irq();
            }
            (false, FOUR_STEP_WRAP) => {
                self.raise_frame_irq();
                self.frame_counter = 0;
            }
            (true, FIVE_STEP_WRAP) => self.frame_counter = 0,
            _ => {}
        }
    }

    fn raise_frame_irq(&mut self) {
        if !self.frame_irq_inhibit {
            self.frame_irq_flag = true;
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.envelope.clock(self.pulse1.length.halted);
        self.pulse2.envelope.clock(self.pulse2.length.halted);
        self.triangle.clock_linear_counter();
        self.noise.envelope.clock(self.noise.length.halted);
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.length.clock();
        self.pulse1.clock_sweep();
        self.pulse2.length.clock();
        self.pulse2.clock_sweep();
        self.triangle.length.clock();
        self.noise.length.clock();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LengthCounter {
    enabled: bool,
    halted: bool,
    value: u8,
}

impl LengthCounter {
    fn active(&self) -> bool {
        self.value > 0
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.value = 0;
        }
    }

    fn load(&mut self, index: u8) {
        if self.enabled {
            self.value = LENGTH_TABLE[(index >> 3) as usize];
        }
    }

    fn clock(&mut self) {
        if !self.halted && self.value > 0 {
            self.value -= 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Envelope {
    constant: bool,
    volume: u8,
    start: bool,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.constant = value & 0x10 != 0;
        self.volume = value & 0x0F;
        self.start = true;
    }

    /// The halt flag doubles as the envelope loop flag.
    fn clock(&mut self, looping: bool) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.volume;
        } else if self.divider > 0 {
            self.divider -= 1;
        } else {
            self.divider = self.volume;
            if self.decay > 0 {
                self.decay -= 1;
            } else if looping {
                self.decay = 15;
            }
        }
    }

    fn level(&self) -> u8 {
        if self.constant { self.volume } else { self.decay }
    }

    fn validate(&self, channel: &str) -> Result<()> {
        if self.volume > 15 || self.decay > 15 {
            bail!(
                "{channel} envelope volume {} decay {} out of range",
                self.volume,
                self.decay
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PulseChannel {
    ones_complement: bool,
    duty: u8,
    duty_step: u8,
    timer_period: u16,
    timer_counter: u16,
    length: LengthCounter,
    envelope: Envelope,

    sweep_enabled: bool,
    sweep_period: u8,
    sweep_negate: bool,
    sweep_shift: u8,
    sweep_reload: bool,
    sweep_divider: u8,
}

impl PulseChannel {
    /// Pulse 1 negates its sweep with one's complement, pulse 2 with two's.
    fn new(ones_complement: bool) -> Self {
        Self {
            ones_complement,
            duty: 0,
            duty_step: 0,
            timer_period: 0,
            timer_counter: 0,
            length: LengthCounter::default(),
            envelope: Envelope::default(),
            sweep_enabled: false,
            sweep_period: 1,
            sweep_negate: false,
            sweep_shift: 0,
            sweep_reload: false,
            sweep_divider: 0,
        }
    }

    fn write_control(&mut self, value: u8) {
        self.duty = value >> 6;
        self.length.halted = value & 0x20 != 0;
        self.envelope.write(value);
    }

    fn write_sweep(&mut self, value: u8) {
        self.sweep_enabled = value & 0x80 != 0;
        self.sweep_period = ((value >> 4) & 0x07) + 1;
        self.sweep_negate = value & 0x08 != 0;
        self.sweep_shift = value & 0x07;
        self.sweep_reload = true;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x0700) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.length.load(value);
        self.duty_step = 0;
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer_counter -= 1;
        }
    }

    fn clock_sweep(&mut self) {
        if self.sweep_divider == 0 && self.sweep_enabled && self.sweep_shift > 0 {
            let target = self.sweep_target();
            if self.timer_period >= 8 && target <= 0x07FF {
                self.timer_period = target;
            }
        }

        if self.sweep_divider == 0 || self.sweep_reload {
            self.sweep_divider = self.sweep_period;
            self.sweep_reload = false;
        } else {
            self.sweep_divider -= 1;
        }
    }

    fn sweep_target(&self) -> u16 {
        let change = self.timer_period >> self.sweep_shift;
        if self.sweep_negate {
            self.timer_period
                .wrapping_sub(change + self.ones_complement as u16)
        } else {
            self.timer_period.wrapping_add(change)
        }
    }

    fn muted(&self) -> bool {
        self.timer_period < 8 || (!self.sweep_negate && self.sweep_target() > 0x07FF)
    }

    fn output(&self) -> u8 {
        let high = DUTY_TABLE[self.duty as usize] & (0x80 >> self.duty_step) != 0;
        if !self.length.active() || !high || self.muted() {
            0
        } else {
            self.envelope.level()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct TriangleChannel {
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload: bool,
    timer_period: u16,
    timer_counter: u16,
    length: LengthCounter,
    step: u8,
}

impl TriangleChannel {
    fn write_linear(&mut self, value: u8) {
        self.length.halted = value & 0x80 != 0;
        self.linear_reload_value = value & 0x7F;
    }

    fn write_timer_low(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x0700) | value as u16;
    }

    fn write_timer_high(&mut self, value: u8) {
        self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
        self.length.load(value);
        self.linear_reload = true;
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        // The control flag is shared with the length counter halt bit.
        if !self.length.halted {
            self.linear_reload = false;
        }
    }

    fn clock_timer(&mut self) {
        if self.timer_counter > 0 {
            self.timer_counter -= 1;
            return;
        }
        self.timer_counter = self.timer_period;
        if self.length.active() && self.linear_counter > 0 && self.timer_period > 1 {
            self.step = (self.step + 1) & 0x1F;
        }
    }

    fn output(&self) -> u8 {
        if !self.length.active() || self.linear_counter == 0 || self.timer_period < 2 {
            0
        } else {
            TRIANGLE_SEQUENCE[self.step as usize]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct NoiseChannel {
    short_mode: bool,
    timer_period: u16,
    timer_counter: u16,
    shift_register: u16,
    length: LengthCounter,
    envelope: Envelope,
}

impl Default for NoiseChannel {
    fn default() -> Self {
        Self {
            short_mode: false,
            timer_period: NOISE_PERIOD_TABLE[0],
            timer_counter: 0,
            shift_register: 1,
            length: LengthCounter::default(),
            envelope: Envelope::default(),
        }
    }
}

impl NoiseChannel {
    fn write_control(&mut self, value: u8) {
        self.length.halted = value & 0x20 != 0;
        self.envelope.write(value);
    }

    fn write_period(&mut self, value: u8) {
        self.short_mode = value & 0x80 != 0;
        self.timer_period = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
    }

    fn write_length(&mut self, value: u8) {
        self.length.load(value);
        self.envelope.start = true;
    }

    fn clock_timer(&mut self) {
        if self.timer_counter > 0 {
            self.timer_counter -= 1;
            return;
        }
        self.timer_counter = self.timer_period;
        let tap = if self.short_mode { 6 } else { 1 };
        let feedback = (self.shift_register ^ (self.shift_register >> tap)) & 0x01;
        self.shift_register = (self.shift_register >> 1) | (feedback << 14);
    }

    fn output(&self) -> u8 {
        if !self.length.active() || self.shift_register & 0x01 != 0 {
            0
        } else {
            self.envelope.level()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct DmcChannel {
    enabled: bool,
    irq_enabled: bool,
    irq_flag: bool,
    looping: bool,
    timer_period: u16,
    timer_counter: u16,
    output_level: u8,
    sample_addr: u8,
    sample_length: u8,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
    dma_pending: bool,
    dma_delay: u8,
}

impl Default for DmcChannel {
    fn default() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq_flag: false,
            looping: false,
            timer_period: DMC_RATE_TABLE[0],
            timer_counter: DMC_RATE_TABLE[0],
            output_level: 0,
            sample_addr: 0,
            sample_length: 0,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
            dma_pending: false,
            dma_delay: 0,
        }
    }
}

impl DmcChannel {
    fn write_control(&mut self, value: u8) {
        self.irq_enabled = value & 0x80 != 0;
        if !self.irq_enabled {
            self.irq_flag = false;
        }
        self.looping = value & 0x40 != 0;
        self.timer_period = DMC_RATE_TABLE[(value & 0x0F) as usize];
        if self.timer_counter == 0 || self.timer_counter > self.timer_period {
            self.timer_counter = self.timer_period;
        }
    }

    fn restart_sample(&mut self) {
        self.current_addr = 0xC000 | ((self.sample_addr as u16) << 6);
        self.bytes_remaining = ((self.sample_length as u16) << 4) | 0x0001;
        if self.sample_buffer.is_none() {
            self.schedule_dma(2);
        }
    }

    fn playback_active(&self) -> bool {
        self.bytes_remaining > 0
    }

    fn needs_dma(&self) -> bool {
        self.enabled && self.dma_pending && self.dma_delay == 0
    }

    fn stop(&mut self) {
        self.bytes_remaining = 0;
        self.dma_pending = false;
        self.dma_delay = 0;
    }

    fn schedule_dma(&mut self, delay: u8) {
        if self.enabled && self.sample_buffer.is_none() && self.bytes_remaining > 0 {
            self.dma_pending = true;
            self.dma_delay = delay;
        }
    }

    fn load_sample_byte(&mut self, byte: u8) {
        self.dma_pending = false;
        self.dma_delay = 0;
        self.sample_buffer = Some(byte);
        if self.bytes_remaining == 0 {
            return;
        }

        // The cursor wraps from $FFFF back to $8000.
        self.current_addr = match self.current_addr {
            0xFFFF => 0x8000,
            addr => addr + 1,
        };
        self.bytes_remaining -= 1;
        if self.bytes_remaining == 0 {
            if self.looping {
                self.restart_sample();
            } else if self.irq_enabled {
                self.irq_flag = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.dma_pending && self.dma_delay > 0 {
            self.dma_delay -= 1;
        }

        if self.timer_counter == 0 {
            self.timer_counter = self.timer_period;
        }
        self.timer_counter -= 1;
        if self.timer_counter == 0 {
            self.clock_output_unit();
        }
    }

    fn clock_output_unit(&mut self) {
        if !self.silence {
            if self.shift_register & 0x01 != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }

        self.shift_register >>= 1;
        self.bits_remaining = self.bits_remaining.saturating_sub(1);
        if self.bits_remaining > 0 {
            return;
        }

        self.bits_remaining = 8;
        match self.sample_buffer.take() {
            Some(sample) => {
                self.shift_register = sample;
                self.silence = false;
                self.schedule_dma(1);
            }
            None => self.silence = true,
        }
    }
}
