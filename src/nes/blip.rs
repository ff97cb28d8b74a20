//! Band-limited step synthesis. Amplitude changes are recorded as deltas at
//! clock-exact times and rendered through a windowed-sinc kernel, so output
//! at any sample rate is free of the aliasing a naive decimator produces.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::OnceLock;

const FRAC_BITS: u32 = 20;
const PHASE_BITS: u32 = 5;
const PHASES: usize = 1 << PHASE_BITS;
const KERNEL_WIDTH: usize = 16;
const KERNEL_SHIFT: u32 = 15;
const KERNEL_UNITY: i64 = 1 << KERNEL_SHIFT;
const CUTOFF: f64 = 0.45;
const MAX_ACCUMULATOR: u64 = 1 << 40;

type Kernel = [[i64; KERNEL_WIDTH]; PHASES];

fn kernel() -> &'static Kernel {
    static KERNEL: OnceLock<Kernel> = OnceLock::new();
    KERNEL.get_or_init(build_kernel)
}

/// One Blackman-windowed sinc per sub-sample phase. Every phase sums to
/// exactly `KERNEL_UNITY` so integrated steps settle on the true amplitude.
fn build_kernel() -> Kernel {
    let mut table = [[0; KERNEL_WIDTH]; PHASES];
    let half = KERNEL_WIDTH as f64 / 2.0;

    for (phase, taps) in table.iter_mut().enumerate() {
        let frac = phase as f64 / PHASES as f64;
        let mut raw = [0f64; KERNEL_WIDTH];
        for (i, tap) in raw.iter_mut().enumerate() {
            let x = i as f64 + 1.0 - half - frac;
            let sinc = if x.abs() < 1e-9 {
                1.0
            } else {
                (2.0 * PI * CUTOFF * x).sin() / (2.0 * PI * CUTOFF * x)
            };
            let w = x / half;
            let window = 0.42 + 0.5 * (PI * w).cos() + 0.08 * (2.0 * PI * w).cos();
            *tap = sinc * window.max(0.0);
        }

        let sum: f64 = raw.iter().sum();
        let mut total = 0;
        for (tap, value) in taps.iter_mut().zip(raw) {
            *tap = (value / sum * KERNEL_UNITY as f64).round() as i64;
            total += *tap;
        }
        taps[KERNEL_WIDTH / 2 - 1] += KERNEL_UNITY - total;
    }

    table
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlipBuffer {
    factor: u64,
    offset: u64,
    integrator: i64,
    buffer: Vec<i64>,
}

impl Default for BlipBuffer {
    fn default() -> Self {
        Self::new(super::apu::CPU_CLOCK_HZ, 48_000)
    }
}

impl BlipBuffer {
    pub fn new(clock_rate: f64, sample_rate: u32) -> Self {
        let factor = (sample_rate as f64 / clock_rate * (1u64 << FRAC_BITS) as f64).round();
        Self {
            factor: factor as u64,
            offset: 0,
            integrator: 0,
            buffer: Vec::new(),
        }
    }

    /// Records an amplitude change `clock_time` clocks into the current frame.
    pub fn add_delta(&mut self, clock_time: u32, delta: i32) {
        let pos = self.offset + clock_time as u64 * self.factor;
        let index = (pos >> FRAC_BITS) as usize;
        let phase = ((pos >> (FRAC_BITS - PHASE_BITS)) as usize) & (PHASES - 1);

        if self.buffer.len() < index + KERNEL_WIDTH {
            self.buffer.resize(index + KERNEL_WIDTH, 0);
        }
        for (slot, tap) in self.buffer[index..].iter_mut().zip(&kernel()[phase]) {
            *slot += delta as i64 * tap;
        }
    }

    /// Closes a frame `clock_duration` clocks long; its samples become readable.
    pub fn end_frame(&mut self, clock_duration: u32) {
        self.offset += clock_duration as u64 * self.factor;
    }

    /// Checks restored state against a buffer built for `sample_rate`, with
    /// deltas placed at most `max_clocks` clocks into the open frame.
    pub fn validate(&self, clock_rate: f64, sample_rate: u32, max_clocks: u32) -> Result<()> {
        let factor = Self::new(clock_rate, sample_rate).factor;
        if self.factor != factor {
            bail!("resampling factor {} does not match {sample_rate} Hz", self.factor);
        }
        if self.offset >= 1 << FRAC_BITS {
            bail!("{} unread samples left in a closed frame", self.samples_available());
        }

        let limit = ((self.offset + max_clocks as u64 * factor) >> FRAC_BITS) as usize + KERNEL_WIDTH;
        if self.buffer.len() > limit {
            bail!("{} buffered samples, at most {limit} fit in one frame", self.buffer.len());
        }
        let in_range = |value: &i64| value.unsigned_abs() <= MAX_ACCUMULATOR;
        if !in_range(&self.integrator) || !self.buffer.iter().all(in_range) {
            bail!("accumulated amplitude out of range");
        }
        Ok(())
    }

    pub fn samples_available(&self) -> usize {
        (self.offset >> FRAC_BITS) as usize
    }

    /// Drains every complete sample into `out`.
    pub fn read_samples(&mut self, out: &mut Vec<i16>) {
        let count = self.samples_available();
        if self.buffer.len() < count {
            self.buffer.resize(count, 0);
        }

        out.reserve(count);
        for delta in self.buffer.drain(..count) {
            self.integrator += delta;
            let sample = self.integrator >> KERNEL_SHIFT;
            out.push(sample.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
        }
        self.offset -= (count as u64) << FRAC_BITS;
    }
}
