use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use log::{LevelFilter, Metadata, Record};
use sha1::{Digest, Sha1};
use voltnes::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, CYCLES_PER_FRAME, Emulator,
};

#[derive(Debug, Clone)]
struct Config {
    rom: Option<PathBuf>,
    frames: u32,
    seed: u32,
    check_restore: bool,
    check_state: bool,
    save_state: Option<PathBuf>,
    load_state: Option<PathBuf>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: None,
            frames: 600,
            seed: 0xC47D_0E8A,
            check_restore: false,
            check_state: false,
            save_state: None,
            load_state: None,
            verbose: false,
        }
    }
}

const USAGE: &str = "frame_runner\n\n\
Usage:\n  frame_runner --rom <path> [options]\n\n\
Options:\n\
  --rom <path>          iNES image to run\n\
  --frames <n>          Frames to emulate (default 600)\n\
  --seed <n>            Input generator seed\n\
  --check-restore       Verify backup/restore replays a frame identically\n\
  --check-state         Verify a mid-frame save state replays identically\n\
  --save-state <path>   Write the final state as JSON\n\
  --load-state <path>   Resume from a JSON state before running\n\
  --verbose             Log debug events to stderr\n\
  -h, --help            Show this help\n";

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args.next().context("--rom requires a path")?;
                cfg.rom = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 600")?;
                cfg.frames = value
                    .parse()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--seed" => {
                let value = args.next().context("--seed requires an integer")?;
                cfg.seed = value
                    .parse()
                    .with_context(|| format!("invalid --seed value: {value}"))?;
            }
            "--check-restore" => cfg.check_restore = true,
            "--check-state" => cfg.check_state = true,
            "--save-state" => {
                let value = args.next().context("--save-state requires a path")?;
                cfg.save_state = Some(PathBuf::from(value));
            }
            "--load-state" => {
                let value = args.next().context("--load-state requires a path")?;
                cfg.load_state = Some(PathBuf::from(value));
            }
            "--verbose" | "-v" => cfg.verbose = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    if cfg.seed == 0 {
        bail!("--seed must be non-zero");
    }
    Ok(cfg)
}

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn init_logging(verbose: bool) -> Result<()> {
    log::set_boxed_logger(Box::new(StderrLogger))
        .map_err(|err| anyhow::anyhow!("failed to install logger: {err}"))?;
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    });
    Ok(())
}

/// Xorshift32 button patterns with opposite directions filtered out.
fn next_buttons(seed: &mut u32) -> u8 {
    let mut x = *seed;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *seed = x;

    let mut buttons = 0u8;
    for (bit, button) in [
        BUTTON_UP,
        BUTTON_DOWN,
        BUTTON_LEFT,
        BUTTON_RIGHT,
        BUTTON_A,
        BUTTON_B,
        BUTTON_START,
        BUTTON_SELECT,
    ]
    .into_iter()
    .enumerate()
    {
        if x & (1 << bit) != 0 {
            buttons |= button;
        }
    }

    if buttons & BUTTON_UP != 0 {
        buttons &= !BUTTON_DOWN;
    }
    if buttons & BUTTON_LEFT != 0 {
        buttons &= !BUTTON_RIGHT;
    }
    buttons
}

/// Video and audio digests of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FrameDigest {
    video: Vec<u8>,
    audio: Vec<u8>,
}

fn run_frame(emu: &mut Emulator, buttons: u8) -> FrameDigest {
    emu.set_buttons(0, buttons);
    emu.run_frame();

    let mut video = Sha1::new();
    video.update(emu.frame_buffer().unwrap_or_default());
    let mut audio = Sha1::new();
    if let Some(frame) = emu.audio_frame() {
        for sample in &frame.mixed {
            audio.update(sample.to_le_bytes());
        }
    }
    FrameDigest {
        video: video.finalize().to_vec(),
        audio: audio.finalize().to_vec(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn check_restore(emu: &mut Emulator, buttons: u8) -> Result<()> {
    emu.backup_state();
    let first = run_frame(emu, buttons);
    emu.restore_state();
    let replay = run_frame(emu, buttons);
    if first != replay {
        bail!("restored state diverged: video {} vs {}", hex(&first.video), hex(&replay.video));
    }
    Ok(())
}

fn check_state(emu: &mut Emulator, buttons: u8) -> Result<()> {
    for _ in 0..CYCLES_PER_FRAME / 3 {
        emu.run_cycle();
    }
    let json = emu.save_state().context("failed to save mid-frame state")?;

    let mut twin = Emulator::with_config(emu.config());
    twin.load_state(&json)
        .context("failed to load mid-frame state")?;

    let original = run_frame(emu, buttons);
    let resumed = run_frame(&mut twin, buttons);
    if original != resumed {
        bail!(
            "deserialized state diverged: video {} vs {}, audio {} vs {}",
            hex(&original.video),
            hex(&resumed.video),
            hex(&original.audio),
            hex(&resumed.audio)
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cfg = parse_args()?;
    init_logging(cfg.verbose)?;
    let Some(rom) = cfg.rom.as_ref() else {
        bail!("--rom is required\n\n{USAGE}");
    };

    let start = Instant::now();
    let mut emu = Emulator::new();
    emu.load_rom(rom)
        .with_context(|| format!("failed to load ROM {}", rom.display()))?;
    if let Some(path) = cfg.load_state.as_ref() {
        emu.load_state_from_file(path)?;
    }

    let mut seed = cfg.seed;
    let mut video = Sha1::new();
    let mut audio = Sha1::new();
    let checkpoint = cfg.frames / 2;

    for frame in 0..cfg.frames {
        // New input every 15 frames, released in between.
        let buttons = if frame % 15 == 0 {
            next_buttons(&mut seed)
        } else {
            0
        };

        if frame == checkpoint {
            if cfg.check_restore {
                check_restore(&mut emu, buttons)?;
                println!("restore check passed at frame {frame}");
            }
            if cfg.check_state {
                check_state(&mut emu, buttons)?;
                println!("state check passed at frame {frame}");
            }
        }

        let digest = run_frame(&mut emu, buttons);
        video.update(&digest.video);
        audio.update(&digest.audio);
    }

    if let Some(path) = cfg.save_state.as_ref() {
        emu.save_state_to_file(path)?;
    }

    let counters = emu.debug_counters();
    println!("Run Summary");
    println!("- mapper: {}", emu.mapper_name().unwrap_or("none"));
    println!("- frames: {}", counters.frames);
    println!("- cpu cycles: {}", counters.cpu_cycles);
    println!("- ppu cycles: {}", counters.ppu_cycles);
    println!("- nmi/irq serviced: {}/{}", counters.nmi_serviced, counters.irq_serviced);
    println!("- unknown opcodes: {}", counters.unknown_opcodes);
    println!("- dma transfers (oam/dmc): {}/{}", counters.oam_dma_transfers, counters.dmc_dma_transfers);
    println!("- video sha1: {}", hex(&video.finalize()));
    println!("- audio sha1: {}", hex(&audio.finalize()));
    println!("- elapsed: {:.2}s", start.elapsed().as_secs_f32());

    if cfg.verbose {
        for event in emu.recent_events(16).iter().rev() {
            log::debug!("event: {event}");
        }
    }
    Ok(())
}
