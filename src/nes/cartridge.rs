use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use sha1::{Digest, Sha1};
use std::{fs, path::Path};

use super::mapper::Mirroring;

pub const HEADER_SIZE: usize = 16;
pub const PRG_BANK_SIZE: usize = 16 * 1024;
pub const CHR_BANK_SIZE: usize = 8 * 1024;
const TRAINER_SIZE: usize = 512;

const FLAG6_VERTICAL: u8 = 0x01;
const FLAG6_EXTENDED_RAM: u8 = 0x02;
const FLAG6_TRAINER: u8 = 0x04;
const FLAG6_FOUR_SCREEN: u8 = 0x08;

/// Immutable ROM image parsed from an iNES file.
///
/// CHR RAM carts (header byte 5 == 0) carry an empty `chr_rom`; the mapper
/// owns the writable 8 KB pattern buffer instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub has_extended_ram: bool,
    pub prg_rom: Vec<u8>,
    pub chr_rom: Vec<u8>,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("failed to parse ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            bail!("ROM is too small to contain an iNES header");
        }
        if &bytes[0..4] != b"NES\x1A" {
            bail!("invalid iNES header magic, expected NES<EOF>");
        }

        let prg_banks = bytes[4] as usize;
        let chr_banks = bytes[5] as usize;
        let flags6 = bytes[6];
        let flags7 = bytes[7];

        if prg_banks == 0 {
            bail!("invalid iNES header: zero PRG ROM banks");
        }

        let mapper_id = (flags6 >> 4) | (flags7 & 0xF0);
        let mirroring = if (flags6 & FLAG6_FOUR_SCREEN) != 0 {
            Mirroring::FourScreen
        } else if (flags6 & FLAG6_VERTICAL) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let has_extended_ram = (flags6 & FLAG6_EXTENDED_RAM) != 0;

        let mut cursor = HEADER_SIZE;
        if (flags6 & FLAG6_TRAINER) != 0 {
            cursor += TRAINER_SIZE;
        }

        let prg_size = prg_banks * PRG_BANK_SIZE;
        if bytes.len() < cursor + prg_size {
            bail!(
                "ROM truncated: expected {} PRG bytes but file ended early",
                prg_size
            );
        }
        let prg_rom = bytes[cursor..cursor + prg_size].to_vec();
        cursor += prg_size;

        let chr_size = chr_banks * CHR_BANK_SIZE;
        if bytes.len() < cursor + chr_size {
            bail!(
                "ROM truncated: expected {} CHR bytes but file ended early",
                chr_size
            );
        }
        let chr_rom = bytes[cursor..cursor + chr_size].to_vec();

        Ok(Self {
            mapper_id,
            mirroring,
            has_extended_ram,
            prg_rom,
            chr_rom,
        })
    }

    pub fn uses_chr_ram(&self) -> bool {
        self.chr_rom.is_empty()
    }

    /// Re-encodes the cartridge as a canonical iNES image. Parsing the result
    /// yields an identical `Cartridge`.
    pub fn to_ines_bytes(&self) -> Vec<u8> {
        let mut flags6 = (self.mapper_id & 0x0F) << 4;
        match self.mirroring {
            Mirroring::Vertical => flags6 |= FLAG6_VERTICAL,
            Mirroring::FourScreen => flags6 |= FLAG6_FOUR_SCREEN,
            _ => {}
        }
        if self.has_extended_ram {
            flags6 |= FLAG6_EXTENDED_RAM;
        }

        let mut out = Vec::with_capacity(HEADER_SIZE + self.prg_rom.len() + self.chr_rom.len());
        out.extend_from_slice(b"NES\x1A");
        out.push((self.prg_rom.len() / PRG_BANK_SIZE) as u8);
        out.push((self.chr_rom.len() / CHR_BANK_SIZE) as u8);
        out.push(flags6);
        out.push(self.mapper_id & 0xF0);
        out.resize(HEADER_SIZE, 0);
        out.extend_from_slice(&self.prg_rom);
        out.extend_from_slice(&self.chr_rom);
        out
    }

    /// SHA-1 over PRG followed by CHR, base64 encoded.
    pub fn identity(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(&self.prg_rom);
        hasher.update(&self.chr_rom);
        BASE64_STANDARD.encode(hasher.finalize())
    }
}
