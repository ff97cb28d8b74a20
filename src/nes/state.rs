//! Full-machine snapshot document.
//!
//! Every section other than the cartridge is optional. Sections are merged
//! field by field over the component they describe, so a snapshot written
//! by an older build that lacks some field simply keeps the current value.

use anyhow::{Context, Result, bail};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Console;
use super::cartridge::Cartridge;
use super::mapper::MapperState;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveState {
    #[serde(default = "current_version")]
    pub version: u32,
    pub cartridge: CartridgeSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapper: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_bus: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_bus: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppu: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apu: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controllers: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartridgeSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Complete iNES image: header, PRG and CHR.
    #[serde(with = "base64_vec")]
    pub image: Vec<u8>,
}

fn current_version() -> u32 {
    STATE_VERSION
}

pub fn save(console: &Console) -> Result<String> {
    let cartridge = console.cartridge();
    let state = SaveState {
        version: STATE_VERSION,
        cartridge: CartridgeSection {
            path: console.source().map(|path| path.display().to_string()),
            identity: Some(cartridge.identity()),
            image: cartridge.to_ines_bytes(),
        },
        mapper: Some(to_section(&console.mapper.state(), "mapper")?),
        main_bus: Some(to_section(&console.bus, "main bus")?),
        picture_bus: Some(to_section(&console.picture_bus, "picture bus")?),
        cpu: Some(to_section(&console.cpu, "cpu")?),
        ppu: Some(to_section(&console.ppu, "ppu")?),
        apu: Some(to_section(&console.apu, "apu")?),
        controllers: Some(to_section(&console.controllers, "controllers")?),
    };
    serde_json::to_string(&state).context("failed to encode state")
}

/// Builds the machine described by `json`. When `current` runs the same
/// cartridge it is the base that sections merge over; otherwise a fresh,
/// reset machine is.
pub fn load(json: &str, current: Option<&Console>, sample_rate: u32) -> Result<Console> {
    let state: SaveState = serde_json::from_str(json).context("state is not a valid document")?;
    if state.version > STATE_VERSION {
        bail!(
            "state version {} is newer than supported version {}",
            state.version,
            STATE_VERSION
        );
    }

    let cartridge = Cartridge::from_bytes(&state.cartridge.image)
        .context("state carries an unreadable cartridge image")?;
    if let Some(identity) = &state.cartridge.identity {
        let actual = cartridge.identity();
        if *identity != actual {
            bail!("cartridge identity mismatch: state says {identity}, image hashes to {actual}");
        }
    }

    let mut console = match current {
        Some(console) if console.cartridge() == &cartridge => console.clone(),
        _ => {
            let source = state.cartridge.path.as_ref().map(Into::into);
            let mut console = Console::new(cartridge, sample_rate, source)?;
            let mut events = super::EventLog::new(0);
            console.reset(&mut events);
            console
        }
    };

    if let Some(section) = state.mapper {
        let mapper_state: MapperState = merge_section(&console.mapper.state(), section, "mapper")?;
        console.mapper.restore(mapper_state)?;
    }
    apply_section(&mut console.bus, state.main_bus, "main bus")?;
    apply_section(&mut console.picture_bus, state.picture_bus, "picture bus")?;
    apply_section(&mut console.cpu, state.cpu, "cpu")?;
    apply_section(&mut console.ppu, state.ppu, "ppu")?;
    apply_section(&mut console.apu, state.apu, "apu")?;
    apply_section(&mut console.controllers, state.controllers, "controllers")?;

    if console.bus.has_extended_ram() != console.mapper.has_extended_ram() {
        bail!("main bus section does not match the cartridge's work RAM");
    }
    console.bus.validate().context("main bus section out of range")?;
    console.cpu.validate().context("cpu section out of range")?;
    console.ppu.validate().context("ppu section out of range")?;
    console.apu.validate().context("apu section out of range")?;
    console
        .picture_bus
        .update_mirroring(console.mapper.name_table_mirroring());
    Ok(console)
}

fn to_section<T: Serialize>(component: &T, name: &str) -> Result<Value> {
    serde_json::to_value(component).with_context(|| format!("failed to encode {name} section"))
}

fn apply_section<T>(component: &mut T, section: Option<Value>, name: &str) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    if let Some(section) = section {
        *component = merge_section(component, section, name)?;
    }
    Ok(())
}

fn merge_section<T>(current: &T, section: Value, name: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = to_section(current, name)?;
    merge(&mut value, section);
    serde_json::from_value(value).with_context(|| format!("invalid {name} section"))
}

/// Overlays `patch` onto `base`. Objects merge key by key; anything else
/// replaces the base value outright.
fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// `#[serde(with)]` codec storing a byte vector as a base64 string.
pub mod base64_vec {
    use super::BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

/// `#[serde(with)]` codec storing a fixed-size byte array as a base64 string.
pub mod base64_array {
    use serde::{Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        super::base64_vec::serialize(bytes, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let bytes = super::base64_vec::deserialize(deserializer)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} bytes, found {len}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::EventLog;
    use crate::nes::mapper::Mirroring;
    use base64::Engine;
    use serde_json::json;

    fn console(mapper_id: u8) -> Console {
        let mut prg_rom = vec![0xEA; 0x8000];
        prg_rom[0x7FFC] = 0x00;
        prg_rom[0x7FFD] = 0x80;
        let cartridge = Cartridge {
            mapper_id,
            mirroring: Mirroring::Horizontal,
            has_extended_ram: false,
            prg_rom,
            chr_rom: Vec::new(),
        };
        let mut console = Console::new(cartridge, 48_000, None).unwrap();
        console.reset(&mut EventLog::new(0));
        console
    }

    fn step(console: &mut Console, cycles: u32) {
        let mut events = EventLog::new(0);
        for _ in 0..cycles {
            let (cpu, mut view) = console.split(&mut events);
            cpu.step(&mut view);
        }
    }

    #[test]
    fn round_trip_preserves_machine() {
        let mut original = console(1);
        step(&mut original, 1000);

        let json = save(&original).unwrap();
        let loaded = load(&json, None, 48_000).unwrap();
        assert_eq!(loaded.cpu, original.cpu);
        assert_eq!(loaded.mapper, original.mapper);
        assert_eq!(
            serde_json::to_value(&loaded.bus).unwrap(),
            serde_json::to_value(&original.bus).unwrap()
        );
        assert_eq!(loaded.apu, original.apu);
    }

    #[test]
    fn missing_sections_and_fields_keep_current_values() {
        let mut current = console(0);
        step(&mut current, 500);

        let mut doc: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();
        let object = doc.as_object_mut().unwrap();
        object.remove("ppu");
        object.insert("cpu".into(), json!({ "a": 0x42 }));

        let loaded = load(&doc.to_string(), Some(&current), 48_000).unwrap();
        assert_eq!(loaded.cpu.a, 0x42);
        assert_eq!(loaded.cpu.pc, current.cpu.pc);
        assert_eq!(loaded.cpu.cycles, current.cpu.cycles);
        assert_eq!(loaded.ppu, current.ppu);
    }

    #[test]
    fn cartridge_section_is_required() {
        let err = load(r#"{"version":1,"cpu":{}}"#, None, 48_000).unwrap_err();
        assert!(format!("{err:#}").contains("cartridge"));
    }

    #[test]
    fn corrupt_image_is_fatal() {
        let current = console(0);
        let mut doc: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();
        doc["cartridge"]["image"] = json!(BASE64_STANDARD.encode(b"NES\x1A"));
        assert!(load(&doc.to_string(), Some(&current), 48_000).is_err());

        doc["cartridge"]["image"] = json!("not base64!");
        assert!(load(&doc.to_string(), Some(&current), 48_000).is_err());
    }

    #[test]
    fn identity_mismatch_is_fatal() {
        let current = console(0);
        let mut doc: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();
        doc["cartridge"]["identity"] = json!("AAAA");
        assert!(load(&doc.to_string(), None, 48_000).is_err());
    }

    #[test]
    fn newer_version_is_rejected() {
        let current = console(0);
        let mut doc: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();
        doc["version"] = json!(STATE_VERSION + 1);
        assert!(load(&doc.to_string(), None, 48_000).is_err());
    }

    #[test]
    fn foreign_mapper_section_is_rejected() {
        let current = console(0);
        let mut doc: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();
        doc["mapper"]["board"] = json!({ "kind": "Uxrom", "prg_bank": 1 });
        assert!(load(&doc.to_string(), None, 48_000).is_err());
    }

    #[test]
    fn byte_arrays_use_base64() {
        let current = console(0);
        let doc: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();
        assert!(doc["main_bus"]["ram"].is_string());
        assert!(doc["ppu"]["oam"].is_string());
        assert!(doc["mapper"]["chr_ram"].is_string());
        assert!(doc["cartridge"]["image"].is_string());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut current = console(1);
        step(&mut current, 500);
        let saved: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();

        let cases: [(&str, &[&str], Value); 9] = [
            ("apu", &["pulse1", "duty"], json!(9)),
            ("apu", &["triangle", "step"], json!(32)),
            ("apu", &["dmc", "timer_period"], json!(0)),
            ("apu", &["frame_counter"], json!(u32::MAX)),
            ("ppu", &["scanline"], json!(300)),
            ("ppu", &["fine_x"], json!(16)),
            ("ppu", &["sprite_count"], json!(9)),
            ("cpu", &["skip_cycles"], json!(u32::MAX)),
            ("mapper", &["board", "write_count"], json!(200)),
        ];
        for (section, path, value) in cases {
            let mut doc = saved.clone();
            *path.iter().fold(&mut doc[section], |slot, key| &mut slot[*key]) = value;

            let result = load(&doc.to_string(), Some(&current), 48_000);
            assert!(result.is_err(), "{section}.{path:?} was accepted");
        }
    }

    #[test]
    fn stale_pipeline_field_follows_scanline() {
        let current = console(0);
        let mut doc: Value = serde_json::from_str(&save(&current).unwrap()).unwrap();
        doc["ppu"]["scanline"] = json!(250);
        doc["ppu"]["pipeline"] = json!("Render");

        let mut loaded = load(&doc.to_string(), None, 48_000).unwrap();
        assert_eq!(loaded.ppu.pipeline(), crate::nes::ppu::Pipeline::VerticalBlank);
        for _ in 0..crate::nes::CYCLES_PER_FRAME {
            loaded
                .ppu
                .tick(&mut loaded.picture_bus, &mut loaded.mapper);
        }
    }
}
