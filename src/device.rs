//! PIC device parameter table, loaded from embedded YAML.

use clap::ValueEnum;
use clap::builder::PossibleValue;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Programming family. Midrange and enhanced midrange lay out the
/// id/revision word differently and blank to different widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Midrange,
    Enhanced,
}

impl Family {
    /// Bits the device id is shifted left of the revision field.
    pub const fn id_shift(self) -> u32 {
        match self {
            Family::Midrange => 4,
            Family::Enhanced => 5,
        }
    }

    pub const fn rev_mask(self) -> u16 {
        match self {
            Family::Midrange => 0x0F,
            Family::Enhanced => 0x1F,
        }
    }

    /// Usable program-word width. Enhanced parts carry 14-bit words.
    pub const fn word_mask(self) -> u16 {
        match self {
            Family::Midrange => 0xFFFF,
            Family::Enhanced => 0x3FFF,
        }
    }

    /// Factory-blank pattern for program and config words.
    pub const fn program_blank(self) -> u16 {
        self.word_mask()
    }

    /// Blank pattern for 8-bit EEPROM data words as read over the wire.
    pub const DATA_BLANK: u16 = 0x00FF;

    /// Split a raw id/revision word into (device id, revision).
    pub const fn decode_id(self, raw: u16) -> (u16, u16) {
        (raw >> self.id_shift(), raw & self.rev_mask())
    }

    /// Inverse of [`Family::decode_id`]; the simulator synthesizes its
    /// id word with this.
    pub const fn encode_id(self, device_id: u16, revision: u16) -> u16 {
        (device_id << self.id_shift()) | (revision & self.rev_mask())
    }
}

impl ValueEnum for Family {
    fn value_variants<'a>() -> &'a [Self] {
        &[Family::Midrange, Family::Enhanced]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Family::Midrange => Some(PossibleValue::new("midrange").aliases(["mid"])),
            Family::Enhanced => Some(PossibleValue::new("enhanced").aliases(["enh"])),
        }
    }
}

impl Default for Family {
    fn default() -> Self {
        Family::Enhanced
    }
}

/// Static parameters for one chip variant. Never mutated by a run.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(deserialize_with = "parse_hex")]
    pub device_id: usize,
    #[serde(default)]
    pub family: Family,
    #[serde(deserialize_with = "parse_hex")]
    pub max_page: usize,
    #[serde(deserialize_with = "parse_hex")]
    pub conf_page: usize,
    #[serde(deserialize_with = "parse_hex")]
    pub conf_len: usize,
    #[serde(default, deserialize_with = "parse_hex")]
    pub min_data: usize,
    #[serde(default, deserialize_with = "parse_hex")]
    pub max_data: usize,
    pub num_latches: usize,
}

impl std::fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(0x{:03X})", self.name, self.device_id)
    }
}

impl DeviceProfile {
    pub fn program_pages(&self) -> std::ops::RangeInclusive<usize> {
        0..=self.max_page
    }

    /// Data-memory page range, if the part has EEPROM at all.
    pub fn data_pages(&self) -> Option<std::ops::RangeInclusive<usize>> {
        (self.min_data != 0 || self.max_data != 0).then(|| self.min_data..=self.max_data)
    }

    /// Every page the verify step compares: program, data and config.
    pub fn check_pages(&self) -> Vec<usize> {
        let mut pages: Vec<usize> = self.program_pages().collect();
        if let Some(data) = self.data_pages() {
            pages.extend(data);
        }
        pages.push(self.conf_page);
        pages
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FamilyTable {
    family: Family,
    variants: Vec<DeviceProfile>,
}

/// Immutable device registry, populated once at startup.
pub struct Registry {
    families: Vec<FamilyTable>,
}

impl Registry {
    pub fn load() -> Result<Self> {
        Ok(Registry {
            families: vec![
                serde_yaml::from_str(include_str!("../devices/midrange.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/enhanced.yaml"))?,
            ],
        })
    }

    pub fn find(&self, device_id: u16) -> Result<DeviceProfile> {
        for table in &self.families {
            if let Some(profile) = table
                .variants
                .iter()
                .find(|v| v.device_id == device_id as usize)
            {
                let mut profile = profile.clone();
                profile.family = table.family;
                return Ok(profile);
            }
        }
        Err(Error::UnknownDevice { id: device_id })
    }
}

fn parse_hex<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| serde::de::Error::custom(format!("bad numeric field {s:?}")))
}
