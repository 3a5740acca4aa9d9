//! Presence, enablement, vendor identification and measurements.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::handles::KeyRole;
use crate::module::{Attestation, ModuleChannel, Property, SecurityModule, hex};

/// Reported when the platform has no module at all.
pub const NOT_AVAILABLE: &str = "Not Available";

/// PCRs listed by `print-pcrs`.
pub const PRINTED_PCRS: std::ops::RangeInclusive<u8> = 0..=22;

/// PCRs covered by a platform quote.
pub const QUOTED_PCRS: std::ops::RangeInclusive<u8> = 0..=8;

/// TCG vendor IDs, as reported in `TPM_PT_MANUFACTURER`.
const VENDORS: [(u32, &str); 21] = [
    (0x414D_4400, "AMD"),
    (0x4154_4D4C, "Atmel"),
    (0x4252_434D, "Broadcom"),
    (0x4850_4500, "HPE"),
    (0x4942_4D00, "IBM"),
    (0x4946_5800, "Infineon"),
    (0x494E_5443, "Intel"),
    (0x4C45_4E00, "Lenovo"),
    (0x4D53_4654, "Microsoft"),
    (0x4E53_4D20, "National SC"),
    (0x4E54_5A00, "Nationz"),
    (0x4E54_4300, "Nuvoton"),
    (0x5143_4F4D, "Qualcomm"),
    (0x534D_5343, "SMSC"),
    (0x5354_4D20, "ST Microelectronics"),
    (0x534D_534E, "Samsung"),
    (0x534E_5300, "Sinosun"),
    (0x5458_4E00, "Texas Instruments"),
    (0x5745_4300, "Winbond"),
    (0x524F_4343, "Fuzhou Rockchip"),
    (0x474F_4F47, "Google"),
];

pub fn vendor_name(code: u32) -> Option<&'static str> {
    VENDORS
        .iter()
        .find(|(id, _)| *id == code)
        .map(|(_, name)| *name)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    NotFound,
    Enabled,
    Disabled,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleStatus::NotFound => "NOTFOUND",
            ModuleStatus::Enabled => "ENABLED",
            ModuleStatus::Disabled => "DISABLED",
        })
    }
}

/// Enabled means the device identity lives in the module: a certificate was
/// issued and no software private key exists next to it.
pub fn module_status(device_present: bool, cert_path: &Path, key_path: &Path) -> ModuleStatus {
    if !device_present {
        return ModuleStatus::NotFound;
    }
    if cert_path.exists() && !key_path.exists() {
        ModuleStatus::Enabled
    } else {
        ModuleStatus::Disabled
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    pub vendor: String,
    pub model: String,
    pub firmware: [u16; 4],
}

impl HardwareInfo {
    /// Decodes Manufacturer, VendorString1, VendorString2, FirmwareVersion1
    /// and FirmwareVersion2, in that order.
    pub fn decode(words: [u32; 5]) -> Self {
        let [manufacturer, vendor1, vendor2, fw1, fw2] = words;
        let vendor = vendor_name(manufacturer)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("0x{manufacturer:08X}"));

        let mut model = Vec::with_capacity(8);
        model.extend_from_slice(&vendor1.to_be_bytes());
        model.extend_from_slice(&vendor2.to_be_bytes());
        let model = String::from_utf8_lossy(&model)
            .trim_end_matches('\0')
            .to_owned();

        let firmware = [
            (fw1 >> 16) as u16,
            fw1 as u16,
            (fw2 >> 16) as u16,
            fw2 as u16,
        ];
        Self {
            vendor,
            model,
            firmware,
        }
    }
}

impl fmt::Display for HardwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.firmware;
        write!(f, "{}-{}, FW Version {a}.{b}.{c}.{d}", self.vendor, self.model)
    }
}

/// Reads the five identification properties from the module.
#[instrument(level = "debug", skip_all)]
pub fn read_hardware_info<M: SecurityModule>(module: &M) -> Result<HardwareInfo> {
    let mut channel = module.open()?;
    let mut words = [0u32; 5];
    for (word, property) in words.iter_mut().zip([
        Property::Manufacturer,
        Property::VendorString1,
        Property::VendorString2,
        Property::FirmwareVersion1,
        Property::FirmwareVersion2,
    ]) {
        *word = channel.get_capability(property)?;
    }
    debug!(?words, "module properties");
    Ok(HardwareInfo::decode(words))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PcrValue {
    pub index: u8,
    pub digest: Vec<u8>,
}

impl fmt::Display for PcrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PCR {}: {}", self.index, hex(&self.digest))
    }
}

fn read_range<C: ModuleChannel>(
    channel: &mut C,
    range: std::ops::RangeInclusive<u8>,
) -> Result<Vec<PcrValue>> {
    range
        .map(|index| {
            Ok(PcrValue {
                index,
                digest: channel.pcr_read(index)?,
            })
        })
        .collect()
}

/// SHA-256 bank, PCRs 0 through 22.
pub fn read_pcrs<M: SecurityModule>(module: &M) -> Result<Vec<PcrValue>> {
    read_range(&mut module.open()?, PRINTED_PCRS)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlatformQuote {
    pub pcrs: Vec<PcrValue>,
    pub attestation: Attestation,
}

/// PCR values plus an AK-signed quote over the same selection.
#[instrument(level = "debug", skip(module, nonce))]
pub fn quote<M: SecurityModule>(module: &M, nonce: &[u8]) -> Result<PlatformQuote> {
    let mut channel = module.open()?;
    let pcrs = read_range(&mut channel, QUOTED_PCRS)?;
    let selection: Vec<u8> = QUOTED_PCRS.collect();
    let attestation = channel.quote(KeyRole::Ak, nonce, &selection)?;
    Ok(PlatformQuote { pcrs, attestation })
}
