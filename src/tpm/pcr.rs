use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of PCRs in a TPM 2.0 PC-client bank.
pub const PCR_COUNT: u8 = 24;

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least one selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[cfg(feature = "tpm2")]
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcrBank {
    Sha1,
    Sha256,
    Sha384,
}

impl PcrBank {
    pub fn as_str(&self) -> &'static str {
        match self {
            PcrBank::Sha1 => "sha1",
            PcrBank::Sha256 => "sha256",
            PcrBank::Sha384 => "sha384",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            PcrBank::Sha1 => 20,
            PcrBank::Sha256 => 32,
            PcrBank::Sha384 => 48,
        }
    }
}

impl FromStr for PcrBank {
    type Err = PcrError;

    fn from_str(bank: &str) -> Result<Self> {
        match bank {
            "sha1" => Ok(PcrBank::Sha1),
            "sha256" => Ok(PcrBank::Sha256),
            "sha384" => Ok(PcrBank::Sha384),
            _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
        }
    }
}

impl fmt::Display for PcrBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of PCR indices in one bank, written `bank:i,j,k` as tpm2-tools does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PcrSelection {
    bank: PcrBank,
    slots: BTreeSet<u8>,
}

impl PcrSelection {
    pub fn new(bank: PcrBank, slots: impl IntoIterator<Item = u8>) -> Result<Self> {
        let slots: BTreeSet<u8> = slots.into_iter().collect();
        if slots.is_empty() {
            return Err(PcrError::EmptyPcrSelectionList);
        }
        if let Some(slot) = slots.iter().find(|s| **s >= PCR_COUNT) {
            return Err(PcrError::InvalidPcrSlot(slot.to_string()));
        }
        Ok(Self { bank, slots })
    }

    pub fn bank(&self) -> PcrBank {
        self.bank
    }

    pub fn slots(&self) -> impl Iterator<Item = u8> + '_ {
        self.slots.iter().copied()
    }

    pub fn contains(&self, slot: u8) -> bool {
        self.slots.contains(&slot)
    }
}

/// The boot chain measurements: PCRs 0 through 7 of the SHA-256 bank.
impl Default for PcrSelection {
    fn default() -> Self {
        Self {
            bank: PcrBank::Sha256,
            slots: (0..8).collect(),
        }
    }
}

fn parse_slot(slot: &str) -> Result<u8> {
    slot.trim()
        .parse::<u8>()
        .ok()
        .filter(|s| *s < PCR_COUNT)
        .ok_or_else(|| PcrError::InvalidPcrSlot(slot.to_string()))
}

fn parse_slots(slots: &str) -> Result<Vec<u8>> {
    if slots.trim().is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    slots.split(',').map(parse_slot).collect()
}

pub fn parse_pcr_selection(expression: &str) -> Result<PcrSelection> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    let bank = bank.parse()?;
    PcrSelection::new(bank, parse_slots(slots)?)
}

impl FromStr for PcrSelection {
    type Err = PcrError;

    fn from_str(expression: &str) -> Result<Self> {
        parse_pcr_selection(expression)
    }
}

impl TryFrom<String> for PcrSelection {
    type Error = PcrError;

    fn try_from(expression: String) -> Result<Self> {
        parse_pcr_selection(&expression)
    }
}

impl From<PcrSelection> for String {
    fn from(selection: PcrSelection) -> Self {
        selection.to_string()
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots: Vec<String> = self.slots.iter().map(u8::to_string).collect();
        write!(f, "{}:{}", self.bank, slots.join(","))
    }
}

#[cfg(feature = "tpm2")]
mod esapi {
    use super::*;
    use tss_esapi::interface_types::algorithm::HashingAlgorithm;
    use tss_esapi::structures::{PcrSelectionList, PcrSlot};

    impl From<PcrBank> for HashingAlgorithm {
        fn from(bank: PcrBank) -> Self {
            match bank {
                PcrBank::Sha1 => HashingAlgorithm::Sha1,
                PcrBank::Sha256 => HashingAlgorithm::Sha256,
                PcrBank::Sha384 => HashingAlgorithm::Sha384,
            }
        }
    }

    pub(crate) fn pcr_slot(slot: u8) -> Result<PcrSlot> {
        match slot {
            0 => Ok(PcrSlot::Slot0),
            1 => Ok(PcrSlot::Slot1),
            2 => Ok(PcrSlot::Slot2),
            3 => Ok(PcrSlot::Slot3),
            4 => Ok(PcrSlot::Slot4),
            5 => Ok(PcrSlot::Slot5),
            6 => Ok(PcrSlot::Slot6),
            7 => Ok(PcrSlot::Slot7),
            8 => Ok(PcrSlot::Slot8),
            9 => Ok(PcrSlot::Slot9),
            10 => Ok(PcrSlot::Slot10),
            11 => Ok(PcrSlot::Slot11),
            12 => Ok(PcrSlot::Slot12),
            13 => Ok(PcrSlot::Slot13),
            14 => Ok(PcrSlot::Slot14),
            15 => Ok(PcrSlot::Slot15),
            16 => Ok(PcrSlot::Slot16),
            17 => Ok(PcrSlot::Slot17),
            18 => Ok(PcrSlot::Slot18),
            19 => Ok(PcrSlot::Slot19),
            20 => Ok(PcrSlot::Slot20),
            21 => Ok(PcrSlot::Slot21),
            22 => Ok(PcrSlot::Slot22),
            23 => Ok(PcrSlot::Slot23),
            _ => Err(PcrError::InvalidPcrSlot(slot.to_string())),
        }
    }

    impl TryFrom<&PcrSelection> for PcrSelectionList {
        type Error = PcrError;

        fn try_from(selection: &PcrSelection) -> Result<Self> {
            let slots = selection
                .slots()
                .map(pcr_slot)
                .collect::<Result<Vec<PcrSlot>>>()?;
            Ok(PcrSelectionList::builder()
                .with_selection(selection.bank().into(), slots.as_slice())
                .build()?)
        }
    }
}
