//! Shared types, errors, run context, and capability mask for the calibration train.
//!
//! This crate provides the foundational types used across the other crates:
//! - `CalibError`: unified error taxonomy
//! - `Subsystem` / `CapabilityMask`: which detectors contributed data to a run
//! - `Overrides`: environment-driven stage switches
//! - `RunContext`: everything the planner knows about one run
//! - `Event`: the shared per-event record streamed through the stages

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error type for the calibration train.
#[derive(Debug, thiserror::Error)]
pub enum CalibError {
    // === Descriptor Errors ===
    #[error("No run descriptor available for run {run}")]
    DescriptorUnavailable { run: u32 },

    #[error("Malformed descriptor for run {run}: {message}")]
    MalformedDescriptor { run: u32, message: String },

    #[error("Run {run} has no scalar '{name}'")]
    MissingScalar { run: u32, name: String },

    // === Registry Errors ===
    #[error("Stage '{name}' is already registered")]
    DuplicateStageName { name: String },

    #[error("Stage '{rejected}' cannot be terminal-mutating: '{existing}' already is")]
    DuplicateTerminalStage { existing: String, rejected: String },

    #[error("Switch '{switch}' is already claimed by stage '{stage}'")]
    DuplicateSwitch { switch: String, stage: String },

    #[error("Stage registry is invalid: {0}")]
    InvalidRegistry(String),

    // === Stage Errors ===
    #[error("Activation predicate of stage '{stage}' failed: {message}")]
    StagePredicateError { stage: String, message: String },

    #[error("Pipeline initialization failed at stage '{stage}': {message}")]
    InitializationFailed { stage: String, message: String },

    #[error("Stage '{stage}' failed on event {event}: {message}")]
    StageFailed {
        stage: String,
        event: u64,
        message: String,
    },

    // === Input Errors ===
    #[error("Malformed input at line {line}: {message}")]
    MalformedInput { line: usize, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CalibError {
    /// Returns `true` for the errors that end a run early without an artifact.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            CalibError::DescriptorUnavailable { .. }
                | CalibError::MalformedDescriptor { .. }
                | CalibError::InitializationFailed { .. }
        )
    }

    /// Returns `true` for errors raised while building the stage catalogue.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            CalibError::DuplicateStageName { .. }
                | CalibError::DuplicateTerminalStage { .. }
                | CalibError::DuplicateSwitch { .. }
                | CalibError::InvalidRegistry(_)
        )
    }
}

/// A convenience alias for `Result<T, CalibError>`.
pub type Result<T> = std::result::Result<T, CalibError>;

// ---------------------------------------------------------------------------
// Subsystem: detector identifiers with fixed bit positions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    ItsSpd,
    ItsSdd,
    ItsSsd,
    Tpc,
    Trd,
    Tof,
    Hmpid,
    Phos,
    Cpv,
    Pmd,
    MuonTrk,
    MuonTrg,
    Fmd,
    T0,
    Vzero,
    Zdc,
    Acorde,
    Trg,
    Emcal,
    DaqTest,
    Ad,
}

impl Subsystem {
    /// Every subsystem, in bit order.
    pub const ALL: [Subsystem; 21] = [
        Subsystem::ItsSpd,
        Subsystem::ItsSdd,
        Subsystem::ItsSsd,
        Subsystem::Tpc,
        Subsystem::Trd,
        Subsystem::Tof,
        Subsystem::Hmpid,
        Subsystem::Phos,
        Subsystem::Cpv,
        Subsystem::Pmd,
        Subsystem::MuonTrk,
        Subsystem::MuonTrg,
        Subsystem::Fmd,
        Subsystem::T0,
        Subsystem::Vzero,
        Subsystem::Zdc,
        Subsystem::Acorde,
        Subsystem::Trg,
        Subsystem::Emcal,
        Subsystem::DaqTest,
        Subsystem::Ad,
    ];

    /// Bit position in the detector mask. Bit 20 is unassigned.
    pub const fn bit(self) -> u32 {
        match self {
            Subsystem::ItsSpd => 0,
            Subsystem::ItsSdd => 1,
            Subsystem::ItsSsd => 2,
            Subsystem::Tpc => 3,
            Subsystem::Trd => 4,
            Subsystem::Tof => 5,
            Subsystem::Hmpid => 6,
            Subsystem::Phos => 7,
            Subsystem::Cpv => 8,
            Subsystem::Pmd => 9,
            Subsystem::MuonTrk => 10,
            Subsystem::MuonTrg => 11,
            Subsystem::Fmd => 12,
            Subsystem::T0 => 13,
            Subsystem::Vzero => 14,
            Subsystem::Zdc => 15,
            Subsystem::Acorde => 16,
            Subsystem::Trg => 17,
            Subsystem::Emcal => 18,
            Subsystem::DaqTest => 19,
            Subsystem::Ad => 21,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Subsystem::ItsSpd => "ITSSPD",
            Subsystem::ItsSdd => "ITSSDD",
            Subsystem::ItsSsd => "ITSSSD",
            Subsystem::Tpc => "TPC",
            Subsystem::Trd => "TRD",
            Subsystem::Tof => "TOF",
            Subsystem::Hmpid => "HMPID",
            Subsystem::Phos => "PHOS",
            Subsystem::Cpv => "CPV",
            Subsystem::Pmd => "PMD",
            Subsystem::MuonTrk => "MUONTRK",
            Subsystem::MuonTrg => "MUONTRG",
            Subsystem::Fmd => "FMD",
            Subsystem::T0 => "T0",
            Subsystem::Vzero => "VZERO",
            Subsystem::Zdc => "ZDC",
            Subsystem::Acorde => "ACORDE",
            Subsystem::Trg => "TRG",
            Subsystem::Emcal => "EMCAL",
            Subsystem::DaqTest => "DAQ_TEST",
            Subsystem::Ad => "AD",
        }
    }

    /// Case-insensitive lookup by detector name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// CapabilityMask: bit-set of contributing subsystems
// ---------------------------------------------------------------------------

/// Immutable set of subsystems that contributed data to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilityMask(u32);

const fn known_bits() -> u32 {
    let mut bits = 0u32;
    let mut i = 0;
    while i < Subsystem::ALL.len() {
        bits |= 1 << Subsystem::ALL[i].bit();
        i += 1;
    }
    bits
}

impl CapabilityMask {
    /// Bits that correspond to a known subsystem.
    pub const KNOWN_BITS: u32 = known_bits();

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Decode a raw detector mask. Returns `None` if any bit outside
    /// [`KNOWN_BITS`](Self::KNOWN_BITS) is set.
    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::KNOWN_BITS != 0 {
            None
        } else {
            Some(Self(bits))
        }
    }

    /// Build a mask from detector names. Returns the first unknown name on failure.
    pub fn from_names<I, S>(names: I) -> std::result::Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mask = Self::empty();
        for name in names {
            let name = name.as_ref();
            let subsystem = Subsystem::from_name(name).ok_or_else(|| name.to_string())?;
            mask = mask.with(subsystem);
        }
        Ok(mask)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, subsystem: Subsystem) -> bool {
        self.0 & (1 << subsystem.bit()) != 0
    }

    #[must_use]
    pub const fn with(self, subsystem: Subsystem) -> Self {
        Self(self.0 | (1 << subsystem.bit()))
    }

    #[must_use]
    pub const fn without(self, subsystem: Subsystem) -> Self {
        Self(self.0 & !(1 << subsystem.bit()))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Contained subsystems in bit order.
    pub fn iter(self) -> impl Iterator<Item = Subsystem> {
        Subsystem::ALL.into_iter().filter(move |s| self.contains(*s))
    }

    pub fn names(self) -> Vec<&'static str> {
        self.iter().map(Subsystem::name).collect()
    }
}

impl FromIterator<Subsystem> for CapabilityMask {
    fn from_iter<T: IntoIterator<Item = Subsystem>>(iter: T) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

/// Space-separated list of triggered detectors, e.g. `"ITSSPD TPC TRD"`.
impl fmt::Display for CapabilityMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(" "))
    }
}

// ---------------------------------------------------------------------------
// Overrides: environment-driven stage switches
// ---------------------------------------------------------------------------

/// Raw switch values keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overrides {
    values: BTreeMap<String, String>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the named variables from the process environment. Other
    /// variables are never looked at.
    pub fn capture<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = Self::new();
        for name in names {
            let name = name.as_ref();
            if let Ok(value) = std::env::var(name) {
                overrides.set(name, value);
            }
        }
        overrides
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Merge `other` into `self`; entries in `other` win.
    pub fn merge(&mut self, other: Overrides) {
        self.values.extend(other.values);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Integer value of a switch, or `None` when it is not set.
    pub fn switch(&self, name: &str) -> Option<i64> {
        self.get(name).map(atoi)
    }

    /// `true` when the switch is set to a value greater than zero.
    pub fn is_positive(&self, name: &str) -> bool {
        self.switch(name).is_some_and(|v| v > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// C `atoi` semantics: optional leading whitespace and sign, then as many
/// digits as present. Anything unparsable reads as 0; overflow saturates.
pub fn atoi(raw: &str) -> i64 {
    let s = raw.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }
    if negative {
        -value
    } else {
        value
    }
}

// ---------------------------------------------------------------------------
// RunContext: read-only view of one run
// ---------------------------------------------------------------------------

/// Name of the solenoid magnet current scalar.
pub const L3_CURRENT: &str = "l3_current";

#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: u32,
    pub mask: CapabilityMask,
    pub scalars: BTreeMap<String, f64>,
    pub overrides: Overrides,
}

impl RunContext {
    pub fn new(run_id: u32, mask: CapabilityMask) -> Self {
        Self {
            run_id,
            mask,
            scalars: BTreeMap::new(),
            overrides: Overrides::new(),
        }
    }

    #[must_use]
    pub fn with_scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.scalars.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn has(&self, subsystem: Subsystem) -> bool {
        self.mask.contains(subsystem)
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.scalars
            .get(name)
            .copied()
            .ok_or_else(|| CalibError::MissingScalar {
                run: self.run_id,
                name: name.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Event: shared per-event record plus auxiliary data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub record: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friend: Option<serde_json::Value>,
}

impl Event {
    pub fn new(index: u64, record: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            index,
            record,
            friend: None,
        }
    }

    #[must_use]
    pub fn with_friend(mut self, friend: serde_json::Value) -> Self {
        self.friend = Some(friend);
        self
    }

    /// Track list of the record; empty when absent or not an array.
    pub fn tracks(&self) -> &[serde_json::Value] {
        self.record
            .get("tracks")
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Numeric field of the record.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.record.get(key).and_then(|v| v.as_f64())
    }
}
