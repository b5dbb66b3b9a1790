//! Run descriptor lookup.
//!
//! A descriptor is a small JSON document:
//!
//! ```json
//! { "run": 104892, "detector_mask": ["TPC", "TRD"], "scalars": { "l3_current": 30000.0 } }
//! ```
//!
//! `detector_mask` may be the raw bit mask (`1083`), a list of names, or a
//! space-separated string of names. `run` is optional but must match the
//! requested run when present.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::Deserialize;

use calibtrain_types::{CalibError, CapabilityMask, Result, RunContext};

/// Well-known snapshot file that replaces live lookup when present.
pub const SNAPSHOT_FILE: &str = "OCDB.json";

/// Resolves a run id to its context. Retries, if any, belong to the
/// implementation.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    async fn resolve(&self, run_id: u32) -> Result<RunContext>;
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    run: Option<u32>,
    detector_mask: serde_json::Value,
    #[serde(default)]
    scalars: BTreeMap<String, f64>,
}

fn malformed(run: u32, message: impl Into<String>) -> CalibError {
    CalibError::MalformedDescriptor {
        run,
        message: message.into(),
    }
}

fn decode_mask(run: u32, value: &serde_json::Value) -> Result<CapabilityMask> {
    match value {
        serde_json::Value::Number(n) => {
            let bits = n
                .as_u64()
                .and_then(|b| u32::try_from(b).ok())
                .ok_or_else(|| malformed(run, format!("detector mask {n} is not a 32-bit mask")))?;
            CapabilityMask::from_bits(bits).ok_or_else(|| {
                malformed(
                    run,
                    format!(
                        "detector mask {bits:#x} sets unknown bits {:#x}",
                        bits & !CapabilityMask::KNOWN_BITS
                    ),
                )
            })
        }
        serde_json::Value::Array(items) => {
            let names = items
                .iter()
                .map(|v| {
                    v.as_str()
                        .ok_or_else(|| malformed(run, format!("detector name {v} is not a string")))
                })
                .collect::<Result<Vec<_>>>()?;
            CapabilityMask::from_names(names)
                .map_err(|name| malformed(run, format!("unknown detector '{name}'")))
        }
        serde_json::Value::String(s) => CapabilityMask::from_names(s.split_whitespace())
            .map_err(|name| malformed(run, format!("unknown detector '{name}'"))),
        other => Err(malformed(
            run,
            format!("detector mask has unsupported type: {other}"),
        )),
    }
}

/// Decode a descriptor document for `run`.
pub fn decode_descriptor(run: u32, document: serde_json::Value) -> Result<RunContext> {
    let raw: RawDescriptor =
        serde_json::from_value(document).map_err(|e| malformed(run, e.to_string()))?;
    if let Some(declared) = raw.run {
        if declared != run {
            return Err(malformed(
                run,
                format!("descriptor belongs to run {declared}"),
            ));
        }
    }
    let mask = decode_mask(run, &raw.detector_mask)?;
    let mut context = RunContext::new(run, mask);
    context.scalars = raw.scalars;
    Ok(context)
}

async fn read_document(run: u32, path: &Path) -> Result<Option<serde_json::Value>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| malformed(run, format!("{}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Metadata directory laid out as `<root>/GRP/GRP/Data/Run<run>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryDescriptorSource {
    root: PathBuf,
}

impl DirectoryDescriptorSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, run_id: u32) -> PathBuf {
        self.root
            .join("GRP")
            .join("GRP")
            .join("Data")
            .join(format!("Run{run_id}.json"))
    }
}

#[async_trait]
impl DescriptorSource for DirectoryDescriptorSource {
    fn describe(&self) -> String {
        format!("local://{}", self.root.display())
    }

    async fn resolve(&self, run_id: u32) -> Result<RunContext> {
        let path = self.path_for(run_id);
        tracing::debug!(run = run_id, path = %path.display(), "Reading run descriptor");
        match read_document(run_id, &path).await? {
            Some(document) => decode_descriptor(run_id, document),
            None => Err(CalibError::DescriptorUnavailable { run: run_id }),
        }
    }
}

/// Single snapshot file: `{"runs": {"<run>": <descriptor>, ...}}`.
#[derive(Debug, Clone)]
pub struct SnapshotDescriptorSource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    runs: BTreeMap<String, serde_json::Value>,
}

impl SnapshotDescriptorSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DescriptorSource for SnapshotDescriptorSource {
    fn describe(&self) -> String {
        format!("snapshot://{}", self.path.display())
    }

    async fn resolve(&self, run_id: u32) -> Result<RunContext> {
        let Some(document) = read_document(run_id, &self.path).await? else {
            return Err(CalibError::DescriptorUnavailable { run: run_id });
        };
        let mut snapshot: Snapshot = serde_json::from_value(document)
            .map_err(|e| malformed(run_id, format!("snapshot: {e}")))?;
        match snapshot.runs.remove(&run_id.to_string()) {
            Some(entry) => decode_descriptor(run_id, entry),
            None => Err(CalibError::DescriptorUnavailable { run: run_id }),
        }
    }
}

// ---------------------------------------------------------------------------
// MetadataLocation
// ---------------------------------------------------------------------------

/// Where run descriptors come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataLocation {
    Directory(PathBuf),
    Snapshot(PathBuf),
}

impl MetadataLocation {
    pub fn into_source(self) -> Box<dyn DescriptorSource> {
        match self {
            MetadataLocation::Directory(root) => Box::new(DirectoryDescriptorSource::new(root)),
            MetadataLocation::Snapshot(path) => Box::new(SnapshotDescriptorSource::new(path)),
        }
    }
}

impl FromStr for MetadataLocation {
    type Err = CalibError;

    /// `local://<dir>`, `snapshot://<file>`, or a bare directory path.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once("://") {
            Some(("local", rest)) if !rest.is_empty() => Ok(Self::Directory(rest.into())),
            Some(("snapshot", rest)) if !rest.is_empty() => Ok(Self::Snapshot(rest.into())),
            Some((scheme, _)) => Err(CalibError::Config(format!(
                "unsupported metadata location '{s}' (scheme '{scheme}'); use local:// or snapshot://"
            ))),
            None if s.is_empty() => Err(CalibError::Config("empty metadata location".into())),
            None => Ok(Self::Directory(s.into())),
        }
    }
}

impl fmt::Display for MetadataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataLocation::Directory(p) => write!(f, "local://{}", p.display()),
            MetadataLocation::Snapshot(p) => write!(f, "snapshot://{}", p.display()),
        }
    }
}

/// The configured source, unless `snapshot_file` exists, in which case the
/// snapshot wins.
pub fn select_source(
    location: &MetadataLocation,
    snapshot_file: &Path,
) -> Box<dyn DescriptorSource> {
    if snapshot_file.is_file() {
        tracing::info!(snapshot = %snapshot_file.display(), "Using metadata snapshot");
        return Box::new(SnapshotDescriptorSource::new(snapshot_file));
    }
    location.clone().into_source()
}

// ---------------------------------------------------------------------------
// Local access file
// ---------------------------------------------------------------------------

/// Optional site file read from the working directory before lookup.
pub const LOCAL_ACCESS_FILE: &str = "localOCDBaccess.json";

/// Site-local adjustments to metadata access:
///
/// ```json
/// { "metadata": "local:///data/OCDB", "overrides": { "CALIBTRAIN_DISABLE_TRD": "1" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LocalAccessConfig {
    /// Replaces the configured metadata location. A snapshot file still wins.
    #[serde(default)]
    pub metadata: Option<String>,
    /// Switch values layered over the environment, under explicit ones.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl LocalAccessConfig {
    /// Load `path`, or `None` when it does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            CalibError::Config(format!("invalid local access file {}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), "Applying local access configuration");
        Ok(Some(config))
    }

    /// The metadata location this file selects, if any.
    pub fn location(&self) -> Result<Option<MetadataLocation>> {
        self.metadata
            .as_deref()
            .map(str::parse::<MetadataLocation>)
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
