//! Built-in stage implementations.
//!
//! The stages are collectors: they summarise fields of the event record and
//! report the summary from `finish`. Fields they read, all optional:
//!
//! - `record.tracks[]`: objects with `pt`, `dedx`, `trd_tracklets`,
//!   `its_clusters`, `tof_signal`
//! - `record.t0`: event start time
//! - `record.vertex`: `[x, y, z]`
//! - `friend`: any auxiliary payload; only its presence is counted

mod cleanup;
mod detectors;
mod sdd;
mod tof;

pub use cleanup::CleanGeometry;
pub use detectors::{MeanVertexCalib, T0Calib, TpcCalib, TrdCalib};
pub use sdd::{SddAlign, SddSettings};
pub use tof::{TofCalib, CALIBRATED_FLAG};

/// Numeric field of a track object.
pub(crate) fn track_number(track: &serde_json::Value, key: &str) -> Option<f64> {
    track.get(key).and_then(|v| v.as_f64())
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RunningMean {
    count: u64,
    sum: f64,
}

impl RunningMean {
    pub(crate) fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }

    pub(crate) fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}
