use async_trait::async_trait;
use serde_json::json;

use calibtrain_types::{Event, Result};

use super::{track_number, RunningMean};
use crate::catalogue;
use crate::stage::EventReader;

// ---------------------------------------------------------------------------
// TPC
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TpcCalib {
    events: u64,
    tracks: u64,
    friend_events: u64,
    dedx: RunningMean,
}

impl TpcCalib {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventReader for TpcCalib {
    fn name(&self) -> &str {
        catalogue::TPC_CALIB
    }

    async fn process(&mut self, event: &Event) -> Result<()> {
        self.events += 1;
        if event.friend.is_some() {
            self.friend_events += 1;
        }
        for track in event.tracks() {
            self.tracks += 1;
            if let Some(dedx) = track_number(track, "dedx") {
                self.dedx.push(dedx);
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<serde_json::Value> {
        Ok(json!({
            "events": self.events,
            "tracks": self.tracks,
            "friend_events": self.friend_events,
            "mean_dedx": self.dedx.mean(),
        }))
    }
}

// ---------------------------------------------------------------------------
// TRD
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TrdCalib {
    events: u64,
    matched_tracks: u64,
    tracklets: u64,
}

impl TrdCalib {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventReader for TrdCalib {
    fn name(&self) -> &str {
        catalogue::TRD_CALIB
    }

    async fn process(&mut self, event: &Event) -> Result<()> {
        self.events += 1;
        for track in event.tracks() {
            let n = track.get("trd_tracklets").and_then(|v| v.as_u64()).unwrap_or(0);
            if n > 0 {
                self.matched_tracks += 1;
                self.tracklets += n;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<serde_json::Value> {
        Ok(json!({
            "events": self.events,
            "matched_tracks": self.matched_tracks,
            "tracklets": self.tracklets,
        }))
    }
}

// ---------------------------------------------------------------------------
// T0
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct T0Calib {
    events: u64,
    t0: RunningMean,
}

impl T0Calib {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventReader for T0Calib {
    fn name(&self) -> &str {
        catalogue::T0_CALIB
    }

    async fn process(&mut self, event: &Event) -> Result<()> {
        self.events += 1;
        if let Some(t0) = event.number("t0") {
            self.t0.push(t0);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<serde_json::Value> {
        Ok(json!({
            "events": self.events,
            "timed_events": self.t0.count(),
            "mean_t0": self.t0.mean(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Mean vertex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MeanVertexCalib {
    events: u64,
    axes: [RunningMean; 3],
}

impl MeanVertexCalib {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventReader for MeanVertexCalib {
    fn name(&self) -> &str {
        catalogue::MEAN_VERTEX
    }

    async fn process(&mut self, event: &Event) -> Result<()> {
        self.events += 1;
        let vertex = event
            .record
            .get("vertex")
            .and_then(|v| v.as_array())
            .filter(|v| v.len() == 3);
        if let Some(vertex) = vertex {
            let coords: Vec<f64> = vertex.iter().filter_map(|c| c.as_f64()).collect();
            // Partial vertices are skipped.
            if coords.len() == 3 {
                for (axis, value) in self.axes.iter_mut().zip(coords) {
                    axis.push(value);
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<serde_json::Value> {
        let mean: Option<Vec<f64>> = self.axes.iter().map(RunningMean::mean).collect();
        Ok(json!({
            "events": self.events,
            "contributors": self.axes[0].count(),
            "mean_vertex": mean,
        }))
    }
}
