use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use calibtrain_types::{Event, Result, RunContext, Subsystem, L3_CURRENT};

use super::track_number;
use crate::catalogue;
use crate::stage::EventReader;

/// Below this magnet current (A) the field is treated as off.
const LOW_FIELD_L3_CURRENT: f64 = 300.0;

const DEFAULT_MIN_PT: f64 = 0.3;
const LOW_FIELD_MIN_PT: f64 = 0.001;
const TOF_WINDOW: f64 = 20.0;

/// Per-run configuration of the SDD alignment stage.
///
/// Derived from the run context when the stage is wired; whether the stage
/// runs at all is decided by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SddSettings {
    /// Use TPC-constrained tracks; otherwise ITS standalone tracks.
    pub use_tpc_constraint: bool,
    /// TOF matching window, or `-1.0` when TOF did not take data.
    pub tof_window: f64,
    pub min_pt: f64,
}

impl SddSettings {
    pub fn for_run(context: &RunContext) -> Self {
        let low_field = match context.scalar(L3_CURRENT) {
            Ok(current) => current < LOW_FIELD_L3_CURRENT,
            Err(e) => {
                tracing::debug!(run = context.run_id, error = %e, "Keeping default SDD min pT");
                false
            }
        };
        Self {
            use_tpc_constraint: context.has(Subsystem::Tpc),
            tof_window: if context.has(Subsystem::Tof) { TOF_WINDOW } else { -1.0 },
            min_pt: if low_field { LOW_FIELD_MIN_PT } else { DEFAULT_MIN_PT },
        }
    }
}

#[derive(Debug)]
pub struct SddAlign {
    settings: SddSettings,
    events: u64,
    accepted_tracks: u64,
    rejected_tracks: u64,
}

impl SddAlign {
    pub fn new(settings: SddSettings) -> Self {
        Self {
            settings,
            events: 0,
            accepted_tracks: 0,
            rejected_tracks: 0,
        }
    }

    fn accepts(&self, track: &serde_json::Value) -> bool {
        let its_clusters = track.get("its_clusters").and_then(|v| v.as_u64()).unwrap_or(0);
        let pt = track_number(track, "pt").unwrap_or(0.0);
        its_clusters > 0 && pt >= self.settings.min_pt
    }
}

#[async_trait]
impl EventReader for SddAlign {
    fn name(&self) -> &str {
        catalogue::SDD_ALIGN
    }

    async fn process(&mut self, event: &Event) -> Result<()> {
        self.events += 1;
        for track in event.tracks() {
            if self.accepts(track) {
                self.accepted_tracks += 1;
            } else {
                self.rejected_tracks += 1;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<serde_json::Value> {
        Ok(json!({
            "events": self.events,
            "accepted_tracks": self.accepted_tracks,
            "rejected_tracks": self.rejected_tracks,
            "settings": self.settings,
        }))
    }
}
