use async_trait::async_trait;
use serde_json::json;

use calibtrain_types::{Event, Result};

use super::{track_number, RunningMean};
use crate::catalogue;
use crate::stage::EventMutator;

/// Key set on every record the stage has seen.
pub const CALIBRATED_FLAG: &str = "tof_calibrated";

/// TOF calibration. Writes `tof_time` (signal minus event `t0`) into each
/// matched track and flags the record, so it has to run after every reader.
#[derive(Debug, Default)]
pub struct TofCalib {
    events: u64,
    matched_tracks: u64,
    tof_time: RunningMean,
}

impl TofCalib {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventMutator for TofCalib {
    fn name(&self) -> &str {
        catalogue::TOF_CALIB
    }

    async fn process(&mut self, event: &mut Event) -> Result<()> {
        self.events += 1;
        let t0 = event.number("t0").unwrap_or(0.0);
        if let Some(tracks) = event.record.get_mut("tracks").and_then(|v| v.as_array_mut()) {
            for track in tracks.iter_mut() {
                let Some(signal) = track_number(track, "tof_signal") else {
                    continue;
                };
                let time = signal - t0;
                if let Some(obj) = track.as_object_mut() {
                    obj.insert("tof_time".into(), json!(time));
                    self.matched_tracks += 1;
                    self.tof_time.push(time);
                }
            }
        }
        event.record.insert(CALIBRATED_FLAG.into(), json!(true));
        Ok(())
    }

    async fn finish(&mut self) -> Result<serde_json::Value> {
        Ok(json!({
            "events": self.events,
            "matched_tracks": self.matched_tracks,
            "mean_tof_time": self.tof_time.mean(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_tof_time_and_flag() {
        let mut record = serde_json::Map::new();
        record.insert("t0".into(), json!(5.0));
        record.insert(
            "tracks".into(),
            json!([{"tof_signal": 25.0}, {"pt": 1.0}]),
        );
        let mut event = Event::new(3, record);

        let mut stage = TofCalib::new();
        stage.process(&mut event).await.unwrap();

        assert_eq!(event.record[CALIBRATED_FLAG], json!(true));
        assert_eq!(event.tracks()[0]["tof_time"], json!(20.0));
        assert!(event.tracks()[1].get("tof_time").is_none());

        let out = stage.finish().await.unwrap();
        assert_eq!(out["events"], 1);
        assert_eq!(out["matched_tracks"], 1);
        assert_eq!(out["mean_tof_time"], 20.0);
    }

    #[tokio::test]
    async fn flags_records_without_tracks() {
        let mut event = Event::default();
        TofCalib::new().process(&mut event).await.unwrap();
        assert_eq!(event.record.get(CALIBRATED_FLAG), Some(&json!(true)));
    }
}
