use async_trait::async_trait;
use serde_json::json;

use calibtrain_types::{Event, Result};

use crate::catalogue;
use crate::stage::EventReader;

/// Pipeline-level resources released when the stream ends.
const RELEASED: &[&str] = &["geometry"];

/// Fixed cleanup stage. Not part of any plan; the executor runs it after
/// every stream, including empty ones.
#[derive(Debug, Default)]
pub struct CleanGeometry {
    released: bool,
}

impl CleanGeometry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventReader for CleanGeometry {
    fn name(&self) -> &str {
        catalogue::CLEAN_GEOM
    }

    async fn process(&mut self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<serde_json::Value> {
        if !self.released {
            tracing::debug!(resources = ?RELEASED, "Releasing pipeline resources");
            self.released = true;
        }
        Ok(json!({ "released": RELEASED }))
    }
}
