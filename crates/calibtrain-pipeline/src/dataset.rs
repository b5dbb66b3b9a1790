//! Event input.
//!
//! [`JsonLinesDataset`] reads one event per line:
//!
//! ```json
//! {"record": {"tracks": [{"pt": 1.2}]}, "friend": {"clusters": 48}}
//! ```
//!
//! Events are numbered in input order starting at 0, whatever `index` the
//! line carries.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use calibtrain_types::{CalibError, Event, Result};

/// Sequential event stream.
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` at end of input.
    async fn next_event(&mut self) -> Result<Option<Event>>;

    /// Number of events handed out so far.
    fn consumed(&self) -> u64;
}

pub struct JsonLinesDataset {
    lines: Lines<BufReader<tokio::fs::File>>,
    line_no: usize,
    consumed: u64,
    read_friends: bool,
}

impl JsonLinesDataset {
    /// Open a dataset. With `read_friends` off, auxiliary data is dropped.
    pub async fn open(path: impl AsRef<Path>, read_friends: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            CalibError::Config(format!("cannot open input {}: {e}", path.display()))
        })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            consumed: 0,
            read_friends,
        })
    }
}

#[async_trait]
impl EventSource for JsonLinesDataset {
    async fn next_event(&mut self) -> Result<Option<Event>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut event: Event =
                serde_json::from_str(line).map_err(|e| CalibError::MalformedInput {
                    line: self.line_no,
                    message: e.to_string(),
                })?;
            event.index = self.consumed;
            if !self.read_friends {
                event.friend = None;
            }
            self.consumed += 1;
            return Ok(Some(event));
        }
        Ok(None)
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }
}

/// In-memory source, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    events: VecDeque<Event>,
    consumed: u64,
}

impl MemorySource {
    pub fn new(events: impl IntoIterator<Item = Event>) -> Self {
        Self {
            events: events.into_iter().collect(),
            consumed: 0,
        }
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next_event(&mut self) -> Result<Option<Event>> {
        let next = self.events.pop_front().map(|mut e| {
            e.index = self.consumed;
            e
        });
        if next.is_some() {
            self.consumed += 1;
        }
        Ok(next)
    }

    fn consumed(&self) -> u64 {
        self.consumed
    }
}
