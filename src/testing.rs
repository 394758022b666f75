//! Test doubles shared by the unit tests.

use crate::components::lines::{LineDriver, LineId};
use crate::components::weight_channel::{WeightChannel, MAX_CHANNELS};
use crate::controllers::outputs::OutputMap;
use crate::interface::link::Message;
use crate::recipe::tanks::Tank;
use crate::recipe::ResolvedStep;
use crate::{StationId, TankId};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::channel;

/// Output driver that remembers every accepted write and can be told to refuse a line.
#[derive(Debug, Default)]
pub struct RecordingLines {
    writes: Vec<(LineId, bool)>,
    levels: BTreeMap<LineId, bool>,
    failing: BTreeSet<LineId>,
    failing_once: BTreeSet<LineId>,
}

impl RecordingLines {
    pub fn fail_line(&mut self, line: LineId) {
        self.failing.insert(line);
    }

    /// Refuses only the next write to `line`.
    pub fn fail_line_once(&mut self, line: LineId) {
        self.failing_once.insert(line);
    }

    pub fn heal_line(&mut self, line: LineId) {
        self.failing.remove(&line);
    }

    pub fn level(&self, line: LineId) -> bool {
        self.levels.get(&line).copied().unwrap_or(false)
    }

    pub fn writes(&self) -> &[(LineId, bool)] {
        &self.writes
    }
}

impl LineDriver for RecordingLines {
    fn is_simulated(&self) -> bool {
        true
    }

    async fn set_line(&mut self, line: LineId, high: bool) -> io::Result<()> {
        if self.failing.contains(&line) || self.failing_once.remove(&line) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("gpio{line} refused"),
            ));
        }
        self.writes.push((line, high));
        self.levels.insert(line, high);
        Ok(())
    }

    async fn release(&mut self) {}
}

/// A weight channel whose instrument answers from `readings` in order, replying with nothing for
/// `None` and once the script runs out. The returned buffer collects the addressed channels.
pub fn scripted_channel(readings: Vec<Option<f64>>) -> (WeightChannel, Arc<Mutex<Vec<u8>>>) {
    let (tx, mut rx) = channel::<Message>(1);
    let addresses = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&addresses);
    tokio::spawn(async move {
        let mut readings = readings.into_iter();
        while let Some(msg) = rx.recv().await {
            seen.lock().unwrap().push(msg.buffer[0]);
            let reply = match readings.next().flatten() {
                Some(weight) => format!("*{weight:+.3}#").into_bytes(),
                None => Vec::new(),
            };
            let _ = msg.response.send(reply);
        }
    });
    (WeightChannel::new(tx, MAX_CHANNELS), addresses)
}

pub fn output_map(lines: &[(TankId, StationId, LineId)]) -> OutputMap {
    let mut map = OutputMap::default();
    for &(tank, station, line) in lines {
        map.insert(tank, station, Some(line));
    }
    map
}

pub fn resolved(tank: TankId, chemical: &str, target_weight: f64) -> ResolvedStep {
    ResolvedStep {
        tank: Tank::unnamed(tank),
        chemical: chemical.into(),
        percentage: 0.,
        target_weight,
    }
}
