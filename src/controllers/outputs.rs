use crate::components::lines::{LineDriver, LineId, Lines};
use crate::error::{Error, Result};
use crate::{StationId, TankId};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

/// BCM pins handed out, in order, when no output map exists yet.
pub const DEFAULT_PIN_POOL: [LineId; 26] = [
    2, 3, 4, 17, 27, 22, 10, 9, 11, 5, 6, 13, 19, 26, 14, 15, 18, 23, 24, 25, 8, 7, 12, 16, 20, 21,
];

pub fn output_key(tank: TankId, station: StationId) -> String {
    format!("tank{tank}_stirrer{station}")
}

/// `tank<N>_stirrer<M>` to physical line. Keys that are absent or `null` have no line wired.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(transparent)]
pub struct OutputMap(BTreeMap<String, Option<LineId>>);

impl OutputMap {
    /// Only tanks `1..=wired_tanks` get lines; the rest are listed as unwired. Each pin of the
    /// pool is handed out once, outputs past the end of the pool stay unwired.
    pub fn default_layout(num_tanks: TankId, num_stations: StationId, wired_tanks: TankId) -> Self {
        let mut pins = DEFAULT_PIN_POOL.iter().copied();
        let mut map = BTreeMap::new();
        let mut short = 0;
        for tank in 1..=num_tanks {
            for station in 1..=num_stations {
                let line = if tank <= wired_tanks { pins.next() } else { None };
                if tank <= wired_tanks && line.is_none() {
                    short += 1;
                }
                map.insert(output_key(tank, station), line);
            }
        }
        if short > 0 {
            warn!(
                "Pin pool has {} lines, {short} outputs left unwired",
                DEFAULT_PIN_POOL.len()
            );
        }
        Self(map)
    }

    pub fn load_or_create(
        path: impl AsRef<Path>,
        num_tanks: TankId,
        num_stations: StationId,
        wired_tanks: TankId,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            return Ok(serde_json::from_str(&raw)?);
        }
        let map = Self::default_layout(num_tanks, num_stations, wired_tanks);
        let json = serde_json::to_string_pretty(&map)?;
        if let Err(source) = std::fs::write(path, json) {
            warn!(
                "{}",
                Error::Persistence {
                    path: path.to_path_buf(),
                    source
                }
            );
        }
        Ok(map)
    }

    pub fn insert(&mut self, tank: TankId, station: StationId, line: Option<LineId>) {
        self.0.insert(output_key(tank, station), line);
    }

    pub fn line(&self, tank: TankId, station: StationId) -> Option<LineId> {
        self.0.get(&output_key(tank, station)).copied().flatten()
    }

    pub fn lines(&self) -> BTreeSet<LineId> {
        self.0.values().filter_map(|line| *line).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Hardware,
    Simulated,
}

/// Owns the valve lines for a run and remembers which (tank, station) outputs are on.
pub struct OutputController<D: LineDriver = Lines> {
    driver: D,
    map: OutputMap,
    asserted: BTreeSet<(TankId, StationId)>,
}

impl<D: LineDriver> OutputController<D> {
    pub fn new(driver: D, map: OutputMap) -> Self {
        Self {
            driver,
            map,
            asserted: BTreeSet::new(),
        }
    }

    pub fn mode(&self) -> OutputMode {
        if self.driver.is_simulated() {
            OutputMode::Simulated
        } else {
            OutputMode::Hardware
        }
    }

    /// Drives the mapped line for `tank` and `station`. Outputs without a line are a no-op.
    /// An output only counts as asserted once the driver accepted the HIGH, and stays counted
    /// until a LOW goes through.
    pub async fn set_output(
        &mut self,
        tank: TankId,
        station: StationId,
        on: bool,
    ) -> io::Result<()> {
        let Some(line) = self.map.line(tank, station) else {
            debug!(
                "No output line for {}, skipping",
                output_key(tank, station)
            );
            return Ok(());
        };
        self.driver.set_line(line, on).await?;
        if on {
            self.asserted.insert((tank, station));
        } else {
            self.asserted.remove(&(tank, station));
        }
        Ok(())
    }

    /// Drives every mapped line LOW, whatever state it is believed to be in. Individual failures
    /// are logged and do not stop the sweep.
    pub async fn cleanup_all(&mut self) {
        for line in self.map.lines() {
            if let Err(e) = self.driver.set_line(line, false).await {
                error!("Error setting line {line} LOW during cleanup: {e}");
            }
        }
        if !self.asserted.is_empty() {
            info!("{} outputs turned OFF", self.asserted.len());
        }
        self.asserted.clear();
    }

    pub async fn release(&mut self) {
        self.cleanup_all().await;
        self.driver.release().await;
    }

    pub fn asserted(&self) -> &BTreeSet<(TankId, StationId)> {
        &self.asserted
    }

    pub fn is_asserted(&self, tank: TankId, station: StationId) -> bool {
        self.asserted.contains(&(tank, station))
    }

    pub fn map(&self) -> &OutputMap {
        &self.map
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }
}

impl OutputController<Lines> {
    /// Picks hardware or simulation for the lines in `map` and starts with everything LOW.
    pub async fn connect(
        gpio_root: impl AsRef<Path>,
        map: OutputMap,
        force_simulation: bool,
    ) -> Self {
        let driver = Lines::select(gpio_root.as_ref(), map.lines(), force_simulation).await;
        let mut controller = Self::new(driver, map);
        controller.cleanup_all().await;
        controller
    }
}

#[test]
fn default_layout_wires_first_tanks_only() {
    let map = OutputMap::default_layout(25, 4, 5);
    assert_eq!(map.line(1, 1), Some(2));
    assert_eq!(map.line(1, 4), Some(17));
    assert_eq!(map.line(5, 4), Some(25));
    assert_eq!(map.line(6, 1), None);
    assert_eq!(map.lines().len(), 20);

    let json = serde_json::to_value(&map).unwrap();
    assert_eq!(json["tank6_stirrer1"], serde_json::Value::Null);
    assert_eq!(json["tank2_stirrer1"], 27);
}

#[test]
fn default_layout_never_shares_a_pin() {
    let map = OutputMap::default_layout(25, 4, 8);
    assert_eq!(map.line(7, 2), Some(21));
    assert_eq!(map.line(7, 3), None);
    assert_eq!(map.line(8, 4), None);
    assert_eq!(map.lines().len(), DEFAULT_PIN_POOL.len());
    let wired = map.0.values().filter(|line| line.is_some()).count();
    assert_eq!(wired, DEFAULT_PIN_POOL.len());
}

#[test]
fn output_map_file_is_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gpio_map.json");
    let created = OutputMap::load_or_create(&path, 25, 4, 5).unwrap();
    std::fs::write(&path, r#"{"tank1_stirrer1": 21, "tank2_stirrer1": null}"#).unwrap();
    let loaded = OutputMap::load_or_create(&path, 25, 4, 5).unwrap();
    assert_ne!(created, loaded);
    assert_eq!(loaded.line(1, 1), Some(21));
    assert_eq!(loaded.line(2, 1), None);
    assert_eq!(loaded.line(3, 1), None);
}

#[tokio::test]
async fn set_output_is_idempotent_and_tracks_asserted() {
    use crate::components::lines::SimulatedLines;

    let mut map = OutputMap::default();
    map.insert(1, 2, Some(17));
    map.insert(6, 2, None);
    let mut outputs = OutputController::new(SimulatedLines::default(), map);
    assert_eq!(outputs.mode(), OutputMode::Simulated);

    outputs.set_output(1, 2, true).await.unwrap();
    outputs.set_output(1, 2, true).await.unwrap();
    assert!(outputs.is_asserted(1, 2));
    assert!(outputs.driver().level(17));
    assert_eq!(outputs.asserted().len(), 1);

    // Unwired and unknown outputs are accepted and ignored.
    outputs.set_output(6, 2, true).await.unwrap();
    outputs.set_output(9, 9, true).await.unwrap();
    assert_eq!(outputs.asserted().len(), 1);

    outputs.set_output(1, 2, false).await.unwrap();
    assert!(outputs.asserted().is_empty());
    assert!(!outputs.driver().level(17));
}

#[tokio::test]
async fn cleanup_survives_driver_failures() {
    use crate::testing::RecordingLines;

    let mut map = OutputMap::default();
    map.insert(1, 1, Some(17));
    map.insert(2, 1, Some(18));
    let mut outputs = OutputController::new(RecordingLines::default(), map);
    outputs.set_output(1, 1, true).await.unwrap();
    outputs.set_output(2, 1, true).await.unwrap();

    outputs.driver_mut().fail_line(17);
    assert!(outputs.set_output(1, 1, false).await.is_err());
    assert!(outputs.is_asserted(1, 1));

    outputs.cleanup_all().await;
    assert!(outputs.asserted().is_empty());
    assert!(!outputs.driver().level(18));
}

#[tokio::test]
async fn connect_drives_everything_low() {
    let dir = tempfile::tempdir().unwrap();
    let map = OutputMap::default_layout(2, 2, 2);
    let outputs = OutputController::connect(dir.path().join("missing"), map, false).await;
    assert_eq!(outputs.mode(), OutputMode::Simulated);
    assert!(outputs.asserted().is_empty());
}
