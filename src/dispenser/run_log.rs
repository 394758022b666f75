use crate::dispenser::StepStatus;
use crate::error::{Error, Result};
use crate::recipe::tanks::Tank;
use crate::util::utils::round_to;
use crate::{StationId, TankId};
use chrono::Local;
use log::error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

fn timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub chemical: String,
    pub target_weight_kg: f64,
    pub dispensed_weight_kg: f64,
    pub progress_percent: f64,
    pub status: StepStatus,
    pub last_updated: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tank: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tank_contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tank_number: Option<TankId>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StationLog {
    pub stirrer_name: String,
    #[serde(default)]
    pub steps: BTreeMap<String, LogEntry>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct RunLogFile {
    pub production_start_time: String,
    #[serde(default)]
    pub stirrers: BTreeMap<String, StationLog>,
}

fn key_number(key: &str) -> u64 {
    key.rsplit('_')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u64::MAX)
}

impl RunLogFile {
    fn started_now() -> Self {
        Self {
            production_start_time: timestamp(),
            stirrers: BTreeMap::new(),
        }
    }

    pub fn entry(&self, station: StationId, step_index: usize) -> Option<&LogEntry> {
        self.stirrers
            .get(&format!("stirrer_{station}"))?
            .steps
            .get(&format!("step_{}", step_index + 1))
    }

    /// Human readable audit view: stations in order, steps in numeric order.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Production Started: {}", self.production_start_time);
        let _ = writeln!(out, "{}\n", "=".repeat(80));

        let mut stirrers: Vec<(&String, &StationLog)> = self.stirrers.iter().collect();
        stirrers.sort_by_key(|(key, _)| key_number(key));
        for (_, station) in stirrers {
            let _ = writeln!(out, ">>> {} <<<", station.stirrer_name);
            let _ = writeln!(out, "{}", "-".repeat(40));
            if station.steps.is_empty() {
                let _ = writeln!(out, "No steps recorded.\n");
                continue;
            }
            let mut steps: Vec<(&String, &LogEntry)> = station.steps.iter().collect();
            steps.sort_by_key(|(key, _)| key_number(key));
            for (key, entry) in steps {
                let _ = writeln!(out, "Step {}:", key_number(key));
                let _ = writeln!(out, "  Chemical: {}", entry.chemical);
                if let Some(tank) = &entry.source_tank {
                    let mut line = format!("  Source Tank: {tank}");
                    if let Some(contents) = entry.tank_contents.as_deref().filter(|c| !c.is_empty())
                    {
                        let _ = write!(line, " (Contains: {contents})");
                    }
                    if let Some(number) = entry.tank_number {
                        let _ = write!(line, " - Tank #{number}");
                    }
                    let _ = writeln!(out, "{line}");
                }
                let _ = writeln!(out, "  Target Weight: {:.3} kg", entry.target_weight_kg);
                let _ = writeln!(out, "  Dispensed Weight: {:.3} kg", entry.dispensed_weight_kg);
                let _ = writeln!(out, "  Progress: {:.1}%", entry.progress_percent);
                let _ = writeln!(out, "  Status: {}", entry.status);
                let _ = writeln!(out, "  Last Updated: {}\n", entry.last_updated);
            }
            out.push('\n');
        }
        out
    }
}

/// Durable audit trail of a production run. Every record rewrites the file; a failed write is
/// logged and dispensing carries on.
pub struct RunLog {
    path: PathBuf,
    data: RunLogFile,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: RunLogFile::started_now(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &RunLogFile {
        &self.data
    }

    pub fn reset(&mut self) {
        self.data = RunLogFile::started_now();
        self.persist();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        station: StationId,
        step_index: usize,
        chemical: &str,
        target: f64,
        dispensed: f64,
        status: StepStatus,
        tank: &Tank,
    ) {
        let progress = if target > 0. {
            dispensed / target * 100.
        } else {
            0.
        };
        let entry = LogEntry {
            chemical: chemical.to_string(),
            target_weight_kg: round_to(target, 3),
            dispensed_weight_kg: round_to(dispensed, 3),
            progress_percent: round_to(progress, 1),
            status,
            last_updated: timestamp(),
            source_tank: Some(tank.name.clone()).filter(|name| !name.is_empty()),
            tank_contents: Some(tank.contents.clone()).filter(|c| !c.is_empty()),
            tank_number: Some(tank.number),
        };
        self.data
            .stirrers
            .entry(format!("stirrer_{station}"))
            .or_insert_with(|| StationLog {
                stirrer_name: format!("Stirrer {station}"),
                steps: BTreeMap::new(),
            })
            .steps
            .insert(format!("step_{}", step_index + 1), entry);
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.try_persist() {
            error!("Error updating dispensing log: {e}");
        }
    }

    fn try_persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(&self.path, json).map_err(|source| Error::Persistence {
            path: self.path.clone(),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<RunLogFile> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Removes the log file. Clearing a log that does not exist is fine.
    pub fn clear(path: impl AsRef<Path>) -> Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[test]
fn record_upserts_by_station_and_step() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispensing_log.json");
    let mut log = RunLog::new(&path);
    log.reset();

    let tank = Tank {
        number: 3,
        name: "Resin".into(),
        contents: "APR332".into(),
    };
    log.record(2, 0, "Resin", 4.0, 1.23456, StepStatus::Dispensing, &tank);
    log.record(2, 0, "Resin", 4.0, 4.1, StepStatus::Complete, &tank);
    log.record(2, 1, "Water", 0.0, 0.0, StepStatus::Waiting, &Tank::unnamed(4));

    let file = RunLog::load(&path).unwrap();
    assert_eq!(file.production_start_time, log.data().production_start_time);
    let first = file.entry(2, 0).unwrap();
    assert_eq!(first.status, StepStatus::Complete);
    assert_eq!(first.dispensed_weight_kg, 4.1);
    assert_eq!(first.progress_percent, 102.5);
    assert_eq!(first.tank_contents.as_deref(), Some("APR332"));
    assert_eq!(file.entry(2, 1).unwrap().progress_percent, 0.0);
    assert!(file.entry(2, 1).unwrap().tank_contents.is_none());
    assert_eq!(file.stirrers["stirrer_2"].stirrer_name, "Stirrer 2");

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["stirrers"]["stirrer_2"]["steps"]["step_1"]["status"], "Complete");
    assert_eq!(raw["stirrers"]["stirrer_2"]["steps"]["step_1"]["source_tank"], "Resin");
    assert!(raw["stirrers"]["stirrer_2"]["steps"]["step_2"]
        .get("tank_contents")
        .is_none());
}

#[test]
fn reset_truncates_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispensing_log.json");
    let mut log = RunLog::new(&path);
    log.record(1, 0, "A", 1.0, 0.5, StepStatus::Dispensing, &Tank::unnamed(1));
    log.reset();
    assert!(RunLog::load(&path).unwrap().stirrers.is_empty());

    RunLog::clear(&path).unwrap();
    assert!(!path.exists());
    RunLog::clear(&path).unwrap();
}

#[test]
fn failed_writes_do_not_panic() {
    let dir = tempfile::tempdir().unwrap();
    let mut log = RunLog::new(dir.path().join("missing").join("log.json"));
    log.reset();
    log.record(1, 0, "A", 1.0, 0.5, StepStatus::Dispensing, &Tank::unnamed(1));
    assert!(log.data().entry(1, 0).is_some());
}

#[test]
fn report_orders_steps_numerically() {
    let mut log = RunLog::new("unused.json");
    log.data = RunLogFile::started_now();
    let tank = Tank {
        number: 5,
        name: "Tank 5".into(),
        contents: "Pigment".into(),
    };
    for idx in 0..11 {
        log.data
            .stirrers
            .entry("stirrer_10".into())
            .or_insert_with(|| StationLog {
                stirrer_name: "Stirrer 10".into(),
                steps: BTreeMap::new(),
            })
            .steps
            .insert(
                format!("step_{}", idx + 1),
                LogEntry {
                    chemical: format!("C{idx}"),
                    target_weight_kg: 1.0,
                    dispensed_weight_kg: 0.25,
                    progress_percent: 25.0,
                    status: StepStatus::Dispensing,
                    last_updated: "now".into(),
                    source_tank: Some(tank.name.clone()),
                    tank_contents: Some(tank.contents.clone()),
                    tank_number: Some(tank.number),
                },
            );
    }
    log.data.stirrers.insert(
        "stirrer_2".into(),
        StationLog {
            stirrer_name: "Stirrer 2".into(),
            steps: BTreeMap::new(),
        },
    );

    let report = log.data().report();
    let stirrer_2 = report.find(">>> Stirrer 2 <<<").unwrap();
    let stirrer_10 = report.find(">>> Stirrer 10 <<<").unwrap();
    assert!(stirrer_2 < stirrer_10);
    assert!(report.contains("No steps recorded."));
    assert!(report.find("Step 2:").unwrap() < report.find("Step 10:").unwrap());
    assert!(report.contains("  Source Tank: Tank 5 (Contains: Pigment) - Tank #5"));
    assert!(report.contains("  Progress: 25.0%"));
}
