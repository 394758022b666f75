//! Digital output lines that open the tank valves.
//!
//! A line is asserted when driven HIGH. The hardware driver uses the Linux GPIO sysfs interface
//! (BCM pin numbers on a Raspberry Pi); the simulated driver only logs. Which one is used is
//! decided once, in [`Lines::select`], and stays fixed for the life of the process.

use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

pub type LineId = u32;

pub trait LineDriver: Send {
    fn is_simulated(&self) -> bool;
    fn set_line(&mut self, line: LineId, high: bool) -> impl Future<Output = io::Result<()>> + Send;
    /// Gives the lines back to the system once everything is LOW.
    fn release(&mut self) -> impl Future<Output = ()> + Send;
}

fn level(high: bool) -> &'static str {
    if high {
        "HIGH"
    } else {
        "LOW"
    }
}

pub struct GpioLines {
    root: PathBuf,
    exported: BTreeSet<LineId>,
}

impl GpioLines {
    /// Exports every line as an output and drives it LOW. Any failure means the hardware is not
    /// usable and is reported as [`Error::OutputUnavailable`].
    pub async fn open(
        root: impl Into<PathBuf>,
        lines: impl IntoIterator<Item = LineId>,
    ) -> Result<Self> {
        let root = root.into();
        let unavailable = |line: LineId, e: io::Error| {
            Error::OutputUnavailable(format!("gpio{line} under {}: {e}", root.display()))
        };
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Err(Error::OutputUnavailable(format!(
                "{} does not exist",
                root.display()
            )));
        }
        let mut exported = BTreeSet::new();
        for line in lines {
            let dir = root.join(format!("gpio{line}"));
            if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                tokio::fs::write(root.join("export"), line.to_string())
                    .await
                    .map_err(|e| unavailable(line, e))?;
            }
            tokio::fs::write(dir.join("direction"), "out")
                .await
                .map_err(|e| unavailable(line, e))?;
            tokio::fs::write(dir.join("value"), "0")
                .await
                .map_err(|e| unavailable(line, e))?;
            exported.insert(line);
        }
        info!("GPIO ready, {} lines driven LOW", exported.len());
        Ok(Self { root, exported })
    }

    fn value_path(&self, line: LineId) -> PathBuf {
        self.root.join(format!("gpio{line}")).join("value")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl LineDriver for GpioLines {
    fn is_simulated(&self) -> bool {
        false
    }

    async fn set_line(&mut self, line: LineId, high: bool) -> io::Result<()> {
        tokio::fs::write(self.value_path(line), if high { "1" } else { "0" }).await?;
        debug!("GPIO {line} {}", level(high));
        Ok(())
    }

    async fn release(&mut self) {
        let unexport = self.root.join("unexport");
        for line in std::mem::take(&mut self.exported) {
            if let Err(e) = tokio::fs::write(&unexport, line.to_string()).await {
                debug!("Could not unexport gpio{line}: {e}");
            }
        }
        info!("GPIO cleanup completed");
    }
}

/// Log-only stand-in used when there is no GPIO hardware.
#[derive(Debug, Default)]
pub struct SimulatedLines {
    levels: BTreeMap<LineId, bool>,
}

impl SimulatedLines {
    pub fn level(&self, line: LineId) -> bool {
        self.levels.get(&line).copied().unwrap_or(false)
    }
}

impl LineDriver for SimulatedLines {
    fn is_simulated(&self) -> bool {
        true
    }

    async fn set_line(&mut self, line: LineId, high: bool) -> io::Result<()> {
        info!("[GPIO SIM] pin {line} -> {}", level(high));
        self.levels.insert(line, high);
        Ok(())
    }

    async fn release(&mut self) {
        self.levels.clear();
    }
}

pub enum Lines {
    Gpio(GpioLines),
    Simulated(SimulatedLines),
}

impl Lines {
    /// Hardware when it can be brought up, simulation otherwise.
    pub async fn select(
        root: impl Into<PathBuf>,
        lines: impl IntoIterator<Item = LineId>,
        force_simulation: bool,
    ) -> Self {
        if force_simulation {
            info!("Output simulation requested");
            return Lines::Simulated(SimulatedLines::default());
        }
        match GpioLines::open(root, lines).await {
            Ok(gpio) => Lines::Gpio(gpio),
            Err(e) => {
                warn!("{e}; running outputs in simulation mode (no hardware changes)");
                Lines::Simulated(SimulatedLines::default())
            }
        }
    }
}

impl LineDriver for Lines {
    fn is_simulated(&self) -> bool {
        match self {
            Lines::Gpio(gpio) => gpio.is_simulated(),
            Lines::Simulated(sim) => sim.is_simulated(),
        }
    }

    async fn set_line(&mut self, line: LineId, high: bool) -> io::Result<()> {
        match self {
            Lines::Gpio(gpio) => gpio.set_line(line, high).await,
            Lines::Simulated(sim) => sim.set_line(line, high).await,
        }
    }

    async fn release(&mut self) {
        match self {
            Lines::Gpio(gpio) => gpio.release().await,
            Lines::Simulated(sim) => sim.release().await,
        }
    }
}

#[cfg(test)]
fn fake_sysfs(lines: &[LineId]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for line in lines {
        std::fs::create_dir(dir.path().join(format!("gpio{line}"))).unwrap();
    }
    dir
}

#[tokio::test]
async fn gpio_lines_write_sysfs_values() {
    use env_logger::Env;

    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
    let sysfs = fake_sysfs(&[17, 18]);
    let mut gpio = GpioLines::open(sysfs.path(), [17, 18]).await.unwrap();
    let value = |line: LineId| {
        std::fs::read_to_string(sysfs.path().join(format!("gpio{line}/value"))).unwrap()
    };
    assert_eq!(value(17), "0");
    assert_eq!(
        std::fs::read_to_string(sysfs.path().join("gpio18/direction")).unwrap(),
        "out"
    );

    gpio.set_line(17, true).await.unwrap();
    assert_eq!(value(17), "1");
    assert_eq!(value(18), "0");
    gpio.set_line(17, false).await.unwrap();
    assert_eq!(value(17), "0");
}

#[tokio::test]
async fn missing_gpio_falls_back_to_simulation() {
    let dir = tempfile::tempdir().unwrap();
    let lines = Lines::select(dir.path().join("no-gpio"), [17], false).await;
    assert!(lines.is_simulated());

    let sysfs = fake_sysfs(&[4]);
    let lines = Lines::select(sysfs.path(), [4], false).await;
    assert!(!lines.is_simulated());

    let lines = Lines::select(sysfs.path(), [4], true).await;
    assert!(lines.is_simulated());
}

#[tokio::test]
async fn simulated_lines_track_levels() {
    let mut sim = SimulatedLines::default();
    sim.set_line(22, true).await.unwrap();
    sim.set_line(22, true).await.unwrap();
    assert!(sim.level(22));
    sim.set_line(22, false).await.unwrap();
    assert!(!sim.level(22));
    assert!(!sim.level(23));
}
