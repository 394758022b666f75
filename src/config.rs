use crate::error::{Error, Result};
use crate::recipe::TankPolicy;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}

/// Line settings of the RS485 adapter. The instrument ships as 9600 baud 8N1.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialSettings {
    pub device: PathBuf,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: 9600,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        }
    }
}

/// Where the weighing instrument is reachable. RS485 adapters show up either as a tty or behind a
/// serial-to-ethernet gateway.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum LinkConfig {
    Tcp { address: String },
    Serial(SerialSettings),
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::Serial(SerialSettings::default())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PlantConfig {
    pub link: LinkConfig,
    pub settle_ms: u64,
    pub read_timeout_ms: u64,
    pub channel_count: u8,
    pub tick_ms: u64,
    pub num_tanks: u32,
    pub num_stations: u32,
    pub gpio_tank_limit: u32,
    pub tank_policy: TankPolicy,
    pub gpio_root: PathBuf,
    pub products_dir: PathBuf,
    pub tanks_file: PathBuf,
    pub process_file: PathBuf,
    pub run_log_file: PathBuf,
    pub output_map_file: PathBuf,
}

impl Default for PlantConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            settle_ms: 20,
            read_timeout_ms: 50,
            channel_count: 26,
            tick_ms: 200,
            num_tanks: 25,
            num_stations: 4,
            gpio_tank_limit: 5,
            tank_policy: TankPolicy::Reject,
            gpio_root: PathBuf::from("/sys/class/gpio"),
            products_dir: PathBuf::from("products"),
            tanks_file: PathBuf::from("tanks.json"),
            process_file: PathBuf::from("process_data.json"),
            run_log_file: PathBuf::from("dispensing_log.json"),
            output_map_file: PathBuf::from("gpio_map.json"),
        }
    }
}

impl PlantConfig {
    /// Reads the plant configuration. A missing file is not an error: the defaults describe the
    /// standard 25 tank / 4 stirrer line.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(Error::Config("tickMs must be greater than zero".into()));
        }
        if self.num_tanks == 0 || self.num_stations == 0 {
            return Err(Error::Config(
                "numTanks and numStations must be greater than zero".into(),
            ));
        }
        if self.channel_count == 0 || self.channel_count > 26 {
            return Err(Error::Config("channelCount must be within 1..=26".into()));
        }
        if self.num_tanks > u32::from(self.channel_count) {
            return Err(Error::Config(format!(
                "numTanks ({}) exceeds the {} weighing channels",
                self.num_tanks, self.channel_count
            )));
        }
        if let LinkConfig::Serial(serial) = &self.link {
            if !(5..=8).contains(&serial.data_bits) || !(1..=2).contains(&serial.stop_bits) {
                return Err(Error::Config(
                    "serial dataBits must be 5..=8 and stopBits 1 or 2".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[test]
fn partial_config_keeps_defaults() {
    let config: PlantConfig = serde_json::from_str(
        r#"{"link": {"kind": "tcp", "address": "10.0.0.7:4001"}, "tickMs": 150, "tankPolicy": "clamp"}"#,
    )
    .unwrap();
    assert_eq!(
        config.link,
        LinkConfig::Tcp {
            address: "10.0.0.7:4001".into()
        }
    );
    assert_eq!(config.tick_period(), Duration::from_millis(150));
    assert_eq!(config.tank_policy, TankPolicy::Clamp);
    assert_eq!(config.num_tanks, 25);
    assert_eq!(config.num_stations, 4);
    assert_eq!(config.run_log_file, PathBuf::from("dispensing_log.json"));
}

#[test]
fn missing_config_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = PlantConfig::load(dir.path().join("plant.json")).unwrap();
    assert_eq!(config, PlantConfig::default());
}

#[test]
fn rejects_unaddressable_channel_count() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plant.json");
    std::fs::write(&path, r#"{"channelCount": 40}"#).unwrap();
    assert!(matches!(PlantConfig::load(&path), Err(Error::Config(_))));
}

#[test]
fn rejects_more_tanks_than_channels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plant.json");
    std::fs::write(&path, r#"{"channelCount": 8}"#).unwrap();
    assert!(matches!(PlantConfig::load(&path), Err(Error::Config(_))));

    std::fs::write(&path, r#"{"channelCount": 8, "numTanks": 8}"#).unwrap();
    assert_eq!(PlantConfig::load(&path).unwrap().num_tanks, 8);
}

#[test]
fn serial_link_settings_default_to_9600_8n1() {
    let config: PlantConfig =
        serde_json::from_str(r#"{"link": {"kind": "serial", "device": "/dev/ttyUSB1"}}"#).unwrap();
    let LinkConfig::Serial(serial) = &config.link else {
        panic!("expected a serial link, got {:?}", config.link);
    };
    assert_eq!(serial.device, PathBuf::from("/dev/ttyUSB1"));
    assert_eq!(serial.baud_rate, 9600);
    assert_eq!(serial.data_bits, 8);
    assert_eq!(serial.parity, SerialParity::None);
    assert_eq!(serial.stop_bits, 1);

    let config: PlantConfig = serde_json::from_str(
        r#"{"link": {"kind": "serial", "baudRate": 19200, "parity": "even", "stopBits": 3}}"#,
    )
    .unwrap();
    assert!(matches!(config.validate(), Err(Error::Config(_))));
}
