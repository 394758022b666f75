use crate::error::{Error, Result};
use crate::TankId;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One row of the tank registry file. The row position decides the tank number.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct TankRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tank {
    pub number: TankId,
    pub name: String,
    pub contents: String,
}

impl Tank {
    pub fn unnamed(number: TankId) -> Self {
        Self {
            number,
            name: format!("Tank {number}"),
            contents: String::new(),
        }
    }

    /// `tank<N>`, the key used by the process plan.
    pub fn key(&self) -> String {
        format!("tank{}", self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TankRegistry {
    tanks: Vec<Tank>,
}

impl TankRegistry {
    pub fn with_defaults(count: u32) -> Self {
        Self {
            tanks: (1..=count).map(Tank::unnamed).collect(),
        }
    }

    pub fn from_records(records: Vec<TankRecord>) -> Self {
        let tanks = records
            .into_iter()
            .zip(1..)
            .map(|(record, number)| Tank {
                number,
                name: record.name.unwrap_or_else(|| format!("Tank {number}")),
                contents: record.contents,
            })
            .collect();
        Self { tanks }
    }

    /// Loads the registry, creating the default `count` tank registry on disk when the file does
    /// not exist yet.
    pub fn load_or_create(path: impl AsRef<Path>, count: u32) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let records: Vec<TankRecord> = serde_json::from_str(&raw)?;
            let registry = Self::from_records(records);
            info!("Loaded {} tanks from {}", registry.len(), path.display());
            return Ok(registry);
        }
        let registry = Self::with_defaults(count);
        if let Err(e) = registry.save(path) {
            warn!("Could not write default tank registry: {e}");
        }
        Ok(registry)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let records: Vec<TankRecord> = self
            .tanks
            .iter()
            .map(|tank| TankRecord {
                name: Some(tank.name.clone()),
                contents: tank.contents.clone(),
            })
            .collect();
        let json = serde_json::to_string_pretty(&records)?;
        std::fs::write(path, json).map_err(|source| Error::Persistence {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, number: TankId) -> Option<&Tank> {
        let idx = usize::try_from(number.checked_sub(1)?).ok()?;
        self.tanks.get(idx)
    }

    /// Name and contents snapshot for a tank, falling back to `Tank <n>` for tanks the registry
    /// does not list.
    pub fn snapshot(&self, number: TankId) -> Tank {
        self.get(number)
            .cloned()
            .unwrap_or_else(|| Tank::unnamed(number))
    }

    pub fn len(&self) -> usize {
        self.tanks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tanks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tank> {
        self.tanks.iter()
    }
}

#[test]
fn registry_numbers_follow_row_order() {
    let records: Vec<TankRecord> = serde_json::from_str(
        r#"[{"name": "Resin", "contents": "APR362"}, {"contents": "Water"}]"#,
    )
    .unwrap();
    let registry = TankRegistry::from_records(records);
    assert_eq!(registry.get(1).unwrap().name, "Resin");
    assert_eq!(registry.get(2).unwrap().name, "Tank 2");
    assert_eq!(registry.get(2).unwrap().contents, "Water");
    assert!(registry.get(0).is_none());
    assert_eq!(registry.snapshot(7), Tank::unnamed(7));
}

#[test]
fn missing_registry_is_created_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tanks.json");
    let registry = TankRegistry::load_or_create(&path, 25).unwrap();
    assert_eq!(registry.len(), 25);
    assert!(path.exists());

    let reloaded = TankRegistry::load_or_create(&path, 3).unwrap();
    assert_eq!(reloaded, registry);
}
