use crate::error::{Error, Result};
use crate::recipe::{percentage_total, IngredientLine};
use crate::TankId;
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Products live as one JSON file per product, `<dir>/<product>.json`.
pub struct ProductStore {
    dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedProduct {
    pub lines: usize,
    pub percentage_total: f64,
}

impl SavedProduct {
    /// The editor asks for confirmation when a product does not add up to 100%.
    pub fn needs_confirmation(&self) -> bool {
        (self.percentage_total - 100.).abs() > 0.1
    }
}

impl ProductStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn names(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != "json" {
                    return None;
                }
                Some(path.file_stem()?.to_string_lossy().into_owned())
            })
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<Vec<IngredientLine>> {
        let path = self.path(name);
        if !path.exists() {
            return Err(Error::UnknownProduct(name.to_string()));
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Stores the product lines that carry a material name and a positive percentage. Tanks
    /// outside `1..=num_tanks` are saved as tank 1.
    pub fn save(
        &self,
        name: &str,
        lines: &[IngredientLine],
        num_tanks: TankId,
    ) -> Result<SavedProduct> {
        let kept: Vec<IngredientLine> = lines
            .iter()
            .filter(|line| !line.raw_material.trim().is_empty() && line.percentage > 0.)
            .map(|line| {
                let mut line = line.clone();
                line.raw_material = line.raw_material.trim().to_string();
                line.kind = line.kind.trim().to_string();
                let tank = line.tank.unwrap_or(1);
                if !(1..=num_tanks).contains(&tank) {
                    warn!("{}: tank {tank} out of range, saving as tank 1", line.raw_material);
                    line.tank = Some(1);
                } else {
                    line.tank = Some(tank);
                }
                line
            })
            .collect();
        if kept.is_empty() {
            return Err(Error::InvalidRecipe(format!(
                "product '{name}' has no valid lines"
            )));
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(name);
        let json = serde_json::to_string_pretty(&kept)?;
        std::fs::write(&path, json).map_err(|source| Error::Persistence {
            path: path.clone(),
            source,
        })?;
        info!("Saved product '{name}' with {} lines", kept.len());
        Ok(SavedProduct {
            lines: kept.len(),
            percentage_total: percentage_total(&kept),
        })
    }
}

#[test]
fn save_filters_and_clamps_lines() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProductStore::new(dir.path().join("products"));
    let lines = [
        IngredientLine::new(" Resin ", 55., 3),
        IngredientLine::new("", 10., 4),
        IngredientLine::new("Pigment", 0., 5),
        IngredientLine::new("Solvent", 40., 99),
    ];
    let saved = store.save("Primer", &lines, 25).unwrap();
    assert_eq!(saved.lines, 2);
    assert!(saved.needs_confirmation());

    let loaded = store.load("Primer").unwrap();
    assert_eq!(loaded[0].raw_material, "Resin");
    assert_eq!(loaded[0].tank, Some(3));
    assert_eq!(loaded[1].tank, Some(1));
    assert_eq!(store.names().unwrap(), vec!["Primer".to_string()]);
}

#[test]
fn unknown_product_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProductStore::new(dir.path());
    assert!(matches!(
        store.load("Nothing"),
        Err(Error::UnknownProduct(name)) if name == "Nothing"
    ));
}
