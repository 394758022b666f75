//! Recipes expressed in percent of batch weight, and their resolution into absolute per-tank
//! dispensing targets.

pub mod plan;
pub mod store;
pub mod tanks;

use crate::error::{Error, Result};
use crate::TankId;
use log::warn;
use serde::{Deserialize, Serialize};
use tanks::{Tank, TankRegistry};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct IngredientLine {
    pub raw_material: String,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tank: Option<TankId>,
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl IngredientLine {
    pub fn new(raw_material: impl Into<String>, percentage: f64, tank: TankId) -> Self {
        Self {
            raw_material: raw_material.into(),
            percentage,
            tank: Some(tank),
            kind: String::new(),
        }
    }
}

/// What to do with an ingredient line that names a tank outside `1..=num_tanks`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TankPolicy {
    #[default]
    Reject,
    /// Redirect the line to tank 1, the same thing the recipe editor does on save.
    Clamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStep {
    pub tank: Tank,
    pub chemical: String,
    pub percentage: f64,
    pub target_weight: f64,
}

pub fn percentage_total(lines: &[IngredientLine]) -> f64 {
    lines.iter().map(|line| line.percentage).sum()
}

pub struct Resolver<'a> {
    tanks: &'a TankRegistry,
    num_tanks: TankId,
    policy: TankPolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(tanks: &'a TankRegistry, num_tanks: TankId, policy: TankPolicy) -> Self {
        Self {
            tanks,
            num_tanks,
            policy,
        }
    }

    fn tank_for(&self, idx: usize, line: &IngredientLine) -> Result<TankId> {
        // Lines without a tank fall back to their position in the recipe.
        let tank = match line.tank {
            Some(tank) => tank,
            None => TankId::try_from(idx + 1).unwrap_or(TankId::MAX),
        };
        if (1..=self.num_tanks).contains(&tank) {
            return Ok(tank);
        }
        match self.policy {
            TankPolicy::Reject => Err(Error::InvalidRecipe(format!(
                "line {} ({}) references tank {tank}, valid tanks are 1..={}",
                idx + 1,
                line.raw_material,
                self.num_tanks
            ))),
            TankPolicy::Clamp => {
                warn!(
                    "Line {} ({}) references tank {tank}, using tank 1",
                    idx + 1,
                    line.raw_material
                );
                Ok(1)
            }
        }
    }

    pub fn resolve(&self, lines: &[IngredientLine], batch_weight: f64) -> Result<Vec<ResolvedStep>> {
        if !batch_weight.is_finite() || batch_weight <= 0. {
            return Err(Error::InvalidRecipe(format!(
                "batch weight must be positive, got {batch_weight}"
            )));
        }
        let total = percentage_total(lines);
        if (total - 100.).abs() > 0.1 {
            warn!("Recipe percentages add up to {total:.1}%, not 100%");
        }

        let mut steps = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if !line.percentage.is_finite() {
                return Err(Error::InvalidRecipe(format!(
                    "line {} ({}) has no valid percentage",
                    idx + 1,
                    line.raw_material
                )));
            }
            if line.percentage <= 0. {
                continue;
            }
            let tank = self.tank_for(idx, line)?;
            let target_weight = line.percentage * batch_weight / 100.;
            if target_weight > 0. {
                steps.push(ResolvedStep {
                    tank: self.tanks.snapshot(tank),
                    chemical: line.raw_material.clone(),
                    percentage: line.percentage,
                    target_weight,
                });
            }
        }
        Ok(steps)
    }
}

#[test]
fn resolves_percentages_into_weights() {
    let registry = TankRegistry::with_defaults(25);
    let resolver = Resolver::new(&registry, 25, TankPolicy::Reject);
    let lines = [
        IngredientLine::new("A", 40., 2),
        IngredientLine::new("Unused", 0., 4),
        IngredientLine::new("B", 60., 3),
    ];
    let steps = resolver.resolve(&lines, 100.).unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].tank.number, 2);
    assert_eq!(steps[0].chemical, "A");
    assert_eq!(steps[0].target_weight, 40.0);
    assert_eq!(steps[1].tank.number, 3);
    assert_eq!(steps[1].chemical, "B");
    assert_eq!(steps[1].target_weight, 60.0);
}

#[test]
fn missing_tank_defaults_to_line_position() {
    let registry = TankRegistry::with_defaults(25);
    let resolver = Resolver::new(&registry, 25, TankPolicy::Reject);
    let lines: Vec<IngredientLine> = serde_json::from_str(
        r#"[{"raw_material": "Water", "percentage": 70}, {"raw_material": "Salt", "percentage": 30, "tank": 9}]"#,
    )
    .unwrap();
    let steps = resolver.resolve(&lines, 2.).unwrap();
    assert_eq!(steps[0].tank.number, 1);
    assert_eq!(steps[1].tank.number, 9);
    assert!((steps[0].target_weight - 1.4).abs() < 1e-9);
}

#[test]
fn out_of_range_tank_follows_policy() {
    let registry = TankRegistry::with_defaults(25);
    let lines = [IngredientLine::new("A", 50., 31), IngredientLine::new("B", 50., 2)];

    let strict = Resolver::new(&registry, 25, TankPolicy::Reject);
    assert!(matches!(
        strict.resolve(&lines, 10.),
        Err(Error::InvalidRecipe(_))
    ));

    let lenient = Resolver::new(&registry, 25, TankPolicy::Clamp);
    let steps = lenient.resolve(&lines, 10.).unwrap();
    assert_eq!(steps[0].tank.number, 1);
    assert_eq!(steps[1].tank.number, 2);
}

#[test]
fn rejects_non_positive_batch() {
    let registry = TankRegistry::with_defaults(25);
    let resolver = Resolver::new(&registry, 25, TankPolicy::Reject);
    let lines = [IngredientLine::new("A", 100., 1)];
    assert!(resolver.resolve(&lines, 0.).is_err());
    assert!(resolver.resolve(&lines, -5.).is_err());
}
