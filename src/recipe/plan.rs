use crate::dispenser::StationRun;
use crate::error::{Error, Result};
use crate::TankId;
use log::info;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One entry of the flat execution plan that standalone runners consume.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub tank: String,
    pub tank_name: String,
    pub tank_number: TankId,
    pub chemical: String,
    pub weight: String,
    pub stirrer: String,
}

impl PlanStep {
    pub fn weight_kg(&self) -> Option<f64> {
        self.weight.trim().trim_end_matches("kg").trim().parse().ok()
    }
}

/// `step<N>` entries numbered across stations, in station order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessPlan {
    steps: Vec<PlanStep>,
}

impl Serialize for ProcessPlan {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(
            self.steps
                .iter()
                .enumerate()
                .map(|(idx, step)| (format!("step{}", idx + 1), step)),
        )
    }
}

impl ProcessPlan {
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a StationRun>) -> Self {
        let steps = runs
            .into_iter()
            .flat_map(|run| {
                run.steps().iter().map(move |step| PlanStep {
                    tank: step.tank.key(),
                    tank_name: step.tank.name.clone(),
                    tank_number: step.tank.number,
                    chemical: step.chemical.clone(),
                    weight: format!("{:.3}kg", step.target_weight),
                    stirrer: run.name(),
                })
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| Error::Persistence {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Wrote {} plan steps to {}", self.steps.len(), path.display());
        Ok(())
    }
}

#[test]
fn plan_numbers_steps_across_stations() {
    use crate::recipe::tanks::TankRegistry;
    use crate::recipe::{IngredientLine, Resolver, TankPolicy};

    let registry = TankRegistry::with_defaults(25);
    let resolver = Resolver::new(&registry, 25, TankPolicy::Reject);
    let first = resolver
        .resolve(&[IngredientLine::new("A", 40., 2), IngredientLine::new("B", 60., 3)], 10.)
        .unwrap();
    let second = resolver
        .resolve(&[IngredientLine::new("C", 100., 5)], 1.5)
        .unwrap();
    let runs = [
        StationRun::new(1, "Primer", 10., first),
        StationRun::new(3, "Topcoat", 1.5, second),
    ];

    let plan = ProcessPlan::from_runs(&runs);
    let json = serde_json::to_value(&plan).unwrap();
    assert_eq!(json["step1"]["tank"], "tank2");
    assert_eq!(json["step1"]["weight"], "4.000kg");
    assert_eq!(json["step2"]["chemical"], "B");
    assert_eq!(json["step3"]["stirrer"], "Stirrer 3");
    assert_eq!(json["step3"]["tank_name"], "Tank 5");
    assert_eq!(plan.steps()[2].weight_kg(), Some(1.5));
}
