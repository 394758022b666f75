pub mod run_log;
pub mod sequencer;

use crate::recipe::tanks::Tank;
use crate::recipe::ResolvedStep;
use crate::StationId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Waiting,
    Dispensing,
    Complete,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StepStatus::Waiting => "Waiting",
            StepStatus::Dispensing => "Dispensing",
            StepStatus::Complete => "Complete",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Active,
    Complete,
}

/// One ingredient going from one tank into one station.
#[derive(Debug, Clone, PartialEq)]
pub struct DispensingStep {
    pub station: StationId,
    pub tank: Tank,
    pub chemical: String,
    pub percentage: f64,
    pub target_weight: f64,
    dispensed_weight: f64,
    baseline: Option<f64>,
    status: StepStatus,
}

impl DispensingStep {
    pub fn new(station: StationId, resolved: ResolvedStep) -> Self {
        Self {
            station,
            tank: resolved.tank,
            chemical: resolved.chemical,
            percentage: resolved.percentage,
            target_weight: resolved.target_weight,
            dispensed_weight: 0.,
            baseline: None,
            status: StepStatus::Waiting,
        }
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn dispensed_weight(&self) -> f64 {
        self.dispensed_weight
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    /// Percent of the target dispensed, capped at 100.
    pub fn progress(&self) -> f64 {
        if self.target_weight > 0. {
            (self.dispensed_weight / self.target_weight * 100.).min(100.)
        } else {
            0.
        }
    }

    fn begin(&mut self, baseline: f64) {
        if self.status == StepStatus::Waiting {
            self.baseline = Some(baseline);
            self.status = StepStatus::Dispensing;
        }
    }

    /// Folds in a reading and reports whether the target is reached. The tank only gets lighter
    /// while dispensing, so readings above the baseline count as nothing dispensed and a reading
    /// never takes back weight already counted.
    fn update(&mut self, reading: f64) -> bool {
        let Some(baseline) = self.baseline else {
            return false;
        };
        if self.status != StepStatus::Dispensing {
            return false;
        }
        let dispensed = (baseline - reading).max(0.);
        self.dispensed_weight = self.dispensed_weight.max(dispensed);
        self.dispensed_weight >= self.target_weight
    }

    fn complete(&mut self) {
        self.status = StepStatus::Complete;
    }
}

/// Everything one station has to receive for one product batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StationRun {
    pub station: StationId,
    pub product: String,
    pub batch_size: f64,
    steps: Vec<DispensingStep>,
    current: usize,
    status: RunStatus,
}

impl StationRun {
    pub fn new(
        station: StationId,
        product: impl Into<String>,
        batch_size: f64,
        resolved: Vec<ResolvedStep>,
    ) -> Self {
        let steps: Vec<DispensingStep> = resolved
            .into_iter()
            .map(|step| DispensingStep::new(station, step))
            .collect();
        let status = if steps.is_empty() {
            RunStatus::Complete
        } else {
            RunStatus::Active
        };
        Self {
            station,
            product: product.into(),
            batch_size,
            steps,
            current: 0,
            status,
        }
    }

    pub fn name(&self) -> String {
        format!("Stirrer {}", self.station)
    }

    pub fn steps(&self) -> &[DispensingStep] {
        &self.steps
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_step(&self) -> Option<&DispensingStep> {
        match self.status {
            RunStatus::Active => self.steps.get(self.current),
            RunStatus::Complete => None,
        }
    }

    fn current_step_mut(&mut self) -> Option<&mut DispensingStep> {
        match self.status {
            RunStatus::Active => self.steps.get_mut(self.current),
            RunStatus::Complete => None,
        }
    }

    /// Moves past a completed step. Returns true once the station has nothing left to do.
    fn advance(&mut self) -> bool {
        if self.current < self.steps.len() {
            self.current += 1;
        }
        if self.current >= self.steps.len() {
            self.status = RunStatus::Complete;
        }
        self.status == RunStatus::Complete
    }

    /// True while the current step is dispensing from `tank`.
    pub fn is_dispensing_from(&self, tank: crate::TankId) -> bool {
        self.current_step().is_some_and(|step| {
            step.status() == StepStatus::Dispensing && step.tank.number == tank
        })
    }

    /// Operator-facing one-liner for a status label.
    pub fn status_line(&self) -> String {
        match self.current_step() {
            None => "Production Complete".to_string(),
            Some(step) => format!(
                "Step {}/{} - {} ({:.1}%) from Tank {} ({})",
                self.current + 1,
                self.steps.len(),
                step.chemical,
                step.progress(),
                step.tank.number,
                step.tank.name
            ),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_current_complete(&mut self) {
        if let Some(step) = self.current_step_mut() {
            step.complete();
        }
    }
}

#[cfg(test)]
use crate::testing::resolved;

#[test]
fn step_ignores_drift_above_baseline() {
    let mut step = DispensingStep::new(1, resolved(2, "Water", 2.));
    assert!(!step.update(9.0));
    step.begin(10.0);
    step.begin(12.0);
    assert_eq!(step.baseline(), Some(10.0));

    assert!(!step.update(10.4));
    assert_eq!(step.dispensed_weight(), 0.0);
    assert!(!step.update(9.0));
    assert_eq!(step.dispensed_weight(), 1.0);
    // A noisy upward reading does not take back weight already counted.
    assert!(!step.update(9.6));
    assert_eq!(step.dispensed_weight(), 1.0);
    assert_eq!(step.progress(), 50.0);
    assert!(step.update(7.5));
    assert_eq!(step.progress(), 100.0);
}

#[test]
fn station_run_walks_its_steps() {
    let mut run = StationRun::new(
        2,
        "Primer",
        10.,
        vec![resolved(1, "A", 4.), resolved(3, "B", 6.)],
    );
    assert_eq!(run.name(), "Stirrer 2");
    assert_eq!(run.status_line(), "Step 1/2 - A (0.0%) from Tank 1 (Tank 1)");
    assert!(!run.advance());
    assert_eq!(run.current_step().unwrap().chemical, "B");
    assert!(run.advance());
    assert_eq!(run.status(), RunStatus::Complete);
    assert!(run.current_step().is_none());
    assert_eq!(run.status_line(), "Production Complete");

    let empty = StationRun::new(4, "Nothing", 1., Vec::new());
    assert_eq!(empty.status(), RunStatus::Complete);
}
