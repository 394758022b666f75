//! The dispensing state machine.
//!
//! Each tick polls the weighing channel once for the current step of the active station.
//! Stations run one after another in ascending id order; steps within a station run in recipe
//! order. A step goes Waiting -> Dispensing on its first reading (which becomes the baseline and
//! opens the valve) and Dispensing -> Complete once `baseline - reading` reaches the target,
//! closing the valve on that same tick. A tick without a reading changes nothing.

use crate::components::lines::{LineDriver, Lines};
use crate::components::weight_channel::WeightChannel;
use crate::controllers::outputs::OutputController;
use crate::dispenser::run_log::RunLog;
use crate::dispenser::{DispensingStep, RunStatus, StationRun, StepStatus};
use crate::{StationId, TankId};
use log::{error, info};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The instrument had nothing for us; try again next tick.
    NoReading,
    /// The output driver refused; nothing advanced.
    Retry,
    BaselineCaptured,
    Progress,
    StepComplete,
    StationComplete,
    /// Every station is complete.
    Finished,
}

/// Read-only view of a station for display.
#[derive(Debug, Clone, PartialEq)]
pub struct StationSnapshot {
    pub station: StationId,
    pub product: String,
    pub batch_size: f64,
    pub status: RunStatus,
    pub current_step: usize,
    pub steps: Vec<DispensingStep>,
    pub status_line: String,
}

impl From<&StationRun> for StationSnapshot {
    fn from(run: &StationRun) -> Self {
        Self {
            station: run.station,
            product: run.product.clone(),
            batch_size: run.batch_size,
            status: run.status(),
            current_step: run.current_index(),
            steps: run.steps().to_vec(),
            status_line: run.status_line(),
        }
    }
}

fn record(log: &mut RunLog, step_index: usize, step: &DispensingStep) {
    log.record(
        step.station,
        step_index,
        &step.chemical,
        step.target_weight,
        step.dispensed_weight(),
        step.status(),
        &step.tank,
    );
}

pub struct Sequencer<D: LineDriver = Lines> {
    runs: BTreeMap<StationId, StationRun>,
    weights: WeightChannel,
    outputs: OutputController<D>,
    log: RunLog,
}

impl<D: LineDriver> Sequencer<D> {
    pub fn new(weights: WeightChannel, outputs: OutputController<D>, log: RunLog) -> Self {
        Self {
            runs: BTreeMap::new(),
            weights,
            outputs,
            log,
        }
    }

    /// Replaces whatever was loaded with a fresh set of station runs.
    pub fn load(&mut self, runs: impl IntoIterator<Item = StationRun>) {
        self.runs = runs.into_iter().map(|run| (run.station, run)).collect();
    }

    /// The one station being polled: the lowest id that is not complete yet.
    pub fn active_station(&self) -> Option<StationId> {
        self.runs
            .values()
            .find(|run| run.status() == RunStatus::Active)
            .map(|run| run.station)
    }

    pub fn is_finished(&self) -> bool {
        self.active_station().is_none()
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let Some(station) = self.active_station() else {
            return TickOutcome::Finished;
        };
        let Self {
            runs,
            weights,
            outputs,
            log,
        } = self;
        let Some(run) = runs.get_mut(&station) else {
            return TickOutcome::Finished;
        };
        let step_index = run.current_index();
        let Some(step) = run.current_step_mut() else {
            run.advance();
            return TickOutcome::StationComplete;
        };
        let tank = step.tank.number;

        let Some(reading) = weights.query(tank).await else {
            return TickOutcome::NoReading;
        };

        match step.status() {
            StepStatus::Waiting => {
                if let Err(e) = outputs.set_output(tank, station, true).await {
                    error!("Error setting output ON for tank{tank}_stirrer{station}: {e}");
                    return TickOutcome::Retry;
                }
                step.begin(reading);
                info!(
                    "Stirrer {station}: {} from Tank {tank}, baseline {reading:.3} kg, target {:.3} kg",
                    step.chemical, step.target_weight
                );
                record(log, step_index, step);
                TickOutcome::BaselineCaptured
            }
            StepStatus::Dispensing => {
                if !step.update(reading) {
                    record(log, step_index, step);
                    return TickOutcome::Progress;
                }
                if let Err(e) = outputs.set_output(tank, station, false).await {
                    error!("Error setting output OFF for tank{tank}_stirrer{station}: {e}");
                    record(log, step_index, step);
                    return TickOutcome::Retry;
                }
                step.complete();
                info!(
                    "Stirrer {station}: {} done, {:.3} kg of {:.3} kg",
                    step.chemical,
                    step.dispensed_weight(),
                    step.target_weight
                );
                record(log, step_index, step);
                if run.advance() {
                    info!("Stirrer {station}: production complete");
                    if runs.values().all(|run| run.status() == RunStatus::Complete) {
                        return TickOutcome::Finished;
                    }
                    return TickOutcome::StationComplete;
                }
                TickOutcome::StepComplete
            }
            StepStatus::Complete => {
                run.advance();
                TickOutcome::StepComplete
            }
        }
    }

    /// True when `station`'s current step is dispensing from `tank`.
    pub fn is_dispensing(&self, station: StationId, tank: TankId) -> bool {
        self.runs
            .get(&station)
            .is_some_and(|run| run.is_dispensing_from(tank))
    }

    pub fn run(&self, station: StationId) -> Option<&StationRun> {
        self.runs.get(&station)
    }

    pub fn runs(&self) -> impl Iterator<Item = &StationRun> {
        self.runs.values()
    }

    pub fn snapshots(&self) -> Vec<StationSnapshot> {
        self.runs.values().map(StationSnapshot::from).collect()
    }

    /// Drops every station run.
    pub fn clear(&mut self) {
        self.runs.clear();
    }

    pub fn outputs(&self) -> &OutputController<D> {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut OutputController<D> {
        &mut self.outputs
    }

    pub fn weights_mut(&mut self) -> &mut WeightChannel {
        &mut self.weights
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RunLog {
        &mut self.log
    }

    #[cfg(test)]
    pub(crate) fn run_mut(&mut self, station: StationId) -> Option<&mut StationRun> {
        self.runs.get_mut(&station)
    }
}

#[cfg(test)]
use crate::testing::{output_map, resolved, scripted_channel, RecordingLines};

#[cfg(test)]
fn sequencer(
    readings: Vec<Option<f64>>,
    dir: &tempfile::TempDir,
) -> Sequencer<RecordingLines> {
    let (weights, _) = scripted_channel(readings);
    let outputs = OutputController::new(
        RecordingLines::default(),
        output_map(&[(2, 1, 18), (3, 1, 27), (4, 2, 22)]),
    );
    Sequencer::new(weights, outputs, RunLog::new(dir.path().join("log.json")))
}

#[tokio::test]
async fn dispenses_until_target_reached() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = sequencer(vec![Some(10.0), Some(9.5), Some(8.3), Some(7.9)], &dir);
    seq.load([StationRun::new(1, "Primer", 2., vec![resolved(2, "Resin", 2.0)])]);

    let expected = [
        (TickOutcome::BaselineCaptured, 0.0, StepStatus::Dispensing),
        (TickOutcome::Progress, 0.5, StepStatus::Dispensing),
        (TickOutcome::Progress, 1.7, StepStatus::Dispensing),
        (TickOutcome::Finished, 2.1, StepStatus::Complete),
    ];
    for (outcome, dispensed, status) in expected {
        assert_eq!(seq.tick().await, outcome);
        let step = &seq.run(1).unwrap().steps()[0];
        assert!((step.dispensed_weight() - dispensed).abs() < 1e-9);
        assert_eq!(step.status(), status);
        assert_eq!(step.baseline(), Some(10.0));
    }

    assert!(seq.outputs().asserted().is_empty());
    assert_eq!(seq.outputs().driver().writes(), &[(18, true), (18, false)]);
    assert!(seq.is_finished());

    let entry = seq.log().data().entry(1, 0).unwrap();
    assert_eq!(entry.status, StepStatus::Complete);
    assert_eq!(entry.dispensed_weight_kg, 2.1);
}

#[tokio::test]
async fn missing_readings_change_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut readings = vec![Some(10.0), Some(9.0)];
    readings.extend([None; 5]);
    let mut seq = sequencer(readings, &dir);
    seq.load([StationRun::new(1, "Primer", 2., vec![resolved(2, "Resin", 2.0)])]);

    assert_eq!(seq.tick().await, TickOutcome::BaselineCaptured);
    assert_eq!(seq.tick().await, TickOutcome::Progress);
    for _ in 0..5 {
        assert_eq!(seq.tick().await, TickOutcome::NoReading);
        let step = &seq.run(1).unwrap().steps()[0];
        assert_eq!(step.status(), StepStatus::Dispensing);
        assert_eq!(step.dispensed_weight(), 1.0);
        assert!(seq.outputs().is_asserted(2, 1));
    }
}

#[tokio::test]
async fn waiting_step_stays_waiting_without_reading() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = sequencer(vec![None; 5], &dir);
    seq.load([StationRun::new(1, "Primer", 2., vec![resolved(2, "Resin", 2.0)])]);
    for _ in 0..5 {
        assert_eq!(seq.tick().await, TickOutcome::NoReading);
    }
    let step = &seq.run(1).unwrap().steps()[0];
    assert_eq!(step.status(), StepStatus::Waiting);
    assert_eq!(step.baseline(), None);
    assert!(seq.outputs().asserted().is_empty());
}

#[tokio::test]
async fn drift_never_reports_negative_dispensed() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = sequencer(vec![Some(5.0), Some(5.3), Some(5.1), Some(4.9)], &dir);
    seq.load([StationRun::new(1, "Primer", 1., vec![resolved(2, "Resin", 1.0)])]);
    let mut last_progress = 0.0;
    for _ in 0..4 {
        seq.tick().await;
        let step = &seq.run(1).unwrap().steps()[0];
        assert!(step.dispensed_weight() >= 0.0);
        assert!(step.progress() >= last_progress);
        last_progress = step.progress();
    }
}

#[tokio::test]
async fn stations_run_one_after_another() {
    let dir = tempfile::tempdir().unwrap();
    let readings = vec![
        Some(20.0),
        Some(19.0),
        Some(8.0),
        Some(6.0),
        Some(50.0),
        Some(47.0),
    ];
    let (weights, addresses) = scripted_channel(readings);
    let outputs = OutputController::new(
        RecordingLines::default(),
        output_map(&[(2, 1, 18), (3, 1, 27), (4, 2, 22)]),
    );
    let mut seq = Sequencer::new(weights, outputs, RunLog::new(dir.path().join("log.json")));
    seq.load([
        StationRun::new(2, "Topcoat", 3., vec![resolved(4, "Pigment", 3.0)]),
        StationRun::new(
            1,
            "Primer",
            3.,
            vec![resolved(2, "Resin", 1.0), resolved(3, "Water", 2.0)],
        ),
    ]);

    assert_eq!(seq.active_station(), Some(1));
    assert_eq!(seq.tick().await, TickOutcome::BaselineCaptured);
    assert_eq!(seq.outputs().asserted().len(), 1);
    assert_eq!(seq.tick().await, TickOutcome::StepComplete);
    assert!(seq.outputs().asserted().is_empty());
    assert_eq!(seq.tick().await, TickOutcome::BaselineCaptured);
    assert!(seq.outputs().is_asserted(3, 1));
    assert_eq!(seq.tick().await, TickOutcome::StationComplete);
    assert_eq!(seq.active_station(), Some(2));
    assert_eq!(seq.tick().await, TickOutcome::BaselineCaptured);
    assert!(seq.outputs().is_asserted(4, 2));
    assert_eq!(seq.tick().await, TickOutcome::Finished);
    assert!(seq.outputs().asserted().is_empty());

    assert_eq!(
        addresses.lock().unwrap().as_slice(),
        b"BBCCDD".as_slice()
    );
    assert_eq!(seq.tick().await, TickOutcome::Finished);
}

#[tokio::test]
async fn unmapped_output_still_dispenses() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = sequencer(vec![Some(3.0), Some(1.0)], &dir);
    seq.load([StationRun::new(1, "Primer", 2., vec![resolved(9, "Solvent", 2.0)])]);
    assert_eq!(seq.tick().await, TickOutcome::BaselineCaptured);
    assert!(seq.outputs().asserted().is_empty());
    assert_eq!(seq.tick().await, TickOutcome::Finished);
    assert!(seq.outputs().driver().writes().is_empty());
}

#[tokio::test]
async fn driver_failure_is_retried_next_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut seq = sequencer(vec![Some(10.0), Some(10.0), Some(7.0), Some(7.0)], &dir);
    seq.load([StationRun::new(1, "Primer", 2., vec![resolved(2, "Resin", 2.0)])]);

    seq.outputs_mut().driver_mut().fail_line(18);
    assert_eq!(seq.tick().await, TickOutcome::Retry);
    assert_eq!(seq.run(1).unwrap().steps()[0].status(), StepStatus::Waiting);

    seq.outputs_mut().driver_mut().heal_line(18);
    assert_eq!(seq.tick().await, TickOutcome::BaselineCaptured);

    seq.outputs_mut().driver_mut().fail_line(18);
    assert_eq!(seq.tick().await, TickOutcome::Retry);
    let step = &seq.run(1).unwrap().steps()[0];
    assert_eq!(step.status(), StepStatus::Dispensing);
    assert!(seq.outputs().is_asserted(2, 1));
    let entry = seq.log().data().entry(1, 0).unwrap();
    assert_eq!(entry.dispensed_weight_kg, 3.0);
    assert_eq!(entry.status, StepStatus::Dispensing);

    seq.outputs_mut().driver_mut().heal_line(18);
    assert_eq!(seq.tick().await, TickOutcome::Finished);
    assert!(seq.outputs().asserted().is_empty());
}

#[tokio::test]
async fn end_to_end_over_a_byte_stream() {
    use crate::interface::link::LinkTiming;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let dir = tempfile::tempdir().unwrap();
    let (near, mut far) = tokio::io::duplex(64);
    let (weights, link) = WeightChannel::with_client(near, LinkTiming::default(), 26);
    let link = tokio::spawn(link);
    let instrument = tokio::spawn(async move {
        let mut request = [0u8; 3];
        for reply in ["*+4.000#", "*+3.400#", "*+2.900#"] {
            far.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"A0\r");
            far.write_all(reply.as_bytes()).await.unwrap();
        }
        far
    });

    let outputs =
        OutputController::new(RecordingLines::default(), output_map(&[(1, 1, 17)]));
    let mut seq = Sequencer::new(weights, outputs, RunLog::new(dir.path().join("log.json")));
    seq.load([StationRun::new(1, "Primer", 1., vec![resolved(1, "Resin", 1.0)])]);

    assert_eq!(seq.tick().await, TickOutcome::BaselineCaptured);
    assert_eq!(seq.tick().await, TickOutcome::Progress);
    assert_eq!(seq.tick().await, TickOutcome::Finished);

    let _far = instrument.await.unwrap();
    seq.weights_mut().close();
    link.await.unwrap().unwrap();
}
