use crate::components::lines::{LineDriver, Lines};
use crate::components::weight_channel::WeightChannel;
use crate::config::PlantConfig;
use crate::controllers::outputs::{OutputController, OutputMap};
use crate::dispenser::run_log::RunLog;
use crate::dispenser::sequencer::{Sequencer, StationSnapshot, TickOutcome};
use crate::dispenser::StationRun;
use crate::error::{Error, Result};
use crate::recipe::plan::ProcessPlan;
use crate::recipe::store::ProductStore;
use crate::recipe::tanks::TankRegistry;
use crate::recipe::Resolver;
use crate::{StationId, TankId};
use log::{error, info, warn};
use std::collections::BTreeSet;
use std::io;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Finished,
}

pub enum Command {
    Pause(oneshot::Sender<ProductionStatus>),
    Resume(oneshot::Sender<ProductionStatus>),
    Stop(oneshot::Sender<ProductionStatus>),
    Status(oneshot::Sender<ProductionStatus>),
    Snapshots(oneshot::Sender<Vec<StationSnapshot>>),
}

/// Paces the sequencer and applies operator commands between ticks.
pub struct Orchestrator<D: LineDriver = Lines> {
    sequencer: Sequencer<D>,
    tick_period: Duration,
    status: ProductionStatus,
    paused_outputs: BTreeSet<(TankId, StationId)>,
}

impl<D: LineDriver> Orchestrator<D> {
    pub fn new(sequencer: Sequencer<D>, tick_period: Duration) -> Self {
        Self {
            sequencer,
            tick_period,
            status: ProductionStatus::Idle,
            paused_outputs: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> ProductionStatus {
        self.status
    }

    pub fn sequencer(&self) -> &Sequencer<D> {
        &self.sequencer
    }

    pub fn sequencer_mut(&mut self) -> &mut Sequencer<D> {
        &mut self.sequencer
    }

    pub fn start(&mut self, runs: Vec<StationRun>) -> Result<()> {
        if runs.is_empty() {
            return Err(Error::Config("no station has anything to dispense".into()));
        }
        info!("Starting production on {} stations", runs.len());
        self.sequencer.load(runs);
        self.paused_outputs.clear();
        self.status = ProductionStatus::Running;
        Ok(())
    }

    /// One sequencer tick, only while running. Finishing shuts the outputs and the link down but
    /// keeps the station runs around for display.
    pub async fn tick(&mut self) -> Option<TickOutcome> {
        if self.status != ProductionStatus::Running {
            return None;
        }
        let outcome = self.sequencer.tick().await;
        if self.sequencer.is_finished() {
            self.sequencer.outputs_mut().cleanup_all().await;
            self.sequencer.weights_mut().close();
            self.status = ProductionStatus::Finished;
            info!("All stirrers complete");
        }
        Some(outcome)
    }

    pub async fn pause(&mut self) -> ProductionStatus {
        if self.status != ProductionStatus::Running {
            return self.status;
        }
        let outputs = self.sequencer.outputs_mut();
        self.paused_outputs = outputs.asserted().clone();
        let mut failed = false;
        for &(tank, station) in &self.paused_outputs {
            if let Err(e) = outputs.set_output(tank, station, false).await {
                error!("Error turning off output tank{tank}_stirrer{station} on pause: {e}");
                failed = true;
            }
        }
        if failed {
            warn!("Sweeping every output LOW before pausing");
            outputs.cleanup_all().await;
        }
        self.status = ProductionStatus::Paused;
        info!("Production paused, {} outputs off", self.paused_outputs.len());
        self.status
    }

    /// Turns back on only the outputs whose station is still dispensing from the same tank.
    pub async fn resume(&mut self) -> ProductionStatus {
        if self.status != ProductionStatus::Paused {
            return self.status;
        }
        for (tank, station) in std::mem::take(&mut self.paused_outputs) {
            if !self.sequencer.is_dispensing(station, tank) {
                continue;
            }
            let outputs = self.sequencer.outputs_mut();
            if let Err(e) = outputs.set_output(tank, station, true).await {
                error!("Error turning on output tank{tank}_stirrer{station} on resume: {e}");
            }
        }
        self.status = ProductionStatus::Running;
        info!("Production resumed");
        self.status
    }

    pub async fn stop(&mut self) -> ProductionStatus {
        self.sequencer.outputs_mut().cleanup_all().await;
        self.sequencer.clear();
        self.sequencer.weights_mut().close();
        self.paused_outputs.clear();
        self.status = ProductionStatus::Stopped;
        info!("Production stopped");
        self.status
    }

    async fn handle(&mut self, command: Command) {
        let sent = match command {
            Command::Pause(reply) => reply.send(self.pause().await).is_ok(),
            Command::Resume(reply) => reply.send(self.resume().await).is_ok(),
            Command::Stop(reply) => reply.send(self.stop().await).is_ok(),
            Command::Status(reply) => reply.send(self.status).is_ok(),
            Command::Snapshots(reply) => reply.send(self.sequencer.snapshots()).is_ok(),
        };
        if !sent {
            warn!("Production command caller went away before the reply");
        }
    }

    /// Ticks while running and serves commands until every handle is dropped. The lines are
    /// released on the way out.
    pub async fn run(mut self, mut commands: Receiver<Command>) {
        let mut tick_interval = interval(self.tick_period);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick_interval.tick(), if self.status == ProductionStatus::Running => {
                    self.tick().await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        if matches!(
            self.status,
            ProductionStatus::Running | ProductionStatus::Paused
        ) {
            self.stop().await;
        }
        self.sequencer.outputs_mut().release().await;
    }
}

#[derive(Clone)]
pub struct ProductionHandle {
    sender: Sender<Command>,
}

impl ProductionHandle {
    pub fn spawn<D: LineDriver + 'static>(orchestrator: Orchestrator<D>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = channel(8);
        let task = tokio::spawn(orchestrator.run(rx));
        (Self { sender: tx }, task)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.sender
            .send(command(resp_tx))
            .await
            .map_err(|_| Error::NotRunning)?;
        resp_rx.await.map_err(|_| Error::NotRunning)
    }

    pub async fn pause(&self) -> Result<ProductionStatus> {
        self.request(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<ProductionStatus> {
        self.request(Command::Resume).await
    }

    pub async fn stop(&self) -> Result<ProductionStatus> {
        self.request(Command::Stop).await
    }

    pub async fn status(&self) -> Result<ProductionStatus> {
        self.request(Command::Status).await
    }

    pub async fn snapshots(&self) -> Result<Vec<StationSnapshot>> {
        self.request(Command::Snapshots).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationSelection {
    pub station: StationId,
    pub product: String,
    pub amount: f64,
}

pub struct RunPlan {
    pub runs: Vec<StationRun>,
    /// Selections that could not be turned into a run, with the reason.
    pub rejected: Vec<(StationId, Error)>,
}

/// Turns the operator's station selections into station runs, in station order. Stations without
/// an amount are left out quietly; anything else that cannot run is reported in `rejected`.
pub fn build_runs(
    selections: &[StationSelection],
    store: &ProductStore,
    resolver: &Resolver,
    num_stations: StationId,
) -> RunPlan {
    let mut plan = RunPlan {
        runs: Vec::new(),
        rejected: Vec::new(),
    };
    for selection in selections {
        let station = selection.station;
        if !selection.amount.is_finite() || selection.amount <= 0. {
            continue;
        }
        if !(1..=num_stations).contains(&station) {
            warn!("Stirrer {station} does not exist, skipping");
            plan.rejected.push((
                station,
                Error::Config(format!("stirrer {station} is outside 1..={num_stations}")),
            ));
            continue;
        }
        if plan.runs.iter().any(|run| run.station == station) {
            warn!("Stirrer {station} selected twice, keeping the first selection");
            plan.rejected.push((
                station,
                Error::Config(format!("stirrer {station} selected more than once")),
            ));
            continue;
        }
        let steps = store
            .load(&selection.product)
            .and_then(|lines| resolver.resolve(&lines, selection.amount));
        match steps {
            Ok(steps) if steps.is_empty() => {
                warn!(
                    "Stirrer {station}: product '{}' has nothing to dispense",
                    selection.product
                );
            }
            Ok(steps) => {
                info!(
                    "Stirrer {station}: {} x {:.3} kg, {} steps",
                    selection.product,
                    selection.amount,
                    steps.len()
                );
                plan.runs.push(StationRun::new(
                    station,
                    selection.product.clone(),
                    selection.amount,
                    steps,
                ));
            }
            Err(e) => {
                warn!("Stirrer {station}: {e}");
                plan.rejected.push((station, e));
            }
        }
    }
    plan.runs.sort_by_key(|run| run.station);
    plan
}

pub struct Launch {
    pub orchestrator: Orchestrator<Lines>,
    pub link: JoinHandle<io::Result<()>>,
    pub rejected: Vec<(StationId, Error)>,
}

/// Resolves the selections, prepares the log and the process plan, brings up the link and the
/// outputs and leaves the orchestrator running.
pub async fn launch(
    config: &PlantConfig,
    selections: &[StationSelection],
    simulate_outputs: bool,
) -> Result<Launch> {
    config.validate()?;
    let tanks = TankRegistry::load_or_create(&config.tanks_file, config.num_tanks)?;
    let resolver = Resolver::new(&tanks, config.num_tanks, config.tank_policy);
    let store = ProductStore::new(&config.products_dir);
    let RunPlan { runs, rejected } =
        build_runs(selections, &store, &resolver, config.num_stations);
    if runs.is_empty() {
        return Err(Error::Config(
            "select a product and an amount for at least one stirrer".into(),
        ));
    }

    let (weights, link) = WeightChannel::connect(config).await?;
    let map = OutputMap::load_or_create(
        &config.output_map_file,
        config.num_tanks,
        config.num_stations,
        config.gpio_tank_limit,
    )?;
    let outputs = OutputController::connect(&config.gpio_root, map, simulate_outputs).await;
    info!("Outputs running in {:?} mode", outputs.mode());

    // The previous run's log is only replaced once the hardware is up.
    let mut log = RunLog::new(&config.run_log_file);
    log.reset();
    if let Err(e) = ProcessPlan::from_runs(&runs).write(&config.process_file) {
        warn!("Process plan not written: {e}");
    }

    let mut orchestrator = Orchestrator::new(
        Sequencer::new(weights, outputs, log),
        config.tick_period(),
    );
    orchestrator.start(runs)?;
    Ok(Launch {
        orchestrator,
        link,
        rejected,
    })
}

#[cfg(test)]
use crate::testing::{output_map, resolved, scripted_channel, RecordingLines};

#[cfg(test)]
fn orchestrator(
    readings: Vec<Option<f64>>,
    dir: &tempfile::TempDir,
) -> Orchestrator<RecordingLines> {
    let (weights, _) = scripted_channel(readings);
    let outputs = OutputController::new(
        RecordingLines::default(),
        output_map(&[(2, 1, 18), (3, 1, 27), (4, 2, 22)]),
    );
    let sequencer = Sequencer::new(weights, outputs, RunLog::new(dir.path().join("log.json")));
    Orchestrator::new(sequencer, Duration::from_millis(200))
}

#[tokio::test]
async fn start_needs_at_least_one_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(Vec::new(), &dir);
    assert!(matches!(orch.start(Vec::new()), Err(Error::Config(_))));
    assert_eq!(orch.status(), ProductionStatus::Idle);
    assert_eq!(orch.tick().await, None);
}

#[tokio::test]
async fn pause_and_resume_follow_the_current_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(vec![Some(10.0), Some(9.5)], &dir);
    orch.start(vec![StationRun::new(
        1,
        "Primer",
        4.,
        vec![resolved(2, "Resin", 2.0), resolved(3, "Water", 2.0)],
    )])
    .unwrap();

    assert_eq!(orch.tick().await, Some(TickOutcome::BaselineCaptured));
    assert!(orch.sequencer().outputs().is_asserted(2, 1));

    assert_eq!(orch.pause().await, ProductionStatus::Paused);
    assert!(orch.sequencer().outputs().asserted().is_empty());
    assert!(!orch.sequencer().outputs().driver().level(18));
    assert_eq!(orch.tick().await, None);

    assert_eq!(orch.resume().await, ProductionStatus::Running);
    assert!(orch.sequencer().outputs().is_asserted(2, 1));
    assert!(orch.sequencer().outputs().driver().level(18));
    assert_eq!(orch.tick().await, Some(TickOutcome::Progress));

    // A step that completed while paused does not get its valve back.
    orch.pause().await;
    orch.sequencer_mut()
        .run_mut(1)
        .unwrap()
        .force_current_complete();
    orch.resume().await;
    assert!(orch.sequencer().outputs().asserted().is_empty());
    assert!(!orch.sequencer().outputs().driver().level(18));
}

#[tokio::test]
async fn stop_turns_everything_off() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(vec![Some(10.0), Some(20.0)], &dir);
    orch.start(vec![
        StationRun::new(1, "Primer", 2., vec![resolved(2, "Resin", 2.0)]),
        StationRun::new(2, "Topcoat", 2., vec![resolved(4, "Pigment", 2.0)]),
    ])
    .unwrap();
    orch.tick().await;
    assert!(orch.sequencer().outputs().is_asserted(2, 1));

    assert_eq!(orch.stop().await, ProductionStatus::Stopped);
    let outputs = orch.sequencer().outputs();
    assert!(outputs.asserted().is_empty());
    for line in [18, 27, 22] {
        assert!(!outputs.driver().level(line));
    }
    assert_eq!(orch.sequencer().runs().count(), 0);
    assert_eq!(orch.tick().await, None);
}

#[tokio::test]
async fn finishing_keeps_runs_for_display() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(vec![Some(10.0), Some(7.5)], &dir);
    orch.start(vec![StationRun::new(
        1,
        "Primer",
        2.,
        vec![resolved(2, "Resin", 2.0)],
    )])
    .unwrap();
    orch.tick().await;
    assert_eq!(orch.tick().await, Some(TickOutcome::Finished));
    assert_eq!(orch.status(), ProductionStatus::Finished);

    let snapshots = orch.sequencer().snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status_line, "Production Complete");
    assert!(orch.sequencer().outputs().asserted().is_empty());
    assert!(!orch.sequencer_mut().weights_mut().is_open());
    assert_eq!(orch.pause().await, ProductionStatus::Finished);
}

#[tokio::test(start_paused = true)]
async fn handle_drives_the_run_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(vec![Some(10.0), Some(9.0), Some(7.9)], &dir);
    orch.start(vec![StationRun::new(
        1,
        "Primer",
        2.,
        vec![resolved(2, "Resin", 2.0)],
    )])
    .unwrap();
    let (handle, task) = ProductionHandle::spawn(orch);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(handle.status().await.unwrap(), ProductionStatus::Running);
    let snapshots = handle.snapshots().await.unwrap();
    assert_eq!(
        snapshots[0].status_line,
        "Step 1/1 - Resin (50.0%) from Tank 2 (Tank 2)"
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(handle.status().await.unwrap(), ProductionStatus::Finished);
    assert_eq!(handle.stop().await.unwrap(), ProductionStatus::Stopped);

    let other = handle.clone();
    drop(handle);
    drop(other);
    task.await.unwrap();
}

#[tokio::test]
async fn handle_reports_a_stopped_loop() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(Vec::new(), &dir);
    let (handle, task) = ProductionHandle::spawn(orch);
    task.abort();
    let _ = task.await;
    assert!(matches!(handle.status().await, Err(Error::NotRunning)));
}

#[test]
fn selections_become_runs() {
    use crate::recipe::{IngredientLine, TankPolicy};

    let dir = tempfile::tempdir().unwrap();
    let store = ProductStore::new(dir.path().join("products"));
    store
        .save(
            "Primer",
            &[
                IngredientLine::new("Resin", 40., 2),
                IngredientLine::new("Water", 60., 3),
            ],
            25,
        )
        .unwrap();
    // Written by hand, the store would have clamped the tank.
    std::fs::write(
        dir.path().join("products").join("Bad.json"),
        r#"[{"raw_material": "Resin", "percentage": 100, "tank": 30}]"#,
    )
    .unwrap();
    let tanks = TankRegistry::with_defaults(25);
    let resolver = Resolver::new(&tanks, 25, TankPolicy::Reject);

    let selection = |station, product: &str, amount| StationSelection {
        station,
        product: product.into(),
        amount,
    };
    let plan = build_runs(
        &[
            selection(3, "Primer", 100.),
            selection(1, "Primer", 0.),
            selection(2, "Missing", 10.),
            selection(9, "Primer", 10.),
            selection(4, "Bad", 10.),
            selection(3, "Primer", 5.),
        ],
        &store,
        &resolver,
        4,
    );

    assert_eq!(plan.runs.len(), 1);
    let run = &plan.runs[0];
    assert_eq!(run.station, 3);
    assert_eq!(run.steps()[0].target_weight, 40.0);
    assert_eq!(run.steps()[1].tank.number, 3);

    let rejected: Vec<StationId> = plan.rejected.iter().map(|(station, _)| *station).collect();
    assert_eq!(rejected, vec![2, 9, 4, 3]);
    assert!(matches!(plan.rejected[0].1, Error::UnknownProduct(_)));
    assert!(matches!(plan.rejected[2].1, Error::InvalidRecipe(_)));
}

#[tokio::test]
async fn launch_prepares_files_and_starts() {
    use crate::recipe::IngredientLine;
    use tokio::net::TcpListener;

    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let instrument = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let config = plant_in(&dir, address);
    ProductStore::new(&config.products_dir)
        .save("Primer", &[IngredientLine::new("Resin", 100., 2)], 25)
        .unwrap();

    let nothing = launch(&config, &[], true).await;
    assert!(matches!(nothing, Err(Error::Config(_))));

    let selections = [StationSelection {
        station: 2,
        product: "Primer".into(),
        amount: 12.5,
    }];
    let Launch {
        mut orchestrator,
        link,
        rejected,
    } = launch(&config, &selections, true).await.unwrap();
    let _instrument = instrument.await.unwrap();

    assert!(rejected.is_empty());
    assert_eq!(orchestrator.status(), ProductionStatus::Running);
    assert!(orchestrator.sequencer().outputs().driver().is_simulated());
    assert!(config.tanks_file.exists());
    assert!(config.output_map_file.exists());
    assert!(RunLog::load(&config.run_log_file)
        .unwrap()
        .stirrers
        .is_empty());
    let plan: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config.process_file).unwrap()).unwrap();
    assert_eq!(plan["step1"]["weight"], "12.500kg");
    assert_eq!(plan["step1"]["stirrer"], "Stirrer 2");

    orchestrator.stop().await;
    link.await.unwrap().unwrap();
}

#[test]
fn runs_and_plan_follow_station_order() {
    use crate::recipe::{IngredientLine, TankPolicy};

    let dir = tempfile::tempdir().unwrap();
    let store = ProductStore::new(dir.path().join("products"));
    store
        .save("Primer", &[IngredientLine::new("Resin", 100., 2)], 25)
        .unwrap();
    let tanks = TankRegistry::with_defaults(25);
    let resolver = Resolver::new(&tanks, 25, TankPolicy::Reject);
    let selection = |station| StationSelection {
        station,
        product: "Primer".into(),
        amount: 10.,
    };

    let plan = build_runs(&[selection(3), selection(1)], &store, &resolver, 4);
    let stations: Vec<StationId> = plan.runs.iter().map(|run| run.station).collect();
    assert_eq!(stations, vec![1, 3]);

    let json = serde_json::to_value(ProcessPlan::from_runs(&plan.runs)).unwrap();
    assert_eq!(json["step1"]["stirrer"], "Stirrer 1");
    assert_eq!(json["step2"]["stirrer"], "Stirrer 3");
}

#[tokio::test]
async fn pause_sweeps_outputs_when_a_deassert_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut orch = orchestrator(vec![Some(10.0), Some(9.0)], &dir);
    orch.start(vec![StationRun::new(
        1,
        "Primer",
        2.,
        vec![resolved(2, "Resin", 2.0)],
    )])
    .unwrap();
    orch.tick().await;
    assert!(orch.sequencer().outputs().driver().level(18));

    orch.sequencer_mut()
        .outputs_mut()
        .driver_mut()
        .fail_line_once(18);
    assert_eq!(orch.pause().await, ProductionStatus::Paused);
    assert!(!orch.sequencer().outputs().driver().level(18));
    assert!(orch.sequencer().outputs().asserted().is_empty());

    assert_eq!(orch.resume().await, ProductionStatus::Running);
    assert!(orch.sequencer().outputs().is_asserted(2, 1));
    assert!(orch.sequencer().outputs().driver().level(18));
}

#[cfg(test)]
fn plant_in(dir: &tempfile::TempDir, address: String) -> PlantConfig {
    use crate::config::LinkConfig;

    PlantConfig {
        link: LinkConfig::Tcp { address },
        gpio_root: dir.path().join("no-gpio"),
        products_dir: dir.path().join("products"),
        tanks_file: dir.path().join("tanks.json"),
        process_file: dir.path().join("process_data.json"),
        run_log_file: dir.path().join("dispensing_log.json"),
        output_map_file: dir.path().join("gpio_map.json"),
        ..PlantConfig::default()
    }
}

#[tokio::test]
async fn failed_link_keeps_previous_log() {
    use crate::recipe::IngredientLine;
    use tokio::net::TcpListener;

    let dir = tempfile::tempdir().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = plant_in(&dir, address);
    ProductStore::new(&config.products_dir)
        .save("Primer", &[IngredientLine::new("Resin", 100., 2)], 25)
        .unwrap();
    std::fs::write(&config.run_log_file, "previous run").unwrap();

    let selections = [StationSelection {
        station: 1,
        product: "Primer".into(),
        amount: 5.,
    }];
    assert!(launch(&config, &selections, true).await.is_err());
    assert_eq!(
        std::fs::read_to_string(&config.run_log_file).unwrap(),
        "previous run"
    );
    assert!(!config.process_file.exists());
}

#[tokio::test]
async fn launch_rejects_tanks_without_a_channel() {
    let dir = tempfile::tempdir().unwrap();
    let config = PlantConfig {
        channel_count: 8,
        ..plant_in(&dir, "127.0.0.1:1".into())
    };
    let selections = [StationSelection {
        station: 1,
        product: "Primer".into(),
        amount: 5.,
    }];
    let launched = launch(&config, &selections, true).await;
    assert!(matches!(launched, Err(Error::Config(_))));
    assert!(!config.tanks_file.exists());
}
