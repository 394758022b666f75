use batch_dispenser::dispenser::run_log::RunLog;
use batch_dispenser::util::utils::parse_selection;
use batch_dispenser::{launch, PlantConfig, ProductionHandle, ProductionStatus, StationSelection};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::time::{interval, Duration, MissedTickBehavior};

fn selection(text: &str) -> Result<StationSelection, String> {
    let (station, product, amount) = parse_selection(text)
        .ok_or_else(|| format!("expected <stirrer>=<product>:<kg>, got '{text}'"))?;
    Ok(StationSelection {
        station,
        product,
        amount,
    })
}

/// Dispenses product batches into the stirrer stations.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Plant configuration file
    #[arg(short, long, default_value = "plant.json")]
    config: PathBuf,

    /// Batch for one stirrer, e.g. `2=Primer:150`. Repeat for more stirrers.
    #[arg(short, long = "station", value_parser = selection)]
    stations: Vec<StationSelection>,

    /// Never touch the GPIO lines, only log what would be switched
    #[arg(long)]
    simulate: bool,

    /// Print the last dispensing log and exit
    #[arg(long)]
    report: bool,
}

async fn supervise(handle: ProductionHandle) -> batch_dispenser::Result<ProductionStatus> {
    let mut status_interval = interval(Duration::from_secs(1));
    status_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping production");
                return handle.stop().await;
            }
            _ = status_interval.tick() => {
                let status = handle.status().await?;
                if matches!(status, ProductionStatus::Finished | ProductionStatus::Stopped) {
                    return Ok(status);
                }
                for snapshot in handle.snapshots().await? {
                    info!("Stirrer {}: {}", snapshot.station, snapshot.status_line);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match PlantConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if args.report {
        return match RunLog::load(&config.run_log_file) {
            Ok(log) => {
                print!("{}", log.report());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Cannot read {}: {e}", config.run_log_file.display());
                ExitCode::FAILURE
            }
        };
    }

    let launched = match launch(&config, &args.stations, args.simulate).await {
        Ok(launched) => launched,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    for (station, reason) in &launched.rejected {
        warn!("Stirrer {station} not started: {reason}");
    }

    let (handle, task) = ProductionHandle::spawn(launched.orchestrator);
    let outcome = supervise(handle).await;
    if let Err(e) = task.await {
        error!("Production task failed: {e}");
    }
    match launched.link.await {
        Ok(Err(e)) => error!("Weight link failed: {e}"),
        Err(e) => error!("Link task failed: {e}"),
        Ok(Ok(())) => {}
    }

    match outcome {
        Ok(ProductionStatus::Finished) => {
            info!("Production finished, log in {}", config.run_log_file.display());
            ExitCode::SUCCESS
        }
        Ok(status) => {
            info!("Production ended as {status:?}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
