pub mod components;
pub mod config;
pub mod controllers;
pub mod dispenser;
pub mod error;
pub mod interface;
pub mod recipe;
pub mod subsystems;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

/// Tanks are numbered from 1, in registry order.
pub type TankId = u32;
/// Stirrer stations are numbered from 1.
pub type StationId = u32;

pub use config::PlantConfig;
pub use error::{Error, Result};
pub use subsystems::production::{launch, ProductionHandle, ProductionStatus, StationSelection};
