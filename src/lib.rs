pub mod condition;
pub mod directory;
pub mod engine;
pub mod error;
pub mod event;
pub mod mechanism;
pub mod netcon;
pub mod netpar;
pub mod params;
pub mod phase1;
pub mod presyn;
pub mod queue;
pub mod raster;
pub mod routing;
pub mod thread;
pub mod transport;
pub mod types;

mod util;
