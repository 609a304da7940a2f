pub mod config;
pub mod error;
pub mod eval;
pub mod layers;
pub mod model;
pub mod optim;
pub mod pipeline;
pub mod record;
pub mod run;
pub mod train;

pub use config::{RunConfig, Split};
pub use error::{Error, Result};
