pub mod controller;
pub mod loop_worker;

pub use controller::PollerController;
pub use loop_worker::{backoff_delay, PollerConfig};
