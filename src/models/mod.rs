pub mod action;
pub mod task;

pub use action::{ActionDescriptor, ActionKind, Locator, LocatorSet};
pub use task::{Dimensions, TaskIndex, TaskRecord, TaskStatus};
