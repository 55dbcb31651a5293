//! Pipeline engine: workers that drain the queue and the controller that
//! schedules them.

pub mod controller;
pub mod launcher;
pub mod shutdown;
pub mod worker;

pub use controller::{Controller, CycleReport};
pub use launcher::{ChildCommand, Launcher};
pub use shutdown::{AnySignal, ShutdownFlag, ShutdownSignal, StopFile};
pub use worker::Worker;
