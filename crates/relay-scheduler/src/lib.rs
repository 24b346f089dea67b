//! Periodic history monitoring: the per-ticket cycle and the background
//! worker driving it.

pub mod cycle;
pub mod poller;

pub use cycle::{CycleReport, MonitorCycle, TicketOutcome};
pub use poller::{PollingScheduler, SchedulerState, ERROR_BACKOFF};
