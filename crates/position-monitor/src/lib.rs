pub mod monitor;

pub use monitor::{ExitCheck, ExitSignal, MonitorContext, PositionMonitor};
