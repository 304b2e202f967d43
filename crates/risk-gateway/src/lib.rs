pub mod gateway;

pub use gateway::{GateDecision, GateInputs, RiskGateway};
