pub mod orchestrator;
pub mod packages;
