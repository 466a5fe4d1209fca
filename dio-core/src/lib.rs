pub mod orchestrator;
pub mod profile;

pub use orchestrator::DeviceOrchestrator;
pub use profile::apply_profile;
