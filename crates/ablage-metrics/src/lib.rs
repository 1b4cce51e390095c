pub mod registry;
pub mod scope;

pub use registry::EngineMetrics;
pub use scope::MeasurementScope;
