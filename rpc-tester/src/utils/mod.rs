pub mod address;
pub mod telemetry;
