// monitoring/mod.rs
pub mod congestion_monitor;
pub mod stats;
