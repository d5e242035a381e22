// control_system/mod.rs
pub mod arbiter;
pub mod emergency;
pub mod traffic_light_controller;
