// models/mod.rs
pub mod lane;
pub mod time;
pub mod vehicle;
