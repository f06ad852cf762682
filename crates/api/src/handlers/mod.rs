//! API handlers module

pub mod bots;
pub mod health;
pub mod lookups;
