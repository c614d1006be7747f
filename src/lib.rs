// lib.rs
pub mod cache;
pub mod comm;
pub mod ids;
pub mod inventory;
pub mod queue;
pub mod remove;
pub mod util;
pub mod walk;
