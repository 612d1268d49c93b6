// src/lib.rs — Library root for handoff

pub mod api;
pub mod cli;
pub mod core;
pub mod infra;
pub mod runner;
pub mod util;
