#![forbid(unsafe_code)]

pub mod command;
pub mod executor;
pub mod gate;
pub mod model;
pub mod state;
