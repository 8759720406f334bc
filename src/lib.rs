#![warn(clippy::all)]

pub mod config;
pub mod sync;
