pub mod cli;
pub mod commands;
pub mod snvmeth;
pub mod utils;
