pub mod cli;
pub mod load_config;
pub mod operator;

pub use cli::{run, Cli, Commands};
