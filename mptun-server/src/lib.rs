pub mod cli;
pub mod relay;
pub mod runtime;
