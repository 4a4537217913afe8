pub mod api;
pub mod bootstrap;
pub mod cli;
