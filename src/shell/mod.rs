pub mod executor;
pub mod job_manager;
pub mod parser;
mod readline;
mod shell;
mod signals;

pub use shell::Shell;
