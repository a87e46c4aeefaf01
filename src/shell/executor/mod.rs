pub mod builtins;
mod command;
pub mod executor;
pub mod expand;
pub mod flow;
mod pipeline;
pub mod redirect;
pub mod variable;

pub use executor::Executor;
pub use flow::Flow;
