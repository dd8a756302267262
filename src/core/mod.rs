pub mod clock;
pub mod config;
pub mod events;
pub mod executors;
pub mod lifecycle;
pub mod macros;
pub mod notify;
pub mod routing;
pub mod runtime;
pub mod store;
pub mod terminal;
