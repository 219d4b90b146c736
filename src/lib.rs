pub mod boards;
pub mod config;
pub mod firmware;
pub mod fixed;
pub mod messages;
pub mod protocol;
pub mod registers;
pub mod runtime;
