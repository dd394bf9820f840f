pub mod agent;
pub mod context;
pub mod conversation;
pub mod errors;
pub mod models;
pub mod multiplexer;
pub mod providers;
pub mod retry;
pub mod state;
pub mod tools;
