pub mod anthropic;
pub mod base;
pub mod credential;
pub mod factory;
pub mod http;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod sse;
pub mod utils;
