//! These models represent the objects passed around by the agent
//!
//! Several wire formats overlap here:
//! - openai chat completion messages/tools and their streamed chunks
//! - anthropic messages/tools and their server sent events
//! - json-rpc tool server listings and call results
//! - the event stream sent from the agent to connected clients
//!
//! Every one of those is converted into the internal structs at the edge, so the
//! orchestrator and the state manager only ever see the types below.
pub mod content;
pub mod delta;
pub mod message;
pub mod role;
pub mod tool;
