//! LLM subsystem: wire types, SSE parsing, streaming client, API worker

pub mod client;
pub mod sse;
pub mod types;
pub mod worker;
