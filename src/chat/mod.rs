//! Chat streaming: the server-side display buffer and sessions, and the client
//! that decodes a streamed reply.

pub mod buffer;
pub mod chatbot;
pub mod client;
pub mod function_name;
pub mod scheduler;
pub mod splitter;
pub mod thinking;
