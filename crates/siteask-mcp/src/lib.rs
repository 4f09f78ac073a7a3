//! Siteask MCP Server
//!
//! Model Context Protocol server exposing query turns to AI assistants.

pub mod protocol;
pub mod resources;
pub mod server;
pub mod tools;

pub use server::{start_server, McpServer};
