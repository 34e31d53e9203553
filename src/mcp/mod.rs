//! MCP (Model Context Protocol) Server Implementation
//!
//! A JSON-RPC 2.0 server on stdio exposing the question answering pipeline
//! as MCP tools.


pub mod protocol;
pub mod server;
pub mod tools;

pub use protocol::{CallToolParams, CallToolResult, Tool, ToolContent};
pub use server::{ConnectionState, McpServer, ToolHandler};
pub use tools::{AskHandler, ModelInfoHandler, RetrieveHandler, register_pipeline_tools};
