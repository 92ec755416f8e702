//! 工具层：注册表、参数校验、分发器与内置工具

pub mod dispatcher;
pub mod echo;
pub mod http;
pub mod registry;
pub mod schema;
pub mod shell;

pub use dispatcher::{DispatchContext, ToolDispatcher};
pub use echo::EchoTool;
pub use http::HttpGetTool;
pub use registry::{FnTool, Tool, ToolContext, ToolDefinition, ToolRegistry};
pub use schema::{schema_for_args, validate_args};
pub use shell::ShellTool;
