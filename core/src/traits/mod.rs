pub mod model;
pub mod tool;

pub use model::{ContentBlock, Message, MessageContent, Model, ModelRequest, ModelResponse, Role, Usage};
pub use tool::{ToolDescriptor, ToolOutput, ToolSession};
