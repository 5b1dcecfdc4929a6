pub mod loop_;
pub mod registry;
pub mod transcript;

pub use loop_::AgentLoop;
pub use registry::ToolRegistry;
pub use transcript::Transcript;
