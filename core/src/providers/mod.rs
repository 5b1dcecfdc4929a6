pub mod anthropic;
pub mod factory;
pub mod openai;

pub use anthropic::AnthropicModel;
pub use factory::{create_model, create_model_with_env};
pub use openai::OpenAIModel;
