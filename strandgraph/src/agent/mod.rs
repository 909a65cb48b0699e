//! Prebuilt agent loops and the collaborator contracts they drive.
//!
//! The engine does not ship concrete model or tool adapters; it defines
//! the [`ChatModel`] and [`Tool`] contracts and a prebuilt
//! [`ReactAgent`]: a model→tools→model cycle compiled onto the stepwise
//! executor, with early-exit rules and parallel tool dispatch.

mod chat_model;
mod react;
mod tool;

pub use chat_model::ChatModel;
pub use react::{MessageModifier, ReactAgent, ReactConfig, ReactOptions};
pub use tool::{Tool, ToolInfo, ToolSet};
