//! Agent orchestration: the agent tree, the invocation context, the plugin
//! chain and the runner that persists every event an agent emits.

pub mod agents;
pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod live;
pub mod plugins;
pub mod runner;
pub mod tools;
pub mod tree;

pub use agents::{
    run_agent, run_agent_live, Agent, EventStream, IncludeContents, LlmAgent, LlmAgentBuilder,
    LoopAgent, ParallelAgent, SequentialAgent,
};
pub use callback::CallbackContext;
pub use config::RunConfig;
pub use context::{InvocationContext, InvocationServices};
pub use error::EngineError;
pub use live::{LiveRequest, LiveRequestQueue};
pub use plugins::{EventOverride, LoggingPlugin, Plugin, PluginManager};
pub use runner::{RunRequest, Runner, RunnerBuilder};
pub use tools::{ExitLoopTool, FunctionTool, Tool, ToolContext, TransferToAgentTool};
pub use tree::AgentTree;
