use serde::{Deserialize, Serialize};

/// Administrative command carried on the `core_command` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CoreCommand {
    LoadModule { module_id: String },
    UnloadModule { module_id: String },
    LoadAgent { agent_id: String },
    UnloadAgent { agent_id: String },
    Stop,
    Restart,
}

impl CoreCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CoreCommand::LoadModule { .. } => "load_module",
            CoreCommand::UnloadModule { .. } => "unload_module",
            CoreCommand::LoadAgent { .. } => "load_agent",
            CoreCommand::UnloadAgent { .. } => "unload_agent",
            CoreCommand::Stop => "stop",
            CoreCommand::Restart => "restart",
        }
    }
}

/// Reply published on `core_response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandReply {
    pub command: String,
    pub ok: bool,
    pub message: String,
}

impl CommandReply {
    pub fn ok(command: &str, message: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(command: &str, message: impl Into<String>) -> Self {
        Self {
            command: command.to_string(),
            ok: false,
            message: message.into(),
        }
    }
}
