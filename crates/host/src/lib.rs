pub mod builtins;
pub mod command;
pub mod core;

pub use command::{CommandReply, CoreCommand};
pub use core::AlfredCore;
