pub mod bus;
pub mod state;

pub use bus::{Callback, MessageBus};
pub use state::StateManager;
