//! Sessions: the model backend, the outbound event stream, and the turn
//! loop that ties them to the tool bridge.

pub mod controller;
pub mod events;
pub mod model;

pub use controller::{SessionController, SessionDeps, TurnResult};
pub use events::{SessionEvent, TokenUsage};
pub use model::{ModelBackend, ModelTurn, OpenRouterBackend, ScriptedModel, ScriptedTurn};
