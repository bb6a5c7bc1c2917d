pub mod channel;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod escalation;
pub mod queue;
pub mod render;
pub mod reply;
pub mod selector;
pub mod timeout;
pub mod types;
pub mod window;

pub use types::*;
