pub mod automod;
pub mod commands;
pub mod data;
pub mod handlers;
pub mod logging;

pub const BOT_NAME: &str = "automod_engine";
pub const COMMAND_TARGET: &str = "automod_engine::command";
pub const ERROR_TARGET: &str = "automod_engine::error";
pub const EVENT_TARGET: &str = "automod_engine::handlers";
pub const CONSOLE_TARGET: &str = "automod_engine";
pub const AUTOMOD_TARGET: &str = "automod_engine::automod";
pub const AUDIT_TARGET: &str = "automod_engine::audit";

pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
