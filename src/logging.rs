use crate::{AUDIT_TARGET, COMMAND_TARGET, CONSOLE_TARGET, Data, ERROR_TARGET, Error};
use poise::{Context, FrameworkError};
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    filter::filter_fn,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Everything the bot logs, as JSON
pub const AUTOMOD_LOG_FILE: &str = "automod";
/// Audit events only, for operators
pub const AUDIT_LOG_FILE: &str = "audit";

/// Initialize the logging system with console and file outputs
///
/// # Errors
/// The log directory cannot be created or the default filter is invalid.
pub fn init() -> Result<(), Error> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let automod_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, AUTOMOD_LOG_FILE);
    let audit_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, AUDIT_LOG_FILE);

    // Human-readable console output
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    let automod_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(automod_file);

    let audit_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(audit_file)
        .with_filter(filter_fn(|metadata| metadata.target() == AUDIT_TARGET));

    // RUST_LOG wins; otherwise info, without serenity's gateway chatter
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info").add_directive("serenity=error".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(automod_layer)
        .with(audit_layer)
        .init();

    info!("Logging system initialized");
    Ok(())
}

fn command_fields(ctx: Context<'_, Data, Error>) -> (String, String, String) {
    let command_name = ctx.command().qualified_name.clone();
    let guild_id = ctx
        .guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.get().to_string());
    let user_id = ctx.author().id.get().to_string();
    (command_name, guild_id, user_id)
}

/// Log the start of a command execution (pre-command hook)
pub async fn log_command_start(ctx: Context<'_, Data, Error>) {
    ctx.set_invocation_data(Instant::now()).await;

    let (command_name, guild_id, user_id) = command_fields(ctx);
    let args = if ctx.command().parameters.is_empty() {
        String::new()
    } else {
        format!("{:?}", ctx.invocation_string())
    };

    info!(
        target: COMMAND_TARGET,
        command = %command_name,
        guild_id = %guild_id,
        user_id = %user_id,
        arguments = %args,
        event = "start",
        "Command execution started"
    );
}

/// Log the end of a command execution (post-command hook)
pub async fn log_command_end(ctx: Context<'_, Data, Error>) {
    let elapsed = ctx
        .invocation_data::<Instant>()
        .await
        .map(|start| start.elapsed());
    let duration_ms = u64::try_from(elapsed.map_or(0, |d| d.as_millis())).unwrap_or_default();

    let (command_name, guild_id, user_id) = command_fields(ctx);
    info!(
        target: COMMAND_TARGET,
        command = %command_name,
        guild_id = %guild_id,
        user_id = %user_id,
        duration_ms = duration_ms,
        event = "end",
        "Command execution completed"
    );
}

/// Log errors that occur during command execution
pub fn log_command_error(error: &FrameworkError<'_, Data, Error>) {
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            let (command_name, guild_id, user_id) = command_fields(*ctx);
            error!(
                target: ERROR_TARGET,
                command = %command_name,
                guild_id = %guild_id,
                user_id = %user_id,
                error = %error,
                "Command error"
            );
        }
        FrameworkError::CommandCheckFailed { error, ctx, .. } => {
            let (command_name, guild_id, user_id) = command_fields(*ctx);
            let error_msg = error
                .as_ref()
                .map_or_else(|| "Check failed".to_string(), ToString::to_string);
            error!(
                target: ERROR_TARGET,
                command = %command_name,
                guild_id = %guild_id,
                user_id = %user_id,
                error = %error_msg,
                "Command check failed"
            );
        }
        FrameworkError::EventHandler { error, event, .. } => {
            error!(
                target: ERROR_TARGET,
                event = %event.snake_case_name(),
                error = %error,
                "Event handler error"
            );
        }
        err => {
            error!(
                target: ERROR_TARGET,
                error = ?err,
                "Other framework error"
            );
        }
    }
}

pub fn log_console(message: &str) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}
