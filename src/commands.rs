use crate::{Data, Error};
use poise::{Context, command};

const OFF: &str = "off";

fn display_level(level: Option<&str>) -> &str {
    level.unwrap_or(OFF)
}

/// `off` disables antiraid; anything else names a level
fn parse_level(input: &str) -> Option<String> {
    let input = input.trim();
    if input.eq_ignore_ascii_case(OFF) {
        None
    } else {
        Some(input.to_string())
    }
}

/// Show or change the antiraid level
#[command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("antiraid_get", "antiraid_set"),
    subcommand_required
)]
pub async fn antiraid(_ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    Ok(())
}

/// Show the current antiraid level
#[command(slash_command, prefix_command, guild_only, rename = "get")]
pub async fn antiraid_get(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let Some(engine) = ctx.data().engine(guild_id) else {
        ctx.say("Automod is not configured for this server.").await?;
        return Ok(());
    };

    let level = engine.antiraid_level();
    let levels = engine.state().antiraid.levels().join("`, `");
    ctx.say(format!(
        "Antiraid level: `{}`\nAvailable levels: `{levels}`",
        display_level(level.as_deref())
    ))
    .await?;
    Ok(())
}

/// Set the antiraid level, or `off`
#[command(slash_command, prefix_command, guild_only, rename = "set")]
pub async fn antiraid_set(
    ctx: Context<'_, Data, Error>,
    #[description = "Level name, or off"] level: String,
) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let Some(engine) = ctx.data().engine(guild_id) else {
        ctx.say("Automod is not configured for this server.").await?;
        return Ok(());
    };

    let level = parse_level(&level);
    let actor = format!("{} ({})", ctx.author().name, ctx.author().id);
    match engine.set_antiraid_level(level.clone(), &actor).await {
        Ok(previous) => {
            ctx.say(format!(
                "Antiraid level set to `{}` (was `{}`)",
                display_level(level.as_deref()),
                display_level(previous.as_deref())
            ))
            .await?;
        }
        Err(e) => {
            ctx.say(format!("Could not change the antiraid level: {e}")).await?;
        }
    }
    Ok(())
}

/// Automod administration
#[command(
    slash_command,
    prefix_command,
    guild_only,
    required_permissions = "MANAGE_GUILD",
    subcommands("automod_status", "automod_reload"),
    subcommand_required
)]
pub async fn automod(_ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    Ok(())
}

/// Show the automod rules loaded for this server
#[command(slash_command, prefix_command, guild_only, rename = "status")]
pub async fn automod_status(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return Ok(());
    };
    let Some(engine) = ctx.data().engine(guild_id) else {
        ctx.say("Automod is not configured for this server.").await?;
        return Ok(());
    };

    let rules = engine.rules();
    let mut reply = format!(
        "{} rule(s), antiraid level `{}`",
        rules.len(),
        display_level(engine.antiraid_level().as_deref())
    );
    for rule in rules.iter() {
        let marker = if rule.enabled { "" } else { " (disabled)" };
        reply.push_str(&format!("\n- `{}`{marker}", rule.name));
    }
    ctx.say(reply).await?;
    Ok(())
}

/// Re-read the automod configuration file
///
/// Also starts automod in servers newly added to the file.
#[command(slash_command, prefix_command, owners_only, rename = "reload")]
pub async fn automod_reload(ctx: Context<'_, Data, Error>) -> Result<(), Error> {
    let present = ctx.serenity_context().cache.guilds();
    match ctx.data().reload(&present).await {
        Ok(count) => ctx.say(format!("Reloaded automod for {count} server(s).")).await?,
        Err(e) => ctx.say(format!("Reload failed, keeping the previous rules: {e}")).await?,
    };
    Ok(())
}
