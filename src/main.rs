use std::{env, sync::Arc};

use automod_engine::automod::actions::ActionRegistry;
use automod_engine::automod::clock::system_clock;
use automod_engine::automod::regex_runner::RegexMatcher;
use automod_engine::automod::triggers::TriggerRegistry;
use automod_engine::automod::{
    EngineServices, ModActionBus, SerenityEffects, TracingAuditSink, YamlAntiraidStore,
};
use automod_engine::data::{self, ANTIRAID_FILE};
use automod_engine::{Data, Error, commands, handlers, logging};
use poise::serenity_prelude::{self as serenity};
use serenity::GatewayIntents;
use tracing::{info, warn};

/// Main function to run the bot
async fn async_main() -> Result<(), Error> {
    logging::init()?;

    let token = env::var("DISCORD_TOKEN").map_err(|_| "DISCORD_TOKEN must be set")?;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![commands::antiraid(), commands::automod()],
            pre_command: |ctx| Box::pin(logging::log_command_start(ctx)),
            post_command: |ctx| Box::pin(logging::log_command_end(ctx)),
            on_error: |error| {
                Box::pin(async move {
                    logging::log_command_error(&error);
                })
            },
            event_handler: |ctx, event, framework, data| {
                Box::pin(handlers::event_handler(ctx, event, framework, data))
            },
            ..Default::default()
        })
        .setup(|ctx, ready, framework| {
            Box::pin(async move {
                let services = EngineServices {
                    triggers: Arc::new(TriggerRegistry::new()),
                    actions: Arc::new(ActionRegistry::new()),
                    effects: Arc::new(SerenityEffects::new(ctx.http.clone())),
                    audit: Arc::new(TracingAuditSink),
                    antiraid_store: Arc::new(YamlAntiraidStore::new(ANTIRAID_FILE)),
                    matcher: Arc::new(RegexMatcher::default()),
                    bus: ModActionBus::default(),
                    clock: system_clock(),
                    self_user_id: Some(ready.user.id),
                };
                let data = Data::load(data::config_path(), services).await?;
                ctx.data.write().await.insert::<Data>(data.clone());

                for guild in &ready.guilds {
                    if let Err(e) = data.load_guild(guild.id).await {
                        warn!(guild_id = %guild.id, error = %e, "Could not load automod for guild");
                    }
                }

                logging::log_console("Registering commands");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                Ok(data)
            })
        })
        .build();

    // Member and voice events drive most rules
    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;
    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    client.start().await?;

    let data = client.data.read().await;
    if let Some(data) = data.get::<Data>() {
        data.unload_all();
    }
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: could not start the runtime: {err}");
            return;
        }
    };

    if let Err(err) = runtime.block_on(async_main()) {
        eprintln!("Error: {err}");
    }
}
