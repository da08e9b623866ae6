//! Author a conversation once, as a table of named steps, and run it
//! unmodified across several chat platforms.
//!
//! The caller supplies a [`StepTable`] (the dialog state machine) and a
//! [`Config`] naming the enabled platforms; [`run`] wires up the platform
//! adapters, the per-user step engine, and the SQLite-backed stores for user
//! state, event deduplication and callback tokens, then drives every
//! platform's event loop.
//!
//! Inbound events from all platforms are normalized into one canonical shape
//! before they reach the engine; outbound keyboards have their payloads
//! swapped for opaque tokens so arbitrary data survives platforms' tiny
//! callback fields.

pub mod config;
pub mod engine;
pub mod files;
pub mod platform;
pub mod step;
pub mod store;

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

pub use crate::config::Config;
pub use crate::engine::StepEngine;
pub use crate::platform::dispatch::Dispatcher;
pub use crate::platform::{
    CommandSpec, FileRef, FileSource, InboundEvent, KeyboardItem, OutboundMessage, PlatformAdapter,
    PlatformKind,
};
pub use crate::step::{OptionItem, Step, StepContext, StepTable, Transition};
pub use crate::store::users::UserRecord;
pub use crate::store::Store;

use crate::platform::slack::SlackAdapter;
use crate::platform::telegram::TelegramAdapter;
use crate::platform::vk::VkAdapter;
use crate::platform::EventHandler;
use crate::store::dedup::EventDedupStore;
use crate::store::tokens::CallbackTokenStore;
use crate::store::users::UserStore;

/// Open the configured database and run the bot until a platform loop fails.
pub async fn run(steps: StepTable, config: Config) -> Result<()> {
    let store = Store::open(&config.storage.database_path)?;
    run_with_store(steps, config, store).await
}

/// Like [`run`], but against an already-open store (useful for embedding and
/// for in-memory setups).
pub async fn run_with_store(steps: StepTable, config: Config, store: Store) -> Result<()> {
    if !config.any_platform_enabled() {
        bail!("no platforms configured; enable at least one of [telegram], [vk], [slack]");
    }

    let commands = engine::commands_from(&steps);

    let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
    if let Some(telegram) = &config.telegram {
        adapters.push(Arc::new(TelegramAdapter::new(telegram, commands.clone())));
    }
    if let Some(vk) = &config.vk {
        adapters.push(Arc::new(VkAdapter::new(vk, commands.clone())));
    }
    if let Some(slack) = &config.slack {
        adapters.push(Arc::new(SlackAdapter::new(slack, commands.clone())));
    }

    let users = UserStore::new(store.connection());
    let dedup = EventDedupStore::new(store.connection());
    let tokens = CallbackTokenStore::new(store.connection());

    if let Some(days) = config.dedup.retention_days {
        dedup.prune_older_than_days(days).await?;
    }

    let dispatcher = Arc::new(Dispatcher::new(adapters.clone(), tokens.clone()));
    let engine = Arc::new(StepEngine::new(
        steps,
        users,
        dedup,
        tokens,
        Arc::clone(&dispatcher),
    ));

    dispatcher.register_commands(&commands).await;

    // Each event gets its own task, so a slow platform call delays only that
    // event's completion.
    let handler: EventHandler = {
        let engine = Arc::clone(&engine);
        Arc::new(move |event| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.handle(event).await;
            });
        })
    };

    info!(
        "Bot is starting with {} platform(s) and {} command(s)",
        adapters.len(),
        commands.len()
    );

    let listeners = adapters.iter().map(|adapter| {
        let adapter = Arc::clone(adapter);
        let handler = Arc::clone(&handler);
        async move { adapter.listen(handler).await }
    });
    futures::future::try_join_all(listeners).await?;

    Ok(())
}
