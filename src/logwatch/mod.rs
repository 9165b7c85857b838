// Logwatch module - Error-log growth detection and email notification

pub mod notifier;
pub mod watcher;

pub use notifier::{Notification, Notifier, SmtpNotifier};
pub use watcher::{LogWatcher, WatchEvent, WatchState};

use crate::config::Config;
use crate::error::{Result, WardenError};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Watch the error log of every configured application
///
/// Runs until every watcher has stopped, which normally never happens.
pub async fn watch_all(config: &Config, notifier: Arc<dyn Notifier>) -> Result<()> {
    let mail = config
        .mail
        .clone()
        .ok_or_else(|| WardenError::MissingConfigField("mail".to_string()))?;

    let mut watchers = JoinSet::new();
    for app in &config.apps {
        let watcher = LogWatcher::new(
            app.name.clone(),
            app.error_log(&config.paths.log_dir),
            config.logwatch,
            mail.clone(),
            notifier.clone(),
        )
        .await;
        watchers.spawn(watcher.run());
    }

    info!(count = watchers.len(), to = %mail.to, "Log check started");

    while let Some(joined) = watchers.join_next().await {
        if let Err(e) = joined {
            error!("Log watcher stopped unexpectedly: {}", e);
        }
    }

    Ok(())
}
