use crate::config::{LogWatchTimings, MailSettings};
use crate::error::{Result, WardenError};
use crate::logwatch::notifier::{Notification, Notifier};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Debounce state of one watched log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchState {
    pub path: PathBuf,
    /// Size of the file after the last handled change
    pub last_size: u64,
    /// A settle timer is pending
    pub handling_change: bool,
    /// A mute window is open
    pub emails_muted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    /// The file's size or modification time changed
    Changed,
    SettleElapsed,
    MuteElapsed,
}

/// Watches one error log and emails its growth, at most once per mute window
pub struct LogWatcher {
    app: String,
    state: WatchState,
    timings: LogWatchTimings,
    mail: MailSettings,
    notifier: Arc<dyn Notifier>,
    events_tx: UnboundedSender<WatchEvent>,
    events_rx: UnboundedReceiver<WatchEvent>,
}

impl LogWatcher {
    /// Create a watcher; a missing file counts as empty
    pub async fn new(
        app: impl Into<String>,
        path: impl Into<PathBuf>,
        timings: LogWatchTimings,
        mail: MailSettings,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let path = path.into();
        let last_size = file_size(&path).await.ok().flatten().unwrap_or(0);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            app: app.into(),
            state: WatchState {
                path,
                last_size,
                handling_change: false,
                emails_muted: false,
            },
            timings,
            mail,
            notifier,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Poll the file and handle its changes until the task is dropped
    pub async fn run(mut self) {
        info!(
            app = %self.app,
            log = %self.state.path.display(),
            size = self.state.last_size,
            "Watching error log"
        );

        tokio::spawn(poll_changes(
            self.state.path.clone(),
            self.timings.poll(),
            self.events_tx.clone(),
        ));

        while let Some(event) = self.events_rx.recv().await {
            self.handle(event).await;
        }
    }

    pub async fn handle(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Changed => self.handle_change(),
            WatchEvent::SettleElapsed => self.on_settle().await,
            WatchEvent::MuteElapsed => self.on_mute().await,
        }
    }

    /// Entry point for every change notification
    ///
    /// Ignored while a change is being handled or emails are muted;
    /// otherwise arms the settle timer and the mute window.
    fn handle_change(&mut self) {
        if self.state.handling_change || self.state.emails_muted {
            debug!(app = %self.app, "Change coalesced into the current burst");
            return;
        }

        self.state.handling_change = true;
        self.state.emails_muted = true;
        debug!(app = %self.app, "Log growth detected");

        self.schedule(self.timings.settle(), WatchEvent::SettleElapsed);
        self.schedule(self.timings.mute(), WatchEvent::MuteElapsed);
    }

    fn schedule(&self, delay: Duration, event: WatchEvent) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = events.send(event);
        });
    }

    async fn on_settle(&mut self) {
        match self.read_delta().await {
            Ok(Some((delta, new_size))) => {
                info!(
                    app = %self.app,
                    bytes = delta.len(),
                    "Error log grew, sending notification"
                );

                let notification = Notification::log_growth(&self.app, &self.mail, &delta);
                match self.notifier.dispatch(&notification).await {
                    Ok(()) => info!(app = %self.app, to = %self.mail.to, "Notification dispatched"),
                    Err(e) => error!(app = %self.app, "Notification failed: {}", e),
                }

                // Advance even when dispatch failed so the same bytes are never resent
                self.state.last_size = new_size;
            }
            Ok(None) => {}
            Err(e) => warn!(app = %self.app, "Failed to read log growth: {}", e),
        }

        self.state.handling_change = false;
    }

    async fn on_mute(&mut self) {
        self.state.emails_muted = false;

        match file_size(&self.state.path).await {
            Ok(size) if size.unwrap_or(0) != self.state.last_size => {
                debug!(app = %self.app, "Log changed during mute window");
                self.handle_change();
            }
            Ok(_) => {}
            Err(e) => warn!(app = %self.app, "Failed to stat log: {}", e),
        }
    }

    /// Read `[last_size, new_size)`
    ///
    /// Returns `None` when there is nothing new. A file that shrank was
    /// truncated or rotated: tracking restarts at its new size.
    async fn read_delta(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let new_size = file_size(&self.state.path).await?.unwrap_or(0);
        let last_size = self.state.last_size;

        if new_size < last_size {
            info!(
                app = %self.app,
                last_size,
                new_size,
                "Error log truncated, tracking from its new size"
            );
            self.state.last_size = new_size;
            return Ok(None);
        }

        if new_size == last_size {
            return Ok(None);
        }

        let length = usize::try_from(new_size - last_size)
            .map_err(|_| WardenError::LogError("Log delta too large".to_string()))?;

        let mut file = File::open(&self.state.path).await.map_err(|e| {
            WardenError::LogFileError(format!("{}: {}", self.state.path.display(), e))
        })?;
        file.seek(SeekFrom::Start(last_size))
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to seek in log file: {}", e)))?;

        let mut delta = vec![0u8; length];
        file.read_exact(&mut delta)
            .await
            .map_err(|e| WardenError::LogError(format!("Failed to read log delta: {}", e)))?;

        Ok(Some((delta, new_size)))
    }
}

/// Size of a file, `None` if it does not exist
async fn file_size(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WardenError::LogError(format!(
            "Failed to stat {}: {}",
            path.display(),
            e
        ))),
    }
}

async fn signature(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some((metadata.len(), metadata.modified().ok()))
}

/// Report a change whenever the file's length or modification time differs
async fn poll_changes(path: PathBuf, interval: Duration, events: UnboundedSender<WatchEvent>) {
    let mut last = signature(&path).await;

    loop {
        sleep(interval).await;

        let current = signature(&path).await;
        if current != last {
            last = current;
            if events.send(WatchEvent::Changed).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn dispatch(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn dispatch(&self, _notification: &Notification) -> Result<()> {
            Err(WardenError::NotificationDispatch("relay down".to_string()))
        }
    }

    fn mail() -> MailSettings {
        MailSettings {
            from: "warden@example.com".to_string(),
            to: "ops@example.com".to_string(),
            smtp_host: "localhost".to_string(),
            smtp_port: 25,
        }
    }

    fn timings() -> LogWatchTimings {
        LogWatchTimings {
            settle_ms: 3_600_000,
            mute_ms: 7_200_000,
            poll_ms: 3_600_000,
        }
    }

    #[tokio::test]
    async fn test_missing_file_starts_at_zero() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = LogWatcher::new(
            "shop",
            temp_dir.path().join("shop-err.log"),
            timings(),
            mail(),
            Arc::new(Recorder::default()),
        )
        .await;

        assert_eq!(watcher.state().last_size, 0);
        assert!(!watcher.state().handling_change);
        assert!(!watcher.state().emails_muted);
    }

    #[tokio::test]
    async fn test_change_sets_flags_and_coalesces() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = LogWatcher::new(
            "shop",
            temp_dir.path().join("shop-err.log"),
            timings(),
            mail(),
            Arc::new(Recorder::default()),
        )
        .await;

        watcher.handle(WatchEvent::Changed).await;
        assert!(watcher.state().handling_change);
        assert!(watcher.state().emails_muted);

        // A second change during the burst changes nothing
        watcher.handle(WatchEvent::Changed).await;
        assert!(watcher.state().handling_change);
    }

    #[tokio::test]
    async fn test_settle_sends_only_the_delta() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shop-err.log");
        tokio::fs::write(&path, "old error\n").await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut watcher =
            LogWatcher::new("shop", &path, timings(), mail(), recorder.clone()).await;
        assert_eq!(watcher.state().last_size, 10);

        tokio::fs::write(&path, "old error\nnew error\n").await.unwrap();
        watcher.handle(WatchEvent::Changed).await;
        watcher.handle(WatchEvent::SettleElapsed).await;

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "new error\n");
        assert_eq!(sent[0].subject, "[shop] Error log grew");
        assert_eq!(watcher.state().last_size, 20);
        assert!(!watcher.state().handling_change);
        assert!(watcher.state().emails_muted);
    }

    #[tokio::test]
    async fn test_truncation_resets_without_email() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shop-err.log");
        tokio::fs::write(&path, "a long line of errors\n").await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut watcher =
            LogWatcher::new("shop", &path, timings(), mail(), recorder.clone()).await;

        tokio::fs::write(&path, "short\n").await.unwrap();
        watcher.handle(WatchEvent::Changed).await;
        watcher.handle(WatchEvent::SettleElapsed).await;

        assert!(recorder.sent.lock().unwrap().is_empty());
        assert_eq!(watcher.state().last_size, 6);
    }

    #[tokio::test]
    async fn test_failed_dispatch_still_advances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shop-err.log");

        let mut watcher = LogWatcher::new("shop", &path, timings(), mail(), Arc::new(Failing)).await;

        tokio::fs::write(&path, "boom\n").await.unwrap();
        watcher.handle(WatchEvent::Changed).await;
        watcher.handle(WatchEvent::SettleElapsed).await;

        assert_eq!(watcher.state().last_size, 5);
        assert!(!watcher.state().handling_change);
    }

    #[tokio::test]
    async fn test_mute_elapsed_rearms_when_file_grew() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shop-err.log");

        let recorder = Arc::new(Recorder::default());
        let mut watcher =
            LogWatcher::new("shop", &path, timings(), mail(), recorder.clone()).await;

        tokio::fs::write(&path, "first\n").await.unwrap();
        watcher.handle(WatchEvent::Changed).await;
        watcher.handle(WatchEvent::SettleElapsed).await;

        // Growth during the mute window is picked up when it closes
        tokio::fs::write(&path, "first\nsecond\n").await.unwrap();
        watcher.handle(WatchEvent::Changed).await;
        watcher.handle(WatchEvent::MuteElapsed).await;
        assert!(watcher.state().handling_change);
        assert!(watcher.state().emails_muted);

        watcher.handle(WatchEvent::SettleElapsed).await;
        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].body, "second\n");
    }

    #[tokio::test]
    async fn test_mute_elapsed_without_growth_stays_idle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("shop-err.log");
        let mut watcher = LogWatcher::new(
            "shop",
            &path,
            timings(),
            mail(),
            Arc::new(Recorder::default()),
        )
        .await;

        tokio::fs::write(&path, "x\n").await.unwrap();
        watcher.handle(WatchEvent::Changed).await;
        watcher.handle(WatchEvent::SettleElapsed).await;
        watcher.handle(WatchEvent::MuteElapsed).await;

        assert!(!watcher.state().handling_change);
        assert!(!watcher.state().emails_muted);
    }
}
