use crate::config::{AppDescriptor, Config, DeafPolicy, SupervisorSettings};
use crate::error::{Result, WardenError};
use crate::process::deafness::SentinelDetector;
use crate::process::output::pump_output;
use crate::process::restart::{RestartContext, RestartDecision};
use crate::process::signals::send_signal;
use crate::process::spawner::{Launcher, ProcessHandle};
use crate::registry::PidRegistry;
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Why the leader stops supervising
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateCause {
    /// SIGTERM or an operator request
    TerminationRequest,
    /// SIGINT
    Interrupt,
    /// A helper task panicked
    Fault(String),
}

impl fmt::Display for TerminateCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminateCause::TerminationRequest => write!(f, "termination request"),
            TerminateCause::Interrupt => write!(f, "interrupt"),
            TerminateCause::Fault(reason) => write!(f, "internal fault: {}", reason),
        }
    }
}

/// Everything the leader reacts to, in delivery order
#[derive(Debug)]
pub enum LeaderEvent {
    ChildExited { app: String, pid: u32, status: String },
    ChildDeaf { app: String, pid: u32 },
    LaunchDue { app: String },
    Terminate(TerminateCause),
    Restart,
}

/// Cloneable sender used to notify a running leader
#[derive(Debug, Clone)]
pub struct LeaderHandle {
    events: UnboundedSender<LeaderEvent>,
}

impl LeaderHandle {
    /// Ask the leader to stop every child and quit
    pub fn terminate(&self, cause: TerminateCause) -> Result<()> {
        self.send(LeaderEvent::Terminate(cause))
    }

    /// Ask the leader to restart every child immediately
    pub fn request_restart(&self) -> Result<()> {
        self.send(LeaderEvent::Restart)
    }

    fn send(&self, event: LeaderEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| WardenError::SignalError("Leader is no longer running".to_string()))
    }
}

/// Counters of one application over a leader run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppReport {
    pub launches: u32,
    pub exits: u32,
    pub deafened: u32,
}

/// What happened during a leader run, per application
#[derive(Debug, Clone, Default)]
pub struct SupervisionReport {
    apps: BTreeMap<String, AppReport>,
}

impl SupervisionReport {
    pub fn app(&self, name: &str) -> Option<&AppReport> {
        self.apps.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AppReport)> {
        self.apps.iter().map(|(name, report)| (name.as_str(), report))
    }

    fn entry(&mut self, name: &str) -> &mut AppReport {
        self.apps.entry(name.to_string()).or_default()
    }
}

struct SupervisedApp {
    descriptor: AppDescriptor,
    forever: bool,
    context: RestartContext,
    pending_launch: bool,
    launch_timer: Option<AbortHandle>,
}

/// The supervising process: owns every child it launched
///
/// All state lives in this struct and is only touched from [`Leader::run`],
/// which consumes one event at a time. Helper tasks (output pumps, exit
/// waiters, restart timers) only report back through the event channel.
pub struct Leader {
    launcher: Launcher,
    settings: SupervisorSettings,
    apps: BTreeMap<String, SupervisedApp>,
    events_tx: UnboundedSender<LeaderEvent>,
    events_rx: UnboundedReceiver<LeaderEvent>,
    tasks: JoinSet<()>,
    quitting: bool,
    report: SupervisionReport,
}

enum Next {
    Event(Option<LeaderEvent>),
    Joined(std::result::Result<(), tokio::task::JoinError>),
}

impl Leader {
    pub fn new(config: &Config) -> Result<Self> {
        let registry = PidRegistry::open(&config.paths.var_dir)?;
        let launcher = Launcher::new(registry, &config.paths);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            launcher,
            settings: config.supervisor.clone(),
            apps: BTreeMap::new(),
            events_tx,
            events_rx,
            tasks: JoinSet::new(),
            quitting: false,
            report: SupervisionReport::default(),
        })
    }

    pub fn handle(&self) -> LeaderHandle {
        LeaderHandle {
            events: self.events_tx.clone(),
        }
    }

    pub fn registry(&self) -> &PidRegistry {
        self.launcher.registry()
    }

    /// Launch the first child of an application and keep supervising it
    ///
    /// # Returns
    /// * `Ok(pid)` - Process ID of the launched child
    /// * `Err(WardenError)` - The application is already supervised or running, or could not be spawned
    pub async fn supervise(&mut self, descriptor: AppDescriptor, forever: bool) -> Result<u32> {
        if self.apps.contains_key(&descriptor.name) {
            return Err(WardenError::AlreadyRunning(descriptor.name));
        }

        if self.quitting {
            return Err(WardenError::SignalError(format!(
                "Leader is quitting, '{}' not started",
                descriptor.name
            )));
        }

        let handle = self.launcher.launch(&descriptor).await?;
        let pid = handle.pid;

        self.apps.insert(
            descriptor.name.clone(),
            SupervisedApp {
                descriptor,
                forever,
                context: RestartContext::new(self.settings.restart_increment()),
                pending_launch: false,
                launch_timer: None,
            },
        );
        self.attach(handle);

        Ok(pid)
    }

    /// Drive the reactor until no child is alive and no relaunch is pending
    pub async fn run(mut self) -> Result<SupervisionReport> {
        info!(apps = self.apps.len(), "Leader started");

        while !self.is_idle() {
            let next = tokio::select! {
                event = self.events_rx.recv() => Next::Event(event),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => Next::Joined(joined),
            };

            match next {
                Next::Event(Some(event)) => self.dispatch(event).await,
                Next::Event(None) => break,
                Next::Joined(Err(e)) if e.is_panic() => {
                    error!("Helper task panicked: {}", e);
                    self.on_terminate(TerminateCause::Fault(e.to_string()));
                }
                Next::Joined(_) => {}
            }
        }

        self.drain().await;
        info!("Leader finished, no children left");

        Ok(self.report)
    }

    fn is_idle(&self) -> bool {
        self.apps
            .values()
            .all(|app| !app.context.has_children() && !app.pending_launch)
    }

    async fn dispatch(&mut self, event: LeaderEvent) {
        match event {
            LeaderEvent::ChildExited { app, pid, status } => self.on_child_exited(&app, pid, &status),
            LeaderEvent::ChildDeaf { app, pid } => self.on_child_deaf(&app, pid),
            LeaderEvent::LaunchDue { app } => self.relaunch(&app).await,
            LeaderEvent::Terminate(cause) => self.on_terminate(cause),
            LeaderEvent::Restart => self.on_restart_requested(),
        }
    }

    /// Track a launched child and start its helper tasks
    fn attach(&mut self, handle: ProcessHandle) {
        let ProcessHandle {
            app,
            pid,
            mut child,
            stdout,
            stderr,
            out_log,
            err_log,
        } = handle;

        if let Some(supervised) = self.apps.get_mut(&app) {
            supervised.context.add_child(pid);
        }
        self.report.entry(&app).launches += 1;

        let detector = SentinelDetector::new(&self.settings.sentinel);
        self.tasks.spawn(pump_output(
            app.clone(),
            pid,
            stdout,
            out_log,
            Some(detector),
            self.events_tx.clone(),
        ));
        self.tasks.spawn(pump_output(
            app.clone(),
            pid,
            stderr,
            err_log,
            None,
            self.events_tx.clone(),
        ));

        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {}", e),
            };
            let _ = events.send(LeaderEvent::ChildExited { app, pid, status });
        });
    }

    fn on_child_exited(&mut self, name: &str, pid: u32, status: &str) {
        let Some(supervised) = self.apps.get_mut(name) else {
            return;
        };

        let Some(child) = supervised.context.remove_child(pid) else {
            debug!(app = %name, pid, "Exit of untracked child ignored");
            return;
        };

        info!(app = %name, pid, %status, "Exited");
        self.report.entry(name).exits += 1;

        let registry = self.launcher.registry();
        if child.deaf {
            if let Err(e) = registry.remove_deaf(pid) {
                warn!(app = %name, pid, "Failed to remove deaf record: {}", e);
            }
        }
        match registry.release(name, pid) {
            Ok(true) => info!(app = %name, pid, "Registry updated: record removed"),
            Ok(false) => {}
            Err(e) => warn!(app = %name, pid, "Failed to remove record: {}", e),
        }

        // A pending restart request is answered by the last child to exit,
        // even one already evaluated when it went deaf
        let owes_restart =
            supervised.context.restart_requested() && !supervised.context.has_children();
        if child.restart_evaluated && !owes_restart {
            debug!(app = %name, pid, "Restart already evaluated when the child went deaf");
            return;
        }

        let decision = supervised.context.evaluate(supervised.forever);
        self.apply(name, decision);
    }

    fn on_child_deaf(&mut self, name: &str, pid: u32) {
        let policy = self.settings.deaf_policy;
        let Some(supervised) = self.apps.get_mut(name) else {
            return;
        };

        let Some(child) = supervised.context.child_mut(pid) else {
            debug!(app = %name, pid, "Deafness of untracked child ignored");
            return;
        };
        if child.deaf {
            return;
        }

        child.deaf = true;
        warn!(app = %name, pid, "Deafened: child no longer accepts connections");
        self.report.entry(name).deafened += 1;

        if let Err(e) = self.launcher.registry().mark_deaf(name, pid) {
            error!(
                app = %name,
                pid,
                "Registry inconsistent, deaf child is listed neither as running nor as deaf: {}",
                e
            );
            return;
        }
        info!(app = %name, pid, "Registry updated: record moved to deaf area");

        if policy == DeafPolicy::RestartImmediately {
            child.restart_evaluated = true;
            let decision = supervised.context.evaluate(supervised.forever);
            self.apply(name, decision);
        }
    }

    fn apply(&mut self, name: &str, decision: RestartDecision) {
        match decision {
            RestartDecision::NoRestart => {
                info!(app = %name, "Not restarting, application stays stopped")
            }
            RestartDecision::Suppressed => {
                info!(app = %name, "Restart suppressed, leader is quitting")
            }
            RestartDecision::ImmediateRestart => {
                info!(app = %name, "Restart requested, relaunching now");
                self.schedule_launch(name, Duration::ZERO);
            }
            RestartDecision::DelayedRestart(delay) => {
                info!(
                    app = %name,
                    delay_ms = delay.as_millis() as u64,
                    "Restart scheduled"
                );
                self.schedule_launch(name, delay);
            }
        }
    }

    fn schedule_launch(&mut self, name: &str, delay: Duration) {
        let Some(supervised) = self.apps.get_mut(name) else {
            return;
        };

        if let Some(timer) = supervised.launch_timer.take() {
            timer.abort();
        }
        supervised.pending_launch = true;

        let events = self.events_tx.clone();
        let app = name.to_string();

        if delay.is_zero() {
            let _ = events.send(LeaderEvent::LaunchDue { app });
        } else {
            supervised.launch_timer = Some(self.tasks.spawn(async move {
                sleep(delay).await;
                let _ = events.send(LeaderEvent::LaunchDue { app });
            }));
        }
    }

    async fn relaunch(&mut self, name: &str) {
        let Some(supervised) = self.apps.get_mut(name) else {
            return;
        };

        supervised.launch_timer = None;
        if !supervised.pending_launch {
            return;
        }
        supervised.pending_launch = false;

        if supervised.context.is_quitting() {
            info!(app = %name, "Restart suppressed, leader is quitting");
            return;
        }

        let descriptor = supervised.descriptor.clone();
        let forever = supervised.forever;

        match self.launcher.launch(&descriptor).await {
            Ok(handle) => self.attach(handle),
            Err(e @ WardenError::SpawnError(_)) if forever => {
                warn!(app = %name, "Relaunch failed, retrying: {}", e);
                if let Some(supervised) = self.apps.get_mut(name) {
                    let decision = supervised.context.evaluate(forever);
                    self.apply(name, decision);
                }
            }
            Err(e) => error!(app = %name, "Relaunch failed: {}", e),
        }
    }

    fn on_terminate(&mut self, cause: TerminateCause) {
        if self.quitting {
            info!(%cause, "Already quitting, notification ignored");
            return;
        }

        self.quitting = true;
        warn!(%cause, "Leader quitting, relaying SIGTERM to all children");

        for (name, supervised) in self.apps.iter_mut() {
            supervised.context.mark_quitting();
            supervised.pending_launch = false;
            if let Some(timer) = supervised.launch_timer.take() {
                timer.abort();
            }

            for pid in supervised.context.child_pids() {
                match send_signal(pid, Signal::SIGTERM) {
                    Ok(()) => info!(app = %name, pid, "Relayed SIGTERM"),
                    Err(e) => error!(app = %name, pid, "Failed to relay SIGTERM: {}", e),
                }
            }
        }
    }

    fn on_restart_requested(&mut self) {
        if self.quitting {
            info!("Restart request ignored, leader is quitting");
            return;
        }

        info!("Restart requested, relaying SIGTERM to all children");

        let names: Vec<String> = self.apps.keys().cloned().collect();
        for name in names {
            let Some(supervised) = self.apps.get_mut(&name) else {
                continue;
            };

            if supervised.context.has_children() {
                supervised.context.request_restart();
                for pid in supervised.context.child_pids() {
                    match send_signal(pid, Signal::SIGTERM) {
                        Ok(()) => info!(app = %name, pid, "Relayed SIGTERM for restart"),
                        Err(e) => error!(app = %name, pid, "Failed to relay SIGTERM: {}", e),
                    }
                }
            } else if supervised.pending_launch {
                // Waiting out a restart delay: cut it short
                supervised.context.request_restart();
                let decision = supervised.context.evaluate(supervised.forever);
                self.apply(&name, decision);
            }
        }
    }

    /// Let output pumps flush what the children wrote last
    async fn drain(&mut self) {
        let grace = self.settings.stop_grace();
        let tasks = &mut self.tasks;

        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Helper task panicked during shutdown: {}", e);
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Output still open after {:?}, aborting",
                grace
            );
            self.tasks.abort_all();
        }
    }
}
