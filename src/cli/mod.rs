// CLI module - Operator-facing command-line interface

mod output;

pub use output::{print_error, print_info, print_success_msg};

use crate::config::Config;
use crate::control;
use crate::error::{Result, WardenError};
use crate::logwatch::{self, Notifier, SmtpNotifier};
use crate::process::{listen_for_signals, Leader};
use crate::registry::PidRegistry;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Appwarden - supervise node-style applications and watch their error logs
#[derive(Parser)]
#[command(name = "appwarden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(
        short,
        long,
        global = true,
        env = "APPWARDEN_CONFIG",
        default_value = "/etc/appwarden/appwarden.toml"
    )]
    config: PathBuf,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the applications that can be started
    #[command(alias = "l")]
    Startable,

    /// List running and deaf applications
    #[command(alias = "s")]
    Started,

    /// Start one application and supervise it until it exits
    Start {
        /// Application name
        app: String,

        /// Restart the application whenever it exits
        #[arg(short, long)]
        forever: bool,
    },

    /// Start every configured application under one supervisor
    Startall {
        /// Restart applications whenever they exit
        #[arg(short, long)]
        forever: bool,
    },

    /// Stop a running application
    Stop {
        /// Application name
        app: String,
    },

    /// Stop every running application
    Stopall,

    /// Watch error logs and email their growth
    Logcheck,
}

impl Cli {
    pub fn config_path(&self) -> &Path {
        &self.config
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Execute the parsed command
    pub async fn execute(&self, config: &Config) -> Result<()> {
        match &self.command {
            Commands::Startable => {
                output::print_startable(&config.apps);
                Ok(())
            }

            Commands::Started => {
                let registry = PidRegistry::open(&config.paths.var_dir)?;
                output::print_running(&control::running_apps(&registry, config)?);
                output::print_deaf(&control::deaf_apps(&registry)?);
                Ok(())
            }

            Commands::Start { app, forever } => {
                let descriptor = config.app(app)?.clone();
                let mut leader = Leader::new(config)?;
                let listener = listen_for_signals(leader.handle())?;

                let pid = match leader.supervise(descriptor, *forever).await {
                    Ok(pid) => pid,
                    Err(e) => {
                        listener.abort();
                        return Err(e);
                    }
                };
                print_success_msg(&format!("{} started (PID: {})", app, pid));

                supervise_until_idle(leader, listener).await
            }

            Commands::Startall { forever } => {
                let mut leader = Leader::new(config)?;
                let listener = listen_for_signals(leader.handle())?;
                let mut started = 0;

                for descriptor in &config.apps {
                    match leader.supervise(descriptor.clone(), *forever).await {
                        Ok(pid) => {
                            print_success_msg(&format!("{} started (PID: {})", descriptor.name, pid));
                            started += 1;
                        }
                        Err(e) => print_error(&format!("{}: {}", descriptor.name, e)),
                    }
                }

                if started == 0 {
                    listener.abort();
                    print_info("Nothing was started");
                    return Ok(());
                }

                supervise_until_idle(leader, listener).await
            }

            Commands::Stop { app } => {
                config.app(app)?;
                let registry = PidRegistry::open(&config.paths.var_dir)?;

                let record =
                    control::stop(&registry, app, config.supervisor.stop_grace()).await?;
                print_success_msg(&format!("{} stopped (PID: {})", app, record.child_pid));
                Ok(())
            }

            Commands::Stopall => {
                let registry = PidRegistry::open(&config.paths.var_dir)?;
                let stopped =
                    control::stop_all(&registry, config, config.supervisor.stop_grace()).await;
                print_success_msg(&format!("Stopped {} application(s)", stopped));
                Ok(())
            }

            Commands::Logcheck => {
                let mail = config
                    .mail
                    .as_ref()
                    .ok_or_else(|| WardenError::MissingConfigField("mail".to_string()))?;
                let notifier: Arc<dyn Notifier> = Arc::new(SmtpNotifier::new(mail));

                print_info(&format!(
                    "Watching {} error log(s), notifying {}",
                    config.apps.len(),
                    mail.to
                ));

                tokio::select! {
                    result = logwatch::watch_all(config, notifier) => result,
                    _ = tokio::signal::ctrl_c() => {
                        print_info("Log check stopped");
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Run the leader in the foreground; `listener` is installed before the first launch
async fn supervise_until_idle(leader: Leader, listener: JoinHandle<()>) -> Result<()> {
    let report = leader.run().await;
    listener.abort();

    output::print_report(&report?);
    Ok(())
}
