// Process module - Child lifecycle, deafness detection and restart policy

pub mod deafness;
pub mod output;
pub mod restart;
pub mod signals;
pub mod spawner;
pub mod supervisor;

pub use deafness::SentinelDetector;
pub use output::LogSink;
pub use restart::{RestartContext, RestartDecision};
pub use signals::{listen_for_signals, send_signal};
pub use spawner::{Launcher, ProcessHandle};
pub use supervisor::{
    AppReport, Leader, LeaderEvent, LeaderHandle, SupervisionReport, TerminateCause,
};
