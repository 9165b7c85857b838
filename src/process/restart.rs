use std::time::Duration;

/// Outcome of evaluating a child exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Leave the application stopped
    NoRestart,
    /// The leader is quitting; nothing may be started any more
    Suppressed,
    /// An explicit restart was requested; relaunch now
    ImmediateRestart,
    /// The forever policy applies; relaunch after the delay
    DelayedRestart(Duration),
}

/// Linear backoff for automatic restarts
///
/// The first automatic restart happens without delay; every further one
/// waits `increment` longer than the previous one.
#[derive(Debug, Clone)]
pub struct Backoff {
    increment: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(increment: Duration) -> Self {
        Self {
            increment,
            current: Duration::ZERO,
        }
    }

    /// Delay for the next automatic restart, then grow it
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_add(self.increment);
        delay
    }

    /// Delay the next automatic restart would use
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// A child currently tracked by the leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedChild {
    pub pid: u32,
    /// The child announced it stopped accepting connections
    pub deaf: bool,
    /// A restart decision was already taken for this child
    pub restart_evaluated: bool,
}

/// Restart bookkeeping of one supervised application
///
/// Owned by the leader; every mutation happens inside its event loop.
#[derive(Debug, Clone)]
pub struct RestartContext {
    children: Vec<TrackedChild>,
    leader_quitting: bool,
    restart_requested: bool,
    backoff: Backoff,
}

impl RestartContext {
    pub fn new(increment: Duration) -> Self {
        Self {
            children: Vec::new(),
            leader_quitting: false,
            restart_requested: false,
            backoff: Backoff::new(increment),
        }
    }

    /// Start tracking a freshly launched child
    ///
    /// Returns `false` if the pid was already tracked.
    pub fn add_child(&mut self, pid: u32) -> bool {
        if self.children.iter().any(|c| c.pid == pid) {
            return false;
        }

        self.children.push(TrackedChild {
            pid,
            deaf: false,
            restart_evaluated: false,
        });
        true
    }

    /// Stop tracking a child once its exit is confirmed
    pub fn remove_child(&mut self, pid: u32) -> Option<TrackedChild> {
        let index = self.children.iter().position(|c| c.pid == pid)?;
        Some(self.children.remove(index))
    }

    pub fn child_mut(&mut self, pid: u32) -> Option<&mut TrackedChild> {
        self.children.iter_mut().find(|c| c.pid == pid)
    }

    pub fn child_pids(&self) -> Vec<u32> {
        self.children.iter().map(|c| c.pid).collect()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Set the quitting flag; returns `false` if it was already set
    pub fn mark_quitting(&mut self) -> bool {
        !std::mem::replace(&mut self.leader_quitting, true)
    }

    pub fn is_quitting(&self) -> bool {
        self.leader_quitting
    }

    pub fn request_restart(&mut self) {
        self.restart_requested = true;
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    /// Delay the next automatic restart would use
    pub fn pending_delay(&self) -> Duration {
        self.backoff.peek()
    }

    /// Decide what follows a child exit (or deafening)
    ///
    /// The quitting flag wins over everything, then a pending restart
    /// request (which also resets the backoff), then the forever policy.
    pub fn evaluate(&mut self, forever: bool) -> RestartDecision {
        if self.leader_quitting {
            return RestartDecision::Suppressed;
        }

        if self.restart_requested {
            self.restart_requested = false;
            self.backoff.reset();
            return RestartDecision::ImmediateRestart;
        }

        if forever {
            return RestartDecision::DelayedRestart(self.backoff.next_delay());
        }

        RestartDecision::NoRestart
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: Duration = Duration::from_secs(4);

    #[test]
    fn test_backoff_grows_linearly() {
        let mut backoff = Backoff::new(STEP);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.peek(), Duration::from_secs(12));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_forever_delays_strictly_increase_after_first() {
        let mut context = RestartContext::new(STEP);
        let delays: Vec<Duration> = (0..6)
            .map(|_| match context.evaluate(true) {
                RestartDecision::DelayedRestart(d) => d,
                other => panic!("Expected DelayedRestart, got {:?}", other),
            })
            .collect();

        assert_eq!(delays[0], Duration::ZERO);
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0], "delays must grow: {:?}", delays);
        }
    }

    #[test]
    fn test_no_restart_without_forever() {
        let mut context = RestartContext::new(STEP);
        assert_eq!(context.evaluate(false), RestartDecision::NoRestart);
    }

    #[test]
    fn test_restart_request_is_immediate_and_resets_backoff() {
        let mut context = RestartContext::new(STEP);
        context.evaluate(true);
        context.evaluate(true);
        context.evaluate(true);
        assert_eq!(context.pending_delay(), Duration::from_secs(12));

        context.request_restart();
        assert_eq!(context.evaluate(true), RestartDecision::ImmediateRestart);
        assert!(!context.restart_requested());
        assert_eq!(context.pending_delay(), Duration::ZERO);

        // The request is consumed by a single evaluation
        assert_eq!(
            context.evaluate(true),
            RestartDecision::DelayedRestart(Duration::ZERO)
        );
    }

    #[test]
    fn test_restart_request_applies_without_forever() {
        let mut context = RestartContext::new(STEP);
        context.request_restart();
        assert_eq!(context.evaluate(false), RestartDecision::ImmediateRestart);
    }

    #[test]
    fn test_quitting_takes_precedence() {
        let mut context = RestartContext::new(STEP);
        context.request_restart();
        assert!(context.mark_quitting());
        assert!(!context.mark_quitting());

        for _ in 0..3 {
            assert_eq!(context.evaluate(true), RestartDecision::Suppressed);
        }
        assert!(context.is_quitting());
    }

    #[test]
    fn test_children_tracked_once() {
        let mut context = RestartContext::new(STEP);
        assert!(context.add_child(10));
        assert!(!context.add_child(10));
        assert!(context.add_child(11));
        assert_eq!(context.child_pids(), vec![10, 11]);

        context.child_mut(10).unwrap().deaf = true;
        let removed = context.remove_child(10).unwrap();
        assert!(removed.deaf);
        assert!(context.remove_child(10).is_none());
        assert_eq!(context.child_pids(), vec![11]);
    }
}
