//! Duty-cycle agents and the thread loop that runs them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::trace::{debug, info};

/// A unit of work invoked repeatedly on its own thread.
///
/// `do_work` returns how much it did; zero tells the runner it may back off.
pub trait Agent: Send {
    fn role_name(&self) -> &'static str;

    fn do_work(&mut self) -> usize;

    /// Called once on the agent's thread after the last duty cycle.
    fn on_close(&mut self) {}
}

/// What a runner does after a cycle that found no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    BusySpin,
    Yielding,
    Sleeping(Duration),
    /// Spin, then yield, then park for `max_park`.
    Backoff {
        max_spins: u32,
        max_yields: u32,
        max_park: Duration,
    },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self::Backoff {
            max_spins: 100,
            max_yields: 10,
            max_park: Duration::from_millis(1),
        }
    }
}

/// Per-thread idle state for an [`IdleStrategy`].
#[derive(Debug)]
pub struct Idler {
    strategy: IdleStrategy,
    spins: u32,
    yields: u32,
}

impl Idler {
    #[must_use]
    pub const fn new(strategy: IdleStrategy) -> Self {
        Self {
            strategy,
            spins: 0,
            yields: 0,
        }
    }

    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        match self.strategy {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Yielding => std::thread::yield_now(),
            IdleStrategy::Sleeping(period) => std::thread::sleep(period),
            IdleStrategy::Backoff {
                max_spins,
                max_yields,
                max_park,
            } => {
                if self.spins < max_spins {
                    self.spins += 1;
                    std::hint::spin_loop();
                } else if self.yields < max_yields {
                    self.yields += 1;
                    std::thread::yield_now();
                } else {
                    std::thread::park_timeout(max_park);
                }
            }
        }
    }

    pub const fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
    }
}

/// Drives an agent until the running flag clears.
pub struct AgentRunner<A: Agent> {
    agent: A,
    idler: Idler,
    running: Arc<AtomicBool>,
}

impl<A: Agent> AgentRunner<A> {
    #[must_use]
    pub const fn new(agent: A, idle: IdleStrategy, running: Arc<AtomicBool>) -> Self {
        Self {
            agent,
            idler: Idler::new(idle),
            running,
        }
    }

    /// Runs duty cycles on the calling thread, then closes the agent.
    pub fn run(mut self) -> A {
        let _role = self.agent.role_name();
        info!(role = _role, "agent started");
        while self.running.load(Ordering::Acquire) {
            let work = self.agent.do_work();
            self.idler.idle(work);
        }
        debug!(role = _role, "agent closing");
        self.agent.on_close();
        info!(role = _role, "agent stopped");
        self.agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Countdown {
        remaining: usize,
        cycles: usize,
        closed: bool,
        running: Arc<AtomicBool>,
    }

    impl Agent for Countdown {
        fn role_name(&self) -> &'static str {
            "countdown"
        }

        fn do_work(&mut self) -> usize {
            self.cycles += 1;
            if self.remaining == 0 {
                self.running.store(false, Ordering::Release);
                return 0;
            }
            self.remaining -= 1;
            1
        }

        fn on_close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn runner_stops_on_flag_and_closes() {
        let running = Arc::new(AtomicBool::new(true));
        let agent = Countdown {
            remaining: 5,
            cycles: 0,
            closed: false,
            running: Arc::clone(&running),
        };
        let agent = AgentRunner::new(agent, IdleStrategy::BusySpin, running).run();
        assert_eq!(agent.cycles, 6);
        assert!(agent.closed);
    }

    #[test]
    fn backoff_escalates_and_resets() {
        let mut idler = Idler::new(IdleStrategy::Backoff {
            max_spins: 2,
            max_yields: 1,
            max_park: Duration::from_micros(1),
        });
        for _ in 0..4 {
            idler.idle(0);
        }
        assert_eq!((idler.spins, idler.yields), (2, 1));
        idler.idle(3);
        assert_eq!((idler.spins, idler.yields), (0, 0));
    }
}
