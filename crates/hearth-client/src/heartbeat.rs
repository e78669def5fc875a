//! Agent-managed timers, run on the page side.
//!
//! The agent asks a page to start a named timer (`heartbeat-start`); the page
//! ticks it and reports each beat together with whether the user has been
//! idle longer than the timer's inactivity threshold. Timers are torn down
//! when the page is hidden and restored from their remembered settings when it
//! becomes visible again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use hearth_types::PageMessage;

use crate::constants::MIN_TIMER_INTERVAL;

/// Where beats go. The engine routes them to the agent.
pub trait Beacon: Send + Sync + 'static {
    fn send(&self, message: PageMessage);
}

impl Beacon for mpsc::UnboundedSender<PageMessage> {
    fn send(&self, message: PageMessage) {
        let _ = mpsc::UnboundedSender::send(self, message);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerSpec {
    pub interval: Duration,
    pub max_inactive: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    Running,
    /// Remembered but torn down; `resume` restarts it.
    Suspended,
    Stopped,
}

pub struct ActivityMonitor {
    beacon: Arc<dyn Beacon>,
    last_activity: Arc<Mutex<Instant>>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
    remembered: Mutex<HashMap<String, TimerSpec>>,
}

impl ActivityMonitor {
    pub fn new(beacon: Arc<dyn Beacon>) -> Self {
        Self {
            beacon,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            running: Mutex::new(HashMap::new()),
            remembered: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) a named timer. Must be called inside a runtime.
    pub fn start(&self, name: &str, spec: TimerSpec) {
        let spec = TimerSpec {
            interval: spec.interval.max(MIN_TIMER_INTERVAL),
            ..spec
        };
        self.remembered.lock().insert(name.to_string(), spec);
        let task = self.spawn_ticker(name.to_string(), spec);
        if let Some(previous) = self.running.lock().insert(name.to_string(), task) {
            previous.abort();
        }
        tracing::debug!(timer = name, interval = ?spec.interval, "timer started");
    }

    /// Stop a timer and forget it.
    pub fn stop(&self, name: &str) {
        self.remembered.lock().remove(name);
        if let Some(task) = self.running.lock().remove(name) {
            task.abort();
        }
    }

    /// Tear down every running timer, remembering them for `resume`.
    pub fn stop_all(&self) -> usize {
        let tasks: Vec<_> = self.running.lock().drain().map(|(_, t)| t).collect();
        let count = tasks.len();
        for task in tasks {
            task.abort();
        }
        count
    }

    /// Restart every remembered timer that is not running.
    pub fn resume(&self) -> usize {
        let specs: Vec<(String, TimerSpec)> = self
            .remembered
            .lock()
            .iter()
            .map(|(n, s)| (n.clone(), *s))
            .collect();
        let mut started = 0;
        for (name, spec) in specs {
            if !self.running.lock().contains_key(&name) {
                let task = self.spawn_ticker(name.clone(), spec);
                self.running.lock().insert(name, task);
                started += 1;
            }
        }
        *self.last_activity.lock() = Instant::now();
        started
    }

    /// Ask the agent to service all timers now.
    pub fn service_now(&self, reason: &str) {
        self.beacon.send(PageMessage::ServiceTimers {
            reason: reason.to_string(),
        });
    }

    /// Note user activity. Ignored while no timer is running.
    pub fn record_activity(&self) {
        if !self.running.lock().is_empty() {
            *self.last_activity.lock() = Instant::now();
        }
    }

    pub fn state(&self, name: &str) -> TimerState {
        if self.running.lock().contains_key(name) {
            TimerState::Running
        } else if self.remembered.lock().contains_key(name) {
            TimerState::Suspended
        } else {
            TimerState::Stopped
        }
    }

    fn spawn_ticker(&self, name: String, spec: TimerSpec) -> JoinHandle<()> {
        let beacon = self.beacon.clone();
        let last_activity = self.last_activity.clone();
        tokio::spawn(async move {
            let start = Instant::now() + spec.interval;
            let mut ticker = tokio::time::interval_at(start, spec.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let inactive = last_activity.lock().elapsed() > spec.max_inactive;
                beacon.send(PageMessage::HeartbeatBeat {
                    name: name.clone(),
                    inactive,
                });
            }
        })
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        for (_, task) in self.running.get_mut().drain() {
            task.abort();
        }
    }
}
