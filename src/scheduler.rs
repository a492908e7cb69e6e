//! Timer abstraction for delayed \<send\>.\
//! *W3C says*:\
//! If a delay is specified via 'delay' or 'delayexpr', the SCXML Processor
//! must interpret the character string as a time interval. It must dispatch
//! the message only when the delay interval elapses. If the SCXML session
//! terminates before the delay interval has elapsed, the SCXML Processor
//! must discard the message without attempting to deliver it.
//!
//! Timers are keyed by the send-id, \<cancel sendid=..\> unregisters them.
//! The interpreter never assumes a particular event-loop technology, it only
//! uses this trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub type ScheduledCallback = Box<dyn FnMut() + Send>;

/// Scheduling interface used for delayed sends.
pub trait Scheduler: Send {
    /// Runs `callback` after `delay_ms` milliseconds, unless cancelled before.
    /// The entry is removed when the callback fires.
    fn schedule(&mut self, delay_ms: i64, send_id: &str, callback: ScheduledCallback);

    /// Cancels the timer registered for `send_id`.
    /// Returns true if a pending timer was removed.
    fn cancel(&mut self, send_id: &str) -> bool;

    /// Cancels all pending timers. Called when the session terminates.
    fn cancel_all(&mut self);

    /// True if a timer for `send_id` is still pending.
    fn is_scheduled(&self, send_id: &str) -> bool;
}

/// Default [Scheduler], backed by a timer thread.
/// Dropping the guard of a pending entry cancels it.
pub struct TimerScheduler {
    timer: timer::Timer,
    guards: Arc<Mutex<HashMap<String, timer::Guard>>>,
}

impl Default for TimerScheduler {
    fn default() -> Self {
        TimerScheduler::new()
    }
}

impl TimerScheduler {
    pub fn new() -> TimerScheduler {
        TimerScheduler {
            timer: timer::Timer::new(),
            guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Scheduler for TimerScheduler {
    fn schedule(&mut self, delay_ms: i64, send_id: &str, callback: ScheduledCallback) {
        let guards = self.guards.clone();
        let id = send_id.to_string();
        let mut cb = callback;
        let guard = self
            .timer
            .schedule_with_delay(chrono::Duration::milliseconds(delay_ms), move || {
                guards.lock().unwrap().remove(&id);
                cb();
            });
        self.guards
            .lock()
            .unwrap()
            .insert(send_id.to_string(), guard);
    }

    fn cancel(&mut self, send_id: &str) -> bool {
        self.guards.lock().unwrap().remove(send_id).is_some()
    }

    fn cancel_all(&mut self) {
        self.guards.lock().unwrap().clear();
    }

    fn is_scheduled(&self, send_id: &str) -> bool {
        self.guards.lock().unwrap().contains_key(send_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{Scheduler, TimerScheduler};

    #[test]
    fn fired_timer_is_unregistered() {
        let mut s = TimerScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        s.schedule(20, "t1", Box::new(move || f.store(true, Ordering::Relaxed)));
        assert!(s.is_scheduled("t1"));
        thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::Relaxed));
        assert!(!s.is_scheduled("t1"));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut s = TimerScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        s.schedule(50, "t1", Box::new(move || f.store(true, Ordering::Relaxed)));
        assert!(s.cancel("t1"));
        assert!(!s.is_scheduled("t1"));
        thread::sleep(Duration::from_millis(150));
        assert!(!fired.load(Ordering::Relaxed));
        // a second cancel is a no-op
        assert!(!s.cancel("t1"));
    }
}
