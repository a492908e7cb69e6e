//! Monitoring of the interpreter.\
//! Each session owns one [Tracer] through which all observable steps of the
//! algorithm are reported: received events, entered and exited states, taken
//! transitions, configuration changes and the final exit.
//! Delivery is synchronous from the session's worker thread; implementations
//! shall return fast and must not block.

use std::fmt::Debug;

use log::{debug, info};

use crate::fsm::{Event, Name};

/// Receiver for the observable signals of a session.
/// All methods have default implementations that format the signal and
/// forward it to [Tracer::trace], so a minimal implementation only needs
/// to provide `trace`.
pub trait Tracer: Send + Debug {
    /// Needed by a minimalistic implementation. The default methods below
    /// call this method with a textual representation of the signal.
    fn trace(&self, msg: &str);

    /// Called if an internal event was put into the internal queue.
    fn event_internal_sent(&self, event: &Event) {
        self.trace(format!("Sent Internal Event: {}", event.name).as_str());
    }

    /// Called if an internal event was taken from the internal queue.
    fn event_internal_received(&self, event: &Event) {
        self.trace(format!("Received Internal Event: {}", event.name).as_str());
    }

    /// Called if an external event was taken from the external queue.
    fn event_external_received(&self, event: &Event) {
        self.trace(
            format!(
                "Received External Event: {} invokeid {:?}",
                event.name, event.invoke_id
            )
            .as_str(),
        );
    }

    /// Called if a state was added to the configuration.
    fn state_entered(&self, state: &Name) {
        self.trace(format!("Enter State: <{}>", state).as_str());
    }

    /// Called if a state was removed from the configuration.
    fn state_exited(&self, state: &Name) {
        self.trace(format!("Exit State: <{}>", state).as_str());
    }

    /// Called before the executable content of a transition runs.
    /// `index` is the position of the transition inside its source state.
    fn transition_taken(&self, state: &Name, index: usize) {
        self.trace(format!("Taking Transition: <{}> #{}", state, index).as_str());
    }

    /// Called after each microstep with the new configuration.
    fn configuration_changed(&self, configuration: &[Name]) {
        self.trace(format!("Configuration: {}", configuration.join(",")).as_str());
    }

    /// Called once when the interpreter exits. `final_state` is set if a
    /// top-level final state was reached, None if the session was cancelled.
    fn interpreter_exited(&self, final_state: Option<&Name>) {
        match final_state {
            Some(name) => self.trace(format!("Exit. Final state <{}>", name).as_str()),
            None => self.trace("Exit."),
        }
    }
}

/// Default implementation, forwards all signals to the log.
#[derive(Debug, Default)]
pub struct DefaultTracer {}

impl DefaultTracer {
    pub fn new() -> DefaultTracer {
        DefaultTracer {}
    }
}

impl Tracer for DefaultTracer {
    fn trace(&self, msg: &str) {
        debug!("{}", msg);
    }

    fn interpreter_exited(&self, final_state: Option<&Name>) {
        match final_state {
            Some(name) => info!("Exit. Final state <{}>", name),
            None => info!("Exit."),
        }
    }
}
