//! Event I/O processor base.\
//! *W3C says*:\
//! Event I/O Processors are the means by which an SCXML session communicates
//! with external entities, including other SCXML sessions. This module
//! provides the trait to implement Event-I/O-Processors.

use std::fmt::Debug;

use crate::datamodel::{GlobalDataArc, ToAny};
use crate::fsm::Event;

/// Trait for Event I/O Processors.\
/// As the processors hold session related data, an instance of this trait is
/// bound to one session, but may share backends with other sessions.
pub trait EventIOProcessor: ToAny + Debug + Send {
    /// Returns the location of the given session for this processor,
    /// as exposed in the "_ioprocessors" system variable.
    fn get_location(&self, session_name: &str) -> String;

    /// Returns the type names of this processor.
    fn get_types(&self) -> &[&str];

    fn get_copy(&self) -> Box<dyn EventIOProcessor>;

    /// Delivers the event to the resolved target.
    /// If the target can not be reached, "error.communication" is put into
    /// the internal queue of the sending session. If the target is not
    /// supported, "error.execution" is raised instead.
    fn send(&mut self, global: &GlobalDataArc, target: &str, event: Event) -> bool;

    fn shutdown(&mut self);
}
