//! Implementation of the SCXML I/O Event Processor.\
//! I/O Processor implementation for type
//! "<http://www.w3.org/TR/scxml/#SCXMLEventProcessor>" (or short-cut "scxml").

use std::fmt::Debug;

use log::error;

use crate::datamodel::{GlobalDataArc, GlobalDataLock, SCXML_EVENT_PROCESSOR};
use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{Event, EventType, SessionId};

/// SCXML Processors specific target:\
/// If the target is the special term '#_internal', the Processor must add the
/// event to the internal event queue of the sending session.
pub const SCXML_TARGET_INTERNAL: &str = "#_internal";

/// SCXML Processors specific target:\
/// If the target is the special term '#_scxml_sessionid', where sessionid is
/// the id of an SCXML session that is accessible to the Processor, the
/// Processor must add the event to the external queue of that session.
pub const SCXML_TARGET_SESSION_ID_PREFIX: &str = "#_scxml_";

/// SCXML Processors specific target:\
/// If the target is the special term '#_parent', the Processor must add the
/// event to the external event queue of the SCXML session that invoked the
/// sending session, if there is one.
pub const SCXML_TARGET_PARENT: &str = "#_parent";

/// SCXML Processors specific target:\
/// If the target is the special term '#_invokeid', where invokeid is the
/// invokeid of an SCXML session that the sending session has created by
/// \<invoke\>, the Processor must add the event to the external queue of that
/// session.\
/// This value is a prefix of the other SCXML targets and needs special care.
pub const SCXML_TARGET_INVOKE_ID_PREFIX: &str = "#_";

/// Shortcut for the SCXML I/O Processor type.
pub const SCXML_EVENT_PROCESSOR_SHORT_TYPE: &str = "scxml";

#[derive(Debug, Default)]
pub struct ScxmlEventIOProcessor {
    pub location_prefix: String,
}

impl ScxmlEventIOProcessor {
    pub fn new() -> ScxmlEventIOProcessor {
        ScxmlEventIOProcessor {
            location_prefix: SCXML_TARGET_SESSION_ID_PREFIX.to_string(),
        }
    }

    fn send_to_session(
        &mut self,
        global_lock: &mut GlobalDataLock,
        session_id: SessionId,
        event: Event,
        report_failure: bool,
    ) -> bool {
        match &global_lock.executor {
            None => {
                error!("Send: executor not available");
                false
            }
            Some(executor) => match executor.send_to_session(session_id, event.clone()) {
                Ok(_) => true,
                Err(err) => {
                    if report_failure {
                        error!("Can't send to session {}. {}", session_id, err);
                        global_lock.enqueue_internal(Event::error_communication(&event));
                    }
                    false
                }
            },
        }
    }
}

const TYPES: &[&str] = &[SCXML_EVENT_PROCESSOR, SCXML_EVENT_PROCESSOR_SHORT_TYPE];

impl EventIOProcessor for ScxmlEventIOProcessor {
    fn get_location(&self, session_name: &str) -> String {
        format!("{}{}", self.location_prefix, session_name)
    }

    fn get_types(&self) -> &[&str] {
        TYPES
    }

    fn get_copy(&self) -> Box<dyn EventIOProcessor> {
        Box::new(ScxmlEventIOProcessor {
            location_prefix: self.location_prefix.clone(),
        })
    }

    /// *W3C says* (only the relevant parts):\
    /// SCXML Processors must support the following special targets for
    /// \<send\>:
    /// - `#_internal`: add the event to the internal event queue of the
    ///   sending session.
    /// - `#_scxml_sessionid`: add the event to the external queue of that
    ///   session.
    /// - `#_parent`: add the event to the external event queue of the SCXML
    ///   session that invoked the sending session, if there is one.
    /// - `#_invokeid`: add the event to the external queue of the session
    ///   that the sending session has created by \<invoke\>.
    /// - If neither 'target' nor 'targetexpr' is specified, add the event to
    ///   the external event queue of the sending session.
    fn send(&mut self, global: &GlobalDataArc, target: &str, mut event: Event) -> bool {
        let mut global_lock = global.lock();
        event.origin_type = Some(SCXML_EVENT_PROCESSOR.to_string());
        if event.origin.is_none() {
            event.origin = Some(self.get_location(global_lock.session_name.as_str()));
        }

        match target {
            "" => {
                global_lock.externalQueue.enqueue(Box::new(event));
                true
            }
            SCXML_TARGET_INTERNAL => {
                event.etype = EventType::internal;
                global_lock.enqueue_internal(event);
                true
            }
            SCXML_TARGET_PARENT => {
                match global_lock.parent_session_id {
                    Some(session_id) => {
                        // A cancelled or exited parent is not an error, the
                        // event is silently discarded.
                        self.send_to_session(&mut global_lock, session_id, event, false)
                    }
                    None => {
                        error!("Send: there is no parent session.");
                        global_lock.enqueue_internal(Event::error_communication(&event));
                        false
                    }
                }
            }
            _ => {
                // W3C: If the sending SCXML session specifies a session that does not
                // exist or is inaccessible, the SCXML Processor must place the error
                // "error.communication" on the internal event queue of the sending session.
                if let Some(session_spec) = target.strip_prefix(SCXML_TARGET_SESSION_ID_PREFIX) {
                    let session_id = match session_spec.parse::<SessionId>() {
                        Ok(session_id) => Some(session_id),
                        Err(_) => match &global_lock.executor {
                            Some(executor) => executor.resolve_session_name(session_spec),
                            None => None,
                        },
                    };
                    match session_id {
                        Some(session_id) => {
                            self.send_to_session(&mut global_lock, session_id, event, true)
                        }
                        None => {
                            error!("The session '{}' is inaccessible.", session_spec);
                            global_lock.enqueue_internal(Event::error_communication(&event));
                            false
                        }
                    }
                } else if let Some(invoke_id) = target.strip_prefix(SCXML_TARGET_INVOKE_ID_PREFIX) {
                    let session_id = match global_lock.child_sessions.get(invoke_id) {
                        None => {
                            error!(
                                "InvokeId '{}' of target '{}' is not available.",
                                invoke_id, target
                            );
                            global_lock.enqueue_internal(Event::error_communication(&event));
                            return false;
                        }
                        Some(session) => session.session_id,
                    };
                    self.send_to_session(&mut global_lock, session_id, event, true)
                } else {
                    // W3C: If the value of the 'target' attribute is not supported or
                    // invalid, the Processor MUST place the error error.execution on
                    // the internal event queue.
                    error!("The send target '{}' is malformed or unsupported.", target);
                    let error =
                        Event::error_execution(&event.sendid.clone(), &event.invoke_id.clone());
                    global_lock.enqueue_internal(error);
                    false
                }
            }
        }
    }

    /// This processor doesn't need a shutdown. The implementation does nothing.
    fn shutdown(&mut self) {}
}
