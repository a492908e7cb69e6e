//! Helper module to maintain FSM sessions.\
//! The executor owns the Event-I/O-Processors and the registry of all
//! running sessions of this runtime, and starts new sessions from XML
//! sources. Child sessions created by \<invoke\> register here with the name
//! `parent-name.invokeid`, the scxml I/O processor resolves
//! `#_scxml_sessionid` targets against this registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::datamodel::{Data, ScxmlError};
use crate::event_io_processor::EventIOProcessor;
use crate::fsm;
use crate::fsm::{Event, EventSender, InvokeId, ScxmlSession, SessionId};
use crate::scxml_reader;

#[derive(Default)]
pub struct ExecuteState {
    pub processors: Vec<Arc<Mutex<Box<dyn EventIOProcessor>>>>,
    pub sessions: HashMap<SessionId, ScxmlSession>,
    pub session_names: HashMap<String, SessionId>,
}

impl ExecuteState {
    pub fn new() -> ExecuteState {
        ExecuteState {
            processors: Vec::new(),
            sessions: HashMap::new(),
            session_names: HashMap::new(),
        }
    }
}

/// Executes FSMs in separate threads.
/// This struct maintains the IO-Processors used by the FSMs and the running
/// sessions.
#[derive(Clone)]
pub struct FsmExecutor {
    pub state: Arc<Mutex<ExecuteState>>,
    pub include_paths: Vec<PathBuf>,
}

impl Default for FsmExecutor {
    fn default() -> Self {
        FsmExecutor::new()
    }
}

impl FsmExecutor {
    pub fn new() -> FsmExecutor {
        let mut e = FsmExecutor {
            state: Arc::new(Mutex::new(ExecuteState::new())),
            include_paths: Vec::new(),
        };
        e.add_processor(Box::new(
            crate::scxml_event_io_processor::ScxmlEventIOProcessor::new(),
        ));
        e
    }

    pub fn add_processor(&mut self, processor: Box<dyn EventIOProcessor>) {
        self.state
            .lock()
            .unwrap()
            .processors
            .push(Arc::new(Mutex::new(processor)));
    }

    pub fn set_include_paths_from_arguments(
        &mut self,
        named_arguments: &HashMap<&'static str, String>,
    ) {
        self.set_include_paths(&scxml_reader::include_path_from_arguments(named_arguments));
    }

    pub fn set_include_paths(&mut self, include_path: &[PathBuf]) {
        for p in include_path {
            self.include_paths.push(p.clone());
        }
    }

    /// Shutdown of all sessions and IO-Processors.
    pub fn shutdown(&mut self) {
        info!("Shutdown...");
        let mut guard = self.state.lock().unwrap();
        for session in guard.sessions.values() {
            let _ = session.sender.send(Box::new(Event::cancel_session()));
        }
        for processor in &guard.processors {
            processor.lock().unwrap().shutdown();
        }
        guard.processors.clear();
    }

    /// Loads and starts the specified FSM.
    /// The source is an inline XML document, a path or a URL.
    pub fn execute(&mut self, source: &str) -> Result<ScxmlSession, ScxmlError> {
        self.execute_with_data(source, &HashMap::new(), None, None, None)
    }

    /// Loads and starts the specified FSM with some data set.
    pub fn execute_with_data(
        &mut self,
        source: &str,
        data: &HashMap<String, Data>,
        parent: Option<SessionId>,
        invoke_id: Option<InvokeId>,
        session_name: Option<String>,
    ) -> Result<ScxmlSession, ScxmlError> {
        let fsm = if scxml_reader::is_inline_document(source) {
            info!("Loading FSM from inline XML");
            scxml_reader::parse_from_xml_with_includes(source.to_string(), &self.include_paths)
        } else {
            info!("Loading FSM from {}", source);
            scxml_reader::parse_from_uri(source.to_string(), &self.include_paths)
        };
        self.start(fsm, data, parent, invoke_id, session_name)
    }

    /// Starts the specified FSM from an XML string.
    pub fn execute_with_data_from_xml(
        &mut self,
        xml: &str,
        data: &HashMap<String, Data>,
        parent: Option<SessionId>,
        invoke_id: Option<InvokeId>,
        session_name: Option<String>,
    ) -> Result<ScxmlSession, ScxmlError> {
        let fsm = scxml_reader::parse_from_xml_with_includes(xml.to_string(), &self.include_paths);
        self.start(fsm, data, parent, invoke_id, session_name)
    }

    fn start(
        &mut self,
        fsm: Result<Box<crate::fsm::Fsm>, ScxmlError>,
        data: &HashMap<String, Data>,
        parent: Option<SessionId>,
        invoke_id: Option<InvokeId>,
        session_name: Option<String>,
    ) -> Result<ScxmlSession, ScxmlError> {
        match fsm {
            Ok(mut fsm) => {
                fsm.caller_invoke_id = invoke_id;
                fsm.parent_session_id = parent;
                let session = fsm::start_fsm_with_data_and_name(
                    fsm,
                    Box::new(self.clone()),
                    data,
                    session_name,
                );
                Ok(session)
            }
            Err(error) => Err(error),
        }
    }

    /// The IO-Processors, shared with the sessions.
    pub fn get_processors(&self) -> Vec<Arc<Mutex<Box<dyn EventIOProcessor>>>> {
        self.state.lock().unwrap().processors.clone()
    }

    /// Puts a new session into the registry. Called during session start.
    pub fn register_session(&self, session: &ScxmlSession) {
        let mut guard = self.state.lock().unwrap();
        guard
            .session_names
            .insert(session.session_name.clone(), session.session_id);
        guard.sessions.insert(session.session_id, session.clone());
    }

    /// Called by the FSM after the session ended.
    pub fn remove_session(&self, session_id: SessionId) {
        debug!("Session #{} finished", session_id);
        let mut guard = self.state.lock().unwrap();
        guard.sessions.remove(&session_id);
        guard.session_names.retain(|_, id| *id != session_id);
    }

    /// Resolves a public session name to the internal id.
    pub fn resolve_session_name(&self, session_name: &str) -> Option<SessionId> {
        self.state
            .lock()
            .unwrap()
            .session_names
            .get(session_name)
            .cloned()
    }

    pub fn get_session_sender(&self, session_id: SessionId) -> Option<EventSender> {
        Some(
            self.state
                .lock()
                .unwrap()
                .sessions
                .get(&session_id)?
                .sender
                .clone(),
        )
    }

    /// Delivers an event to the external queue of the given session.
    pub fn send_to_session(&self, session_id: SessionId, event: Event) -> Result<(), String> {
        match self.get_session_sender(session_id) {
            None => Err(format!("Session #{} not found", session_id)),
            Some(sender) => sender
                .send(Box::new(event))
                .map_err(|e| format!("Session #{} is gone. {}", session_id, e)),
        }
    }

    /// Delivers an event to all running sessions.
    pub fn send_to_all_sessions(&self, event: Event) {
        let senders: Vec<EventSender> = {
            let guard = self.state.lock().unwrap();
            guard
                .sessions
                .values()
                .map(|session| session.sender.clone())
                .collect()
        };
        for sender in senders {
            let _ = sender.send(event.get_copy());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::FsmExecutor;
    use crate::fsm::Event;

    #[test]
    fn sessions_are_registered_and_removed() {
        let mut executor = FsmExecutor::new();
        let session = executor
            .execute("<scxml initial='idle'><state id='idle'/></scxml>")
            .unwrap();

        assert_eq!(
            executor.resolve_session_name(&session.session_name),
            Some(session.session_id)
        );

        assert!(executor
            .send_to_session(session.session_id, Event::new_simple("noop"))
            .is_ok());

        session.cancel();
        let mut waited = 0;
        while !session.is_finished() && waited < 3000 {
            thread::sleep(Duration::from_millis(10));
            waited += 10;
        }
        assert!(session.is_finished());

        // after exit, the registry entry is gone
        let mut waited = 0;
        while executor.resolve_session_name(&session.session_name).is_some() && waited < 1000 {
            thread::sleep(Duration::from_millis(10));
            waited += 10;
        }
        assert_eq!(executor.resolve_session_name(&session.session_name), None);
    }

    #[test]
    fn parse_error_is_reported() {
        let mut executor = FsmExecutor::new();
        let r = executor.execute("<scxml><state id='broken'></scxml>");
        assert!(r.is_err());
    }
}
