//! Test support.\
//! A [Tracer] implementation that records all observation signals and a
//! harness that runs a machine, feeds it events and returns the recorded
//! signals together with the final configuration.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[cfg(feature = "json-config")]
use std::fs::File;
#[cfg(feature = "json-config")]
use std::io::BufReader;

use log::info;

#[cfg(feature = "json-config")]
use serde::Deserialize;

use crate::fsm::{start_fsm, Event, Fsm, Name, ScxmlSession};
use crate::fsm_executor::FsmExecutor;
use crate::tracer::Tracer;

/// Everything one session reported through its [Tracer].
#[derive(Debug, Default)]
pub struct TraceRecord {
    pub entered: Vec<String>,
    pub exited: Vec<String>,
    pub configurations: Vec<Vec<String>>,
    pub internal_events: Vec<String>,
    pub external_events: Vec<String>,
    pub transitions: Vec<(String, usize)>,
    /// Some(..) once the session exited, the inner value carries the
    /// top-level final state if one was reached.
    pub final_state: Option<Option<String>>,
}

#[derive(Debug, Default)]
pub struct TestTracer {
    pub record: Arc<Mutex<TraceRecord>>,
}

impl TestTracer {
    pub fn new() -> TestTracer {
        TestTracer {
            record: Arc::new(Mutex::new(TraceRecord::default())),
        }
    }
}

impl Tracer for TestTracer {
    fn trace(&self, msg: &str) {
        info!("{}", msg);
    }

    fn event_internal_received(&self, event: &Event) {
        self.record
            .lock()
            .unwrap()
            .internal_events
            .push(event.name.clone());
    }

    fn event_external_received(&self, event: &Event) {
        self.record
            .lock()
            .unwrap()
            .external_events
            .push(event.name.clone());
    }

    fn state_entered(&self, state: &Name) {
        self.record.lock().unwrap().entered.push(state.clone());
    }

    fn state_exited(&self, state: &Name) {
        self.record.lock().unwrap().exited.push(state.clone());
    }

    fn transition_taken(&self, state: &Name, index: usize) {
        self.record
            .lock()
            .unwrap()
            .transitions
            .push((state.clone(), index));
    }

    fn configuration_changed(&self, configuration: &[Name]) {
        self.record
            .lock()
            .unwrap()
            .configurations
            .push(configuration.to_vec());
    }

    fn interpreter_exited(&self, final_state: Option<&Name>) {
        self.record.lock().unwrap().final_state = Some(final_state.cloned());
    }
}

/// Runs the machine with a [TestTracer], executes the given callback (which
/// usually sends events), then stops the session and waits for termination.
///
/// The stop is requested through the external queue, so it is processed
/// strictly after all events the callback sent.
///
/// Returns the recorded signals and the final configuration.
pub fn run_fsm_test(
    test_name: &str,
    mut fsm: Box<Fsm>,
    timeout_ms: u64,
    events: impl FnOnce(&ScxmlSession),
) -> (Arc<Mutex<TraceRecord>>, Option<Vec<String>>) {
    let tracer = TestTracer::new();
    let record = tracer.record.clone();
    fsm.tracer = Box::new(tracer);

    let executor = Box::new(FsmExecutor::new());
    let session = start_fsm(fsm, executor);

    events(&session);

    // Processed after everything the callback sent.
    session.send_event(Event::cancel_session());

    let mut waited: u64 = 0;
    while !session.is_finished() && waited < timeout_ms {
        thread::sleep(Duration::from_millis(10));
        waited += 10;
    }
    if !session.is_finished() {
        panic!("[{}] The session did not terminate in time", test_name);
    }

    let final_configuration = session.final_configuration();
    (record, final_configuration)
}

/// Waits until the session is in the given state, an expectation of
/// [run_test_specification].
pub fn wait_for_state(session: &ScxmlSession, state: &str, timeout_ms: u64) -> bool {
    let mut waited: u64 = 0;
    loop {
        if session.in_state(state) {
            return true;
        }
        if waited >= timeout_ms {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
        waited += 10;
    }
}

#[cfg(feature = "json-config")]
#[derive(Debug, Deserialize)]
pub struct EventSpecification {
    /// Mandatory event name to send.
    pub name: String,

    /// Delay in milliseconds before the event is sent.
    #[serde(default)]
    pub delay_ms: u64,

    /// Optional state to reach after the event.
    pub shall_reach_state: Option<String>,
}

#[cfg(feature = "json-config")]
#[derive(Debug, Deserialize)]
pub struct TestSpecification {
    /// The document to run, inline XML or a path.
    pub file: Option<String>,
    pub events: Vec<EventSpecification>,
    pub final_configuration: Option<Vec<String>>,
    pub timeout_milliseconds: Option<u64>,
}

#[cfg(feature = "json-config")]
pub fn load_json_config(file_path: &str) -> Result<TestSpecification, String> {
    match File::open(file_path) {
        Ok(file) => {
            let reader = BufReader::new(file);
            serde_json::from_reader::<BufReader<File>, TestSpecification>(reader)
                .map_err(|e| format!("Error de-serializing config file '{}'. {}", file_path, e))
        }
        Err(err) => Err(format!(
            "Error reading config file '{}'. {}",
            file_path, err
        )),
    }
}

#[cfg(feature = "json-config")]
pub fn load_json_config_from_str(json: &str) -> Result<TestSpecification, String> {
    serde_json::from_str::<TestSpecification>(json)
        .map_err(|e| format!("Error de-serializing config. {}", e))
}

/// Runs a machine against a [TestSpecification].
/// Returns false if an expected state or the expected final configuration
/// was not reached.
#[cfg(feature = "json-config")]
pub fn run_test_specification(
    test_name: &str,
    specification: &TestSpecification,
    fsm: Box<Fsm>,
) -> bool {
    let timeout = specification.timeout_milliseconds.unwrap_or(5000);

    let executor = Box::new(FsmExecutor::new());
    let session = start_fsm(fsm, executor);

    for event in &specification.events {
        if event.delay_ms > 0 {
            thread::sleep(Duration::from_millis(event.delay_ms));
        }
        session.send(&event.name, None);
        if let Some(state) = &event.shall_reach_state {
            if !wait_for_state(&session, state, timeout) {
                info!(
                    "[{}] ==> Expected state '{}' not reached after '{}'",
                    test_name, state, event.name
                );
                session.cancel();
                return false;
            }
        }
    }

    session.send_event(Event::cancel_session());
    let mut waited: u64 = 0;
    while !session.is_finished() && waited < timeout {
        thread::sleep(Duration::from_millis(10));
        waited += 10;
    }
    if !session.is_finished() {
        info!("[{}] ==> The session did not terminate in time", test_name);
        return false;
    }

    match &specification.final_configuration {
        None => true,
        Some(expected) => {
            let final_configuration = session.final_configuration().unwrap_or_default();
            for state in expected {
                if !final_configuration.contains(state) {
                    info!(
                        "[{}] ==> Expected final state '{}' not reached. Final configuration: {}",
                        test_name,
                        state,
                        final_configuration.join(",")
                    );
                    return false;
                }
            }
            info!(
                "[{}] ==> Final configuration '{}' reached",
                test_name,
                expected.join(",")
            );
            true
        }
    }
}

#[cfg(all(test, feature = "json-config"))]
mod tests {
    use super::{load_json_config_from_str, run_test_specification};
    use crate::scxml_reader;

    #[test]
    fn specification_round_trip() {
        let spec = load_json_config_from_str(
            r#"{
                "events": [
                    { "name": "e1", "shall_reach_state": "green" },
                    { "name": "e2", "delay_ms": 20, "shall_reach_state": "red" }
                ],
                "final_configuration": [ "red" ],
                "timeout_milliseconds": 3000
            }"#,
        )
        .unwrap();
        assert_eq!(spec.events.len(), 2);
        assert_eq!(spec.events[1].delay_ms, 20);

        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='red'>
                <state id='red'><transition event='e1' target='green'/></state>
                <state id='green'><transition event='e2' target='red'/></state>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        assert!(run_test_specification("specification_round_trip", &spec, fsm));
    }
}
