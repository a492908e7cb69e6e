//! Implementation of "executable content" elements.

use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::{error, info, warn};
use regex::Regex;

use crate::datamodel::{
    Data, Datamodel, GlobalDataArc, ToAny, SCXML_EVENT_PROCESSOR, SCXML_INVOKE_TYPE_SHORT,
};
use crate::event_io_processor::EventIOProcessor as _;
use crate::fsm::{
    opt_vec_to_string, Cancel, Event, EventType, ExecutableContentId, Fsm, Parameter,
    SendParameters, PLATFORM_ID_COUNTER,
};
use crate::scheduler::Scheduler as _;
use crate::scxml_event_io_processor::SCXML_TARGET_INTERNAL;

pub const TYPE_IF: &str = "if";
pub const TYPE_EXPRESSION: &str = "expression";
pub const TYPE_LOG: &str = "log";
pub const TYPE_FOREACH: &str = "foreach";
pub const TYPE_SEND: &str = "send";
pub const TYPE_RAISE: &str = "raise";
pub const TYPE_CANCEL: &str = "cancel";
pub const TYPE_ASSIGN: &str = "assign";
pub const TYPE_FINALIZE: &str = "finalize";
pub const TYPE_CUSTOM: &str = "custom";

/// Send type used for the host-specific "#_response" sink.
pub const SEND_TYPE_RESPONSE: &str = "x-pyscxml-response";
/// Send type used for the host-specific "#_websocket" sink.
pub const SEND_TYPE_WEBSOCKET: &str = "x-pyscxml-websocket";

pub trait ExecutableContent: ToAny + Debug + Send {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm);
    fn get_type(&self) -> &str;
}

pub fn get_safe_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> &mut T {
    ec.as_any_mut()
        .downcast_mut::<T>()
        .unwrap_or_else(|| panic!("Failed to cast executable content"))
}

pub fn get_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> Option<&mut T> {
    ec.as_any_mut().downcast_mut::<T>()
}

pub fn get_opt_executable_content_as<T: 'static>(
    ec_opt: Option<&mut dyn ExecutableContent>,
) -> Option<&mut T> {
    match ec_opt {
        Some(ec) => get_executable_content_as::<T>(ec),
        None => None,
    }
}

////////////////////////////////////////////////////////////////////////////////
// Registries for host extensions

/// The payload handed to custom send-type handlers.
#[derive(Debug, Clone)]
pub struct ScxmlMessage {
    pub name: String,
    pub source: String,
    pub target: String,
    pub send_id: Option<String>,
    pub data: HashMap<String, Data>,
    pub content: Option<Data>,
    pub source_type: String,
}

pub type CustomSendHandler = Arc<dyn Fn(&ScxmlMessage, &GlobalDataArc) + Send + Sync>;
pub type CustomExecutableHandler = Arc<dyn Fn(&Custom, &mut dyn Datamodel) + Send + Sync>;

lazy_static! {
    static ref CUSTOM_SENDTYPES: Mutex<HashMap<String, CustomSendHandler>> =
        Mutex::new(HashMap::new());
    static ref CUSTOM_EXECUTABLES: Mutex<HashMap<String, CustomExecutableHandler>> =
        Mutex::new(HashMap::new());
}

/// Registers a handler for a custom \<send type=..\> value.
pub fn register_custom_sendtype(type_name: &str, handler: CustomSendHandler) {
    CUSTOM_SENDTYPES
        .lock()
        .unwrap()
        .insert(type_name.to_string(), handler);
}

pub fn get_custom_sendtype(type_name: &str) -> Option<CustomSendHandler> {
    CUSTOM_SENDTYPES.lock().unwrap().get(type_name).cloned()
}

/// Registers a handler for executable content in a foreign namespace.
pub fn register_custom_executable(namespace: &str, handler: CustomExecutableHandler) {
    CUSTOM_EXECUTABLES
        .lock()
        .unwrap()
        .insert(namespace.to_string(), handler);
}

pub fn get_custom_executable(namespace: &str) -> Option<CustomExecutableHandler> {
    CUSTOM_EXECUTABLES.lock().unwrap().get(namespace).cloned()
}

////////////////////////////////////////////////////////////////////////////////
// Elements

#[derive(Debug)]
pub struct Expression {
    pub content: String,
}

#[derive(Debug)]
pub struct Log {
    pub label: String,
    pub expression: String,
}

#[derive(Debug)]
pub struct If {
    pub condition: String,
    pub content: ExecutableContentId,
    pub else_content: ExecutableContentId,
}

#[derive(Debug)]
pub struct ForEach {
    pub array: String,
    pub item: String,
    pub index: String,
    pub content: ExecutableContentId,
}

/// *W3C says*:\
/// The \<raise\> element raises an event in the current SCXML session.\
/// Note that the event will not be processed until the current block of
/// executable content has completed and all events that are already in the
/// internal event queue have been processed.
pub struct Raise {
    pub event: String,
}

pub struct Assign {
    pub location: String,
    pub expr: String,
}

/// Synthesized \<finalize\> block: copies each name out of `_event.data`
/// into the associated location of the local datamodel.
#[derive(Debug)]
pub struct FinalizeCopy {
    /// (name in event data, location in the datamodel)
    pub pairs: Vec<(String, String)>,
}

/// Executable content in a foreign namespace, dispatched through the
/// custom-executable registry.
#[derive(Debug)]
pub struct Custom {
    pub namespace: String,
    pub tag: String,
    pub attributes: HashMap<String, String>,
    pub text: String,
}

impl Assign {
    pub fn new() -> Assign {
        Assign {
            location: String::new(),
            expr: String::new(),
        }
    }
}

impl Default for Assign {
    fn default() -> Self {
        Assign::new()
    }
}

impl Debug for Assign {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assign")
            .field("location", &self.location)
            .field("expr", &self.expr)
            .finish()
    }
}

impl ExecutableContent for Assign {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) {
        datamodel.assign(self.location.as_str(), self.expr.as_str());
    }

    fn get_type(&self) -> &str {
        TYPE_ASSIGN
    }
}

impl Raise {
    pub fn new() -> Raise {
        Raise {
            event: String::new(),
        }
    }
}

impl Default for Raise {
    fn default() -> Self {
        Raise::new()
    }
}

impl Debug for Raise {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raise").field("event", &self.event).finish()
    }
}

impl ExecutableContent for Raise {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) {
        let mut event = Event::new("", &self.event, None, None);
        event.etype = EventType::internal;
        datamodel.global().lock().enqueue_internal(event);
    }

    fn get_type(&self) -> &str {
        TYPE_RAISE
    }
}

impl Expression {
    pub fn new() -> Expression {
        Expression {
            content: String::new(),
        }
    }
}

impl Default for Expression {
    fn default() -> Self {
        Expression::new()
    }
}

impl ExecutableContent for Expression {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) {
        if let Err(msg) = datamodel.execute(&self.content) {
            error!("script '{}' failed: {}", self.content, msg);
            datamodel.internal_error_execution();
        }
    }

    fn get_type(&self) -> &str {
        TYPE_EXPRESSION
    }
}

impl Log {
    pub fn new(label: &Option<&String>, expression: &str) -> Log {
        Log {
            label: label.cloned().unwrap_or_default(),
            expression: expression.to_string(),
        }
    }
}

impl ExecutableContent for Log {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) {
        match datamodel.execute(&self.expression) {
            Ok(value) => {
                let msg = value.to_string();
                datamodel.log(&self.label, &msg);
            }
            Err(msg) => {
                error!("log expr '{}' failed: {}", self.expression, msg);
                datamodel.internal_error_execution();
            }
        }
    }

    fn get_type(&self) -> &str {
        TYPE_LOG
    }
}

impl If {
    pub fn new(condition: &String) -> If {
        If {
            condition: condition.clone(),
            content: 0,
            else_content: 0,
        }
    }
}

impl ExecutableContent for If {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) {
        let matching = datamodel
            .execute_condition(&self.condition)
            .unwrap_or_else(|e| {
                warn!("Condition {} can't be evaluated. {}", self.condition, e);
                datamodel.internal_error_execution();
                false
            });
        if matching {
            if self.content != 0 {
                datamodel.executeContent(fsm, self.content);
            }
        } else if self.else_content != 0 {
            datamodel.executeContent(fsm, self.else_content);
        }
    }

    fn get_type(&self) -> &str {
        TYPE_IF
    }
}

pub const INDEX_TEMP: &str = "__$index";

impl ForEach {
    pub fn new() -> ForEach {
        ForEach {
            array: "".to_string(),
            item: "".to_string(),
            index: "".to_string(),
            content: 0,
        }
    }
}

impl Default for ForEach {
    fn default() -> Self {
        ForEach::new()
    }
}

impl ExecutableContent for ForEach {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) {
        let idx = if self.index.is_empty() {
            INDEX_TEMP.to_string()
        } else {
            self.index.clone()
        };
        let content = self.content;
        datamodel.execute_for_each(&self.array, &self.item, &idx, &mut |dm| {
            if content != 0 {
                dm.executeContent(fsm, content)
            } else {
                true
            }
        });
    }

    fn get_type(&self) -> &str {
        TYPE_FOREACH
    }
}

impl ExecutableContent for FinalizeCopy {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) {
        let current = datamodel.global().lock().current_event.clone();
        if let Some(event) = current {
            if let Some(params) = &event.param_values {
                for (name, location) in &self.pairs {
                    if let Some(value) = params.get(name) {
                        datamodel.set(location, value.clone());
                    }
                }
            }
        }
    }

    fn get_type(&self) -> &str {
        TYPE_FINALIZE
    }
}

impl ExecutableContent for Custom {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) {
        match get_custom_executable(&self.namespace) {
            Some(handler) => handler(self, datamodel),
            None => {
                warn!(
                    "No handler registered for custom executable content <{}> ({})",
                    self.tag, self.namespace
                );
            }
        }
    }

    fn get_type(&self) -> &str {
        TYPE_CUSTOM
    }
}

impl Parameter {
    pub fn new() -> Parameter {
        Parameter {
            name: "".to_string(),
            expr: "".to_string(),
            location: "".to_string(),
        }
    }
}

impl Default for Parameter {
    fn default() -> Self {
        Parameter::new()
    }
}

impl Display for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter{{name:{} expr:{} location:{}}}",
            self.name, self.expr, self.location
        )
    }
}

impl ExecutableContent for Cancel {
    /// *W3C says*:\
    /// The \<cancel\> element is used to cancel a delayed \<send\> event. The
    /// SCXML Processor must NOT allow \<cancel\> to affect events that were
    /// not raised in the same session.
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) {
        let send_id =
            match datamodel.get_expression_alternative_value(&self.send_id, &self.send_id_expr) {
                Ok(value) => value,
                Err(_) => {
                    return;
                }
            };
        datamodel.global().lock().timers.cancel(send_id.as_str());
    }

    fn get_type(&self) -> &str {
        TYPE_CANCEL
    }
}

fn is_scxml_send_type(type_val: &str) -> bool {
    matches!(
        type_val,
        SCXML_INVOKE_TYPE_SHORT
            | SCXML_EVENT_PROCESSOR
            | "basichttp"
            | crate::datamodel::BASIC_HTTP_EVENT_PROCESSOR
    )
}

/// Implements the execution of the \<send\> element.
impl ExecutableContent for SendParameters {
    /// If unable to dispatch, "error.communication" is placed in the internal
    /// queue. If the target or type is not supported, "error.execution" is
    /// placed in the internal queue.
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) {
        let global_arc = datamodel.global().clone();

        let mut target =
            match datamodel.get_expression_alternative_value(&self.target, &self.target_expr) {
                Ok(value) => value,
                Err(_) => {
                    return;
                }
            };

        let event_name =
            match datamodel.get_expression_alternative_value(&self.event, &self.event_expr) {
                Ok(value) => value,
                Err(_) => {
                    return;
                }
            };

        let mut type_val =
            match datamodel.get_expression_alternative_value(&self.type_value, &self.type_expr) {
                Ok(value) => value,
                Err(_) => {
                    return;
                }
            };
        if type_val.is_empty() {
            type_val = SCXML_INVOKE_TYPE_SHORT.to_string();
        }

        // Host-specific sinks are addressed by target and dispatched through
        // the custom send-type registry.
        if target == "#_response" {
            type_val = SEND_TYPE_RESPONSE.to_string();
            target = String::new();
        } else if target == "#_websocket" {
            type_val = SEND_TYPE_WEBSOCKET.to_string();
            target = String::new();
        }

        // W3C: If 'idlocation' is present, the SCXML Processor must generate
        // an id when the parent <send> element is evaluated and store it in
        // this location.
        let mut send_id: Option<String> = None;
        if !self.name.is_empty() {
            send_id = Some(self.name.clone());
        } else if !self.name_location.is_empty() {
            let generated = format!(
                "send_id_{}",
                PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            if datamodel.has_location(&self.name_location) {
                datamodel.set(&self.name_location, Data::String(generated.clone()));
                send_id = Some(generated);
            } else {
                error!(
                    "Send: idlocation '{}' was not instantiated in the datamodel",
                    self.name_location
                );
                datamodel.internal_error_execution_for(&None, &fsm.caller_invoke_id);
                return;
            }
        }
        let timer_id = match &send_id {
            Some(id) => id.clone(),
            None => format!(
                "send_id_{}",
                PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
        };

        let delay_ms = if !self.delay_expr.is_empty() {
            match datamodel.execute(&self.delay_expr) {
                Err(msg) => {
                    error!("Send: delayexpr '{}' failed: {}", self.delay_expr, msg);
                    datamodel.internal_error_execution_for(&send_id, &fsm.caller_invoke_id);
                    return;
                }
                Ok(delay) => parse_duration_to_milliseconds(&delay.to_string()),
            }
        } else {
            self.delay_ms as i64
        };

        if delay_ms < 0 {
            error!("Send: delay '{}' is invalid", self.delay_expr);
            datamodel.internal_error_execution_for(&send_id, &fsm.caller_invoke_id);
            return;
        }

        if delay_ms > 0 && target.eq(SCXML_TARGET_INTERNAL) {
            error!("Send: illegal delay for target {}", target);
            datamodel.internal_error_execution_for(&send_id, &fsm.caller_invoke_id);
            return;
        }

        let mut name_values = HashMap::new();
        for location in &self.name_list {
            if let Ok(value) = datamodel.get_by_location(location) {
                name_values.insert(location.clone(), value);
            }
        }
        datamodel.evaluate_params(&self.params, &mut name_values);
        let content = datamodel.evaluate_content(&self.content);

        if is_scxml_send_type(type_val.as_str()) {
            if event_name.is_empty() {
                error!("Send: missing 'event' for type '{}'", type_val);
                datamodel.internal_error_execution_for(&send_id, &fsm.caller_invoke_id);
                return;
            }
            let iop = match datamodel.get_io_processor(SCXML_EVENT_PROCESSOR) {
                Some(iop) => iop,
                None => {
                    datamodel.internal_error_execution_for(&send_id, &fsm.caller_invoke_id);
                    return;
                }
            };
            let event = Event {
                name: event_name,
                etype: EventType::external,
                sendid: send_id,
                origin: None,
                origin_type: None,
                invoke_id: fsm.caller_invoke_id.clone(),
                param_values: if name_values.is_empty() {
                    None
                } else {
                    Some(name_values)
                },
                content,
            };
            if delay_ms > 0 {
                info!("schedule '{}' for {}ms", event, delay_ms);
                let arc_for_timer = global_arc.clone();
                datamodel.global().lock().timers.schedule(
                    delay_ms,
                    timer_id.as_str(),
                    Box::new(move || {
                        let _ignored =
                            iop.lock()
                                .unwrap()
                                .send(&arc_for_timer, &target, event.clone());
                    }),
                );
            } else {
                let _ignored = iop.lock().unwrap().send(&global_arc, &target, event);
            }
        } else {
            // W3C: If the SCXML Processor does not support the type that is
            // specified, it must place the event error.execution on the
            // internal event queue.
            match get_custom_sendtype(type_val.as_str()) {
                Some(handler) => {
                    let source = format!("#_scxml_{}", global_arc.lock().session_name);
                    let msg = ScxmlMessage {
                        name: event_name,
                        source,
                        target: target.clone(),
                        send_id,
                        data: name_values,
                        content,
                        source_type: SCXML_INVOKE_TYPE_SHORT.to_string(),
                    };
                    if delay_ms > 0 {
                        let arc_for_timer = global_arc.clone();
                        datamodel.global().lock().timers.schedule(
                            delay_ms,
                            timer_id.as_str(),
                            Box::new(move || {
                                handler(&msg, &arc_for_timer);
                            }),
                        );
                    } else {
                        handler(&msg, &global_arc);
                    }
                }
                None => {
                    error!("Send: type '{}' is invalid or unsupported", type_val);
                    datamodel.internal_error_execution_for(&send_id, &fsm.caller_invoke_id);
                }
            }
        }
    }

    fn get_type(&self) -> &str {
        TYPE_SEND
    }
}

impl Debug for SendParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Send")
            .field("name", &self.name)
            .field("event", &self.event)
            .field("target", &self.target)
            .field("delay_ms", &self.delay_ms)
            .field("params", &opt_vec_to_string(&self.params))
            .finish()
    }
}

/// Parses a duration in CSS-time format.
/// A bare number counts as seconds. Returns -1 for illegal input.
pub fn parse_duration_to_milliseconds(d: &str) -> i64 {
    lazy_static! {
        static ref DURATION_RE: Regex =
            Regex::new(r"^(\d*(\.\d+)?)(MS|S|M|H|D|ms|s|m|h|d)?$").unwrap();
    }
    if d.is_empty() {
        0
    } else {
        match DURATION_RE.captures(d) {
            None => -1,
            Some(cap) => {
                let value = cap.get(1).map_or("", |m| m.as_str());
                let unit = cap.get(3).map_or("s", |m| m.as_str());

                if value.is_empty() {
                    return -1;
                }
                let mut v: f64 = value.parse::<f64>().unwrap();
                match unit {
                    "D" | "d" => {
                        v = v * 24.0 * 60.0 * 60.0 * 1000.0;
                    }
                    "H" | "h" => {
                        v = v * 60.0 * 60.0 * 1000.0;
                    }
                    "M" | "m" => {
                        v *= 60000.0;
                    }
                    "S" | "s" => {
                        v *= 1000.0;
                    }
                    "MS" | "ms" => {}
                    _ => {
                        return -1;
                    }
                }
                v.round() as i64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::executable_content::parse_duration_to_milliseconds;

    #[test]
    fn delay_parse() {
        assert_eq!(parse_duration_to_milliseconds("6.7s"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5d"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1m"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001s"), 1);
        assert_eq!(parse_duration_to_milliseconds("6.7S"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5D"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1M"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001S"), 1);
        assert_eq!(parse_duration_to_milliseconds("500ms"), 500);

        // a bare number counts as seconds
        assert_eq!(parse_duration_to_milliseconds("2"), 2000);
        assert_eq!(parse_duration_to_milliseconds("0.5"), 500);

        assert_eq!(parse_duration_to_milliseconds("x1S"), -1);
        assert_eq!(parse_duration_to_milliseconds("1Sx"), -1);
        assert_eq!(parse_duration_to_milliseconds("ms"), -1);
    }
}
