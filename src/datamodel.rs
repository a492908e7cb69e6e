//! Defines the API used to access the data models.

use lazy_static::lazy_static;
use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use log::error;
use regex::Regex;

use crate::event_io_processor::EventIOProcessor;
use crate::executable_content::ExecutableContent as _;
use crate::expression_datamodel::{ExpressionDatamodel, EXPRESSION_DATAMODEL_LC};
use crate::fsm::{
    vec_to_string, CommonContent, Event, ExecutableContentId, Fsm, GlobalData, InvokeId, Parameter,
    StateId,
};

pub const NULL_DATAMODEL: &str = "NULL";
pub const NULL_DATAMODEL_LC: &str = "null";

pub const SCXML_INVOKE_TYPE: &str = "http://www.w3.org/TR/scxml";

/// W3C: Processors MAY define short form notations as an authoring convenience
/// (e.g., "scxml" as equivalent to http://www.w3.org/TR/scxml/).
pub const SCXML_INVOKE_TYPE_SHORT: &str = "scxml";

pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";
pub const BASIC_HTTP_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#BasicHTTPEventProcessor";

/// Name of system variable "_sessionid".\
/// *W3C says*:\
/// The SCXML Processor MUST bind the variable _sessionid at load time to the
/// system-generated id for the current SCXML session. The Processor MUST keep
/// the variable bound to this value until the session terminates.
pub const SESSION_ID_VARIABLE_NAME: &str = "_sessionid";

/// Name of system variable "_name".\
/// *W3C says*:\
/// The SCXML Processor MUST bind the variable _name at load time to the value
/// of the 'name' attribute of the \<scxml\> element.
pub const SESSION_NAME_VARIABLE_NAME: &str = "_name";

/// Name of system variable "_ioprocessors".
pub const IO_PROCESSORS_VARIABLE_NAME: &str = "_ioprocessors";

/// Name of system variable "_event".
pub const EVENT_VARIABLE_NAME: &str = "_event";

/// System variables that may be written only once (at load time).
pub const ASSIGN_ONCE_NAMES: &[&str] = &[
    SESSION_ID_VARIABLE_NAME,
    SESSION_NAME_VARIABLE_NAME,
    IO_PROCESSORS_VARIABLE_NAME,
];

/// System variables that are read-only for document code.
pub const HIDDEN_NAMES: &[&str] = &[EVENT_VARIABLE_NAME];

/// Checks identifier legality for datamodel locations, items and indexes.
pub fn is_legal_name(name: &str) -> bool {
    lazy_static! {
        static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    }
    NAME_RE.is_match(name)
}

/// True if `name` is one of the protected system variables.
pub fn is_protected_name(name: &str) -> bool {
    ASSIGN_ONCE_NAMES.contains(&name) || HIDDEN_NAMES.contains(&name)
}

////////////////////////////////////////////////////////////////////////////////
// Errors

/// Typed error kinds of the platform. Runtime instances are surfaced as
/// platform events (error.execution / error.communication) on the internal
/// queue, compile-time instances abort the parse.
#[derive(Debug, Clone, PartialEq)]
pub enum ScxmlError {
    /// Evaluation of a datamodel expression failed.
    ExprEval(String),
    /// Evaluation of an `*expr` attribute failed or gave an illegal value.
    AttributeEval(String),
    /// An assign or idlocation names an undeclared location.
    IllegalLocation(String),
    /// Malformed \<send\> attributes (bad type, bad delay, missing event).
    SendExecution(String),
    /// A send target is unreachable (missing session, invoke or parent).
    SendCommunication(String),
    /// Fetching one or more `src` documents failed. Fatal at compile time.
    ScriptFetch(String),
    /// Illegal identifier or write to a protected key.
    DataModel(String),
    /// Malformed \<invoke\>.
    Invoke(String),
    /// A child of \<foreach\> or \<if\> raised an error.
    ExecutableContainer(String),
    /// The XML source could not be parsed.
    Parse(String),
}

impl ScxmlError {
    /// The event name under which this error is raised at runtime.
    pub fn event_name(&self) -> &'static str {
        match self {
            ScxmlError::SendCommunication(_) => "error.communication",
            _ => "error.execution",
        }
    }
}

impl Display for ScxmlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScxmlError::ExprEval(m) => write!(f, "expression evaluation failed: {}", m),
            ScxmlError::AttributeEval(m) => write!(f, "attribute evaluation failed: {}", m),
            ScxmlError::IllegalLocation(m) => {
                write!(f, "the location '{}' was not instantiated in the datamodel", m)
            }
            ScxmlError::SendExecution(m) => write!(f, "send failed: {}", m),
            ScxmlError::SendCommunication(m) => write!(f, "send target unreachable: {}", m),
            ScxmlError::ScriptFetch(m) => write!(f, "fetching remote source failed: {}", m),
            ScxmlError::DataModel(m) => write!(f, "datamodel error: {}", m),
            ScxmlError::Invoke(m) => write!(f, "invoke failed: {}", m),
            ScxmlError::ExecutableContainer(m) => {
                write!(f, "stopped executing children after an error: {}", m)
            }
            ScxmlError::Parse(m) => write!(f, "parse error: {}", m),
        }
    }
}

impl Error for ScxmlError {}

////////////////////////////////////////////////////////////////////////////////
// Global data access

/// Gets the global data store from a datamodel.
#[macro_export]
macro_rules! get_global {
    ($x:expr) => {
        $x.global().lock()
    };
}

pub type GlobalDataLock<'a> = MutexGuard<'a, GlobalData>;

/// Shared access to the global data of one session.
/// In the W3C algorithm the datamodel is simply a global variable. As the
/// datamodel needs access to other global variables, most global data is
/// moved to [GlobalData], owned by the datamodel and shared with timers and
/// peer sessions through this handle.
#[derive(Clone)]
pub struct GlobalDataArc {
    arc: Arc<Mutex<GlobalData>>,
}

impl Default for GlobalDataArc {
    fn default() -> Self {
        GlobalDataArc::new()
    }
}

impl GlobalDataArc {
    pub fn new() -> GlobalDataArc {
        GlobalDataArc {
            arc: Arc::new(Mutex::new(GlobalData::new())),
        }
    }

    pub fn lock(&self) -> GlobalDataLock {
        self.arc.lock().unwrap()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Data

pub trait ToAny: 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Debug + 'static> ToAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Data variant used to handle values in a type-safe but datamodel-agnostic
/// way.
#[derive(Clone, PartialEq)]
pub enum Data {
    Integer(i64),
    Double(f64),
    String(String),
    Boolean(bool),
    Array(Vec<Data>),
    Map(HashMap<String, Data>),
    Null(),
}

impl Data {
    /// Lisp-like truth value, used for conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Data::Integer(v) => *v != 0,
            Data::Double(v) => *v != 0.0,
            Data::String(v) => !v.is_empty(),
            Data::Boolean(v) => *v,
            Data::Array(v) => !v.is_empty(),
            Data::Map(v) => !v.is_empty(),
            Data::Null() => false,
        }
    }
}

impl Debug for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Data::String(v) => write!(f, "'{}'", v),
            _ => write!(f, "{}", self),
        }
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            Data::String(v) => write!(f, "{}", v),
            Data::Integer(v) => write!(f, "{}", v),
            Data::Double(v) => write!(f, "{}", v),
            Data::Boolean(v) => write!(f, "{}", v),
            Data::Array(v) => write!(f, "{}", vec_to_string(v)),
            Data::Map(v) => {
                let mut keys: Vec<&String> = v.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", k, v.get(*k).unwrap())?;
                }
                write!(f, "}}")
            }
            Data::Null() => write!(f, "null"),
        }
    }
}

/// One \<data\> declaration of a state, value still unevaluated.
/// Value precedence at initialization time: `expr` before `content`
/// (inline text, child XML or the fetched `src` document).
#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    pub id: String,
    pub expr: Option<String>,
    pub content: Option<String>,
}

/// The \<data\> declarations of one state, in document order.
#[derive(Debug, Default)]
pub struct DataStore {
    pub entries: Vec<DataEntry>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore {
            entries: Vec::new(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Datamodel API

/// Data model interface trait.
/// *W3C says*:\
/// The Data Model offers the capability of storing, reading, and modifying a
/// set of data that is internal to the state machine. This specification does
/// not mandate any specific data model, but instead defines a set of abstract
/// capabilities that can be realized by various languages. In addition to the
/// underlying data structure, the data model defines a set of expressions.
/// These expressions are used to refer to specific locations in the data
/// model, to compute values to assign to those locations, and to evaluate
/// boolean conditions.
pub trait Datamodel {
    /// Returns the global data.
    fn global(&mut self) -> &mut GlobalDataArc;

    fn global_s(&self) -> &GlobalDataArc;

    /// The name of the data model as used in the \<scxml\> attribute "datamodel".
    fn get_name(&self) -> &str;

    /// Adds the "In" predicate and binds the system variables
    /// `_sessionid`, `_name` and `_ioprocessors`.
    fn add_functions(&mut self, fsm: &Fsm);

    /// Initialize the data model for one state.
    /// Called with the pseudo-root for the global initialization at startup
    /// (which also declares all data ids and, with early binding, evaluates
    /// all of them) and with individual states on first entry for late
    /// binding.
    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, fsm: &Fsm, state: StateId);

    /// Binds a global read-only variable.
    fn initialize_read_only(&mut self, name: &str, value: Data);

    /// Sets a variable, bypassing protection. Used by the platform itself.
    fn set(&mut self, name: &str, data: Data);

    /// Sets the system variable "_event".
    fn set_event(&mut self, event: &Event);

    /// Executes an assignment.
    /// The location must be declared and legal, otherwise "error.execution"
    /// is put into the internal queue and false is returned.
    fn assign(&mut self, location: &str, expr: &str) -> bool;

    /// Gets a value by a location expression.
    /// If the location is undefined or illegal, "error.execution" is put
    /// into the internal queue.
    fn get_by_location(&mut self, location: &str) -> Result<Data, String>;

    /// True if the location is declared and resolvable.
    fn has_location(&mut self, location: &str) -> bool;

    /// Clear all data.
    fn clear(&mut self);

    /// "log" function, used for \<log\> content.
    fn log(&mut self, label: &str, msg: &str);

    /// Evaluates a script/expression and returns the resulting value.
    fn execute(&mut self, script: &str) -> Result<Data, String>;

    /// Executes a for-each loop.
    fn execute_for_each(
        &mut self,
        array_expression: &str,
        item: &str,
        index: &str,
        execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool;

    /// *W3C says*:\
    /// The set of operators in conditional expressions varies depending on the
    /// data model, but all data models must support the 'In()' predicate,
    /// which takes a state ID as its argument and returns true if the state
    /// machine is in that state.
    fn execute_condition(&mut self, script: &str) -> Result<bool, String>;

    /// Executes content by id.
    #[allow(non_snake_case)]
    fn executeContent(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool;

    /// Convenience function to retrieve a value that has an alternative
    /// expression-value. If `value_expression` is empty, Ok(value) is
    /// returned. If the expression fails, "error.execution" is put into the
    /// internal queue and Err is returned.
    fn get_expression_alternative_value(
        &mut self,
        value: &str,
        value_expression: &str,
    ) -> Result<String, String> {
        if value_expression.is_empty() {
            Ok(value.to_string())
        } else {
            match self.execute(value_expression) {
                Err(msg) => {
                    self.internal_error_execution();
                    Err(msg)
                }
                Ok(value) => Ok(value.to_string()),
            }
        }
    }

    /// Get an io-processor by type name.
    fn get_io_processor(&mut self, name: &str) -> Option<Arc<Mutex<Box<dyn EventIOProcessor>>>> {
        self.global().lock().io_processors.get(name).cloned()
    }

    /// *W3C says*:\
    /// Indicates that an error internal to the execution of the document has
    /// occurred, such as one arising from expression evaluation.
    fn internal_error_execution(&mut self) {
        self.global()
            .lock()
            .enqueue_internal(Event::error_execution(&None, &None));
    }

    /// As [internal_error_execution](Datamodel::internal_error_execution),
    /// carrying the triggering send-id and invoke-id.
    fn internal_error_execution_for(
        &mut self,
        send_id: &Option<String>,
        invoke_id: &Option<InvokeId>,
    ) {
        self.global()
            .lock()
            .enqueue_internal(Event::error_execution(send_id, invoke_id));
    }

    /// *W3C says*:\
    /// Indicates that an error has occurred while trying to communicate with
    /// an external entity.
    fn internal_error_communication(&mut self, event: &Event) {
        self.global()
            .lock()
            .enqueue_internal(Event::error_communication(event));
    }

    /// Evaluates a content element.
    /// Returns the static content or the result of the expression.
    fn evaluate_content(&mut self, content: &Option<CommonContent>) -> Option<Data> {
        match content {
            None => None,
            Some(ct) => match &ct.content_expr {
                None => ct.content.as_ref().map(|c| Data::String(c.clone())),
                Some(expr) => {
                    match self.execute(expr.as_str()) {
                        Err(msg) => {
                            // W3C: If the evaluation of 'expr' produces an error, the
                            // Processor must place error.execution in the internal event
                            // queue and use the empty string as the value.
                            error!("content expr '{}' is invalid ({})", expr, msg);
                            self.internal_error_execution();
                            None
                        }
                        Ok(value) => Some(value),
                    }
                }
            },
        }
    }

    /// Evaluates a list of \<param\> elements into name/value pairs.
    fn evaluate_params(
        &mut self,
        params: &Option<Vec<Parameter>>,
        values: &mut HashMap<String, Data>,
    ) {
        if let Some(params) = &params {
            for param in params {
                if !param.location.is_empty() {
                    match self.get_by_location(&param.location) {
                        Err(msg) => {
                            // W3C: If the 'location' attribute does not refer to a valid
                            // location in the data model, the SCXML Processor must place
                            // the error 'error.execution' on the internal event queue and
                            // must ignore the name and value.
                            error!("location of param {} is invalid ({})", param, msg);
                            // get_by_location already raised "error.execution"
                        }
                        Ok(value) => {
                            values.insert(param.name.clone(), value);
                        }
                    }
                } else if !param.expr.is_empty() {
                    match self.execute(param.expr.as_str()) {
                        Err(msg) => {
                            error!("expr of param {} is invalid ({})", param, msg);
                            self.internal_error_execution();
                        }
                        Ok(value) => {
                            values.insert(param.name.clone(), value);
                        }
                    }
                }
            }
        }
    }
}

/// Factory trait to handle creation of datamodels dynamically.
pub trait DatamodelFactory: Send {
    /// Create a NEW datamodel.
    fn create(&mut self, global_data: GlobalDataArc) -> Box<dyn Datamodel>;
}

lazy_static! {
    static ref DATAMODEL_FACTORIES: Mutex<HashMap<String, Box<dyn DatamodelFactory>>> =
        Mutex::new(HashMap::new());
}

/// Registers a datamodel factory for use with the "datamodel" attribute of
/// the \<scxml\> element.
pub fn register_datamodel(name: &str, factory: Box<dyn DatamodelFactory>) {
    DATAMODEL_FACTORIES
        .lock()
        .unwrap()
        .insert(name.to_lowercase(), factory);
}

/// Creates the datamodel with the specified name.
/// An empty name selects the default expression datamodel.
pub fn create_datamodel(
    name: &str,
    global_data: GlobalDataArc,
) -> Result<Box<dyn Datamodel>, ScxmlError> {
    match name.to_lowercase().as_str() {
        "" | EXPRESSION_DATAMODEL_LC => Ok(Box::new(ExpressionDatamodel::new(global_data))),
        NULL_DATAMODEL_LC => Ok(Box::new(NullDatamodel::new(global_data))),
        other => match DATAMODEL_FACTORIES.lock().unwrap().get_mut(other) {
            Some(factory) => Ok(factory.create(global_data)),
            None => Err(ScxmlError::DataModel(format!(
                "unsupported datamodel '{}'",
                name
            ))),
        },
    }
}

////////////////////////////////////////////////////////////////////////////////
// Null datamodel

/// ## W3C says:
/// ### B.1 The Null Data Model
/// The value "null" for the 'datamodel' attribute results in an absent or
/// empty data model. In particular:
/// - There is no underlying data model.
/// - The boolean expression language consists of the In predicate only. It
///   has the form 'In(id)', where id is the id of a state in the enclosing
///   state machine.
/// - There is no location, value or scripting language.
pub struct NullDatamodel {
    pub global: GlobalDataArc,
    pub state_name_to_id: HashMap<String, StateId>,
}

pub struct NullDatamodelFactory {}

impl DatamodelFactory for NullDatamodelFactory {
    fn create(&mut self, global_data: GlobalDataArc) -> Box<dyn Datamodel> {
        Box::new(NullDatamodel::new(global_data))
    }
}

impl NullDatamodel {
    pub fn new(global_data: GlobalDataArc) -> NullDatamodel {
        NullDatamodel {
            global: global_data,
            state_name_to_id: HashMap::new(),
        }
    }
}

impl Datamodel for NullDatamodel {
    fn global(&mut self) -> &mut GlobalDataArc {
        &mut self.global
    }

    fn global_s(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &str {
        NULL_DATAMODEL
    }

    fn add_functions(&mut self, fsm: &Fsm) {
        for state in fsm.states.as_slice() {
            self.state_name_to_id.insert(state.name.clone(), state.id);
        }
    }

    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, _fsm: &Fsm, _state: StateId) {
        // nothing to do
    }

    fn initialize_read_only(&mut self, _name: &str, _value: Data) {
        // nothing to do
    }

    fn set(&mut self, _name: &str, _data: Data) {
        // nothing to do
    }

    fn set_event(&mut self, _event: &Event) {
        // nothing to do
    }

    fn assign(&mut self, _location: &str, _expr: &str) -> bool {
        true
    }

    fn get_by_location(&mut self, _location: &str) -> Result<Data, String> {
        Err("the null datamodel has no locations".to_string())
    }

    fn has_location(&mut self, _location: &str) -> bool {
        false
    }

    fn clear(&mut self) {}

    fn log(&mut self, label: &str, msg: &str) {
        default_log(self.global(), label, msg);
    }

    fn execute(&mut self, _script: &str) -> Result<Data, String> {
        // W3C: There is no scripting language in the null datamodel.
        Err("the null datamodel has no scripting language".to_string())
    }

    fn execute_for_each(
        &mut self,
        _array_expression: &str,
        _item: &str,
        _index: &str,
        _execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool {
        true
    }

    /// *W3C says*:\
    /// The boolean expression language consists of the In predicate only.
    /// It has the form 'In(id)', where id is the id of a state in the
    /// enclosing state machine. The predicate must return 'true' if and only
    /// if that state is in the current state configuration.
    fn execute_condition(&mut self, script: &str) -> Result<bool, String> {
        lazy_static! {
            static ref IN_RE: Regex = Regex::new(r"In\((.*)\)").unwrap();
        }

        let caps = IN_RE.captures(script);
        match caps {
            None => Ok(false),
            Some(caps) => {
                let mut value = caps.get(1).map_or("", |m| m.as_str()).trim();
                if value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2 {
                    value = &value[1..value.len() - 1];
                }
                match self.state_name_to_id.get(value) {
                    None => Ok(false),
                    Some(state_id) => Ok(self.global.lock().configuration.isMember(state_id)),
                }
            }
        }
    }

    #[allow(non_snake_case)]
    fn executeContent(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool {
        match fsm.executableContent.get(&content_id) {
            Some(vec) => {
                for ec in vec {
                    ec.execute(self, fsm);
                }
                true
            }
            None => false,
        }
    }
}

/// Forwards a \<log\> line to the session's log function, or to the log crate
/// if none is installed.
pub fn default_log(global: &GlobalDataArc, label: &str, msg: &str) {
    let mut lock = global.lock();
    match &mut lock.log_function {
        Some(f) => f(label, msg),
        None => {
            if label.is_empty() {
                log::info!("{}", msg);
            } else {
                log::info!("{}: {}", label, msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_legality() {
        assert!(is_legal_name("x"));
        assert!(is_legal_name("_foo"));
        assert!(is_legal_name("Foo_9"));
        assert!(!is_legal_name("9foo"));
        assert!(!is_legal_name("foo.bar"));
        assert!(!is_legal_name(""));
        assert!(!is_legal_name("foo-bar"));
    }

    #[test]
    fn protected_names() {
        assert!(is_protected_name("_sessionid"));
        assert!(is_protected_name("_event"));
        assert!(!is_protected_name("event"));
    }

    #[test]
    fn data_display() {
        assert_eq!(Data::Integer(42).to_string(), "42");
        assert_eq!(Data::String("abc".to_string()).to_string(), "abc");
        assert_eq!(format!("{:?}", Data::String("abc".to_string())), "'abc'");
        assert_eq!(Data::Null().to_string(), "null");
        assert_eq!(
            Data::Array(vec![Data::Integer(1), Data::Boolean(true)]).to_string(),
            "[1,true]"
        );
    }

    #[test]
    fn data_truthiness() {
        assert!(Data::Boolean(true).is_truthy());
        assert!(!Data::Boolean(false).is_truthy());
        assert!(!Data::Null().is_truthy());
        assert!(Data::Integer(-1).is_truthy());
        assert!(!Data::Integer(0).is_truthy());
        assert!(!Data::String("".to_string()).is_truthy());
        assert!(Data::String("0".to_string()).is_truthy());
    }

    #[test]
    fn unknown_datamodel_is_an_error() {
        let r = create_datamodel("no_such_model", GlobalDataArc::new());
        assert!(r.is_err());
    }
}
