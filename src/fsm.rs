//! Implements the data-structures and algorithms described in the W3C scxml
//! recommendation.\
//! As reference the relevant procedures carry the W3C description in their
//! documentation.\
//! See [W3C:Algorithm for SCXML Interpretation](https://www.w3.org/TR/scxml/#AlgorithmforSCXMLInterpretation)

#![allow(non_camel_case_types)]

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::ops::DerefMut;
use std::slice::Iter;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::datamodel::{
    create_datamodel, Data, DataStore, Datamodel, GlobalDataArc, SCXML_INVOKE_TYPE,
    SCXML_INVOKE_TYPE_SHORT,
};
use crate::event_io_processor::EventIOProcessor;
use crate::executable_content::ExecutableContent;
use crate::fsm_executor::FsmExecutor;
use crate::get_global;
use crate::scheduler::{Scheduler, TimerScheduler};
use crate::tracer::{DefaultTracer, Tracer};

/// Platform specific event to cancel the current session.
pub const EVENT_CANCEL_SESSION: &str = "error.platform.cancel";

/// Platform marker event, used to wake up a session that blocks on the
/// external queue after an internal event was put into its internal queue
/// from outside the interpreter thread.
pub const EVENT_INTERNAL_ARRIVED: &str = "event.internal";

pub(crate) static ID_COUNTER: AtomicU32 = AtomicU32::new(1);
pub(crate) static SESSION_ID_COUNTER: AtomicU32 = AtomicU32::new(1);
pub(crate) static PLATFORM_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Starts the FSM inside a worker thread.
pub fn start_fsm(sm: Box<Fsm>, executor: Box<FsmExecutor>) -> ScxmlSession {
    start_fsm_with_data(sm, executor, &HashMap::new())
}

pub fn start_fsm_with_data(
    sm: Box<Fsm>,
    executor: Box<FsmExecutor>,
    data: &HashMap<String, Data>,
) -> ScxmlSession {
    start_fsm_with_data_and_name(sm, executor, data, None)
}

pub fn start_fsm_with_data_and_name(
    mut sm: Box<Fsm>,
    executor: Box<FsmExecutor>,
    data: &HashMap<String, Data>,
    session_name: Option<String>,
) -> ScxmlSession {
    #![allow(non_snake_case)]
    let externalQueue: BlockingQueue<Box<Event>> = BlockingQueue::new();
    let sender = externalQueue.sender.clone();

    let session_id: SessionId = SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let session_name =
        session_name.unwrap_or_else(|| format!("scxml_session_{}", session_id));

    let processors = executor.get_processors();

    let mut session =
        ScxmlSession::new_without_join_handle(session_id, session_name.as_str(), sender.clone());
    executor.register_session(&session);

    for (key, value) in data {
        sm.initData.insert(key.clone(), value.clone());
    }

    let global_data = session.global_data.clone();

    let thread = thread::Builder::new()
        .name(format!("fsm_{}", session_id))
        .spawn(move || {
            info!("SM '{}' starting...", session_name);
            {
                let mut datamodel =
                    match create_datamodel(sm.datamodel.as_str(), global_data.clone()) {
                        Ok(datamodel) => datamodel,
                        Err(err) => {
                            error!("SM '{}' failed to start: {}", session_name, err);
                            let mut global = global_data.lock();
                            global.exited = true;
                            executor.remove_session(session_id);
                            return;
                        }
                    };
                {
                    let mut global = get_global!(datamodel);
                    global.externalQueue = externalQueue;
                    global.session_id = session_id;
                    global.session_name = session_name.clone();
                    global.caller_invoke_id = sm.caller_invoke_id.clone();
                    global.parent_session_id = sm.parent_session_id;
                    for processor in processors {
                        let types: Vec<String> = processor
                            .lock()
                            .unwrap()
                            .get_types()
                            .iter()
                            .map(|t| t.to_string())
                            .collect();
                        for t in types {
                            global.io_processors.insert(t, processor.clone());
                        }
                    }
                    for state in sm.states.as_slice() {
                        global.state_names.insert(state.id, state.name.clone());
                    }
                    global.executor = Some(executor);
                }
                sm.interpret(datamodel.deref_mut());
            }
            info!("SM finished");
        });

    let _ = session.session_thread.insert(thread.unwrap());
    session
}

////////////////////////////////////////////////////////////////////////////////
// ## General Purpose Data types
// Structs and methods are designed to match the signatures in the W3C pseudo
// code.

/// ## General Purpose List type, as used in the W3C algorithm.
#[derive(Clone)]
pub struct List<T: Clone> {
    data: Vec<T>,
}

impl<T: Clone + PartialEq> Default for List<T> {
    fn default() -> Self {
        List::new()
    }
}

impl<T: Clone + PartialEq> List<T> {
    pub fn new() -> List<T> {
        List {
            data: Default::default(),
        }
    }

    /// Extension to create a list from an array.
    pub fn from_array(l: &[T]) -> List<T> {
        List { data: l.to_vec() }
    }

    /// Extension to return the current size of the list.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Extension to add an element at the end of the list.
    pub fn push(&mut self, t: T) {
        self.data.push(t);
    }

    /// Extension to merge the specified set into this list.
    pub fn push_set(&mut self, l: &OrderedSet<T>) {
        for i in l.data.iter() {
            self.data.push((*i).clone());
        }
    }

    /// *W3C says*: Returns the head of the list.
    pub fn head(&self) -> &T {
        self.data.first().unwrap()
    }

    /// *W3C says*:
    /// Returns the tail of the list (i.e., the rest of the list once the head is removed)
    pub fn tail(&self) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.remove(0);
        t
    }

    /// *W3C says*:
    /// Returns the list appended with l
    pub fn append(&self, l: &List<T>) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    /// *W3C says*:
    /// Returns the list appended with l
    pub fn append_set(&self, l: &OrderedSet<T>) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    /// *W3C says*:
    /// Returns the list of elements that satisfy the predicate f
    /// # Actual Implementation:
    /// Can't name the function "filter" because this gets in conflict with
    /// the pre-defined "filter" that is introduced by the Iterator-implementation.
    pub fn filter_by(&self, f: &dyn Fn(&T) -> bool) -> List<T> {
        let mut t = List::new();

        for i in self.data.iter() {
            if f(i) {
                t.data.push((*i).clone());
            }
        }
        t
    }

    /// *W3C says*:
    /// Returns true if some element in the list satisfies the predicate f.
    /// Returns false for an empty list.
    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if f(si) {
                return true;
            }
        }
        false
    }

    /// *W3C says*:
    /// Returns true if every element in the list satisfies the predicate f.
    /// Returns true for an empty list.
    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if !f(si) {
                return false;
            }
        }
        true
    }

    /// Returns a sorted copy of the list.
    pub fn sort<F>(&self, compare: &F) -> List<T>
    where
        F: Fn(&T, &T) -> std::cmp::Ordering + ?Sized,
    {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.sort_by(compare);
        t
    }

    /// Extension to support "for in" semantics.
    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }

    /// Returns the last element as mutable reference.
    pub fn last_mut(&mut self) -> &mut T {
        self.data.last_mut().unwrap()
    }

    /// Extension to support conversion to ordered sets.\
    /// Returns a new OrderedSet with copies of the elements in this list.
    /// Duplicates are removed.
    pub fn to_set(&self) -> OrderedSet<T> {
        let mut s = OrderedSet::new();
        for e in self.data.iter() {
            s.add(e.clone());
        }
        s
    }
}

/// Set datatype used by the algorithm.
/// *W3C says*:
/// Note that the algorithm assumes a Lisp-like semantics in which the empty
/// Set null is equivalent to boolean 'false' and all other entities are
/// equivalent to 'true'.
#[derive(Debug, Clone)]
pub struct OrderedSet<T> {
    pub(crate) data: Vec<T>,
}

impl<T: Clone + PartialEq> Default for OrderedSet<T> {
    fn default() -> Self {
        OrderedSet::new()
    }
}

impl<T: Clone + PartialEq> OrderedSet<T> {
    pub fn new() -> OrderedSet<T> {
        OrderedSet {
            data: Default::default(),
        }
    }

    pub fn from_array(l: &[T]) -> OrderedSet<T> {
        OrderedSet { data: l.to_vec() }
    }

    /// Extension: The size (only informational)
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// *W3C says*:
    /// Adds e to the set if it is not already a member
    pub fn add(&mut self, e: T) {
        if !self.data.contains(&e) {
            self.data.push(e);
        }
    }

    /// *W3C says*:
    /// Deletes e from the set
    pub fn delete(&mut self, e: &T) {
        self.data.retain(|x| *x != *e);
    }

    /// *W3C says*:
    /// Adds all members of s that are not already members of the set
    /// (s must also be an OrderedSet)
    pub fn union(&mut self, s: &OrderedSet<T>) {
        for si in &s.data {
            if !self.isMember(si) {
                self.add(si.clone());
            }
        }
    }

    /// *W3C says*:
    /// Is e a member of set?
    #[allow(non_snake_case)]
    pub fn isMember(&self, e: &T) -> bool {
        self.data.contains(e)
    }

    /// *W3C says*:
    /// Returns true if some element in the set satisfies the predicate f.
    ///
    /// Returns false for an empty set.
    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if f(si) {
                return true;
            }
        }
        false
    }

    /// *W3C says*:
    /// Returns true if every element in the set satisfies the predicate f.
    ///
    /// Returns true for an empty set.
    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        for si in &self.data {
            if !f(si) {
                return false;
            }
        }
        true
    }

    /// *W3C says*:
    /// Returns true if this set and set s have at least one member in common
    #[allow(non_snake_case)]
    pub fn hasIntersection(&self, s: &OrderedSet<T>) -> bool {
        for si in &self.data {
            if s.isMember(si) {
                return true;
            }
        }
        false
    }

    /// *W3C says*:
    /// Is the set empty?
    #[allow(non_snake_case)]
    pub fn isEmpty(&self) -> bool {
        self.size() == 0
    }

    /// *W3C says*:
    /// Remove all elements from the set (make it empty)
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// *W3C says*:
    /// Converts the set to a list that reflects the order in which elements
    /// were originally added.
    #[allow(non_snake_case)]
    pub fn toList(&self) -> List<T> {
        let mut l = List::new();
        for e in self.data.iter() {
            l.push(e.clone());
        }
        l
    }

    pub fn sort<F>(&self, compare: &F) -> List<T>
    where
        F: Fn(&T, &T) -> std::cmp::Ordering + ?Sized,
    {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.sort_by(compare);
        t
    }

    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// Queue datatype used by the algorithm
#[derive(Debug)]
pub struct Queue<T> {
    data: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        Queue {
            data: VecDeque::new(),
        }
    }

    /// Extension to re-use existing instances.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// *W3C says*:
    /// Puts e last in the queue
    pub fn enqueue(&mut self, e: T) {
        self.data.push_back(e);
    }

    /// *W3C says*:
    /// Removes and returns first element in queue
    pub fn dequeue(&mut self) -> T {
        self.data.pop_front().unwrap()
    }

    /// *W3C says*:
    /// Is the queue empty?
    #[allow(non_snake_case)]
    pub fn isEmpty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Blocking queue backed by a channel, used for the external event queue.
/// Enqueue is safe for timers and peer sessions (multi-producer).
#[derive(Debug)]
pub struct BlockingQueue<T> {
    pub sender: Sender<T>,
    pub receiver: Arc<Mutex<Receiver<T>>>,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> BlockingQueue<T> {
        let (sender, receiver) = channel();
        BlockingQueue {
            receiver: Arc::new(Mutex::new(receiver)),
            sender,
        }
    }

    /// *W3C says*:
    /// Puts e last in the queue
    pub fn enqueue(&mut self, e: T) {
        let _ = self.sender.send(e);
    }

    /// *W3C says*:
    /// Removes and returns first element in queue, blocks if queue is empty
    pub fn dequeue(&mut self) -> T {
        self.receiver.lock().unwrap().recv().unwrap()
    }
}

/// *W3C says*:
/// table\[foo\] returns the value associated with foo.
/// table\[foo\] = bar sets the value associated with foo to be bar.
/// # Actual implementation:
/// Instead of the operators, methods are used.
#[derive(Debug)]
pub struct HashTable<K, T> {
    data: HashMap<K, T>,
}

impl<K: Eq + Hash + Clone, T: Clone> Default for HashTable<K, T> {
    fn default() -> Self {
        HashTable::new()
    }
}

impl<K: Eq + Hash + Clone, T: Clone> HashTable<K, T> {
    pub fn new() -> HashTable<K, T> {
        HashTable {
            data: HashMap::new(),
        }
    }

    /// Extension to re-use existing instances.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn put(&mut self, k: K, v: &T) {
        self.data.insert(k, v.clone());
    }

    pub fn put_move(&mut self, k: K, v: T) {
        self.data.insert(k, v);
    }

    pub fn put_all(&mut self, t: &HashTable<K, T>) {
        for (k, v) in &t.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn has(&self, k: K) -> bool {
        self.data.contains_key(&k)
    }

    pub fn get(&self, k: K) -> &T {
        self.data.get(&k).unwrap()
    }
}

/////////////////////////////////////////////////////////////
// FSM model (State etc, representing the XML-data-model)

pub type Name = String;
pub type StateId = u32;
pub type DocumentId = u32;
pub type ExecutableContentId = u32;
pub type TransitionId = u32;
pub type SessionId = u32;
pub type InvokeId = String;
pub type StateNameMap = HashMap<Name, StateId>;
pub type TransitionMap = HashMap<TransitionId, Transition>;
pub type EventSender = Sender<Box<Event>>;

/// Datamodel binding type. See [W3C SCXML Data Binding](https://www.w3.org/TR/scxml/#DataBinding)
#[derive(Debug, Clone, PartialEq, Copy)]
pub enum BindingType {
    Early,
    Late,
}

impl FromStr for BindingType {
    type Err = ();

    fn from_str(input: &str) -> Result<BindingType, Self::Err> {
        match input.to_lowercase().as_str() {
            "early" => Ok(BindingType::Early),
            "late" => Ok(BindingType::Late),
            _ => Err(()),
        }
    }
}

/// Event type.
#[derive(Debug, Clone, PartialEq, Copy)]
pub enum EventType {
    /// for events raised by the platform itself, such as error events
    platform,
    /// for events raised by \<raise\> and \<send\> with target '_internal'
    internal,
    /// for all other events
    external,
}

impl EventType {
    pub fn name(&self) -> &'static str {
        match self {
            EventType::platform => "platform",
            EventType::internal => "internal",
            EventType::external => "external",
        }
    }
}

/// *W3C says*:
/// ## The Internal Structure of Events.
/// Events have an internal structure which is reflected in the _event
/// variable. This variable can be accessed to condition transitions (via
/// boolean expressions in the 'cond' attribute) or to update the data model
/// (via \<assign\>), etc.
///
/// The SCXML Processor must ensure that the following fields are present in
/// all events, whether internal or external: name, type, sendid, origin,
/// origintype, invokeid and data.
#[derive(Debug, Clone)]
pub struct Event {
    /// Dot separated event name, matched against the 'event' attribute of
    /// \<transition\>.
    pub name: String,
    pub etype: EventType,
    pub sendid: Option<String>,
    pub origin: Option<String>,
    pub origin_type: Option<String>,
    pub invoke_id: Option<InvokeId>,

    /// Name-Value pairs from \<param\> elements and 'namelist'.
    pub param_values: Option<HashMap<String, Data>>,

    /// Content from a \<content\> element.
    pub content: Option<Data>,
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Event {
    pub fn new_simple(name: &str) -> Event {
        Event {
            name: name.to_string(),
            etype: EventType::external,
            sendid: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            param_values: None,
            content: None,
        }
    }

    pub fn new(
        prefix: &str,
        id: &str,
        data_params: Option<HashMap<String, Data>>,
        data_content: Option<Data>,
    ) -> Event {
        Event {
            name: format!("{}{}", prefix, id),
            etype: EventType::external,
            sendid: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            param_values: data_params,
            content: data_content,
        }
    }

    /// The sentinel that terminates a session. Posted by
    /// [ScxmlSession::cancel] or by the parent session on invoke
    /// cancellation.
    pub fn cancel_session() -> Event {
        let mut e = Event::new_simple(EVENT_CANCEL_SESSION);
        e.etype = EventType::platform;
        e
    }

    pub(crate) fn internal_arrived() -> Event {
        let mut e = Event::new_simple(EVENT_INTERNAL_ARRIVED);
        e.etype = EventType::platform;
        e
    }

    /// *W3C says*: Indicates that an error internal to the execution of the
    /// document has occurred, such as one arising from expression evaluation.
    pub fn error_execution(send_id: &Option<String>, invoke_id: &Option<InvokeId>) -> Event {
        Event {
            name: "error.execution".to_string(),
            etype: EventType::platform,
            sendid: send_id.clone(),
            origin: None,
            origin_type: None,
            invoke_id: invoke_id.clone(),
            param_values: None,
            content: None,
        }
    }

    /// *W3C says*: Indicates that an error has occurred while trying to
    /// communicate with an external entity.
    pub fn error_communication(event: &Event) -> Event {
        Event {
            name: "error.communication".to_string(),
            etype: EventType::platform,
            sendid: event.sendid.clone(),
            origin: None,
            origin_type: None,
            invoke_id: event.invoke_id.clone(),
            param_values: None,
            content: None,
        }
    }

    pub fn get_copy(&self) -> Box<Event> {
        Box::new(self.clone())
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct CommonContent {
    /// Content inside the \<content\> child.
    pub content: Option<String>,

    /// The expr-attribute of the \<content\> child.
    pub content_expr: Option<String>,
}

impl Default for CommonContent {
    fn default() -> Self {
        CommonContent::new()
    }
}

impl CommonContent {
    pub fn new() -> CommonContent {
        CommonContent {
            content: None,
            content_expr: None,
        }
    }
}

/// Stores \<param\> elements of \<send\>, \<donedata\> or \<invoke\>.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub expr: String,
    pub location: String,
}

pub type OptionalParams = Option<Vec<Parameter>>;

pub fn push_param(params: &mut OptionalParams, param: Parameter) {
    match params {
        Some(p) => p.push(param),
        None => {
            let _ = params.insert(vec![param]);
        }
    }
}

/// *W3C says*:
/// The \<invoke\> element is used to create an instance of an external service.
#[derive(Clone, PartialEq)]
pub struct Invoke {
    pub doc_id: DocumentId,

    /// *W3C says*:
    /// Attribute 'idlocation':\
    /// Any data model expression evaluating to a data model location.\
    /// Must not occur with the 'id' attribute.
    pub external_id_location: String,

    /// *W3C says*:
    /// Attribute 'type':\
    /// A URI specifying the type of the external service.
    pub type_name: String,

    /// *W3C says*:
    /// Attribute 'typeexpr':\
    /// A dynamic alternative to 'type'.
    pub type_expr: String,

    /// *W3C says*:
    /// List of valid location expressions
    pub name_list: Vec<String>,

    /// *W3C says*:
    /// A URI to be passed to the external service.\
    /// Must not occur with the 'srcexpr' attribute or the \<content\> element.
    pub src: String,

    /// *W3C says*:
    /// A dynamic alternative to 'src'.
    pub src_expr: String,

    /// *W3C says*:
    /// A flag indicating whether to forward events to the invoked process.
    pub autoforward: bool,

    /// *W3C says*:
    /// Executable content to massage the data returned from the invoked
    /// component. Occurs 0 or 1 times.
    pub finalize: ExecutableContentId,

    /// Invoke-id from the "id" attribute. If empty, an id is generated when
    /// the element is evaluated.
    pub invoke_id: String,

    /// Set if the element was structurally malformed (e.g. both 'id' and
    /// 'idlocation'). Raised as "error.execution.invoke.parseerror" when the
    /// element is evaluated.
    pub parse_error: Option<String>,

    pub parent_state_name: String,

    /// \<param\> children
    pub params: OptionalParams,

    pub content: Option<CommonContent>,
}

impl Default for Invoke {
    fn default() -> Self {
        Invoke::new()
    }
}

impl Invoke {
    pub fn new() -> Invoke {
        Invoke {
            doc_id: 0,
            invoke_id: "".to_string(),
            parse_error: None,
            parent_state_name: "".to_string(),
            external_id_location: "".to_string(),
            type_name: "".to_string(),
            type_expr: "".to_string(),
            name_list: vec![],
            src: "".to_string(),
            src_expr: "".to_string(),
            autoforward: false,
            params: None,
            content: None,
            finalize: 0,
        }
    }
}

impl Debug for Invoke {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoke")
            .field("invokeId", &self.invoke_id)
            .field("idlocation", &self.external_id_location)
            .field("type", &self.type_name)
            .field("src", &self.src)
            .field("autoforward", &self.autoforward)
            .finish()
    }
}

/// Runtime state of one running \<invoke\>.
#[derive(Debug, Clone)]
pub struct InvokeMeta {
    pub state_id: StateId,
    pub finalize: ExecutableContentId,
    pub autoforward: bool,
}

/// Holds the attributes of a \<cancel\> element.
pub struct Cancel {
    pub send_id: String,
    pub send_id_expr: String,
}

impl Default for Cancel {
    fn default() -> Self {
        Cancel::new()
    }
}

impl Cancel {
    pub fn new() -> Cancel {
        Cancel {
            send_id: String::new(),
            send_id_expr: String::new(),
        }
    }
}

impl Debug for Cancel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("send_id", &self.send_id)
            .field("send_id_expr", &self.send_id_expr)
            .finish()
    }
}

/// Holds all parameters of a \<send\> call.
pub struct SendParameters {
    /// SCXML \<send\> attribute 'idlocation'.
    pub name_location: String,
    /// SCXML \<send\> attribute 'id'.
    pub name: String,
    /// SCXML \<send\> attribute 'event'.
    pub event: String,
    /// SCXML \<send\> attribute 'eventexpr'.
    pub event_expr: String,
    /// SCXML \<send\> attribute 'target'.
    pub target: String,
    /// SCXML \<send\> attribute 'targetexpr'.
    pub target_expr: String,
    /// SCXML \<send\> attribute 'type'.
    pub type_value: String,
    /// SCXML \<send\> attribute 'typeexpr'.
    pub type_expr: String,
    /// SCXML \<send\> attribute 'delay' in milliseconds.
    pub delay_ms: u64,
    /// SCXML \<send\> attribute 'delayexpr'.
    pub delay_expr: String,
    /// SCXML \<send\> attribute 'namelist'.
    /// Must not be specified in conjunction with 'content'.
    pub name_list: Vec<String>,
    /// \<param\> children
    pub params: OptionalParams,
    pub content: Option<CommonContent>,
}

impl Default for SendParameters {
    fn default() -> Self {
        SendParameters::new()
    }
}

impl SendParameters {
    pub fn new() -> SendParameters {
        SendParameters {
            name_location: "".to_string(),
            name: "".to_string(),
            event: "".to_string(),
            event_expr: "".to_string(),
            target: "".to_string(),
            target_expr: "".to_string(),
            type_value: "".to_string(),
            type_expr: "".to_string(),
            delay_ms: 0,
            delay_expr: "".to_string(),
            name_list: vec![],
            params: None,
            content: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DoneData {
    /// Content of the \<content\> child.
    pub content: Option<CommonContent>,

    /// \<param\> children.
    pub params: OptionalParams,
}

impl Default for DoneData {
    fn default() -> Self {
        DoneData::new()
    }
}

impl DoneData {
    pub fn new() -> DoneData {
        DoneData {
            content: None,
            params: None,
        }
    }
}

/// *W3C says*:
/// ## Global variables
/// The following variables are global from the point of view of the algorithm.
/// Their values will be set in the procedure interpret().
/// # Actual Implementation
/// In the W3C algorithm the datamodel is simply a global variable. As the
/// datamodel needs access to other global variables, most global data is
/// moved to this struct that is owned by the datamodel and shared via
/// [GlobalDataArc](crate::datamodel::GlobalDataArc).
#[allow(non_snake_case)]
pub struct GlobalData {
    pub executor: Option<Box<FsmExecutor>>,
    pub configuration: OrderedSet<StateId>,
    pub statesToInvoke: OrderedSet<StateId>,
    pub historyValue: HashTable<StateId, OrderedSet<StateId>>,
    pub running: bool,

    /// True once the interpreter has terminated, by a top-level final state
    /// or by cancellation.
    pub exited: bool,

    pub(crate) internalQueue: Queue<Event>,
    pub externalQueue: BlockingQueue<Box<Event>>,

    /// Event-I/O-Processors of this session, by type name.
    pub io_processors: HashMap<String, Arc<Mutex<Box<dyn EventIOProcessor>>>>,

    /// Invoked sessions. Key: InvokeId.
    pub child_sessions: HashMap<InvokeId, ScxmlSession>,

    /// Runtime data of the currently active invokes.
    pub active_invokes: HashMap<InvokeId, InvokeMeta>,

    /// Set if this FSM was created as result of some \<invoke\>.
    pub caller_invoke_id: Option<InvokeId>,
    pub parent_session_id: Option<SessionId>,

    /// Unique id of the owning session.
    pub session_id: SessionId,

    /// Public name of the owning session, bound to "_sessionid".
    /// Children get "parent-name.invokeid".
    pub session_name: String,

    /// Id to scxml-id mapping, for configuration lookups from outside.
    pub state_names: HashMap<StateId, Name>,

    /// The most recently dequeued event.
    pub current_event: Option<Box<Event>>,

    /// Pending delayed sends, keyed by send-id.
    pub timers: Box<dyn Scheduler>,

    /// Sink for \<log\> output. Defaults to the log crate.
    pub log_function: Option<Box<dyn FnMut(&str, &str) + Send>>,

    /// Contains the final configuration after the session terminated.
    pub final_configuration: Option<Vec<String>>,
}

impl Default for GlobalData {
    fn default() -> Self {
        GlobalData::new()
    }
}

impl GlobalData {
    pub fn new() -> GlobalData {
        GlobalData {
            executor: None,
            configuration: OrderedSet::new(),
            historyValue: HashTable::new(),
            running: false,
            exited: false,
            statesToInvoke: OrderedSet::new(),
            internalQueue: Queue::new(),
            externalQueue: BlockingQueue::new(),
            io_processors: HashMap::new(),
            child_sessions: HashMap::new(),
            active_invokes: HashMap::new(),
            caller_invoke_id: None,
            parent_session_id: None,
            session_id: 0,
            session_name: String::new(),
            state_names: HashMap::new(),
            current_event: None,
            timers: Box::new(TimerScheduler::new()),
            log_function: None,
            final_configuration: None,
        }
    }

    pub fn enqueue_internal(&mut self, event: Event) {
        self.internalQueue.enqueue(event);
        // In case the FSM waits on the external queue, wake it up.
        self.externalQueue
            .enqueue(Box::new(Event::internal_arrived()));
    }
}

/// Represents a running session.
/// Holds the channel-sender to the external queue and shared access to the
/// global data of the session.
pub struct ScxmlSession {
    pub session_id: SessionId,
    pub session_name: String,
    pub session_thread: Option<JoinHandle<()>>,
    pub sender: EventSender,
    /// Global data should be accessed with care while the FSM is running,
    /// locks are shared with the interpreter thread.
    pub global_data: GlobalDataArc,
}

impl ScxmlSession {
    pub fn new_without_join_handle(
        id: SessionId,
        name: &str,
        sender: EventSender,
    ) -> ScxmlSession {
        ScxmlSession {
            session_id: id,
            session_name: name.to_string(),
            session_thread: None,
            sender,
            global_data: GlobalDataArc::new(),
        }
    }

    /// Pushes an event to the external queue of this session.
    /// A no-op if the session already terminated.
    pub fn send_event(&self, event: Event) -> bool {
        self.sender.send(Box::new(event)).is_ok()
    }

    /// Sends a named external event, `data` ends up in `_event.data`.
    pub fn send(&self, name: &str, data: Option<Data>) -> bool {
        let mut event = Event::new_simple(name);
        event.content = data;
        self.send_event(event)
    }

    /// Stops the session: all states in the current configuration execute
    /// their onexit blocks, pending timers and child invokes are cancelled.
    /// The session no longer accepts events afterwards.
    pub fn cancel(&self) {
        self.global_data.lock().running = false;
        let _ = self.sender.send(Box::new(Event::cancel_session()));
    }

    /// True if the session reached a top-level final state or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.global_data.lock().exited
    }

    /// True if the state with the given scxml-id is in the current
    /// configuration.
    pub fn in_state(&self, state_name: &str) -> bool {
        let global = self.global_data.lock();
        global
            .configuration
            .iterator()
            .any(|sid| match global.state_names.get(sid) {
                Some(name) => name == state_name,
                None => false,
            })
    }

    /// The configuration at termination, None while the session is running.
    pub fn final_configuration(&self) -> Option<Vec<String>> {
        self.global_data.lock().final_configuration.clone()
    }
}

impl Clone for ScxmlSession {
    fn clone(&self) -> Self {
        ScxmlSession {
            session_id: self.session_id,
            session_name: self.session_name.clone(),
            session_thread: None,
            sender: self.sender.clone(),
            global_data: self.global_data.clone(),
        }
    }
}

/// The FSM implementation, according to the W3C proposal.
#[allow(non_snake_case)]
pub struct Fsm {
    pub tracer: Box<dyn Tracer>,
    pub datamodel: String,

    pub binding: BindingType,
    pub version: String,
    pub statesNames: StateNameMap,
    pub executableContent: HashMap<ExecutableContentId, Vec<Box<dyn ExecutableContent>>>,

    pub name: String,

    /// True if the document declared exmode='strict'.
    pub strict_mode: bool,

    /// An FSM can have multiple initial-target-states, so this state may be
    /// artificial. The reader has to generate a parent state if needed.
    /// This state also serves as the \<scxml\> element.
    pub pseudo_root: StateId,

    /// The only real storage of states, identified by the id - the one based
    /// index into the vector. If a state has no declared id, one is generated.
    pub states: Vec<State>,
    pub transitions: TransitionMap,

    /// The global script, executed at startup.
    pub script: ExecutableContentId,

    /// Set if this FSM was created as result of some \<invoke\>.
    pub caller_invoke_id: Option<InvokeId>,
    pub parent_session_id: Option<SessionId>,

    /// Values that override matching \<data\> declarations at startup.
    /// Filled from invoke params or by the embedder.
    pub initData: HashMap<String, Data>,
}

impl Debug for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fsm{{v:{} root:{} states:",
            self.version, self.pseudo_root
        )?;
        display_state_vec(&self.states, f)?;
        write!(f, "}}")
    }
}

fn display_state_vec(sm: &Vec<State>, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    let mut first = true;
    for e in sm {
        if first {
            first = false;
        } else {
            write!(f, ",")?;
        }
        write!(f, "{}", *e)?;
    }
    write!(f, "}}")
}

impl Default for Fsm {
    fn default() -> Self {
        Fsm::new()
    }
}

impl Fsm {
    pub fn new() -> Fsm {
        Fsm {
            tracer: Box::new(DefaultTracer::new()),
            datamodel: String::new(),
            states: Vec::new(),
            transitions: HashMap::new(),
            pseudo_root: 0,
            caller_invoke_id: None,
            parent_session_id: None,
            name: "".to_string(),
            strict_mode: false,
            script: 0,
            version: "1.0".to_string(),
            binding: BindingType::Early,
            statesNames: StateNameMap::new(),
            executableContent: HashMap::new(),
            initData: HashMap::new(),
        }
    }

    pub fn get_state_by_name(&self, name: &str) -> &State {
        self.get_state_by_id(*self.statesNames.get(name).unwrap())
    }

    pub fn get_state_by_name_mut(&mut self, name: &str) -> &mut State {
        self.get_state_by_id_mut(*self.statesNames.get(name).unwrap())
    }

    /// Gets a state by id. The id MUST exist.
    pub fn get_state_by_id(&self, state_id: StateId) -> &State {
        self.states.get((state_id - 1) as usize).unwrap()
    }

    /// Gets a mutable state by id. The id MUST exist.
    pub fn get_state_by_id_mut(&mut self, state_id: StateId) -> &mut State {
        self.states.get_mut((state_id - 1) as usize).unwrap()
    }

    pub fn get_transition_by_id(&self, transition_id: TransitionId) -> &Transition {
        self.transitions.get(&transition_id).unwrap()
    }

    pub fn get_transition_by_id_mut(&mut self, transition_id: TransitionId) -> &mut Transition {
        self.transitions.get_mut(&transition_id).unwrap()
    }

    fn state_document_order(&self, sid1: &StateId, sid2: &StateId) -> std::cmp::Ordering {
        let d1 = self.get_state_by_id(*sid1).doc_id;
        let d2 = self.get_state_by_id(*sid2).doc_id;
        d1.cmp(&d2)
    }

    fn state_entry_order(&self, s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
        // Same as document order
        self.state_document_order(s1, s2)
    }

    fn state_exit_order(&self, s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
        // Reverse document order
        self.state_document_order(s2, s1)
    }

    fn transition_document_order(t1: &&Transition, t2: &&Transition) -> std::cmp::Ordering {
        t1.doc_id.cmp(&t2.doc_id)
    }

    fn invoke_document_order(i1: &Invoke, i2: &Invoke) -> std::cmp::Ordering {
        i1.doc_id.cmp(&i2.doc_id)
    }

    /// *W3C says*:
    /// The purpose of this procedure is to initialize the interpreter and to
    /// start processing.
    ///
    /// Initialize the global data structures, including the data model. If
    /// binding is set to 'early', initialize the data model. Then execute the
    /// global \<script\> element, if any. Finally, call enterStates on the
    /// initial configuration, set the global running variable to true and
    /// start the interpreter's event loop.
    /// ```ignore
    /// procedure interpret(doc):
    ///     if not valid(doc): failWithError()
    ///     expandScxmlSource(doc)
    ///     configuration = new OrderedSet()
    ///     statesToInvoke = new OrderedSet()
    ///     internalQueue = new Queue()
    ///     externalQueue = new BlockingQueue()
    ///     historyValue = new HashTable()
    ///     datamodel = new Datamodel(doc)
    ///     if doc.binding == "early":
    ///         initializeDatamodel(datamodel, doc)
    ///     running = true
    ///     executeGlobalScriptElement(doc)
    ///     enterStates([doc.initial.transition])
    ///     mainEventLoop()
    /// ```
    pub fn interpret(&mut self, datamodel: &mut dyn Datamodel) {
        if !self.valid() {
            self.failWithError();
            return;
        }
        datamodel.clear();
        {
            let mut global = get_global!(datamodel);
            global.internalQueue.clear();
            global.historyValue.clear();
            global.running = true;
        }
        // Declares all data ids and, with early binding, initializes them.
        datamodel.initializeDataModel(self, self.pseudo_root);
        datamodel.add_functions(self);

        for (key, value) in &self.initData {
            if datamodel.has_location(key) {
                datamodel.set(key, value.clone());
            }
        }

        self.executeGlobalScriptElement(datamodel);

        let mut initial_states = List::new();
        let initial_transition = self.get_state_by_id(self.pseudo_root).initial;
        if initial_transition != 0 {
            initial_states.push(initial_transition);
        }
        self.enterStates(datamodel, &initial_states);
        self.mainEventLoop(datamodel);

        // Session cleanup.
        let mut global = get_global!(datamodel);
        global.timers.cancel_all();
        global.exited = true;
        let session_id = global.session_id;
        if let Some(executor) = global.executor.as_ref() {
            executor.remove_session(session_id);
        }
    }

    /// # Actual implementation:
    /// Checks if all state references are resolved (all states have a
    /// document-id).
    fn valid(&self) -> bool {
        for state in &self.states {
            if state.doc_id == 0 {
                error!("Referenced state '{}' is not declared", state.name);
                return false;
            }
        }
        true
    }

    #[allow(non_snake_case)]
    fn failWithError(&self) {
        error!("FSM has failed");
    }

    #[allow(non_snake_case)]
    fn executeGlobalScriptElement(&self, datamodel: &mut dyn Datamodel) {
        if self.script != 0 {
            datamodel.executeContent(self, self.script);
        }
    }

    /// *W3C says*:
    /// ## procedure mainEventLoop()
    /// This loop runs until we enter a top-level final state or an external
    /// entity cancels processing. In either case 'running' will be set to
    /// false (see EnterStates, below, for termination by entering a top-level
    /// final state).
    ///
    /// Each iteration through the loop consists of four main steps:
    /// 1) Complete the macrostep by repeatedly taking any internally enabled
    ///    transitions, namely those that don't require an event or that are
    ///    triggered by an internal event.
    /// 2) When there are no more internally enabled transitions available,
    ///    the macrostep is done. Execute any \<invoke\> tags for states that
    ///    we entered on the last iteration through the loop.
    /// 3) If any internal events have been generated by the invokes, repeat
    ///    step 1 to handle any errors raised by the \<invoke\> elements.
    /// 4) When the internal event queue is empty, wait for an external event
    ///    and then execute any transitions that it triggers. However special
    ///    preliminary processing is applied to the event if the state has
    ///    executed any \<invoke\> elements. First, if this event was generated
    ///    by an invoked process, apply \<finalize\> processing to it.
    ///    Secondly, if any \<invoke\> elements have autoforwarding set,
    ///    forward the event to them. These steps apply before the transitions
    ///    are taken.
    ///
    /// This event loop thus enforces run-to-completion semantics, in which
    /// the system processes an external event and then takes all the
    /// 'follow-up' transitions that the processing has enabled before looking
    /// for another external event.
    #[allow(non_snake_case)]
    fn mainEventLoop(&mut self, datamodel: &mut dyn Datamodel) {
        while get_global!(datamodel).running {
            let mut enabledTransitions;
            let mut macrostepDone = false;
            // Here we handle eventless transitions and transitions triggered
            // by internal events until the macrostep is complete
            while get_global!(datamodel).running && !macrostepDone {
                enabledTransitions = self.selectEventlessTransitions(datamodel);
                if enabledTransitions.isEmpty() {
                    if get_global!(datamodel).internalQueue.isEmpty() {
                        macrostepDone = true;
                    } else {
                        let internalEvent = get_global!(datamodel).internalQueue.dequeue();
                        self.tracer.event_internal_received(&internalEvent);
                        get_global!(datamodel).current_event =
                            Some(internalEvent.get_copy());
                        datamodel.set_event(&internalEvent);
                        enabledTransitions = self.selectTransitions(datamodel, &internalEvent);
                    }
                }
                if !enabledTransitions.isEmpty() {
                    self.microstep(datamodel, &enabledTransitions.toList())
                }
            }
            // either we're in a final state, and we break out of the loop
            if !get_global!(datamodel).running {
                break;
            }
            // or we've completed a macrostep, so we start a new macrostep by
            // waiting for an external event.
            // Here we invoke whatever needs to be invoked.
            let sortedStatesToInvoke = get_global!(datamodel)
                .statesToInvoke
                .sort(&|s1, s2| self.state_entry_order(s1, s2));
            for sid in sortedStatesToInvoke.iterator() {
                let invokes = self
                    .get_state_by_id(*sid)
                    .invoke
                    .sort(&Fsm::invoke_document_order);
                for inv in invokes.iterator() {
                    self.invoke(datamodel, *sid, inv);
                }
            }

            let externalEvent;
            {
                let externalQueue_receiver = {
                    let mut global_lock = get_global!(datamodel);
                    global_lock.statesToInvoke.clear();
                    // Invoking may have raised internal error events,
                    // we iterate to handle them
                    if !global_lock.internalQueue.isEmpty() {
                        continue;
                    }
                    global_lock.externalQueue.receiver.clone()
                };

                // A blocking wait for an external event. Alternatively, if we
                // have been invoked, our parent session also might cancel us.
                let received = externalQueue_receiver.lock().unwrap().recv();
                externalEvent = match received {
                    Ok(event) => event,
                    Err(_) => {
                        // All senders are gone, nothing can arrive anymore.
                        get_global!(datamodel).running = false;
                        continue;
                    }
                };
                if self.isCancelEvent(&externalEvent) {
                    get_global!(datamodel).running = false;
                    continue;
                }
                if externalEvent.name.eq(EVENT_INTERNAL_ARRIVED) {
                    // Some internal event arrived while we were blocked.
                    continue;
                }
            }
            self.tracer.event_external_received(&externalEvent);

            let mut toFinalize: Vec<ExecutableContentId> = Vec::new();
            let mut toForward: Vec<InvokeId> = Vec::new();
            {
                let global = get_global!(datamodel);
                for (invoke_id, meta) in &global.active_invokes {
                    if let Some(event_invoke_id) = &externalEvent.invoke_id {
                        if invoke_id == event_invoke_id && meta.finalize != 0 {
                            toFinalize.push(meta.finalize);
                        }
                    }
                    if meta.autoforward {
                        toForward.push(invoke_id.clone());
                    }
                }
            }
            get_global!(datamodel).current_event = Some(externalEvent.clone());
            datamodel.set_event(&externalEvent);
            for finalizeContentId in toFinalize {
                // applyFinalize
                self.executeContent(datamodel, finalizeContentId);
            }
            for invokeId in toForward {
                // W3C: When the 'autoforward' attribute is set to true, the SCXML
                // Processor must send an exact copy of every external event it
                // receives to the invoked process. The SCXML Processor must forward
                // the event at the point at which it removes it from the external
                // event queue of the invoking session for processing.
                let session_sender = get_global!(datamodel)
                    .child_sessions
                    .get(&invokeId)
                    .map(|session| session.sender.clone());
                if let Some(sender) = session_sender {
                    let _ = sender.send(externalEvent.clone());
                }
            }

            let enabledTransitions = self.selectTransitions(datamodel, &externalEvent);
            if !enabledTransitions.isEmpty() {
                self.microstep(datamodel, &enabledTransitions.toList());
            }
        }
        // If we get here, we have reached a top-level final state or have
        // been cancelled.
        self.exitInterpreter(datamodel);
    }

    /// *W3C says*:
    /// # procedure exitInterpreter()
    /// The purpose of this procedure is to exit the current SCXML process by
    /// exiting all active states. If the machine is in a top-level final
    /// state, a Done event is generated. (Note that in this case, the final
    /// state will be the only active state.) The implementation of
    /// returnDoneEvent is platform-dependent, but if this session is the
    /// result of an \<invoke\> in another SCXML session, returnDoneEvent will
    /// cause the event done.invoke.\<id\> to be placed in the external event
    /// queue of that session, where \<id\> is the id generated in that
    /// session when the \<invoke\> was executed.
    /// ```ignore
    /// procedure exitInterpreter():
    ///     statesToExit = configuration.toList().sort(exitOrder)
    ///     for s in statesToExit:
    ///         for content in s.onexit.sort(documentOrder):
    ///             executeContent(content)
    ///         for inv in s.invoke:
    ///             cancelInvoke(inv)
    ///         configuration.delete(s)
    ///         if isFinalState(s) and isScxmlElement(s.parent):
    ///             returnDoneEvent(s.donedata)
    /// ```
    #[allow(non_snake_case)]
    fn exitInterpreter(&mut self, datamodel: &mut dyn Datamodel) {
        let statesToExit = {
            let mut global = get_global!(datamodel);
            let mut final_config = Vec::new();
            for sid in global.configuration.iterator() {
                final_config.push(self.get_state_by_id(*sid).name.clone());
            }
            let _ = global.final_configuration.insert(final_config);
            global
                .configuration
                .toList()
                .sort(&|s1, s2| self.state_exit_order(s1, s2))
        };

        let mut final_state_name: Option<Name> = None;
        for sid in statesToExit.iterator() {
            let onexit_id = self.get_state_by_id(*sid).onexit;
            if onexit_id != 0 {
                self.executeContent(datamodel, onexit_id);
            }
            self.cancelInvokesOfState(datamodel, *sid);
            {
                let s = self.get_state_by_id(*sid);
                self.tracer.state_exited(&s.name);
                get_global!(datamodel).configuration.delete(sid);
                if self.isFinalState(s) && self.isSCXMLElement(s.parent) {
                    final_state_name = Some(s.name.clone());
                    self.returnDoneEvent(&s.donedata.clone(), datamodel);
                }
            }
        }
        self.tracer.interpreter_exited(final_state_name.as_ref());
    }

    /// *W3C says*:
    /// The implementation of returnDoneEvent is platform-dependent, but if
    /// this session is the result of an \<invoke\> in another SCXML session,
    /// returnDoneEvent will cause the event done.invoke.\<id\> to be placed
    /// in the external event queue of that session.
    #[allow(non_snake_case)]
    fn returnDoneEvent(&self, done_data: &Option<DoneData>, datamodel: &mut dyn Datamodel) {
        let (caller_invoke_id, parent_session_id) = {
            let global = get_global!(datamodel);
            (global.caller_invoke_id.clone(), global.parent_session_id)
        };
        if let (Some(invoke_id), Some(session_id)) = (caller_invoke_id, parent_session_id) {
            let mut name_values = HashMap::new();
            let mut content = None;
            if let Some(done_data) = done_data {
                datamodel.evaluate_params(&done_data.params, &mut name_values);
                content = datamodel.evaluate_content(&done_data.content);
            }
            let param_values = if name_values.is_empty() {
                None
            } else {
                Some(name_values)
            };
            let mut event = Event::new("done.invoke.", &invoke_id, param_values, content);
            event.invoke_id = Some(invoke_id);
            let sent = {
                let global = get_global!(datamodel);
                match &global.executor {
                    Some(executor) => executor.send_to_session(session_id, event).is_ok(),
                    None => false,
                }
            };
            if !sent {
                warn!("Failed to send 'done.invoke' to the parent session");
            }
        }
    }

    /// *W3C says*:
    /// # function selectEventlessTransitions()
    /// This function selects all transitions that are enabled in the current
    /// configuration that do not require an event trigger. First find a
    /// transition with no 'event' attribute whose condition evaluates to
    /// true. If multiple matching transitions are present, take the first in
    /// document order. If none are present, search in the state's ancestors
    /// in ancestry order until one is found. As soon as such a transition is
    /// found, add it to enabledTransitions, and proceed to the next atomic
    /// state in the configuration. When all atomic states have been visited
    /// and transitions selected, filter the set of enabled transitions,
    /// removing any that are preempted by other transitions, then return the
    /// resulting set.
    #[allow(non_snake_case)]
    fn selectEventlessTransitions(
        &self,
        datamodel: &mut dyn Datamodel,
    ) -> OrderedSet<TransitionId> {
        let mut enabledTransitions: OrderedSet<TransitionId> = OrderedSet::new();
        let atomicStates = get_global!(datamodel)
            .configuration
            .toList()
            .filter_by(&|sid| -> bool { self.isAtomicStateId(sid) })
            .sort(&|s1, s2| self.state_document_order(s1, s2));
        for sid in atomicStates.iterator() {
            let mut states: List<StateId> = List::new();
            states.push(*sid);
            states.push_set(&self.getProperAncestors(*sid, 0));
            let mut condT = Vec::new();
            for s in states.iterator() {
                let state = self.get_state_by_id(*s);
                for t in self
                    .to_transition_list(&state.transitions)
                    .sort(&Fsm::transition_document_order)
                    .iterator()
                {
                    if t.events.is_empty() && !t.wildcard {
                        condT.push(t.id);
                    }
                }
            }
            for ct in condT {
                if self.conditionMatch(datamodel, ct) {
                    enabledTransitions.add(ct);
                    break;
                }
            }
        }
        self.removeConflictingTransitions(datamodel, &enabledTransitions)
    }

    /// *W3C says*:
    /// # function selectTransitions(event)
    /// The purpose of the selectTransitions() procedure is to collect the
    /// transitions that are enabled by this event in the current
    /// configuration.
    ///
    /// Create an empty set of enabledTransitions. For each atomic state, find
    /// a transition whose 'event' attribute matches event and whose condition
    /// evaluates to true. If multiple matching transitions are present, take
    /// the first in document order. If none are present, search in the
    /// state's ancestors in ancestry order until one is found. When all
    /// atomic states have been visited and transitions selected, filter out
    /// any preempted transitions and return the resulting set.
    #[allow(non_snake_case)]
    fn selectTransitions(
        &self,
        datamodel: &mut dyn Datamodel,
        event: &Event,
    ) -> OrderedSet<TransitionId> {
        let mut enabledTransitions: OrderedSet<TransitionId> = OrderedSet::new();
        let atomicStates = get_global!(datamodel)
            .configuration
            .toList()
            .filter_by(&|sid| -> bool { self.isAtomicStateId(sid) })
            .sort(&|s1, s2| self.state_document_order(s1, s2));
        for state in atomicStates.iterator() {
            let mut condT = Vec::new();
            for sid in List::from_array(&[*state])
                .append_set(&self.getProperAncestors(*state, 0))
                .iterator()
            {
                let s = self.get_state_by_id(*sid);
                for t in self
                    .to_transition_list(&s.transitions)
                    .sort(&Fsm::transition_document_order)
                    .iterator()
                {
                    if t.name_match(&event.name) {
                        condT.push(t.id);
                    }
                }
            }
            for ct in condT {
                if self.conditionMatch(datamodel, ct) {
                    enabledTransitions.add(ct);
                    break;
                }
            }
        }
        self.removeConflictingTransitions(datamodel, &enabledTransitions)
    }

    /// *W3C says*:
    /// # function removeConflictingTransitions(enabledTransitions)
    /// enabledTransitions will contain multiple transitions only if a
    /// parallel state is active. In that case, we may have one transition
    /// selected for each of its children. These transitions may conflict with
    /// each other in the sense that they have incompatible target states.
    /// The test that transitions have non-intersecting exit sets captures
    /// this requirement. When such a conflict occurs, then if the source
    /// state of one of the transitions is a descendant of the source state of
    /// the other, we select the transition in the descendant. Otherwise we
    /// prefer the transition that was selected by the earlier state in
    /// document order and discard the other transition.
    /// ```ignore
    /// function removeConflictingTransitions(enabledTransitions):
    ///     filteredTransitions = new OrderedSet()
    ///     // toList sorts the transitions in the order of the states that selected them
    ///     for t1 in enabledTransitions.toList():
    ///         t1Preempted = false
    ///         transitionsToRemove = new OrderedSet()
    ///         for t2 in filteredTransitions.toList():
    ///             if computeExitSet([t1]).hasIntersection(computeExitSet([t2])):
    ///                 if isDescendant(t1.source, t2.source):
    ///                     transitionsToRemove.add(t2)
    ///                 else:
    ///                     t1Preempted = true
    ///                     break
    ///         if not t1Preempted:
    ///             for t3 in transitionsToRemove.toList():
    ///                 filteredTransitions.delete(t3)
    ///             filteredTransitions.add(t1)
    ///     return filteredTransitions
    /// ```
    #[allow(non_snake_case)]
    fn removeConflictingTransitions(
        &self,
        datamodel: &mut dyn Datamodel,
        enabledTransitions: &OrderedSet<TransitionId>,
    ) -> OrderedSet<TransitionId> {
        let mut filteredTransitions: OrderedSet<TransitionId> = OrderedSet::new();
        for tid1 in enabledTransitions.toList().iterator() {
            let t1 = self.get_transition_by_id(*tid1);
            let mut t1Preempted = false;
            let mut transitionsToRemove = OrderedSet::new();
            let filteredTransitionList = filteredTransitions.toList();
            for tid2 in filteredTransitionList.iterator() {
                if self
                    .computeExitSet(datamodel, &List::from_array(&[*tid1]))
                    .hasIntersection(&self.computeExitSet(datamodel, &List::from_array(&[*tid2])))
                {
                    let t2 = self.get_transition_by_id(*tid2);
                    if self.isDescendant(t1.source, t2.source) {
                        transitionsToRemove.add(*tid2);
                    } else {
                        t1Preempted = true;
                        break;
                    }
                }
            }
            if !t1Preempted {
                for t3 in transitionsToRemove.toList().iterator() {
                    filteredTransitions.delete(t3);
                }
                filteredTransitions.add(*tid1);
            }
        }
        filteredTransitions
    }

    /// *W3C says*:
    /// # procedure microstep(enabledTransitions)
    /// The purpose of the microstep procedure is to process a single set of
    /// transitions. The processing of the enabled transitions must be done in
    /// parallel ('lock step') in the sense that their source states must
    /// first be exited, then their actions must be executed, and finally
    /// their target states entered.
    /// ```ignore
    /// procedure microstep(enabledTransitions):
    ///     exitStates(enabledTransitions)
    ///     executeTransitionContent(enabledTransitions)
    ///     enterStates(enabledTransitions)
    /// ```
    #[allow(non_snake_case)]
    fn microstep(&mut self, datamodel: &mut dyn Datamodel, enabledTransitions: &List<TransitionId>) {
        self.exitStates(datamodel, enabledTransitions);
        self.executeTransitionContent(datamodel, enabledTransitions);
        self.enterStates(datamodel, enabledTransitions);

        let configuration_names = {
            let global = get_global!(datamodel);
            let mut names = Vec::with_capacity(global.configuration.size());
            for sid in global.configuration.iterator() {
                names.push(self.get_state_by_id(*sid).name.clone());
            }
            names
        };
        self.tracer.configuration_changed(&configuration_names);
    }

    /// *W3C says*:
    /// # procedure exitStates(enabledTransitions)
    /// Compute the set of states to exit. Then remove all the states on
    /// statesToExit from the set of states that will have invoke processing
    /// done at the start of the next macrostep. Then convert statesToExit to
    /// a list and sort it in exitOrder.
    ///
    /// For each state s in the list, if s has a deep history state h, set the
    /// history value of h to be the list of all atomic descendants of s that
    /// are members in the current configuration, else set its value to be the
    /// list of all immediate children of s that are members of the current
    /// configuration. Again for each state s in the list, first execute any
    /// onexit handlers, then cancel any ongoing invocations, and finally
    /// remove s from the current configuration.
    #[allow(non_snake_case)]
    fn exitStates(&self, datamodel: &mut dyn Datamodel, enabledTransitions: &List<TransitionId>) {
        let statesToExit = self.computeExitSet(datamodel, enabledTransitions);

        {
            let mut global = get_global!(datamodel);
            for s in statesToExit.iterator() {
                global.statesToInvoke.delete(s);
            }
        }
        let statesToExitSorted = statesToExit.sort(&|s1, s2| self.state_exit_order(s1, s2));
        let mut ahistory: HashTable<StateId, OrderedSet<StateId>> = HashTable::new();

        {
            let global = get_global!(datamodel);
            for sid in statesToExitSorted.iterator() {
                let s = self.get_state_by_id(*sid);
                for hid in s.history.iterator() {
                    let h = self.get_state_by_id(*hid);
                    if h.history_type == HistoryType::Deep {
                        let f = global
                            .configuration
                            .toList()
                            .filter_by(&|s0| -> bool {
                                self.isAtomicStateId(s0) && self.isDescendant(*s0, s.id)
                            })
                            .to_set();
                        ahistory.put_move(h.id, f);
                    } else {
                        let f = global
                            .configuration
                            .toList()
                            .filter_by(&|s0| -> bool { self.get_state_by_id(*s0).parent == s.id })
                            .to_set();
                        ahistory.put_move(h.id, f);
                    }
                }
            }
        }
        get_global!(datamodel).historyValue.put_all(&ahistory);

        for sid in statesToExitSorted.iterator() {
            let onexit_id = self.get_state_by_id(*sid).onexit;
            if onexit_id != 0 {
                self.executeContent(datamodel, onexit_id);
            }
            self.cancelInvokesOfState(datamodel, *sid);
            let state_name = &self.get_state_by_id(*sid).name;
            self.tracer.state_exited(state_name);
            get_global!(datamodel).configuration.delete(sid);
        }
    }

    /// Cancels all running invokes started by the given state.
    /// The cancel sentinel is posted to the child session, the child
    /// terminates on its next step.
    #[allow(non_snake_case)]
    fn cancelInvokesOfState(&self, datamodel: &mut dyn Datamodel, state: StateId) {
        let invoke_ids: Vec<InvokeId> = {
            let global = get_global!(datamodel);
            global
                .active_invokes
                .iter()
                .filter(|(_, meta)| meta.state_id == state)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for invoke_id in invoke_ids {
            self.cancelInvoke(datamodel, &invoke_id);
        }
    }

    #[allow(non_snake_case)]
    fn cancelInvoke(&self, datamodel: &mut dyn Datamodel, invoke_id: &InvokeId) {
        let session = {
            let mut global = get_global!(datamodel);
            global.active_invokes.remove(invoke_id);
            global.child_sessions.remove(invoke_id)
        };
        if let Some(session) = session {
            debug!("Cancel invoke '{}'", invoke_id);
            let _ = session.sender.send(Box::new(Event::cancel_session()));
        }
    }

    /// *W3C says*:
    /// # procedure executeTransitionContent(enabledTransitions)
    /// For each transition in the list of enabledTransitions, execute its
    /// executable content.
    #[allow(non_snake_case)]
    fn executeTransitionContent(
        &self,
        datamodel: &mut dyn Datamodel,
        enabledTransitions: &List<TransitionId>,
    ) {
        for tid in enabledTransitions.iterator() {
            let (content, source_name, index) = {
                let t = self.get_transition_by_id(*tid);
                let source = self.get_state_by_id(t.source);
                let index = source
                    .transitions
                    .iterator()
                    .position(|id| *id == *tid)
                    .unwrap_or(0);
                (t.content, source.name.clone(), index)
            };
            self.tracer.transition_taken(&source_name, index);
            if content != 0 {
                self.executeContent(datamodel, content);
            }
        }
    }

    /// *W3C says*:
    /// ## procedure enterStates(enabledTransitions)
    /// First, compute the list of all the states that will be entered as a
    /// result of taking the transitions in enabledTransitions. Add them to
    /// statesToInvoke so that invoke processing can be done at the start of
    /// the next macrostep. Convert statesToEnter to a list and sort it in
    /// entryOrder. For each state s in the list, first add s to the current
    /// configuration. Then if we are using late binding, and this is the
    /// first time we have entered s, initialize its data model. Then execute
    /// any onentry handlers. If s's initial state is being entered by
    /// default, execute any executable content in the initial transition. If
    /// a history state in s was the target of a transition, and s has not
    /// been entered before, execute the content inside the history state's
    /// default transition. Finally, if s is a final state, generate relevant
    /// Done events. If we have reached a top-level final state, set running
    /// to false as a signal to stop processing.
    /// ```ignore
    ///    procedure enterStates(enabledTransitions):
    ///        statesToEnter = new OrderedSet()
    ///        statesForDefaultEntry = new OrderedSet()
    ///        // initialize the temporary table for default content in history states
    ///        defaultHistoryContent = new HashTable()
    ///        computeEntrySet(enabledTransitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///        for s in statesToEnter.toList().sort(entryOrder):
    ///           configuration.add(s)
    ///           statesToInvoke.add(s)
    ///           if binding == "late" and s.isFirstEntry:
    ///              initializeDataModel(datamodel.s,doc.s)
    ///              s.isFirstEntry = false
    ///           for content in s.onentry.sort(documentOrder):
    ///              executeContent(content)
    ///           if statesForDefaultEntry.isMember(s):
    ///              executeContent(s.initial.transition)
    ///           if defaultHistoryContent[s.id]:
    ///              executeContent(defaultHistoryContent[s.id])
    ///           if isFinalState(s):
    ///              if isSCXMLElement(s.parent):
    ///                 running = false
    ///              else:
    ///                 parent = s.parent
    ///                 grandparent = parent.parent
    ///                 internalQueue.enqueue(new Event("done.state." + parent.id, s.donedata))
    ///                 if isParallelState(grandparent):
    ///                    if getChildStates(grandparent).every(isInFinalState):
    ///                       internalQueue.enqueue(new Event("done.state." + grandparent.id))
    /// ```
    #[allow(non_snake_case)]
    fn enterStates(&mut self, datamodel: &mut dyn Datamodel, enabledTransitions: &List<TransitionId>) {
        let binding = self.binding;
        let mut statesToEnter = OrderedSet::new();
        let mut statesForDefaultEntry = OrderedSet::new();

        // initialize the temporary table for default content in history states
        let mut defaultHistoryContent: HashTable<StateId, ExecutableContentId> = HashTable::new();
        self.computeEntrySet(
            datamodel,
            enabledTransitions,
            &mut statesToEnter,
            &mut statesForDefaultEntry,
            &mut defaultHistoryContent,
        );
        for s in statesToEnter
            .toList()
            .sort(&|s1, s2| self.state_entry_order(s1, s2))
            .iterator()
        {
            {
                let mut global = get_global!(datamodel);
                global.configuration.add(*s);
                global.statesToInvoke.add(*s);
            }
            let mut to_init: StateId = 0;
            {
                let state_s: &mut State = self.get_state_by_id_mut(*s);
                if binding == BindingType::Late && state_s.isFirstEntry {
                    to_init = *s;
                    state_s.isFirstEntry = false;
                }
            }
            if to_init != 0 {
                datamodel.initializeDataModel(self, to_init);
            }
            self.tracer.state_entered(&self.get_state_by_id(*s).name);

            let mut exe = Vec::new();
            {
                let state_s: &State = self.get_state_by_id(*s);
                exe.push(state_s.onentry);
                if statesForDefaultEntry.isMember(s) && state_s.initial != 0 {
                    exe.push(self.get_transition_by_id(state_s.initial).content);
                }
                if defaultHistoryContent.has(*s) {
                    exe.push(*defaultHistoryContent.get(*s));
                }
            }
            for content in exe {
                if content != 0 {
                    self.executeContent(datamodel, content);
                }
            }

            if self.isFinalStateId(*s) {
                let state_s = self.get_state_by_id(*s);
                let parent: StateId = state_s.parent;
                if self.isSCXMLElement(parent) {
                    get_global!(datamodel).running = false;
                } else {
                    let mut name_values = HashMap::new();
                    let mut content = None;
                    if let Some(done_data) = &state_s.donedata {
                        datamodel.evaluate_params(&done_data.params, &mut name_values);
                        content = datamodel.evaluate_content(&done_data.content);
                    }
                    let param_values = if name_values.is_empty() {
                        None
                    } else {
                        Some(name_values)
                    };
                    let parent_state = self.get_state_by_id(parent);
                    self.enqueue_internal(
                        datamodel,
                        Event::new("done.state.", &parent_state.name, param_values, content),
                    );
                    let grandparent: StateId = parent_state.parent;
                    if self.isParallelState(grandparent)
                        && self
                            .getChildStates(grandparent)
                            .every(&|cs: &StateId| -> bool { self.isInFinalState(datamodel, *cs) })
                    {
                        let grandparent_state = self.get_state_by_id(grandparent);
                        self.enqueue_internal(
                            datamodel,
                            Event::new("done.state.", &grandparent_state.name, None, None),
                        );
                    }
                }
            }
        }
    }

    /// Put an event into the internal queue.
    pub fn enqueue_internal(&self, datamodel: &mut dyn Datamodel, event: Event) {
        self.tracer.event_internal_sent(&event);
        get_global!(datamodel).internalQueue.enqueue(event);
    }

    #[allow(non_snake_case)]
    pub fn executeContent(&self, datamodel: &mut dyn Datamodel, contentId: ExecutableContentId) {
        if contentId != 0 {
            datamodel.executeContent(self, contentId);
        }
    }

    #[allow(non_snake_case)]
    pub fn isParallelState(&self, state: StateId) -> bool {
        state > 0 && self.get_state_by_id(state).is_parallel
    }

    #[allow(non_snake_case)]
    pub fn isSCXMLElement(&self, state: StateId) -> bool {
        state == self.pseudo_root
    }

    #[allow(non_snake_case)]
    pub fn isFinalState(&self, state: &State) -> bool {
        state.is_final
    }

    #[allow(non_snake_case)]
    pub fn isFinalStateId(&self, state: StateId) -> bool {
        self.isFinalState(self.get_state_by_id(state))
    }

    #[allow(non_snake_case)]
    pub fn isAtomicState(&self, state: &State) -> bool {
        state.states.is_empty()
    }

    #[allow(non_snake_case)]
    pub fn isAtomicStateId(&self, sid: &StateId) -> bool {
        self.isAtomicState(self.get_state_by_id(*sid))
    }

    /// *W3C says*:
    /// # procedure computeExitSet(enabledTransitions)
    /// For each transition t in enabledTransitions, if t is targetless then
    /// do nothing, else compute the transition's domain. (This will be the
    /// source state in the case of internal transitions) or the least common
    /// compound ancestor state of the source state and target states of t (in
    /// the case of external transitions). Add to the statesToExit set all
    /// states in the configuration that are descendants of the domain.
    #[allow(non_snake_case)]
    fn computeExitSet(
        &self,
        datamodel: &mut dyn Datamodel,
        transitions: &List<TransitionId>,
    ) -> OrderedSet<StateId> {
        let mut statesToExit: OrderedSet<StateId> = OrderedSet::new();
        for tid in transitions.iterator() {
            let t = self.get_transition_by_id(*tid);
            if !t.target.is_empty() {
                let domain = self.getTransitionDomain(datamodel, t);
                for s in get_global!(datamodel).configuration.iterator() {
                    if self.isDescendant(*s, domain) {
                        statesToExit.add(*s);
                    }
                }
            }
        }
        statesToExit
    }

    /// *W3C says*:
    /// # procedure computeEntrySet(transitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    /// Compute the complete set of states that will be entered as a result of
    /// taking 'transitions'. First gather up all the target states in
    /// 'transitions'. Then add them and, for all that are not atomic states,
    /// add all of their (default) descendants until we reach one or more
    /// atomic states. Then add any ancestors that will be entered within the
    /// domain of the transition.
    #[allow(non_snake_case)]
    fn computeEntrySet(
        &self,
        datamodel: &mut dyn Datamodel,
        transitions: &List<TransitionId>,
        statesToEnter: &mut OrderedSet<StateId>,
        statesForDefaultEntry: &mut OrderedSet<StateId>,
        defaultHistoryContent: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        for tid in transitions.iterator() {
            let t = self.get_transition_by_id(*tid);
            for s in t.target.iter() {
                self.addDescendantStatesToEnter(
                    datamodel,
                    *s,
                    statesToEnter,
                    statesForDefaultEntry,
                    defaultHistoryContent,
                );
            }
            let ancestor = self.getTransitionDomain(datamodel, t);
            for s in self.getEffectiveTargetStates(datamodel, t).iterator() {
                self.addAncestorStatesToEnter(
                    datamodel,
                    *s,
                    ancestor,
                    statesToEnter,
                    statesForDefaultEntry,
                    defaultHistoryContent,
                );
            }
        }
    }

    /// *W3C says*:
    /// # procedure addDescendantStatesToEnter(state,statesToEnter,statesForDefaultEntry, defaultHistoryContent)
    /// The purpose of this procedure is to add to statesToEnter 'state' and
    /// any of its descendants that the state machine will end up entering
    /// when it enters 'state'. (N.B. If 'state' is a history pseudo-state, we
    /// dereference it and add the history value instead.)
    ///
    /// First, If state is a history state then add either the history values
    /// associated with state or state's default target to statesToEnter. Then
    /// (since the history value may not be an immediate descendant of
    /// 'state's parent) add any ancestors between the history value and
    /// state's parent. Else (if state is not a history state), add state to
    /// statesToEnter. Then if state is a compound state, add state to
    /// statesForDefaultEntry and recursively call addStatesToEnter on its
    /// default initial state(s). Otherwise, if state is a parallel state,
    /// recursively call addStatesToEnter on any of its child states that
    /// don't already have a descendant on statesToEnter.
    #[allow(non_snake_case)]
    fn addDescendantStatesToEnter(
        &self,
        datamodel: &mut dyn Datamodel,
        sid: StateId,
        statesToEnter: &mut OrderedSet<StateId>,
        statesForDefaultEntry: &mut OrderedSet<StateId>,
        defaultHistoryContent: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        let state = self.get_state_by_id(sid);
        if self.isHistoryState(sid) {
            let history_value = {
                let global = get_global!(datamodel);
                if global.historyValue.has(sid) {
                    Some(global.historyValue.get(sid).clone())
                } else {
                    None
                }
            };
            match history_value {
                Some(previous) => {
                    for s in previous.iterator() {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *s,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                    for s in previous.iterator() {
                        self.addAncestorStatesToEnter(
                            datamodel,
                            *s,
                            state.parent,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                }
                None => {
                    // A history state has exactly one transition which
                    // specifies the default history configuration.
                    let defaultTransition = self.get_transition_by_id(*state.transitions.head());
                    defaultHistoryContent.put(state.parent, &defaultTransition.content);
                    for s in &defaultTransition.target {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *s,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                    for s in &defaultTransition.target {
                        self.addAncestorStatesToEnter(
                            datamodel,
                            *s,
                            state.parent,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                }
            }
        } else {
            statesToEnter.add(sid);
            if self.isCompoundState(sid) {
                statesForDefaultEntry.add(sid);
                if state.initial != 0 {
                    let initialTransition = self.get_transition_by_id(state.initial);
                    for s in &initialTransition.target {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *s,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                    for s in &initialTransition.target {
                        self.addAncestorStatesToEnter(
                            datamodel,
                            *s,
                            sid,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        )
                    }
                }
            } else if self.isParallelState(sid) {
                for child in self.getChildStates(sid).iterator() {
                    if !statesToEnter.some(&|s| self.isDescendant(*s, *child)) {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *child,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        )
                    }
                }
            }
        }
    }

    /// *W3C says*:
    /// # procedure addAncestorStatesToEnter(state, ancestor, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    /// Add to statesToEnter any ancestors of 'state' up to, but not
    /// including, 'ancestor' that must be entered in order to enter 'state'.
    /// If any of these ancestor states is a parallel state, we must fill in
    /// its descendants as well.
    #[allow(non_snake_case)]
    fn addAncestorStatesToEnter(
        &self,
        datamodel: &mut dyn Datamodel,
        state: StateId,
        ancestor: StateId,
        statesToEnter: &mut OrderedSet<StateId>,
        statesForDefaultEntry: &mut OrderedSet<StateId>,
        defaultHistoryContent: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        for anc in self.getProperAncestors(state, ancestor).iterator() {
            statesToEnter.add(*anc);
            if self.isParallelState(*anc) {
                for child in self.getChildStates(*anc).iterator() {
                    if !statesToEnter.some(&|s| self.isDescendant(*s, *child)) {
                        self.addDescendantStatesToEnter(
                            datamodel,
                            *child,
                            statesToEnter,
                            statesForDefaultEntry,
                            defaultHistoryContent,
                        );
                    }
                }
            }
        }
    }

    /// *W3C says*:
    /// # procedure isInFinalState(s)
    /// Return true if s is a compound \<state\> and one of its children is an
    /// active \<final\> state (i.e. is a member of the current
    /// configuration), or if s is a \<parallel\> state and isInFinalState is
    /// true of all its children.
    #[allow(non_snake_case)]
    fn isInFinalState(&self, datamodel: &dyn Datamodel, s: StateId) -> bool {
        if self.isCompoundState(s) {
            self.getChildStates(s).some(&|cs: &StateId| -> bool {
                self.isFinalStateId(*cs) && datamodel.global_s().lock().configuration.isMember(cs)
            })
        } else if self.isParallelState(s) {
            self.getChildStates(s)
                .every(&|cs: &StateId| -> bool { self.isInFinalState(datamodel, *cs) })
        } else {
            false
        }
    }

    /// *W3C says*:
    /// # function getTransitionDomain(transition)
    /// Return the compound state such that
    /// 1) all states that are exited or entered as a result of taking
    ///    'transition' are descendants of it
    /// 2) no descendant of it has this property.
    /// ```ignore
    /// function getTransitionDomain(t)
    ///     tstates = getEffectiveTargetStates(t)
    ///     if not tstates:
    ///         return null
    ///     elif t.type == "internal" and isCompoundState(t.source) and tstates.every(lambda s: isDescendant(s,t.source)):
    ///         return t.source
    ///     else:
    ///         return findLCCA([t.source].append(tstates))
    /// ```
    #[allow(non_snake_case)]
    fn getTransitionDomain(&self, datamodel: &mut dyn Datamodel, t: &Transition) -> StateId {
        let tstates = self.getEffectiveTargetStates(datamodel, t);
        if tstates.isEmpty() {
            0
        } else if t.transition_type == TransitionType::Internal
            && self.isCompoundState(t.source)
            && tstates.every(&|s| -> bool { self.isDescendant(*s, t.source) })
        {
            t.source
        } else {
            let mut l = List::new();
            l.push(t.source);
            self.findLCCA(&l.append_set(&tstates))
        }
    }

    /// *W3C says*:
    /// # function findLCCA(stateList)
    /// The Least Common Compound Ancestor is the \<state\> or \<scxml\>
    /// element s such that s is a proper ancestor of all states on stateList
    /// and no descendant of s has this property. Note that there is
    /// guaranteed to be such an element since the \<scxml\> wrapper element
    /// is a common ancestor of all states. Note also that since we are
    /// speaking of proper ancestor (parent or parent of a parent, etc.) the
    /// LCCA is never a member of stateList.
    #[allow(non_snake_case)]
    fn findLCCA(&self, stateList: &List<StateId>) -> StateId {
        let mut lcca = 0;
        for anc in self
            .getProperAncestors(*stateList.head(), 0)
            .toList()
            .filter_by(&|s| self.isCompoundStateOrScxmlElement(*s))
            .iterator()
        {
            if stateList.tail().every(&|s| self.isDescendant(*s, *anc)) {
                lcca = *anc;
                break;
            }
        }
        lcca
    }

    /// *W3C says*:
    /// # function getEffectiveTargetStates(transition)
    /// Returns the states that will be the target when 'transition' is taken,
    /// dereferencing any history states.
    /// ```ignore
    /// function getEffectiveTargetStates(transition)
    ///     targets = new OrderedSet()
    ///     for s in transition.target
    ///         if isHistoryState(s):
    ///             if historyValue[s.id]:
    ///                 targets.union(historyValue[s.id])
    ///             else:
    ///                 targets.union(getEffectiveTargetStates(s.transition))
    ///         else:
    ///             targets.add(s)
    ///     return targets
    /// ```
    #[allow(non_snake_case)]
    fn getEffectiveTargetStates(
        &self,
        datamodel: &mut dyn Datamodel,
        transition: &Transition,
    ) -> OrderedSet<StateId> {
        let mut targets: OrderedSet<StateId> = OrderedSet::new();
        for sid in &transition.target {
            if self.isHistoryState(*sid) {
                let history_value = {
                    let global = get_global!(datamodel);
                    if global.historyValue.has(*sid) {
                        Some(global.historyValue.get(*sid).clone())
                    } else {
                        None
                    }
                };
                match history_value {
                    Some(previous) => {
                        targets.union(&previous);
                    }
                    None => {
                        // History states have exactly one "transition"
                        let s = self.get_state_by_id(*sid);
                        targets.union(&self.getEffectiveTargetStates(
                            datamodel,
                            self.get_transition_by_id(*s.transitions.head()),
                        ));
                    }
                }
            } else {
                targets.add(*sid);
            }
        }
        targets
    }

    /// *W3C says*:
    /// # function getProperAncestors(state1, state2)
    /// If state2 is null, returns the set of all ancestors of state1 in
    /// ancestry order (state1's parent followed by the parent's parent, etc.
    /// up to an including the \<scxml\> element). If state2 is non-null,
    /// returns in ancestry order the set of all ancestors of state1, up to
    /// but not including state2. If state2 is state1's parent, or equal to
    /// state1, or a descendant of state1, this returns the empty set.
    #[allow(non_snake_case)]
    fn getProperAncestors(&self, state1: StateId, state2: StateId) -> OrderedSet<StateId> {
        let mut properAncestors: OrderedSet<StateId> = OrderedSet::new();
        if !self.isDescendant(state2, state1) {
            let mut currState = self.get_state_by_id(state1).parent;
            while currState != 0 && currState != state2 {
                properAncestors.add(currState);
                currState = self.get_state_by_id(currState).parent;
            }
        }
        properAncestors
    }

    /// *W3C says*:
    /// # function isDescendant(state1, state2)
    /// Returns 'true' if state1 is a descendant of state2 (a child, or a
    /// child of a child, or a child of a child of a child, etc.) Otherwise
    /// returns 'false'.
    #[allow(non_snake_case)]
    fn isDescendant(&self, state1: StateId, state2: StateId) -> bool {
        if state1 == 0 || state2 == 0 || state1 == state2 {
            false
        } else {
            let mut currState = self.get_state_by_id(state1).parent;
            while currState != 0 && currState != state2 {
                currState = self.get_state_by_id(currState).parent;
            }
            currState == state2
        }
    }

    /// *W3C says*:
    /// A Compound State: A state of type \<state\> with at least one child
    /// state.
    #[allow(non_snake_case)]
    fn isCompoundState(&self, state: StateId) -> bool {
        if state != 0 {
            let state_s = self.get_state_by_id(state);
            !(state_s.is_final || state_s.is_parallel || state_s.states.is_empty())
        } else {
            false
        }
    }

    #[allow(non_snake_case)]
    fn isCompoundStateOrScxmlElement(&self, sid: StateId) -> bool {
        sid == self.pseudo_root || self.isCompoundState(sid)
    }

    #[allow(non_snake_case)]
    fn isHistoryState(&self, state: StateId) -> bool {
        self.get_state_by_id(state).history_type != HistoryType::None
    }

    #[allow(non_snake_case)]
    fn isCancelEvent(&self, ev: &Event) -> bool {
        ev.name.eq(EVENT_CANCEL_SESSION)
    }

    /// *W3C says*:
    /// # function getChildStates(state1)
    /// Returns a list containing all \<state\>, \<final\>, and \<parallel\>
    /// children of state1.
    #[allow(non_snake_case)]
    fn getChildStates(&self, state1: StateId) -> List<StateId> {
        let mut l: List<StateId> = List::new();
        let state_ref = self.get_state_by_id(state1);
        for c in &state_ref.states {
            l.push(*c);
        }
        l
    }

    /// Starts one \<invoke\> of the given state.
    /// *W3C says*: if the evaluation of its arguments produces an error, the
    /// SCXML Processor must terminate the processing of the element without
    /// further action.
    fn invoke(&self, datamodel: &mut dyn Datamodel, state: StateId, inv: &Invoke) {
        if let Some(reason) = &inv.parse_error {
            error!("Malformed <invoke>: {}", reason);
            self.enqueue_internal(
                datamodel,
                Event::new("error.execution.invoke.", "parseerror", None, None),
            );
            return;
        }

        let type_name =
            match datamodel.get_expression_alternative_value(&inv.type_name, &inv.type_expr) {
                Ok(value) => value,
                Err(_) => {
                    return;
                }
            };

        let type_name_trimmed = type_name.trim_end_matches('/');
        if !(type_name_trimmed.is_empty()
            || type_name_trimmed.eq(SCXML_INVOKE_TYPE_SHORT)
            || type_name_trimmed.eq(SCXML_INVOKE_TYPE))
        {
            error!("Unsupported <invoke> type {}", type_name);
            self.enqueue_internal(
                datamodel,
                Event::new("error.execution.invoke.", "unsupportedtype", None, None),
            );
            return;
        }

        // W3C: If the 'idlocation' attribute is present, the SCXML Processor
        // must generate an id automatically when the <invoke> element is
        // evaluated and store it in the location specified by 'idlocation'.
        // The automatically generated identifier must have the form
        // stateid.platformid.
        let invoke_id = if inv.invoke_id.is_empty() {
            format!(
                "{}.{}.{}",
                inv.parent_state_name,
                inv.doc_id,
                PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            inv.invoke_id.clone()
        };
        if !inv.external_id_location.is_empty() {
            datamodel.set(
                inv.external_id_location.as_str(),
                Data::String(invoke_id.clone()),
            );
        }

        let src = match datamodel.get_expression_alternative_value(&inv.src, &inv.src_expr) {
            Ok(value) => value,
            Err(_) => {
                return;
            }
        };

        let mut name_values: HashMap<String, Data> = HashMap::new();
        for name in inv.name_list.as_slice() {
            if let Ok(value) = datamodel.get_by_location(name) {
                name_values.insert(name.clone(), value);
            }
        }
        datamodel.evaluate_params(&inv.params, &mut name_values);

        let content_xml = if src.is_empty() {
            datamodel
                .evaluate_content(&inv.content)
                .map(|data| data.to_string())
        } else {
            None
        };

        debug!(
            "Invoke: type '{}' invokeId '{}' src '{}' namelist '{:?}'",
            type_name, invoke_id, src, name_values
        );

        let result = {
            let mut global = get_global!(datamodel);
            let session_id = global.session_id;
            let child_session_name = format!("{}.{}", global.session_name, invoke_id);
            match global.executor.as_mut() {
                None => Err(crate::datamodel::ScxmlError::Invoke(
                    "executor not available".to_string(),
                )),
                Some(executor) => {
                    if src.is_empty() {
                        match &content_xml {
                            Some(xml) => executor.execute_with_data_from_xml(
                                xml,
                                &name_values,
                                Some(session_id),
                                Some(invoke_id.clone()),
                                Some(child_session_name),
                            ),
                            None => Err(crate::datamodel::ScxmlError::Invoke(
                                "no content to execute".to_string(),
                            )),
                        }
                    } else {
                        executor.execute_with_data(
                            src.as_str(),
                            &name_values,
                            Some(session_id),
                            Some(invoke_id.clone()),
                            Some(child_session_name),
                        )
                    }
                }
            }
        };

        match result {
            Ok(session) => {
                let mut global = get_global!(datamodel);
                global.child_sessions.insert(invoke_id.clone(), session);
                global.active_invokes.insert(
                    invoke_id,
                    InvokeMeta {
                        state_id: state,
                        finalize: inv.finalize,
                        autoforward: inv.autoforward,
                    },
                );
            }
            Err(error) => {
                error!("Execution of invoke '{}' failed: {}", invoke_id, error);
                self.enqueue_internal(
                    datamodel,
                    Event::new("error.execution.invoke.", &invoke_id, None, None),
                );
            }
        }
    }

    /// *W3C says*:
    /// ## 5.9.1 Conditional Expressions
    /// Conditional expressions are used inside the 'cond' attribute of
    /// \<transition\>, \<if\> and \<elseif\>. If a conditional expression
    /// cannot be evaluated as a boolean value ('true' or 'false') or if its
    /// evaluation causes an error, the SCXML Processor must treat the
    /// expression as if it evaluated to 'false' and must place the error
    /// 'error.execution' in the internal event queue.
    #[allow(non_snake_case)]
    fn conditionMatch(&self, datamodel: &mut dyn Datamodel, tid: TransitionId) -> bool {
        let cond = self.get_transition_by_id(tid).cond.clone();
        match cond {
            Some(cond) => match datamodel.execute_condition(cond.as_str()) {
                Ok(value) => value,
                Err(e) => {
                    error!("Evaluation of cond '{}' failed: {}", cond, e);
                    datamodel.internal_error_execution();
                    false
                }
            },
            None => true,
        }
    }

    /// Converts a list of transition-ids to a list of references.
    fn to_transition_list(&self, trans_ids: &List<TransitionId>) -> List<&Transition> {
        let mut l = List::new();
        for tid in trans_ids.iterator() {
            l.push(self.get_transition_by_id(*tid));
        }
        l
    }
}

/// Stores all data of a state.
/// In this model "State" is used for the SCXML elements "state", "parallel",
/// "final", "history" and the \<scxml\> root.
///
/// ## Definitions:
/// - An atomic state is a \<state\> that has no \<state\>, \<parallel\> or
///   \<final\> children.
/// - A compound state is a \<state\> that has \<state\>, \<parallel\>, or
///   \<final\> children (or a combination of these).
/// - The default initial state(s) of a compound state are those specified by
///   the 'initial' attribute or \<initial\> element, if either is present.
///   Otherwise it is the state's first child state in document order.
#[allow(non_snake_case)]
pub struct State {
    /// The internal id, the one based index of the state in Fsm.states.
    pub id: StateId,

    /// The unique id, counting in document order.
    /// "id" is assigned also on references to states, not only declarations,
    /// and may not result in correct document order.
    pub doc_id: DocumentId,

    /// The SCXML id attribute.
    pub name: String,

    /// The initial transition id (if the state has sub-states).
    pub initial: TransitionId,

    /// The ids of the sub-states of this state.
    pub states: Vec<StateId>,

    /// True for "parallel" states
    pub is_parallel: bool,

    /// True for "final" states
    pub is_final: bool,

    pub history_type: HistoryType,

    /// The script that is executed if the state is entered.
    pub onentry: ExecutableContentId,

    /// The script that is executed if the state is left.
    pub onexit: ExecutableContentId,

    /// All transitions of this state.
    pub transitions: List<TransitionId>,

    pub invoke: List<Invoke>,
    pub history: List<StateId>,

    /// The local \<data\> declarations.
    pub data: DataStore,

    /// True if the state was never entered before.
    pub isFirstEntry: bool,

    pub parent: StateId,
    pub donedata: Option<DoneData>,
}

impl State {
    pub fn new(name: &str) -> State {
        State {
            id: 0,
            doc_id: 0,
            name: name.to_string(),
            initial: 0,
            states: vec![],
            onentry: 0,
            onexit: 0,
            transitions: List::new(),
            is_parallel: false,
            is_final: false,
            history_type: HistoryType::None,
            data: DataStore::new(),
            isFirstEntry: true,
            parent: 0,
            donedata: None,
            invoke: List::new(),
            history: List::new(),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum HistoryType {
    Shallow,
    Deep,
    None,
}

pub fn map_history_type(ts: &str) -> HistoryType {
    match ts.to_lowercase().as_str() {
        "deep" => HistoryType::Deep,
        "shallow" => HistoryType::Shallow,
        "" => HistoryType::None,
        _ => panic!("Unknown history type '{}'", ts),
    }
}

#[derive(Debug, PartialEq)]
pub enum TransitionType {
    Internal,
    External,
}

pub fn map_transition_type(ts: &str) -> TransitionType {
    match ts.to_lowercase().as_str() {
        "internal" => TransitionType::Internal,
        "external" => TransitionType::External,
        "" => TransitionType::External,
        _ => panic!("Unknown transition type '{}'", ts),
    }
}

/// A state to state transition, with references to the content that shall be
/// executed with the transition.
#[derive(Debug)]
pub struct Transition {
    pub id: TransitionId,
    pub doc_id: DocumentId,

    /// Event patterns as dot-separated token lists. Trailing ".*" and "."
    /// are normalized away at parse time.
    pub events: Vec<Vec<String>>,

    /// True if one of the patterns is the wildcard "*".
    pub wildcard: bool,

    pub cond: Option<String>,
    pub source: StateId,
    pub target: Vec<StateId>,
    pub transition_type: TransitionType,
    pub content: ExecutableContentId,
}

impl PartialEq for Transition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Default for Transition {
    fn default() -> Self {
        Transition::new()
    }
}

impl Transition {
    pub fn new() -> Transition {
        let idc = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Transition {
            id: idc,
            doc_id: 0,
            events: vec![],
            wildcard: false,
            cond: None,
            source: 0,
            target: vec![],
            transition_type: TransitionType::External,
            content: 0,
        }
    }

    /// *W3C says*:
    /// An event designator is a series of alphanumeric characters segmented
    /// into tokens by the "." character. A transition matches an event if
    /// one of its event descriptors matches the event's name: an event
    /// descriptor matches if it is an exact match or a prefix of the
    /// sequence of tokens in the event's name.
    pub fn name_match(&self, name: &str) -> bool {
        if self.wildcard {
            return true;
        }
        if self.events.is_empty() {
            return false;
        }
        let event_tokens: Vec<&str> = name.split('.').collect();
        self.events.iter().any(|pattern| {
            pattern.len() <= event_tokens.len()
                && pattern
                    .iter()
                    .zip(event_tokens.iter())
                    .all(|(p, e)| p == e)
        })
    }
}

////////////////////////////////////////
//// Display support

impl Display for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fsm{{v:{} root:{} states:",
            self.version, self.pseudo_root
        )?;
        display_state_vec(&self.states, f)?;
        write!(f, "}}")
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{#{} <{}> states:{} transitions:{}}}",
            self.id,
            self.name,
            vec_to_string(&self.states),
            vec_to_string(&self.transitions.data)
        )
    }
}

impl Display for Transition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{#{} {} {:?} target:{:?}}}",
            self.id, self.transition_type, &self.events, self.target
        )
    }
}

impl Display for TransitionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransitionType::Internal => f.write_str("internal"),
            TransitionType::External => f.write_str("external"),
        }
    }
}

pub(crate) fn vec_to_string<T: Display>(v: &[T]) -> String {
    let mut s = "[".to_string();
    for (i, item) in v.iter().enumerate() {
        s += format!("{}{}", if i > 0 { "," } else { "" }, item).as_str();
    }
    s += "]";
    s
}

pub(crate) fn opt_vec_to_string<T: Display>(v: &Option<Vec<T>>) -> String {
    match v {
        None => "None".to_string(),
        Some(v) => vec_to_string(v),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crate::fsm::{List, OrderedSet, Transition};
    use crate::scheduler::Scheduler as _;
    use crate::scxml_reader;
    use crate::test::run_fsm_test;

    #[test]
    fn list_basics() {
        let mut l: List<String> = List::new();
        l.push("Abc".to_string());
        l.push("def".to_string());
        l.push("ghi".to_string());
        assert_eq!(l.size(), 3);
        assert_eq!(l.head(), &"Abc".to_string());
        assert_eq!(l.tail().size(), 2);

        let l2 = l.append(&l);
        assert_eq!(l2.size(), 2 * l.size());

        assert!(l.some(&|s| s == "def"));
        assert!(l.every(&|s| !s.is_empty()));
        assert_eq!(l.filter_by(&|s| s.starts_with('g')).size(), 1);
    }

    #[test]
    fn list_can_sort() {
        let mut l: List<String> = List::new();
        l.push("Xyz".to_string());
        l.push("Abc".to_string());
        l.push("Ghi".to_string());

        let sorted = l.sort(&|a, b| a.cmp(b));
        assert_eq!(sorted.head(), &"Abc".to_string());
        assert_eq!(sorted.size(), 3);
    }

    #[test]
    fn ordered_set_basics() {
        let mut os: OrderedSet<String> = OrderedSet::new();
        os.add("Abc".to_string());
        os.add("def".to_string());
        os.add("Abc".to_string()); // ignored, already a member
        assert_eq!(os.size(), 2);

        os.delete(&"Abc".to_string());
        os.delete(&"xxx".to_string()); // ignored
        assert_eq!(os.size(), 1);

        assert!(!os.isEmpty());
        os.clear();
        assert!(os.isEmpty());
    }

    #[test]
    fn ordered_set_union_keeps_order() {
        let mut os1: OrderedSet<u32> = OrderedSet::from_array(&[1, 2, 3]);
        let os2: OrderedSet<u32> = OrderedSet::from_array(&[3, 4]);
        os1.union(&os2);
        assert_eq!(os1.size(), 4);
        assert_eq!(os1.toList().head(), &1);
        assert!(os1.isMember(&4));
    }

    #[test]
    #[allow(non_snake_case)]
    fn ordered_set_hasIntersection() {
        let mut os1: OrderedSet<u32> = OrderedSet::from_array(&[1, 2]);
        let os2: OrderedSet<u32> = OrderedSet::from_array(&[2, 3]);
        assert!(os1.hasIntersection(&os2));
        os1.delete(&2);
        assert!(!os1.hasIntersection(&os2));
        // empty sets never intersect, not even with themselves
        os1.clear();
        assert!(!os1.hasIntersection(&os1));
    }

    fn transition_with_events(patterns: &[&str]) -> Transition {
        let mut t = Transition::new();
        for p in patterns {
            if *p == "*" {
                t.wildcard = true;
            }
            t.events
                .push(p.split('.').map(|s| s.to_string()).collect());
        }
        t
    }

    #[test]
    fn event_name_matching() {
        let exact = transition_with_events(&["foo.bar.baz"]);
        let prefix1 = transition_with_events(&["foo"]);
        let prefix2 = transition_with_events(&["foo.bar"]);
        let wildcard = transition_with_events(&["*"]);
        let other = transition_with_events(&["foo.barz"]);

        assert!(exact.name_match("foo.bar.baz"));
        assert!(prefix1.name_match("foo.bar.baz"));
        assert!(prefix2.name_match("foo.bar.baz"));
        assert!(wildcard.name_match("foo.bar.baz"));
        assert!(!other.name_match("foo.bar.baz"));

        // token-wise prefix, not string prefix
        assert!(!prefix2.name_match("foo.barbara"));
        assert!(!exact.name_match("foo.bar"));

        // no pattern and no wildcard never matches
        let eventless = Transition::new();
        assert!(!eventless.name_match("foo"));
    }

    #[test]
    fn lcca_of_nested_states() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='c'>
                <state id='c' initial='x'>
                  <state id='x' initial='y'>
                    <state id='y'/>
                    <state id='z'/>
                  </state>
                </state>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let x = *fsm.statesNames.get("x").unwrap();
        let y = *fsm.statesNames.get("y").unwrap();
        let z = *fsm.statesNames.get("z").unwrap();
        let c = *fsm.statesNames.get("c").unwrap();

        assert_eq!(fsm.findLCCA(&List::from_array(&[y, z])), x);
        assert_eq!(fsm.findLCCA(&List::from_array(&[y, y])), x);
        assert_eq!(fsm.findLCCA(&List::from_array(&[x, y])), c);
        assert_eq!(fsm.findLCCA(&List::from_array(&[c, x])), fsm.pseudo_root);
    }

    #[test]
    fn simple_toggle() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='red'>
                <state id='red'>
                  <transition event='e1' target='green'/>
                </state>
                <state id='green'>
                  <transition event='e2' target='red'/>
                </state>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (record, final_config) = run_fsm_test("simple_toggle", fsm, 3000, |session| {
            session.send("e1", None);
            session.send("e2", None);
            session.send("e1", None);
        });

        assert_eq!(final_config.unwrap(), vec!["green".to_string()]);
        let rec = record.lock().unwrap();
        assert_eq!(
            rec.entered,
            vec![
                "red".to_string(),
                "green".to_string(),
                "red".to_string(),
                "green".to_string()
            ]
        );
    }

    #[test]
    fn internal_event_stabilization() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='a'>
                <state id='a'>
                  <onentry><raise event='t'/></onentry>
                  <transition event='t' target='b'/>
                </state>
                <state id='b'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (record, final_config) =
            run_fsm_test("internal_event_stabilization", fsm, 3000, |_session| {});

        // The configuration reaches 'b' within the start macrostep,
        // no external event required.
        assert_eq!(final_config.unwrap(), vec!["b".to_string()]);
        let rec = record.lock().unwrap();
        assert_eq!(rec.configurations.first().unwrap(), &vec!["b".to_string()]);
        assert!(rec.internal_events.contains(&"t".to_string()));
    }

    #[test]
    fn parallel_completion() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='p'>
                <parallel id='p'>
                  <state id='p1' initial='p1run'>
                    <state id='p1run'><transition event='e1' target='f1'/></state>
                    <final id='f1'/>
                  </state>
                  <state id='p2' initial='p2run'>
                    <state id='p2run'><transition event='e2' target='f2'/></state>
                    <final id='f2'/>
                  </state>
                  <transition event='done.state.p' target='alldone'/>
                </parallel>
                <final id='alldone'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (record, final_config) = run_fsm_test("parallel_completion", fsm, 5000, |session| {
            session.send("e1", None);
            session.send("e2", None);
        });

        assert_eq!(final_config.unwrap(), vec!["alldone".to_string()]);
        let rec = record.lock().unwrap();
        assert!(rec.internal_events.contains(&"done.state.p1".to_string()));
        assert!(rec.internal_events.contains(&"done.state.p2".to_string()));
        assert!(rec.internal_events.contains(&"done.state.p".to_string()));
        assert_eq!(rec.final_state, Some(Some("alldone".to_string())));
    }

    #[test]
    fn deep_history_recall() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='c'>
                <state id='c' initial='x'>
                  <history type='deep' id='h'>
                    <transition target='x'/>
                  </history>
                  <state id='x' initial='y'>
                    <state id='y'><transition event='mv' target='z'/></state>
                    <state id='z'/>
                  </state>
                  <transition event='out' target='outside'/>
                </state>
                <state id='outside'>
                  <transition event='back' target='h'/>
                </state>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (_record, final_config) = run_fsm_test("deep_history_recall", fsm, 3000, |session| {
            session.send("mv", None);
            session.send("out", None);
            session.send("back", None);
        });

        let config = final_config.unwrap();
        assert!(config.contains(&"z".to_string()), "config: {:?}", config);
        assert!(config.contains(&"c".to_string()));
        assert!(!config.contains(&"h".to_string()));
    }

    #[test]
    fn history_without_record_takes_default_target() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='outside'>
                <state id='outside'>
                  <transition event='go' target='h'/>
                </state>
                <state id='c' initial='x'>
                  <history id='h'>
                    <transition target='z'/>
                  </history>
                  <state id='x'/>
                  <state id='z'/>
                </state>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (_record, final_config) =
            run_fsm_test("history_default_target", fsm, 3000, |session| {
                session.send("go", None);
            });

        let config = final_config.unwrap();
        assert!(config.contains(&"z".to_string()), "config: {:?}", config);
    }

    #[test]
    fn delayed_send_can_be_cancelled() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='s'>
                <state id='s'>
                  <onentry>
                    <send id='t1' event='late' delay='200ms'/>
                    <cancel sendid='t1'/>
                  </onentry>
                </state>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (record, _final_config) =
            run_fsm_test("delayed_send_cancel", fsm, 3000, |session| {
                // give a not-cancelled timer plenty of time to fire
                thread::sleep(Duration::from_millis(500));
                assert!(!session.global_data.lock().timers.is_scheduled("t1"));
            });

        let rec = record.lock().unwrap();
        assert!(!rec.external_events.contains(&"late".to_string()));
    }

    #[test]
    fn delayed_send_fires_without_cancel() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='s'>
                <state id='s'>
                  <onentry>
                    <send id='t1' event='late' delay='50ms'/>
                  </onentry>
                  <transition event='late' target='got_it'/>
                </state>
                <state id='got_it'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (_record, final_config) =
            run_fsm_test("delayed_send_fires", fsm, 3000, |_session| {
                thread::sleep(Duration::from_millis(500));
            });

        assert_eq!(final_config.unwrap(), vec!["got_it".to_string()]);
    }

    #[test]
    fn illegal_assign_keeps_machine_running() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='s'>
                <state id='s'>
                  <onentry><assign location='undeclared' expr='1'/></onentry>
                  <transition event='ping' target='s2'/>
                </state>
                <state id='s2'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (record, final_config) = run_fsm_test("illegal_assign", fsm, 3000, |session| {
            session.send("ping", None);
        });

        let rec = record.lock().unwrap();
        assert!(rec
            .internal_events
            .contains(&"error.execution".to_string()));
        assert_eq!(final_config.unwrap(), vec!["s2".to_string()]);
    }

    #[test]
    fn invoked_child_reports_done() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='work'>
                <state id='work'>
                  <invoke id='childjob' autoforward='true'>
                    <param name='seed' expr='5'/>
                    <content>
                      <scxml initial='go'>
                        <datamodel><data id='seed' expr='0'/></datamodel>
                        <state id='go'>
                          <transition event='finish' cond='seed == 5' target='end'/>
                        </state>
                        <final id='end'/>
                      </scxml>
                    </content>
                  </invoke>
                  <transition event='done.invoke.childjob' target='ok'/>
                </state>
                <state id='ok'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (record, final_config) = run_fsm_test("invoked_child", fsm, 5000, |session| {
            // autoforwarded to the child, which only finishes with seed == 5
            session.send("finish", None);
            assert!(crate::test::wait_for_state(session, "ok", 4000));
        });

        assert_eq!(final_config.unwrap(), vec!["ok".to_string()]);
        let rec = record.lock().unwrap();
        assert!(rec
            .external_events
            .contains(&"done.invoke.childjob".to_string()));
    }

    #[test]
    fn malformed_invoke_raises_parseerror_and_keeps_running() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='s'>
                <state id='s'>
                  <invoke id='child' idlocation='loc' src='child.scxml'/>
                  <transition event='ping' target='s2'/>
                </state>
                <state id='s2'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (record, final_config) = run_fsm_test("malformed_invoke", fsm, 3000, |session| {
            session.send("ping", None);
        });

        let rec = record.lock().unwrap();
        assert!(rec
            .internal_events
            .contains(&"error.execution.invoke.parseerror".to_string()));
        assert_eq!(final_config.unwrap(), vec!["s2".to_string()]);
    }

    #[test]
    fn custom_executable_and_sendtype_are_dispatched() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{Arc, Mutex};

        let executed = Arc::new(AtomicBool::new(false));
        let executed_flag = executed.clone();
        crate::executable_content::register_custom_executable(
            "http://example.com/custom-exec",
            Arc::new(move |element, _datamodel| {
                assert_eq!(element.tag, "mark");
                executed_flag.store(true, Ordering::Relaxed);
            }),
        );

        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_names = sent.clone();
        crate::executable_content::register_custom_sendtype(
            "x-test-sink",
            Arc::new(move |message, _global| {
                sent_names.lock().unwrap().push(message.name.clone());
            }),
        );

        let fsm = scxml_reader::parse_from_xml(
            r"<scxml xmlns:ce='http://example.com/custom-exec' initial='s'>
                <state id='s'>
                  <onentry>
                    <ce:mark/>
                    <send type='x-test-sink' event='ping'/>
                  </onentry>
                </state>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (_record, _final_config) =
            run_fsm_test("custom_extensions", fsm, 3000, |_session| {});

        assert!(executed.load(Ordering::Relaxed));
        assert_eq!(*sent.lock().unwrap(), vec!["ping".to_string()]);
    }

    #[test]
    fn cancel_twice_is_idempotent() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='s'><state id='s'/></scxml>".to_string(),
        )
        .unwrap();

        let executor = Box::new(crate::fsm_executor::FsmExecutor::new());
        let session = crate::fsm::start_fsm(fsm, executor);

        session.cancel();
        session.cancel();

        let mut waited = 0;
        while !session.is_finished() && waited < 3000 {
            thread::sleep(Duration::from_millis(10));
            waited += 10;
        }
        assert!(session.is_finished());
    }

    #[test]
    fn in_predicate_in_condition() {
        let fsm = scxml_reader::parse_from_xml(
            r#"<scxml initial='p'>
                <parallel id='p'>
                  <state id='a' initial='a1'>
                    <state id='a1'/>
                  </state>
                  <state id='b' initial='b1'>
                    <state id='b1'>
                      <transition event='check' cond="In('a1')" target='b2'/>
                    </state>
                    <state id='b2'/>
                  </state>
                </parallel>
              </scxml>"#
                .to_string(),
        )
        .unwrap();

        let (_record, final_config) = run_fsm_test("in_predicate", fsm, 3000, |session| {
            session.send("check", None);
        });

        let config = final_config.unwrap();
        assert!(config.contains(&"b2".to_string()), "config: {:?}", config);
    }

    #[test]
    fn eventless_transitions_chain() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='a'>
                <state id='a'>
                  <transition target='b'/>
                </state>
                <state id='b'>
                  <transition cond='false' target='a'/>
                  <transition target='end'/>
                </state>
                <final id='end'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (_record, final_config) =
            run_fsm_test("eventless_transitions", fsm, 3000, |_session| {});

        assert_eq!(final_config.unwrap(), vec!["end".to_string()]);
    }

    #[test]
    fn done_event_carries_donedata() {
        let fsm = scxml_reader::parse_from_xml(
            r"<scxml initial='c'>
                <state id='c' initial='working'>
                  <state id='working'>
                    <transition event='finish' target='done_child'/>
                  </state>
                  <final id='done_child'>
                    <donedata><param name='result' expr='41 + 1'/></donedata>
                  </final>
                  <transition event='done.state.c' cond='_event.data.result == 42' target='happy'/>
                </state>
                <state id='happy'/>
              </scxml>"
                .to_string(),
        )
        .unwrap();

        let (_record, final_config) = run_fsm_test("donedata", fsm, 3000, |session| {
            session.send("finish", None);
        });

        assert_eq!(final_config.unwrap(), vec!["happy".to_string()]);
    }
}
