//! Implements a SAX parser for SCXML documents according to the W3C
//! recommendation.\
//! See [W3C:SCXML Overview](https://www.w3.org/TR/scxml/#overview).

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::{env, mem, str, string::String};

#[cfg(feature = "Debug_Reader")]
use log::debug;
use log::{error, warn};

use lazy_static::lazy_static;
use quick_xml::events::attributes::Attributes;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;

use crate::common::ArgOption;
use crate::datamodel::{DataEntry, ScxmlError};
use crate::executable_content::{
    get_opt_executable_content_as, get_safe_executable_content_as, parse_duration_to_milliseconds,
    Assign, Custom, ExecutableContent, Expression, FinalizeCopy, ForEach, If, Log, Raise,
};
use crate::fsm::{
    map_history_type, map_transition_type, push_param, BindingType, Cancel, CommonContent,
    DoneData, ExecutableContentId, Fsm, HistoryType, Invoke, Parameter, SendParameters, State,
    StateId, Transition, TransitionId, TransitionType, ID_COUNTER,
};

pub type AttributeMap = HashMap<String, String>;
pub type XReader<'a> = Reader<&'a [u8]>;

pub const SCXML_NAMESPACE: &str = "http://www.w3.org/2005/07/scxml";

pub static INCLUDE_PATH_ARGUMENT_OPTION: ArgOption = ArgOption {
    name: "includePaths",
    with_value: true,
    required: false,
};

pub fn include_path_from_arguments(
    named_arguments: &HashMap<&'static str, String>,
) -> Vec<PathBuf> {
    let mut include_paths = Vec::new();
    if let Some(paths) = named_arguments.get(INCLUDE_PATH_ARGUMENT_OPTION.name) {
        for pa in env::split_paths(&paths) {
            include_paths.push(pa.to_owned());
        }
    }
    include_paths
}

/// True if the source string is an inline SCXML document (in contrast to a
/// path or URL pointing to one).
pub fn is_inline_document(source: &str) -> bool {
    lazy_static! {
        static ref INLINE_RE: Regex = Regex::new("<[^>]*scxml").unwrap();
    }
    INLINE_RE.is_match(source)
}

/// Hook to rewrite custom-namespaced elements into SCXML before traversal.
/// The handler receives the element and returns replacement XML that is
/// parsed in place of it.
pub type PreprocessHandler = Arc<dyn Fn(&Custom) -> String + Send + Sync>;

lazy_static! {
    static ref PREPROCESSORS: Mutex<HashMap<String, PreprocessHandler>> =
        Mutex::new(HashMap::new());
}

/// Registers a preprocessor for the given namespace.
pub fn register_preprocessor(namespace: &str, handler: PreprocessHandler) {
    PREPROCESSORS
        .lock()
        .unwrap()
        .insert(namespace.to_string(), handler);
}

fn get_preprocessor(namespace: &str) -> Option<PreprocessHandler> {
    PREPROCESSORS.lock().unwrap().get(namespace).cloned()
}

pub const TAG_SCXML: &str = "scxml";
pub const ATTR_NAME: &str = "name";
pub const ATTR_BINDING: &str = "binding";
pub const ATTR_EXMODE: &str = "exmode";

pub const ATTR_DATAMODEL: &str = "datamodel";

pub const TAG_DATAMODEL: &str = "datamodel";
pub const TAG_DATA: &str = "data";
pub const TAG_VERSION: &str = "version";
pub const TAG_INITIAL: &str = "initial";
pub const ATTR_ID: &str = "id";

pub const TAG_STATE: &str = "state";
pub const ATTR_INITIAL: &str = "initial";
pub const TAG_HISTORY: &str = "history";
pub const TAG_PARALLEL: &str = "parallel";
pub const TAG_FINAL: &str = "final";
pub const TAG_TRANSITION: &str = "transition";
pub const ATTR_COND: &str = "cond";
pub const TAG_EVENT: &str = "event";
pub const TAG_TYPE: &str = "type";
pub const TAG_ON_ENTRY: &str = "onentry";
pub const TAG_ON_EXIT: &str = "onexit";
pub const TAG_INVOKE: &str = "invoke";
pub const ATTR_SRCEXPR: &str = "srcexpr";
pub const ATTR_AUTOFORWARD: &str = "autoforward";

pub const TAG_FINALIZE: &str = "finalize";
pub const TAG_DONEDATA: &str = "donedata";

pub const TAG_INCLUDE: &str = "include";
pub const TAG_HREF: &str = "href";
pub const ATTR_PARSE: &str = "parse";
pub const ATTR_XPOINTER: &str = "xpointer";

/// Executable content
pub const TAG_RAISE: &str = "raise";
pub const TAG_SEND: &str = "send";

pub const ATTR_EVENT: &str = "event";
pub const ATTR_EVENTEXPR: &str = "eventexpr";
pub const ATTR_TARGET: &str = "target";
pub const ATTR_TARGETEXPR: &str = "targetexpr";
pub const ATTR_TYPE: &str = "type";
pub const ATTR_TYPEEXPR: &str = "typeexpr";
pub const ATTR_IDLOCATION: &str = "idlocation";
pub const ATTR_DELAY: &str = "delay";
pub const ATTR_DELAYEXPR: &str = "delayexpr";
pub const ATTR_NAMELIST: &str = "namelist";
pub const TAG_PARAM: &str = "param";
pub const TAG_CONTENT: &str = "content";

pub const TAG_LOG: &str = "log";
pub const TAG_SCRIPT: &str = "script";
pub const ATTR_SRC: &str = "src";
pub const TAG_ASSIGN: &str = "assign";
pub const ATTR_LOCATION: &str = "location";

pub const TAG_IF: &str = "if";
pub const TAG_FOR_EACH: &str = "foreach";
pub const ATTR_ARRAY: &str = "array";
pub const ATTR_ITEM: &str = "item";
pub const ATTR_INDEX: &str = "index";

pub const TAG_CANCEL: &str = "cancel";
pub const ATTR_SENDIDEXPR: &str = "sendidexpr";
pub const ATTR_SENDID: &str = "sendid";

pub const TAG_ELSE: &str = "else";
pub const TAG_ELSEIF: &str = "elseif";

pub const ATTR_LABEL: &str = "label";
pub const ATTR_EXPR: &str = "expr";

struct ReaderStackItem {
    current_state: StateId,
    current_transition: TransitionId,
    current_tag: String,
}

impl ReaderStackItem {
    pub fn new(o: &ReaderStackItem) -> ReaderStackItem {
        ReaderStackItem {
            current_state: o.current_state,
            current_transition: o.current_transition,
            current_tag: o.current_tag.clone(),
        }
    }
}

struct ReaderState {
    // True if reader is inside an scxml element
    in_scxml: bool,
    id_count: i32,
    doc_id_count: u32,
    file: PathBuf,
    content: String,

    // The resulting fsm
    fsm: Box<Fsm>,

    current: ReaderStackItem,
    stack: Vec<ReaderStackItem>,
    executable_content_stack: Vec<(ExecutableContentId, &'static str)>,
    current_executable_content: ExecutableContentId,
    include_paths: Vec<PathBuf>,

    /// xmlns prefix declarations of the root element.
    ns_prefixes: HashMap<String, String>,

    /// Collected src-fetch failures. All of them are reported at once after
    /// the traversal finished.
    fetch_errors: Vec<String>,

    /// Set if exmode='strict' rejected some content.
    strict_error: Option<String>,
}

impl ReaderState {
    pub fn new() -> ReaderState {
        ReaderState {
            in_scxml: false,
            id_count: 0,
            doc_id_count: 0,
            stack: vec![],
            executable_content_stack: vec![],
            current_executable_content: 0,
            current: ReaderStackItem {
                current_state: 0,
                current_transition: 0,
                current_tag: "".to_string(),
            },
            fsm: Box::new(Fsm::new()),
            file: Path::new("Buffer").to_path_buf(),
            content: "".to_string(),
            include_paths: Vec::new(),
            ns_prefixes: HashMap::new(),
            fetch_errors: Vec::new(),
            strict_error: None,
        }
    }

    fn next_doc_id(&mut self) -> u32 {
        self.doc_id_count += 1;
        self.doc_id_count
    }

    /// Process a XML file.
    /// For technical reasons (to handle user content) the file is read into a
    /// buffer first.
    fn process_file(&mut self, file: &Path) -> Result<(), ScxmlError> {
        self.file.clone_from(&file.to_path_buf());
        match File::open(self.file.clone()) {
            Ok(mut f) => {
                self.content.clear();
                match f.read_to_string(&mut self.content) {
                    Ok(_len) => self.process(),
                    Err(e) => Err(ScxmlError::Parse(format!(
                        "Failed to read {:?}. {}",
                        self.file, e
                    ))),
                }
            }
            Err(e) => Err(ScxmlError::Parse(format!(
                "Failed to open {:?}. {}",
                self.file, e
            ))),
        }
    }

    /// Process all events from the current content.
    fn process(&mut self) -> Result<(), ScxmlError> {
        self.ensure_default_namespace();
        self.process_current_content()?;

        if !self.fetch_errors.is_empty() {
            return Err(ScxmlError::ScriptFetch(self.fetch_errors.join("; ")));
        }
        if let Some(msg) = &self.strict_error {
            return Err(ScxmlError::Parse(msg.clone()));
        }
        Ok(())
    }

    fn process_current_content(&mut self) -> Result<(), ScxmlError> {
        #[cfg(feature = "Debug_Reader")]
        debug!(">>> Reading {:?}", self.file);

        // The reader needs its own copy of "content", read_content slices the
        // original buffer by reader positions.
        let ct = self.content.clone();
        let mut reader = Reader::from_str(ct.as_str());
        reader.config_mut().trim_text(true);

        loop {
            match reader.read_event() {
                Err(e) => {
                    return Err(ScxmlError::Parse(format!(
                        "Error at position {}: {:?}",
                        reader.buffer_position(),
                        e
                    )));
                }
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) => {
                    self.start_element(&mut reader, &e, true);
                }
                Ok(Event::End(e)) => {
                    self.end_element(str::from_utf8(e.name().as_ref()).unwrap());
                }
                Ok(Event::Empty(e)) => {
                    // Element without content.
                    self.start_element(&mut reader, &e, false);
                    self.end_element(str::from_utf8(e.name().as_ref()).unwrap());
                }
                Ok(Event::Text(_e)) => {}
                Ok(Event::Comment(_e)) => {
                    #[cfg(feature = "Debug_Reader")]
                    debug!("Comment: {}", _e.unescape().unwrap())
                }
                Ok(_e) => {
                    #[cfg(feature = "Debug_Reader")]
                    debug!("Ignored SAX Event {:?}", _e)
                }
            }
        }
        #[cfg(feature = "Debug_Reader")]
        debug!("<<< {:?}", self.file);
        Ok(())
    }

    /// Processes a XML fragment (e.g. from a preprocessor) in the current
    /// context.
    fn process_fragment(&mut self, fragment: String) -> Result<(), ScxmlError> {
        let org_content = mem::replace(&mut self.content, fragment);
        let result = self.process_current_content();
        self.content = org_content;
        result
    }

    /// If the root tag contains `scxml` but lacks the default namespace
    /// declaration, it is added for parsing purposes.
    fn ensure_default_namespace(&mut self) {
        if let Some(start) = self.content.find("<scxml") {
            let tag_end = self.content[start..]
                .find('>')
                .map(|p| start + p)
                .unwrap_or(self.content.len());
            if !self.content[start..tag_end].contains("xmlns") {
                warn!(
                    "Your document lacks the correct default namespace declaration. \
                     It has been added for you, for parsing purposes."
                );
                self.content = self.content.replacen(
                    "<scxml",
                    format!("<scxml xmlns='{}'", SCXML_NAMESPACE).as_str(),
                    1,
                );
            }
        }
    }

    fn push(&mut self, tag: &str) {
        self.stack.push(ReaderStackItem::new(&self.current));
        self.current.current_tag = tag.to_string();
    }

    fn pop(&mut self) {
        let p = self.stack.pop();
        if p.is_some() {
            self.current = p.unwrap();
        }
    }

    fn generate_name(&mut self, tag: &str, doc_id: u32, parent: StateId) -> String {
        self.id_count += 1;
        let parent_name = if parent != 0 {
            self.fsm.get_state_by_id(parent).name.clone()
        } else {
            "__main__".to_string()
        };
        format!("{}_{}_child_{}", parent_name, tag, doc_id)
    }

    fn parse_location_expressions(&mut self, location_expr: &str, targets: &mut Vec<String>) {
        location_expr.split_ascii_whitespace().for_each(|location| {
            targets.push(location.to_string());
        });
    }

    fn parse_state_specification(&mut self, target_name: &str, targets: &mut Vec<StateId>) {
        target_name
            .split_ascii_whitespace()
            .for_each(|target| targets.push(self.get_or_create_state(target, false)));
    }

    fn parse_boolean(&mut self, value: &Option<&String>, default: bool) -> bool {
        match value {
            Some(val) => val.eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    fn get_state_by_id_mut(&mut self, id: StateId) -> &mut State {
        self.fsm.get_state_by_id_mut(id)
    }

    fn get_current_state(&mut self) -> &mut State {
        let id = self.current.current_state;
        if id == 0 {
            panic!("Internal error: Current State is unknown");
        }
        self.get_state_by_id_mut(id)
    }

    fn get_current_transition(&mut self) -> &mut Transition {
        let id = self.current.current_transition;
        if id == 0 {
            panic!("Internal error: Current Transition is unknown");
        }
        self.fsm.get_transition_by_id_mut(id)
    }

    /// Starts a new region of executable content.\
    /// A stack is used to handle nested executable content.
    /// This stack works independently from the main element stack, but should
    /// be considered as synchronized with it.
    /// # Arguments
    /// * `stack` - If true, the current region is put on the stack and
    ///   continued after the matching
    ///   [end_executable_content_region](Self::end_executable_content_region).
    ///   If false, the current stack is discarded.
    /// * `tag` - Tag for which this region was started.
    fn start_executable_content_region(
        &mut self,
        stack: bool,
        tag: &'static str,
    ) -> ExecutableContentId {
        if stack {
            self.executable_content_stack
                .push((self.current_executable_content, tag));
        } else {
            self.executable_content_stack.clear();
        }
        self.current_executable_content = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "Debug_Reader")]
        debug!(
            " start executable content region #{}",
            self.current_executable_content
        );
        self.fsm
            .executableContent
            .insert(self.current_executable_content, Vec::new());
        self.current_executable_content
    }

    /// Get the last entry of the given content region.
    fn get_last_executable_content_entry_for_region(
        &mut self,
        ec_id: ExecutableContentId,
    ) -> Option<&mut dyn ExecutableContent> {
        let v = self.fsm.executableContent.get_mut(&ec_id);
        match v {
            Some(vc) => Some(vc.last_mut().unwrap().as_mut()),
            None => None,
        }
    }

    /// Ends the current executable content region and returns the region id.\
    /// The current id is reset to 0 or popped from stack if the stack is not
    /// empty. See [start_executable_content_region](Self::start_executable_content_region).
    fn end_executable_content_region(&mut self, tag: &'static str) -> ExecutableContentId {
        if self.current_executable_content == 0 {
            panic!("Try to end executable content in unsupported document part.");
        } else {
            let ec_id = self.current_executable_content;
            #[cfg(feature = "Debug_Reader")]
            debug!(" end executable content region #{}", ec_id);
            match self.executable_content_stack.pop() {
                Some((oec_id, oec_tag)) => {
                    self.current_executable_content = oec_id;
                    if (!tag.is_empty()) && tag.ne(oec_tag) {
                        self.end_executable_content_region(tag);
                    }
                }
                None => {
                    self.current_executable_content = 0;
                }
            };
            if self.fsm.executableContent.contains_key(&ec_id) {
                ec_id
            } else {
                0
            }
        }
    }

    /// Adds content to the current executable content region.
    fn add_executable_content(&mut self, ec: Box<dyn ExecutableContent>) {
        if self.current_executable_content == 0 {
            panic!("Try to add executable content to unsupported document part.");
        } else {
            #[cfg(feature = "Debug_Reader")]
            debug!(
                "Adding executable content '{}' to #{}",
                ec.get_type(),
                self.current_executable_content
            );
            self.fsm
                .executableContent
                .get_mut(&self.current_executable_content)
                .unwrap()
                .push(ec);
        }
    }

    fn get_parent_tag(&self) -> &str {
        let mut r = "";
        if !self.stack.is_empty() {
            r = self.stack.last().as_ref().unwrap().current_tag.as_str();
        }
        r
    }

    pub fn verify_parent_tag(&self, name: &str, allowed_parents: &[&str]) -> &str {
        let parent_tag = self.get_parent_tag();
        if !allowed_parents.contains(&parent_tag) {
            let mut allowed_parents_s = "".to_string();
            let len = allowed_parents.len();
            for (i, ai) in allowed_parents.iter().enumerate() {
                allowed_parents_s += format!(
                    "{}<{}>",
                    if i > 0 {
                        if i < (len - 1) {
                            ", "
                        } else {
                            " or "
                        }
                    } else {
                        ""
                    },
                    ai
                )
                .as_str();
            }
            panic!(
                "<{}> inside <{}>. Only allowed inside {}",
                name, parent_tag, allowed_parents_s
            );
        }
        parent_tag
    }

    fn get_or_create_state(&mut self, name: &str, parallel: bool) -> StateId {
        let m = self.fsm.statesNames.get(name).cloned();
        match m {
            None => {
                let mut s = State::new(name);
                s.id = (self.fsm.states.len() + 1) as StateId;
                s.is_parallel = parallel;
                let sid = s.id;
                self.fsm.statesNames.insert(s.name.clone(), s.id);
                self.fsm.states.push(s);
                sid
            }
            Some(id) => {
                if parallel {
                    self.fsm
                        .states
                        .get_mut((id - 1) as usize)
                        .unwrap()
                        .is_parallel = true;
                }
                id
            }
        }
    }

    fn get_or_create_state_with_attributes(
        &mut self,
        attr: &AttributeMap,
        tag: &str,
        parallel: bool,
        parent: StateId,
    ) -> StateId {
        let doc_id = self.next_doc_id();
        let sname = match attr.get(ATTR_ID) {
            None => self.generate_name(tag, doc_id, parent),
            Some(id) => id.clone(),
        };
        let id = self.get_or_create_state(&sname, parallel);

        let initial;
        match attr.get(ATTR_INITIAL) {
            None => initial = 0,
            Some(id_refs) => {
                // Create the initial-transition with the initial states
                let mut t = Transition::new();
                t.doc_id = self.next_doc_id();
                t.transition_type = TransitionType::Internal;
                t.source = id;
                initial = t.id;
                self.parse_state_specification(id_refs, &mut t.target);
                self.fsm.transitions.insert(t.id, t);
            }
        }

        let state = self.get_state_by_id_mut(id);
        if initial != 0 {
            state.initial = initial;
        }
        if state.doc_id == 0 {
            state.doc_id = doc_id;
        }

        if parent != 0 {
            state.parent = parent;
            let parent_state = self.get_state_by_id_mut(parent);
            if !parent_state.states.contains(&id) {
                parent_state.states.push(id);
            }
        }
        id
    }

    fn get_required_attr<'a>(tag: &str, attribute: &str, attr: &'a AttributeMap) -> &'a String {
        let attr = attr.get(attribute);
        if attr.is_none() {
            panic!("<{}> requires attribute {}", tag, attribute);
        }
        attr.unwrap()
    }

    fn read_from_uri(&mut self, uri: &str) -> Result<String, String> {
        match url::Url::parse(uri) {
            Ok(parsed) => match parsed.scheme().to_ascii_lowercase().as_str() {
                "file" => self.read_from_relative_path(parsed.path()),
                "http" | "https" => match ureq::get(uri).call() {
                    Ok(response) => response
                        .into_string()
                        .map_err(|e| format!("Failed to decode from {}. {}", uri, e)),
                    Err(e) => Err(format!("Failed to download {}. {}", uri, e)),
                },
                // Unknown schemes are likely drive letters, try as a path.
                _ => self.read_from_relative_path(uri),
            },
            Err(_e) => {
                #[cfg(feature = "Debug_Reader")]
                debug!("{} is not a URI ({}). Try loading as relative path...", uri, _e);
                self.read_from_relative_path(uri)
            }
        }
    }

    fn read_from_relative_path(&mut self, path: &str) -> Result<String, String> {
        let file_src = self.get_resolved_path(path)?;
        self.file.clone_from(&file_src);
        match File::open(file_src.clone()) {
            Ok(mut file) => {
                let mut buf = String::new();
                match file.read_to_string(&mut buf) {
                    Ok(_r) => Ok(buf),
                    Err(e) => Err(e.to_string()),
                }
            }
            Err(e) => Err(format!(
                "Failed to load relative path {:?}: {}",
                file_src, e
            )),
        }
    }

    /// Try to resolve a file name as absolute path, relative to the current
    /// file or relative to the include paths.
    fn get_resolved_path(&self, ps: &str) -> Result<PathBuf, String> {
        let src = Path::new(ps);
        if src.is_absolute() {
            if src.exists() {
                return Ok(src.to_owned());
            }
        } else {
            let to_current = match self.file.parent() {
                Some(parent_path) => parent_path.join(src),
                None => src.to_owned(),
            };
            if to_current.exists() {
                return Ok(to_current);
            }
            for ip in &self.include_paths {
                let rp = ip.join(src);
                if rp.exists() {
                    return Ok(rp);
                }
            }
        }
        Err(format!("Can not resolve {:?}", ps))
    }

    /// A new "parallel" element started
    fn start_parallel(&mut self, attr: &AttributeMap) -> StateId {
        self.verify_parent_tag(TAG_PARALLEL, &[TAG_SCXML, TAG_STATE, TAG_PARALLEL]);
        let state_id = self.get_or_create_state_with_attributes(
            attr,
            TAG_PARALLEL,
            true,
            self.current.current_state,
        );
        self.current.current_state = state_id;
        state_id
    }

    /// A new "final" element started
    fn start_final(&mut self, attr: &AttributeMap) -> StateId {
        self.verify_parent_tag(TAG_FINAL, &[TAG_SCXML, TAG_STATE]);
        let state_id = self.get_or_create_state_with_attributes(
            attr,
            TAG_FINAL,
            false,
            self.current.current_state,
        );
        self.fsm.get_state_by_id_mut(state_id).is_final = true;
        self.current.current_state = state_id;
        state_id
    }

    /// A new "donedata" element started
    fn start_donedata(&mut self) {
        self.verify_parent_tag(TAG_DONEDATA, &[TAG_FINAL]);
        self.get_current_state().donedata = Some(DoneData::new());
    }

    /// A new "history" element started
    fn start_history(&mut self, attr: &AttributeMap) -> StateId {
        self.verify_parent_tag(TAG_HISTORY, &[TAG_STATE, TAG_PARALLEL]);
        // History-states are not added to "states" of the parent (parent = 0)
        let state_id = self.get_or_create_state_with_attributes(attr, TAG_HISTORY, false, 0);
        if self.current.current_state > 0 {
            let parent_state = self.get_current_state();
            parent_state.history.push(state_id);
        }
        // Assign the parent manually, as get_or_create_state_with_attributes
        // did not get the parent.
        let hstate = self.fsm.get_state_by_id_mut(state_id);
        hstate.parent = self.current.current_state;

        match attr.get(TAG_TYPE) {
            None => hstate.history_type = HistoryType::Shallow,
            Some(type_name) => hstate.history_type = map_history_type(type_name),
        }
        self.current.current_state = state_id;
        state_id
    }

    /// A new "state" element started
    fn start_state(&mut self, attr: &AttributeMap) -> StateId {
        self.verify_parent_tag(TAG_STATE, &[TAG_SCXML, TAG_STATE, TAG_PARALLEL]);
        let sid = self.get_or_create_state_with_attributes(
            attr,
            TAG_STATE,
            false,
            self.current.current_state,
        );
        self.current.current_state = sid;
        sid
    }

    /// A "datamodel" element started (the element, not the attribute)
    fn start_datamodel(&mut self) {
        self.verify_parent_tag(TAG_DATAMODEL, &[TAG_SCXML, TAG_STATE, TAG_PARALLEL]);
    }

    /// A new "data" element started.
    /// The value is stored unevaluated, values are computed when the
    /// datamodel initializes (depending on the binding mode).
    fn start_data(&mut self, attr: &AttributeMap, reader: &mut XReader, has_content: bool) {
        self.verify_parent_tag(TAG_DATA, &[TAG_DATAMODEL]);

        let id = Self::get_required_attr(TAG_DATA, ATTR_ID, attr).clone();
        let src = attr.get(ATTR_SRC).cloned();
        let expr = attr.get(ATTR_EXPR).cloned();

        let inline_content = if has_content {
            self.read_content(TAG_DATA, reader)
        } else {
            String::new()
        };

        // W3C: In a conformant SCXML document, a <data> element may have
        // either a 'src' or an 'expr' attribute, but must not have both.
        // Furthermore, if either attribute is present, the element must not
        // have any children. Thus 'src', 'expr' and children are mutually
        // exclusive in the <data> element.
        let content = if let Some(src) = src {
            if !(expr.is_none() && inline_content.is_empty()) {
                panic!(
                    "{} shall have only {}, {} or children, but not some combination of them.",
                    TAG_DATA, ATTR_SRC, ATTR_EXPR
                );
            }
            match self.read_from_uri(&src) {
                Ok(source) => Some(source),
                Err(e) => {
                    error!("Can't read data source '{}'. {}", src, e);
                    self.fetch_errors.push(format!("{}: {}", src, e));
                    None
                }
            }
        } else if !inline_content.is_empty() {
            if expr.is_some() {
                panic!(
                    "{} shall have only {}, {} or children, but not some combination of them.",
                    TAG_DATA, ATTR_SRC, ATTR_EXPR
                );
            }
            Some(inline_content)
        } else {
            None
        };

        self.get_current_state()
            .data
            .entries
            .push(DataEntry { id, expr, content });
    }

    /// A "initial" element started (the element, not the attribute)
    fn start_initial(&mut self) {
        self.verify_parent_tag(TAG_INITIAL, &[TAG_STATE, TAG_PARALLEL]);
        if self.get_current_state().initial > 0 {
            panic!(
                "<{}> must not be specified if {}-attribute was given",
                TAG_INITIAL, ATTR_INITIAL
            )
        }
    }

    /// Records a structural error of the current \<invoke\>.
    /// W3C: such documents are not conformant, the platform raises
    /// "error.execution.invoke.parseerror" when the element is evaluated.
    fn set_invoke_parse_error(invoke: &mut Invoke, attr1: &str, attr2: &str) {
        error!(
            "{}: attributes {} and {} must not occur both",
            TAG_INVOKE, attr1, attr2
        );
        if invoke.parse_error.is_none() {
            invoke.parse_error = Some(format!(
                "attributes {} and {} must not occur both",
                attr1, attr2
            ));
        }
    }

    fn start_invoke(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(TAG_INVOKE, &[TAG_STATE, TAG_PARALLEL]);
        let mut invoke = Invoke::new();
        invoke.doc_id = self.next_doc_id();

        if let Some(type_opt) = attr.get(ATTR_TYPE) {
            if attr.get(ATTR_TYPEEXPR).is_some() {
                Self::set_invoke_parse_error(&mut invoke, ATTR_TYPE, ATTR_TYPEEXPR);
            }
            invoke.type_name.clone_from(type_opt);
        }
        if let Some(typeexpr) = attr.get(ATTR_TYPEEXPR) {
            invoke.type_expr.clone_from(typeexpr);
        }

        // W3C: Must not occur with the 'srcexpr' attribute or the <content> element.
        if let Some(src) = attr.get(ATTR_SRC) {
            if attr.get(ATTR_SRCEXPR).is_some() {
                Self::set_invoke_parse_error(&mut invoke, ATTR_SRC, ATTR_SRCEXPR);
            }
            invoke.src.clone_from(src);
        }
        if let Some(srcexpr) = attr.get(ATTR_SRCEXPR) {
            invoke.src_expr.clone_from(srcexpr);
        }

        // W3C: A conformant SCXML document may specify either the 'id' or
        // 'idlocation' attribute, but must not specify both.
        if let Some(id) = attr.get(ATTR_ID) {
            if attr.get(ATTR_IDLOCATION).is_some() {
                Self::set_invoke_parse_error(&mut invoke, ATTR_ID, ATTR_IDLOCATION);
            }
            invoke.invoke_id.clone_from(id);
        }
        if let Some(idlocation) = attr.get(ATTR_IDLOCATION) {
            invoke.external_id_location.clone_from(idlocation);
        }

        invoke
            .parent_state_name
            .clone_from(&self.get_current_state().name);

        if let Some(name_list) = attr.get(ATTR_NAMELIST) {
            let mut locations = Vec::new();
            self.parse_location_expressions(name_list, &mut locations);
            invoke.name_list = locations;
        }
        invoke.autoforward = self.parse_boolean(&attr.get(ATTR_AUTOFORWARD), false);

        self.get_current_state().invoke.push(invoke);
    }

    fn start_finalize(&mut self, _attr: &AttributeMap) {
        self.verify_parent_tag(TAG_FINALIZE, &[TAG_INVOKE]);
        self.start_executable_content_region(false, TAG_FINALIZE);
    }

    fn end_finalize(&mut self) {
        let ec_id = self.end_executable_content_region(TAG_FINALIZE);
        let region_is_empty = self
            .fsm
            .executableContent
            .get(&ec_id)
            .map(|v| v.is_empty())
            .unwrap_or(true);
        if region_is_empty {
            // W3C: If the <finalize> element is empty, the Processor copies
            // each value from the event into the matching location of the
            // namelist and <param location=..> entries.
            let pairs = {
                let state = self.get_current_state();
                let invoke = state.invoke.last_mut();
                let mut pairs: Vec<(String, String)> = invoke
                    .name_list
                    .iter()
                    .map(|n| (n.clone(), n.clone()))
                    .collect();
                if let Some(params) = &invoke.params {
                    for p in params {
                        if !p.location.is_empty() {
                            pairs.push((p.name.clone(), p.location.clone()));
                        }
                    }
                }
                pairs
            };
            self.fsm
                .executableContent
                .get_mut(&ec_id)
                .unwrap()
                .push(Box::new(FinalizeCopy { pairs }));
        }
        self.get_current_state().invoke.last_mut().finalize = ec_id;
    }

    fn start_transition(&mut self, attr: &AttributeMap) {
        let parent_tag = self
            .verify_parent_tag(
                TAG_TRANSITION,
                &[TAG_HISTORY, TAG_INITIAL, TAG_STATE, TAG_PARALLEL],
            )
            .to_string();

        let mut t = Transition::new();
        t.doc_id = self.next_doc_id();

        // Start the script region.
        self.start_executable_content_region(false, TAG_TRANSITION);

        if let Some(event) = attr.get(TAG_EVENT) {
            t.events = event
                .split_whitespace()
                .map(|s| {
                    // Strip redundant "." and ".*" suffixes
                    let mut rt = s;
                    let mut do_it = true;
                    while do_it {
                        do_it = false;
                        if let Some(r) = rt.strip_suffix(".*") {
                            do_it = true;
                            rt = r;
                        }
                        if let Some(r) = rt.strip_suffix('.') {
                            do_it = true;
                            rt = r;
                        }
                    }
                    rt.split('.').map(|token| token.to_string()).collect()
                })
                .collect();
            t.wildcard = t.events.contains(&vec!["*".to_string()]);
        }

        if let Some(cond) = attr.get(ATTR_COND) {
            t.cond = Some(cond.clone());
        }

        if let Some(target_name) = attr.get(ATTR_TARGET) {
            self.parse_state_specification(target_name, &mut t.target);
        }

        if let Some(trans_type) = attr.get(TAG_TYPE) {
            t.transition_type = map_transition_type(trans_type)
        }

        let state = self.get_current_state();

        if parent_tag.eq(TAG_INITIAL) {
            if state.initial > 0 {
                panic!("<initial> must not be specified if initial-attribute was given")
            }
            state.initial = t.id;
        } else {
            state.transitions.push(t.id);
        }
        t.source = state.id;
        self.current.current_transition = t.id;
        self.fsm.transitions.insert(t.id, t);
    }

    fn end_transition(&mut self) {
        let ec_id = self.end_executable_content_region(TAG_TRANSITION);
        let trans = self.get_current_transition();
        // Assign the collected content to the transition.
        trans.content = ec_id;
    }

    fn start_script(&mut self, attr: &AttributeMap, reader: &mut XReader, has_content: bool) {
        self.verify_parent_tag(
            TAG_SCRIPT,
            &[
                TAG_SCXML,
                TAG_TRANSITION,
                TAG_ON_EXIT,
                TAG_ON_ENTRY,
                TAG_IF,
                TAG_FOR_EACH,
                TAG_FINALIZE,
            ],
        );
        let at_root = self.get_parent_tag().eq(TAG_SCXML);

        let mut s = Expression::new();

        if let Some(file_src) = attr.get(ATTR_SRC) {
            // W3C: If the script can not be downloaded within a
            // platform-specific timeout interval, the document is considered
            // non-conformant, and the platform must reject it.
            match self.read_from_uri(file_src) {
                Ok(source) => {
                    s.content = source;
                }
                Err(e) => {
                    error!("Can't read script '{}'. {}", file_src, e);
                    self.fetch_errors.push(format!("{}: {}", file_src, e));
                }
            }
        }

        let script_text = if has_content {
            self.read_content(TAG_SCRIPT, reader)
        } else {
            String::new()
        };

        let src = script_text.trim();
        if !src.is_empty() {
            if !s.content.is_empty() {
                panic!("<script> with 'src' attribute shall not have content.")
            }
            s.content = src.to_string();
        }

        if at_root {
            // The global script, executed at startup.
            if self.fsm.script == 0 {
                let region = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
                self.fsm.executableContent.insert(region, Vec::new());
                self.fsm.script = region;
            }
            let script_region = self.fsm.script;
            self.fsm
                .executableContent
                .get_mut(&script_region)
                .unwrap()
                .push(Box::new(s));
        } else {
            self.add_executable_content(Box::new(s));
        }
    }

    fn start_for_each(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(
            TAG_FOR_EACH,
            &[
                TAG_ON_ENTRY,
                TAG_ON_EXIT,
                TAG_TRANSITION,
                TAG_FOR_EACH,
                TAG_IF,
                TAG_FINALIZE,
            ],
        );

        let ec_id = self.current_executable_content;
        let mut fe = ForEach::new();
        fe.array
            .clone_from(Self::get_required_attr(TAG_FOR_EACH, ATTR_ARRAY, attr));
        fe.item
            .clone_from(Self::get_required_attr(TAG_FOR_EACH, ATTR_ITEM, attr));
        if let Some(index) = attr.get(ATTR_INDEX) {
            fe.index.clone_from(index);
        }
        self.add_executable_content(Box::new(fe));
        let content_id = self.start_executable_content_region(true, TAG_FOR_EACH);

        let ec_opt = self.get_last_executable_content_entry_for_region(ec_id);
        match get_opt_executable_content_as::<ForEach>(ec_opt) {
            Some(fe) => {
                fe.content = content_id;
            }
            None => {
                panic!(
                    "Internal Error: Executable Content missing in start_for_each in region #{}",
                    ec_id
                );
            }
        }
    }

    fn end_for_each(&mut self) {
        self.end_executable_content_region(TAG_FOR_EACH);
    }

    fn start_cancel(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(
            TAG_CANCEL,
            &[
                TAG_TRANSITION,
                TAG_ON_EXIT,
                TAG_ON_ENTRY,
                TAG_IF,
                TAG_FOR_EACH,
            ],
        );

        let sendid = attr.get(ATTR_SENDID);
        let sendidexpr = attr.get(ATTR_SENDIDEXPR);

        let mut cancel = Cancel::new();

        if let Some(sendid_value) = sendid {
            if sendidexpr.is_some() {
                panic!(
                    "{}: attributes {} and {} must not occur both",
                    TAG_CANCEL, ATTR_SENDID, ATTR_SENDIDEXPR
                );
            }
            cancel.send_id.clone_from(sendid_value);
        } else if let Some(sendidexpr_value) = sendidexpr {
            cancel.send_id_expr.clone_from(sendidexpr_value);
        } else {
            panic!(
                "{}: attribute {} or {} must be given",
                TAG_CANCEL, ATTR_SENDID, ATTR_SENDIDEXPR
            );
        }
        self.add_executable_content(Box::new(cancel));
    }

    fn start_on_entry(&mut self, _attr: &AttributeMap) {
        self.verify_parent_tag(TAG_ON_ENTRY, &[TAG_STATE, TAG_PARALLEL, TAG_FINAL]);
        self.start_executable_content_region(false, TAG_ON_ENTRY);
    }

    fn end_on_entry(&mut self) {
        let ec_id = self.end_executable_content_region(TAG_ON_ENTRY);
        let state = self.get_current_state();
        // Add the collected content to on-entry.
        state.onentry = ec_id;
    }

    fn start_on_exit(&mut self, _attr: &AttributeMap) {
        self.verify_parent_tag(TAG_ON_EXIT, &[TAG_STATE, TAG_PARALLEL, TAG_FINAL]);
        self.start_executable_content_region(false, TAG_ON_EXIT);
    }

    fn end_on_exit(&mut self) {
        let ec_id = self.end_executable_content_region(TAG_ON_EXIT);
        let state = self.get_current_state();
        // Add the collected content to on-exit.
        state.onexit = ec_id;
    }

    fn start_if(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(
            TAG_IF,
            &[
                TAG_ON_ENTRY,
                TAG_ON_EXIT,
                TAG_TRANSITION,
                TAG_FOR_EACH,
                TAG_IF,
                TAG_FINALIZE,
            ],
        );

        let ec_if = If::new(Self::get_required_attr(TAG_IF, ATTR_COND, attr));
        self.add_executable_content(Box::new(ec_if));
        let if_id = self.current_executable_content;

        self.start_executable_content_region(true, TAG_IF);
        let if_cid = self.current_executable_content;

        let if_ec = self.get_last_executable_content_entry_for_region(if_id);
        match get_opt_executable_content_as::<If>(if_ec) {
            Some(evc_if) => {
                evc_if.content = if_cid;
            }
            None => {
                panic!(
                    "Internal Error: Executable Content missing in start_if in region #{}",
                    if_id
                );
            }
        }
    }

    fn end_if(&mut self) {
        let _content_id = self.end_executable_content_region(TAG_IF);
    }

    fn start_else_if(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(TAG_ELSEIF, &[TAG_IF]);

        // Close the parent <if> content region
        self.end_executable_content_region(TAG_IF);

        let mut if_id = self.current_executable_content;

        // Start a new "else" region - will contain only one "if", replacing
        // the current "if" stack element.
        self.start_executable_content_region(true, TAG_IF);
        let else_id = self.current_executable_content;

        // Add the new "if"
        let else_if = If::new(Self::get_required_attr(TAG_IF, ATTR_COND, attr));
        self.add_executable_content(Box::new(else_if));

        let else_if_content_id = self.start_executable_content_region(true, TAG_ELSEIF);

        // Put together
        let else_if_ec = self.get_last_executable_content_entry_for_region(else_id);
        match get_opt_executable_content_as::<If>(else_if_ec) {
            Some(evc_if) => {
                evc_if.content = else_if_content_id;
            }
            None => {
                panic!(
                    "Internal Error: Executable Content missing in start_else_if in region #{}",
                    else_id
                );
            }
        }

        while if_id > 0 {
            // Find the matching "if" level for the new "else if"
            let if_ec = self.get_last_executable_content_entry_for_region(if_id);
            match get_opt_executable_content_as::<If>(if_ec) {
                Some(evc_if) => {
                    if evc_if.else_content > 0 {
                        // Some higher "if". Go inside the else-region.
                        if_id = evc_if.else_content;
                    } else {
                        // Match, set the "else-region".
                        if_id = 0;
                        evc_if.else_content = else_id;
                    }
                }
                None => {
                    panic!("Internal Error: Executable Content missing in start_else_if");
                }
            }
        }
    }

    fn start_else(&mut self, _attr: &AttributeMap) {
        self.verify_parent_tag(TAG_ELSE, &[TAG_IF]);

        // Close the parent <if> content region
        self.end_executable_content_region(TAG_IF);

        let mut if_id = self.current_executable_content;

        // Start a new "else" region, replacing the "if" region.
        let else_id = self.start_executable_content_region(true, TAG_IF);

        // Put together. Set the deepest else.
        while if_id > 0 {
            let if_ec = self.get_last_executable_content_entry_for_region(if_id);
            match get_opt_executable_content_as::<If>(if_ec) {
                Some(evc_if) => {
                    if evc_if.else_content > 0 {
                        if_id = evc_if.else_content;
                    } else {
                        if_id = 0;
                        evc_if.else_content = else_id;
                    }
                }
                None => {
                    panic!("Internal Error: Executable Content missing in start_else");
                }
            }
        }
    }

    fn start_send(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(
            TAG_SEND,
            &[
                TAG_TRANSITION,
                TAG_ON_EXIT,
                TAG_ON_ENTRY,
                TAG_IF,
                TAG_FOR_EACH,
            ],
        );

        let mut send_params = SendParameters::new();

        let event = attr.get(ATTR_EVENT);
        let eventexpr = attr.get(ATTR_EVENTEXPR);

        if let Some(event_value) = event {
            if eventexpr.is_some() {
                panic!(
                    "{}: attributes {} and {} must not occur both",
                    TAG_SEND, ATTR_EVENT, ATTR_EVENTEXPR
                );
            }
            send_params.event.clone_from(event_value);
        } else if let Some(eventexpr_value) = eventexpr {
            send_params.event_expr.clone_from(eventexpr_value);
        }

        let target = attr.get(ATTR_TARGET);
        let targetexpr = attr.get(ATTR_TARGETEXPR);
        if let Some(target_val) = target {
            if targetexpr.is_some() {
                panic!(
                    "{}: attributes {} and {} must not occur both",
                    TAG_SEND, ATTR_TARGET, ATTR_TARGETEXPR
                );
            }
            send_params.target.clone_from(target_val);
        } else if let Some(targetexpr_value) = targetexpr {
            send_params.target_expr.clone_from(targetexpr_value);
        }

        let type_attr = attr.get(ATTR_TYPE);
        let typeexpr = attr.get(ATTR_TYPEEXPR);
        if let Some(type_attr_value) = type_attr {
            if typeexpr.is_some() {
                panic!(
                    "{}: attributes {} and {} must not occur both",
                    TAG_SEND, ATTR_TYPE, ATTR_TYPEEXPR
                );
            }
            send_params.type_value.clone_from(type_attr_value);
        } else if let Some(typeexpr_value) = typeexpr {
            send_params.type_expr.clone_from(typeexpr_value);
        }

        let id = attr.get(ATTR_ID);
        let idlocation = attr.get(ATTR_IDLOCATION);
        if let Some(id_value) = id {
            if idlocation.is_some() {
                panic!(
                    "{}: attributes {} and {} must not occur both",
                    TAG_SEND, ATTR_ID, ATTR_IDLOCATION
                );
            }
            send_params.name.clone_from(id_value);
        } else if let Some(idlocation_value) = idlocation {
            send_params.name_location.clone_from(idlocation_value);
        }

        let delay_attr = attr.get(ATTR_DELAY);
        let delay_expr_attr = attr.get(ATTR_DELAYEXPR);

        if let Some(delay_expr_attr_value) = delay_expr_attr {
            if delay_attr.is_some() {
                panic!(
                    "{}: attributes {} and {} must not occur both",
                    TAG_SEND, ATTR_DELAY, ATTR_DELAYEXPR
                );
            }
            send_params.delay_expr.clone_from(delay_expr_attr_value);
        } else if let Some(delay_attr_value) = delay_attr {
            let delayms = parse_duration_to_milliseconds(delay_attr_value);
            if delayms < 0 {
                panic!(
                    "{}: {} with illegal value '{}'",
                    TAG_SEND, ATTR_DELAY, delay_attr_value
                );
            } else {
                send_params.delay_ms = delayms as u64;
            }
        }

        if let Some(name_list_value) = attr.get(ATTR_NAMELIST) {
            let mut locations = Vec::new();
            self.parse_location_expressions(name_list_value, &mut locations);
            send_params.name_list = locations;
        }
        self.add_executable_content(Box::new(send_params));
    }

    /// Reads the content until the matching end-tag is encountered.
    fn read_content(&mut self, tag: &str, reader: &mut XReader) -> String {
        let start = BytesStart::new(tag.to_string());
        let end = start.to_end().into_owned();

        let mut buf = Vec::new();
        let content = match reader.read_to_end_into(end.name(), &mut buf) {
            Ok(span) => self.content[(span.start as usize)..(span.end as usize)]
                .trim()
                .to_string(),
            Err(e) => {
                panic!("XML invalid. {}", e);
            }
        };
        // Remove the element from the stack, its End event was consumed.
        self.pop();

        content
    }

    fn start_content(&mut self, attr: &AttributeMap, reader: &mut XReader, has_content: bool) {
        self.verify_parent_tag(TAG_CONTENT, &[TAG_SEND, TAG_INVOKE, TAG_DONEDATA]);

        let parent_tag = self.get_parent_tag().to_string();
        let expr = attr.get(ATTR_EXPR);

        let content = if has_content {
            Some(self.read_content(TAG_CONTENT, reader))
        } else {
            None
        };

        // W3C: A conformant SCXML document must not specify both the 'expr'
        // attribute and child content.
        if expr.is_some() && content.is_some() {
            panic!(
                "{} shall have only {} or children, but not both.",
                TAG_CONTENT, ATTR_EXPR
            );
        }

        let common_content = CommonContent {
            content,
            content_expr: expr.map(|x| x.to_string()),
        };

        match parent_tag.as_str() {
            TAG_DONEDATA => {
                let state = self.get_current_state();
                match state.donedata.as_mut() {
                    Some(dd) => {
                        dd.content = Some(common_content);
                    }
                    None => {
                        panic!("Internal Error: donedata-Option not initialized")
                    }
                }
            }
            TAG_INVOKE => {
                let state = self.get_current_state();
                let invoke = state.invoke.last_mut();
                invoke.content = Some(common_content);
            }
            TAG_SEND => {
                let ec_id = self.current_executable_content;
                let ec = self.get_last_executable_content_entry_for_region(ec_id);
                if let Some(ec) = ec {
                    let send = get_safe_executable_content_as::<SendParameters>(ec);
                    send.content = Some(common_content);
                }
            }
            _ => {
                panic!(
                    "Internal Error: invalid parent-tag <{}> in start_content",
                    parent_tag
                )
            }
        }
    }

    fn start_param(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(TAG_PARAM, &[TAG_SEND, TAG_INVOKE, TAG_DONEDATA]);

        let parent_tag = self.get_parent_tag().to_string();

        let mut param = Parameter::new();

        param
            .name
            .clone_from(Self::get_required_attr(TAG_PARAM, ATTR_NAME, attr));
        let expr = attr.get(ATTR_EXPR);
        if let Some(expr_value) = expr {
            param.expr.clone_from(expr_value);
        }
        if let Some(location_value) = attr.get(ATTR_LOCATION) {
            if expr.is_some() {
                panic!(
                    "{} shall have only {} or {}, but not both.",
                    TAG_PARAM, ATTR_LOCATION, ATTR_EXPR
                );
            }
            param.location.clone_from(location_value);
        }

        match parent_tag.as_str() {
            TAG_SEND => {
                let ec_id = self.current_executable_content;
                let ec = self.get_last_executable_content_entry_for_region(ec_id);
                let send = get_safe_executable_content_as::<SendParameters>(ec.unwrap());
                push_param(&mut send.params, param);
            }
            TAG_INVOKE => {
                let state = self.get_current_state();
                push_param(&mut state.invoke.last_mut().params, param);
            }
            TAG_DONEDATA => {
                let state = self.get_current_state();
                match state.donedata.as_mut() {
                    Some(dd) => {
                        push_param(&mut dd.params, param);
                    }
                    None => {
                        panic!("Internal Error: donedata-Option not initialized")
                    }
                }
            }
            _ => {
                panic!(
                    "Internal Error: invalid parent-tag <{}> in start_param",
                    parent_tag
                )
            }
        }
    }

    fn start_log(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(
            TAG_LOG,
            &[
                TAG_TRANSITION,
                TAG_ON_EXIT,
                TAG_ON_ENTRY,
                TAG_IF,
                TAG_FOR_EACH,
                TAG_FINALIZE,
            ],
        );
        let label = attr.get(ATTR_LABEL);
        if let Some(expr) = attr.get(ATTR_EXPR) {
            self.add_executable_content(Box::new(Log::new(&label, expr.as_str())));
        }
    }

    fn start_assign(&mut self, attr: &AttributeMap, reader: &mut XReader, has_content: bool) {
        self.verify_parent_tag(
            TAG_ASSIGN,
            &[
                TAG_TRANSITION,
                TAG_ON_EXIT,
                TAG_ON_ENTRY,
                TAG_IF,
                TAG_FOR_EACH,
                TAG_FINALIZE,
            ],
        );

        let mut assign = Assign::new();
        assign
            .location
            .clone_from(Self::get_required_attr(TAG_ASSIGN, ATTR_LOCATION, attr));

        if let Some(expr_value) = attr.get(ATTR_EXPR) {
            assign.expr.clone_from(expr_value);
        }

        let assign_text = if has_content {
            self.read_content(TAG_ASSIGN, reader)
        } else {
            String::new()
        };

        let assign_src = assign_text.trim();
        if !assign_src.is_empty() {
            if !assign.expr.is_empty() {
                panic!("<assign> with 'expr' attribute shall not have content.")
            }
            assign.expr = assign_src.to_string();
        }

        self.add_executable_content(Box::new(assign));
    }

    fn start_raise(&mut self, attr: &AttributeMap) {
        self.verify_parent_tag(
            TAG_RAISE,
            &[
                TAG_TRANSITION,
                TAG_ON_EXIT,
                TAG_ON_ENTRY,
                TAG_IF,
                TAG_FOR_EACH,
            ],
        );

        let mut raise = Raise::new();
        raise
            .event
            .clone_from(Self::get_required_attr(TAG_RAISE, ATTR_EVENT, attr));

        self.add_executable_content(Box::new(raise));
    }

    fn start_scxml(&mut self, attr: &AttributeMap) {
        if self.in_scxml {
            panic!("Only one <{}> allowed", TAG_SCXML);
        }
        self.in_scxml = true;

        // Remember xmlns prefix declarations, needed to resolve
        // custom-namespaced elements.
        for (key, value) in attr {
            if let Some(prefix) = key.strip_prefix("xmlns:") {
                self.ns_prefixes.insert(prefix.to_string(), value.clone());
            }
        }

        if let Some(n) = attr.get(ATTR_NAME) {
            self.fsm.name.clone_from(n);
        }
        if let Some(datamodel) = attr.get(ATTR_DATAMODEL) {
            self.fsm.datamodel = datamodel.to_string();
        }
        if let Some(binding) = attr.get(ATTR_BINDING) {
            match BindingType::from_str(binding) {
                Ok(t) => {
                    self.fsm.binding = t;
                }
                Err(_e) => {
                    panic!("{}: unsupported value {}", ATTR_BINDING, binding)
                }
            }
        }
        // W3C: exmode declares how to treat unrecognized content,
        // "lax" (default) ignores it, "strict" rejects the document.
        if let Some(exmode) = attr.get(ATTR_EXMODE) {
            self.fsm.strict_mode = exmode.eq_ignore_ascii_case("strict");
        }
        if let Some(version_value) = attr.get(TAG_VERSION) {
            self.fsm.version.clone_from(version_value);
        }

        let mut root_attr = attr.clone();
        root_attr
            .entry(ATTR_ID.to_string())
            .or_insert_with(|| "__main__".to_string());
        self.fsm.pseudo_root =
            self.get_or_create_state_with_attributes(&root_attr, TAG_SCXML, false, 0);
        self.current.current_state = self.fsm.pseudo_root;
    }

    fn end_scxml(&mut self) {
        self.set_default_initial(self.fsm.pseudo_root);
    }

    fn set_default_initial(&mut self, id: StateId) {
        let doc_id = self.next_doc_id();
        let state = self.get_state_by_id_mut(id);
        if state.initial == 0 {
            // W3C: If not specified, the default initial state is the first
            // child state in document order.
            match state.states.first() {
                None => {
                    // No child states at all
                }
                Some(first_state) => {
                    let mut t = Transition::new();
                    t.doc_id = doc_id;
                    t.transition_type = TransitionType::Internal;
                    state.initial = t.id;
                    t.source = state.id;
                    t.target.push(*first_state);
                    self.fsm.transitions.insert(t.id, t);
                }
            }
        }
    }

    fn end_state(&mut self) {
        // W3C: If not specified, the default initial state is the first child
        // state in document order.
        self.set_default_initial(self.current.current_state);
    }

    /// Handles an element in a foreign namespace.
    /// A registered preprocessor rewrites it into SCXML, a registered custom
    /// executable handler is bound for runtime dispatch. Everything else is
    /// ignored in lax mode and rejected in strict mode.
    ///
    /// The element is already on the tag-stack. With content, the whole
    /// subtree (including the end-tag) is consumed here, otherwise the
    /// following end-event pops the element.
    fn start_custom_element(
        &mut self,
        prefix: &str,
        local_name: &str,
        qname: &str,
        attr: &AttributeMap,
        reader: &mut XReader,
        has_content: bool,
    ) {
        let namespace = self.ns_prefixes.get(prefix).cloned().unwrap_or_default();

        let text = if has_content {
            self.read_content(qname, reader)
        } else {
            String::new()
        };

        let element = Custom {
            namespace: namespace.clone(),
            tag: local_name.to_string(),
            attributes: attr.clone(),
            text,
        };

        if let Some(preprocessor) = get_preprocessor(&namespace) {
            // The rewritten content replaces the element, so the fragment is
            // parsed with the element's parent as context.
            if !has_content {
                self.pop();
            }
            let fragment = preprocessor(&element);
            if let Err(e) = self.process_fragment(fragment) {
                panic!("Preprocessing of <{}> failed: {}", qname, e);
            }
            if !has_content {
                // The end-event of the element still follows.
                self.push(qname);
            }
        } else if self.current_executable_content != 0
            && crate::executable_content::get_custom_executable(&namespace).is_some()
        {
            self.add_executable_content(Box::new(element));
        } else if self.fsm.strict_mode {
            self.strict_error = Some(format!(
                "Unrecognized executable content <{}> ({})",
                qname, namespace
            ));
        } else {
            #[cfg(feature = "Debug_Reader")]
            debug!("Ignored custom element <{}>", qname);
        }
    }

    fn start_element(&mut self, reader: &mut XReader, e: &BytesStart, has_content: bool) {
        let n = e.name();
        let name = str::from_utf8(n.as_ref()).unwrap().to_string();
        self.push(&name);

        #[cfg(feature = "Debug_Reader")]
        debug!("Start Element {}", name);

        let attr = &decode_attributes(reader, &mut e.attributes());

        if let Some((prefix, local_name)) = name.split_once(':') {
            let prefix = prefix.to_string();
            let local_name = local_name.to_string();
            self.start_custom_element(&prefix, &local_name, &name, attr, reader, has_content);
            return;
        }

        match name.as_str() {
            TAG_INCLUDE => {
                self.include(attr);
            }
            TAG_SCXML => {
                self.start_scxml(attr);
            }
            TAG_DATAMODEL => {
                self.start_datamodel();
            }
            TAG_DATA => {
                self.start_data(attr, reader, has_content);
            }
            TAG_STATE => {
                self.start_state(attr);
            }
            TAG_PARALLEL => {
                self.start_parallel(attr);
            }
            TAG_FINAL => {
                self.start_final(attr);
            }
            TAG_DONEDATA => {
                self.start_donedata();
            }
            TAG_HISTORY => {
                self.start_history(attr);
            }
            TAG_INITIAL => {
                self.start_initial();
            }
            TAG_INVOKE => {
                self.start_invoke(attr);
            }
            TAG_TRANSITION => {
                self.start_transition(attr);
            }
            TAG_FINALIZE => {
                self.start_finalize(attr);
            }
            TAG_ON_ENTRY => {
                self.start_on_entry(attr);
            }
            TAG_ON_EXIT => {
                self.start_on_exit(attr);
            }
            TAG_SCRIPT => {
                self.start_script(attr, reader, has_content);
            }
            TAG_RAISE => {
                self.start_raise(attr);
            }
            TAG_SEND => {
                self.start_send(attr);
            }
            TAG_PARAM => {
                self.start_param(attr);
            }
            TAG_CONTENT => {
                self.start_content(attr, reader, has_content);
            }
            TAG_LOG => {
                self.start_log(attr);
            }
            TAG_ASSIGN => {
                self.start_assign(attr, reader, has_content);
            }
            TAG_FOR_EACH => {
                self.start_for_each(attr);
            }
            TAG_CANCEL => {
                self.start_cancel(attr);
            }
            TAG_IF => {
                self.start_if(attr);
            }
            TAG_ELSE => {
                self.start_else(attr);
            }
            TAG_ELSEIF => {
                self.start_else_if(attr);
            }
            _ => {
                if self.current_executable_content != 0 && self.fsm.strict_mode {
                    self.strict_error =
                        Some(format!("Unrecognized executable content <{}>", name));
                }
                #[cfg(feature = "Debug_Reader")]
                debug!("Ignored tag {}", name)
            }
        }
    }

    /// Handle a XInclude include element.
    /// See <https://www.w3.org/TR/xinclude/>.
    /// Only parse="text" and "href" with a relative path are supported,
    /// no "xpointer" etc.
    fn include(&mut self, attr: &AttributeMap) {
        let href = Self::get_required_attr(TAG_INCLUDE, TAG_HREF, attr);
        let parse = attr.get(ATTR_PARSE);
        if parse.is_none() || parse.unwrap().ne("text") {
            panic!("{}: only {}='text' is supported", TAG_INCLUDE, ATTR_PARSE)
        }
        if attr.get(ATTR_XPOINTER).is_some() {
            panic!("{}: {} is not supported", TAG_INCLUDE, ATTR_XPOINTER)
        }

        // Remove "include" from the parent-stack while reading the content.
        self.pop();

        match self.get_resolved_path(href.as_str()) {
            Ok(src) => {
                let org_file = mem::take(&mut self.file);
                let org_content = mem::take(&mut self.content);
                self.file.clone_from(&src);
                let rs = match File::open(src.clone()) {
                    Ok(mut f) => {
                        self.content.clear();
                        match f.read_to_string(&mut self.content) {
                            Ok(_len) => self.process_current_content(),
                            Err(e) => Err(ScxmlError::Parse(format!(
                                "Failed to read {:?}. {}",
                                src, e
                            ))),
                        }
                    }
                    Err(e) => Err(ScxmlError::Parse(format!(
                        "Failed to open {:?}. {}",
                        src, e
                    ))),
                };
                if let Err(err) = rs {
                    panic!("Failed to include {:?}. {}", src, err);
                }
                self.file = org_file;
                self.content = org_content;
            }
            Err(err) => {
                panic!("Can't resolve path {}: {}", href, err);
            }
        }

        self.push(TAG_INCLUDE);
    }

    /// Called from the SAX handler if some end-tag was read.
    fn end_element(&mut self, name: &str) {
        if !self.current.current_tag.eq(name) {
            panic!(
                "Illegal end-tag {:?}, expected {:?}",
                &name, &self.current.current_tag
            );
        }
        #[cfg(feature = "Debug_Reader")]
        debug!("End Element {}", name);
        match name {
            TAG_SCXML => {
                self.end_scxml();
            }
            TAG_IF => {
                self.end_if();
            }
            TAG_TRANSITION => {
                self.end_transition();
            }
            TAG_ON_EXIT => {
                self.end_on_exit();
            }
            TAG_ON_ENTRY => {
                self.end_on_entry();
            }
            TAG_FOR_EACH => {
                self.end_for_each();
            }
            TAG_FINALIZE => {
                self.end_finalize();
            }
            TAG_STATE => {
                self.end_state();
            }
            _ => {}
        }
        self.pop();
    }
}

/// Decodes attributes into a hash-map.
fn decode_attributes(reader: &XReader, attr: &mut Attributes) -> AttributeMap {
    attr.map(|attr_result| match attr_result {
        Ok(a) => {
            let key = reader.decoder().decode(a.key.as_ref());
            if key.is_err() {
                panic!(
                    "unable to read attribute name {:?}, utf8 error {:?}",
                    &a,
                    key.err()
                );
            }
            let value = a.decode_and_unescape_value(reader.decoder());
            if value.is_err() {
                panic!(
                    "unable to read attribute value {:?}, utf8 error {:?}",
                    &a,
                    value.err()
                );
            }
            (key.unwrap().to_string(), value.unwrap().to_string())
        }
        Err(err) => {
            panic!("unable to read attribute, err = {:?}", err);
        }
    })
    .collect()
}

/// Reads and parses the FSM from an XML file.
pub fn parse_from_xml_file(file: &Path, include_paths: &[PathBuf]) -> Result<Box<Fsm>, ScxmlError> {
    let mut rs = ReaderState::new();
    rs.include_paths = Vec::from(include_paths);
    rs.process_file(file)?;
    Ok(rs.fsm)
}

/// Reads and parses the FSM from a URI (http/https/file) or a plain path.
pub fn parse_from_uri(uri: String, include_paths: &[PathBuf]) -> Result<Box<Fsm>, ScxmlError> {
    let mut rs = ReaderState::new();
    rs.include_paths = Vec::from(include_paths);
    match rs.read_from_uri(&uri) {
        Ok(source) => {
            rs.content = source;
            rs.process()?;
            Ok(rs.fsm)
        }
        Err(err) => Err(ScxmlError::Parse(err)),
    }
}

/// Reads the FSM from an XML String.
pub fn parse_from_xml(xml: String) -> Result<Box<Fsm>, ScxmlError> {
    parse_from_xml_with_includes(xml, &Vec::new())
}

/// Reads the FSM from an XML String, with include paths for XInclude and
/// src resolution.
pub fn parse_from_xml_with_includes(
    xml: String,
    include_paths: &[PathBuf],
) -> Result<Box<Fsm>, ScxmlError> {
    let mut rs = ReaderState::new();
    rs.include_paths = Vec::from(include_paths);
    rs.content = xml;
    rs.process()?;
    Ok(rs.fsm)
}

#[cfg(test)]
mod tests {
    use crate::datamodel::ScxmlError;
    use crate::executable_content::ExecutableContent as _;
    use crate::fsm::TransitionType;
    use crate::scxml_reader::{is_inline_document, parse_from_xml};

    #[test]
    fn inline_document_detection() {
        assert!(is_inline_document("<scxml initial='a'/>"));
        assert!(is_inline_document(
            "<foo:scxml xmlns:foo='http://www.w3.org/2005/07/scxml'/>"
        ));
        assert!(!is_inline_document("some/path/machine.xml"));
        assert!(!is_inline_document("http://example.com/machine.xml"));
    }

    #[test]
    #[should_panic]
    fn initial_attribute_should_panic() {
        let _r = parse_from_xml(
            "<scxml initial='Main'><state id='Main' initial='A'>\
    <initial><transition></transition></initial></state></scxml>"
                .to_string(),
        );
    }

    #[test]
    fn initial_attribute() {
        let _r = parse_from_xml(
            "<scxml initial='Main'><state id='Main' initial='A'><state id='A'/></state></scxml>"
                .to_string(),
        );
    }

    #[test]
    fn wrong_end_tag_should_fail() {
        let r = parse_from_xml(
            "<scxml initial='Main'><state id='Main' initial='A'></parallel></scxml>".to_string(),
        );
        assert!(r.is_err(), "Shall result in error");
    }

    #[test]
    #[should_panic]
    fn wrong_transition_type_should_panic() {
        let _r = parse_from_xml(
            "<scxml><state><transition type='bla'></transition></state></scxml>".to_string(),
        );
    }

    #[test]
    fn transition_types() {
        let fsm = parse_from_xml(
            "<scxml><state id='s'>\
             <transition event='i' type='internal' target='s'/>\
             <transition event='e' type='external' target='s'/>\
             <transition event='d' target='s'/>\
             </state></scxml>"
                .to_string(),
        )
        .unwrap();
        let s = fsm.get_state_by_name("s");
        let types: Vec<&TransitionType> = s
            .transitions
            .iterator()
            .map(|tid| &fsm.get_transition_by_id(*tid).transition_type)
            .collect();
        assert_eq!(
            types,
            vec![
                &TransitionType::Internal,
                &TransitionType::External,
                &TransitionType::External
            ]
        );
    }

    #[test]
    #[should_panic]
    fn assign_with_expr_and_content_shall_panic() {
        let _r = parse_from_xml(
            "<scxml><state><transition><assign location='x' expr='123'>123</assign></transition></state></scxml>".to_string());
    }

    #[test]
    fn assign_with_content() {
        let _r = parse_from_xml(
            "<scxml><state><transition><assign location='x'>123</assign></transition></state></scxml>".to_string());
    }

    #[test]
    fn event_patterns_are_normalized() {
        let fsm = parse_from_xml(
            "<scxml><state id='s'><transition event='foo.* bar.baz. *' target='s'/></state></scxml>"
                .to_string(),
        )
        .unwrap();
        let s = fsm.get_state_by_name("s");
        let t = fsm.get_transition_by_id(*s.transitions.head());
        assert_eq!(
            t.events,
            vec![
                vec!["foo".to_string()],
                vec!["bar".to_string(), "baz".to_string()],
                vec!["*".to_string()]
            ]
        );
        assert!(t.wildcard);
    }

    #[test]
    fn generated_ids_follow_parent_tag_and_order() {
        let fsm = parse_from_xml(
            "<scxml><state id='outer'><state/></state></scxml>".to_string(),
        )
        .unwrap();
        assert!(
            fsm.statesNames
                .keys()
                .any(|name| name.starts_with("outer_state_child_")),
            "state names: {:?}",
            fsm.statesNames.keys()
        );
    }

    #[test]
    fn root_without_id_is_main() {
        let fsm = parse_from_xml("<scxml><state id='a'/></scxml>".to_string()).unwrap();
        assert_eq!(fsm.get_state_by_id(fsm.pseudo_root).name, "__main__");
    }

    #[test]
    fn missing_namespace_is_injected() {
        // without namespace
        assert!(parse_from_xml("<scxml><state id='a'/></scxml>".to_string()).is_ok());
        // with namespace
        assert!(parse_from_xml(
            "<scxml xmlns='http://www.w3.org/2005/07/scxml'><state id='a'/></scxml>".to_string()
        )
        .is_ok());
    }

    #[test]
    fn data_entries_are_collected() {
        let fsm = parse_from_xml(
            "<scxml><datamodel><data id='x' expr='42'/><data id='y'>abc</data><data id='z'/></datamodel>\
             <state id='a'/></scxml>"
                .to_string(),
        )
        .unwrap();
        let root = fsm.get_state_by_id(fsm.pseudo_root);
        assert_eq!(root.data.entries.len(), 3);
        assert_eq!(root.data.entries[0].id, "x");
        assert_eq!(root.data.entries[0].expr, Some("42".to_string()));
        assert_eq!(root.data.entries[1].content, Some("abc".to_string()));
        assert_eq!(root.data.entries[2].expr, None);
        assert_eq!(root.data.entries[2].content, None);
    }

    #[test]
    fn unresolvable_script_src_is_fatal() {
        let r = parse_from_xml(
            "<scxml><script src='no/such/file.js'/><state id='a'/></scxml>".to_string(),
        );
        match r {
            Err(ScxmlError::ScriptFetch(msg)) => {
                assert!(msg.contains("no/such/file.js"));
            }
            other => panic!("expected ScriptFetch error, got {:?}", other.err()),
        }
    }

    #[test]
    fn strict_mode_rejects_unknown_executable_content() {
        let r = parse_from_xml(
            "<scxml exmode='strict' xmlns:my='http://example.com/my'>\
             <state id='a'><onentry><my:noop/></onentry></state></scxml>"
                .to_string(),
        );
        assert!(r.is_err());

        // lax mode (default) ignores it
        let r = parse_from_xml(
            "<scxml xmlns:my='http://example.com/my'>\
             <state id='a'><onentry><my:noop/></onentry></state></scxml>"
                .to_string(),
        );
        assert!(r.is_ok());
    }

    #[test]
    fn send_delay_is_parsed() {
        let fsm = parse_from_xml(
            "<scxml><state id='a'><onentry><send event='e' delay='2s'/></onentry></state></scxml>"
                .to_string(),
        )
        .unwrap();
        let a = fsm.get_state_by_name("a");
        let content = fsm.executableContent.get(&a.onentry).unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].get_type(), crate::executable_content::TYPE_SEND);
    }

    #[test]
    fn invoke_with_id_and_idlocation_is_a_deferred_error() {
        // The document still parses, the platform raises
        // "error.execution.invoke.parseerror" when the element is evaluated.
        let fsm = parse_from_xml(
            "<scxml><state id='a'>\
             <invoke id='child' idlocation='loc' src='child.scxml'/>\
             </state></scxml>"
                .to_string(),
        )
        .unwrap();
        let a = fsm.get_state_by_name("a");
        assert_eq!(a.invoke.size(), 1);
        assert!(a.invoke.head().parse_error.is_some());
    }

    #[test]
    fn invoke_with_src_and_srcexpr_is_a_deferred_error() {
        let fsm = parse_from_xml(
            "<scxml><state id='a'>\
             <invoke src='child.scxml' srcexpr='doc'/>\
             </state></scxml>"
                .to_string(),
        )
        .unwrap();
        let a = fsm.get_state_by_name("a");
        assert!(a.invoke.head().parse_error.is_some());
    }

    #[test]
    fn preprocessor_rewrites_custom_namespace() {
        use std::sync::Arc;
        crate::scxml_reader::register_preprocessor(
            "http://example.com/pre",
            Arc::new(|element| {
                assert_eq!(element.tag, "flash");
                "<state id='flashed'/>".to_string()
            }),
        );
        let fsm = parse_from_xml(
            "<scxml xmlns:pre='http://example.com/pre'><pre:flash/><state id='a'/></scxml>"
                .to_string(),
        )
        .unwrap();
        assert!(fsm.statesNames.contains_key("flashed"));
        assert!(fsm.statesNames.contains_key("a"));
    }

    #[test]
    fn invoke_is_parsed() {
        let fsm = parse_from_xml(
            "<scxml><state id='a'>\
             <invoke id='child' src='child.scxml' autoforward='true'>\
               <param name='p' expr='1'/>\
               <finalize/>\
             </invoke></state></scxml>"
                .to_string(),
        )
        .unwrap();
        let a = fsm.get_state_by_name("a");
        assert_eq!(a.invoke.size(), 1);
        let inv = a.invoke.head();
        assert_eq!(inv.invoke_id, "child");
        assert!(inv.autoforward);
        // the empty <finalize/> synthesizes the copy-back block
        assert_ne!(inv.finalize, 0);
        assert_eq!(
            fsm.executableContent.get(&inv.finalize).unwrap().len(),
            1
        );
    }
}
