//! The built-in expression datamodel.\
//! A keyed [Data] store plus a small expression language: literals, variable
//! references with dotted member access, array literals, arithmetic,
//! comparison and boolean operators and the mandatory `In(..)` predicate.
//! Scripting backends with a full language belong into separate crates and
//! can be plugged in via [register_datamodel](crate::datamodel::register_datamodel).

use std::collections::HashMap;

use log::error;

use crate::datamodel::{
    is_legal_name, is_protected_name, Data, Datamodel, DatamodelFactory, GlobalDataArc,
    EVENT_VARIABLE_NAME, IO_PROCESSORS_VARIABLE_NAME, SCXML_EVENT_PROCESSOR,
    SESSION_ID_VARIABLE_NAME, SESSION_NAME_VARIABLE_NAME,
};
use crate::executable_content::{ExecutableContent as _, INDEX_TEMP};
use crate::fsm::{BindingType, Event, ExecutableContentId, Fsm, StateId};

pub const EXPRESSION_DATAMODEL: &str = "expression";
pub const EXPRESSION_DATAMODEL_LC: &str = "expression";

pub struct ExpressionDatamodel {
    pub global: GlobalDataArc,
    pub data: HashMap<String, Data>,
    state_name_to_id: HashMap<String, StateId>,
}

pub struct ExpressionDatamodelFactory {}

impl DatamodelFactory for ExpressionDatamodelFactory {
    fn create(&mut self, global_data: GlobalDataArc) -> Box<dyn Datamodel> {
        Box::new(ExpressionDatamodel::new(global_data))
    }
}

impl ExpressionDatamodel {
    pub fn new(global_data: GlobalDataArc) -> ExpressionDatamodel {
        ExpressionDatamodel {
            global: global_data,
            data: HashMap::new(),
            state_name_to_id: HashMap::new(),
        }
    }

    fn eval(&self, script: &str) -> Result<Data, String> {
        let parser = ExprParser {
            src: script.as_bytes(),
            pos: 0,
            data: &self.data,
            states: &self.state_name_to_id,
            global: &self.global,
        };
        parser.parse()
    }

    fn init_data_entries(&mut self, fsm: &Fsm, state: StateId) {
        let entries = &fsm.get_state_by_id(state).data.entries;
        for entry in entries {
            let value = if let Some(expr) = &entry.expr {
                match self.eval(expr) {
                    Ok(v) => v,
                    Err(msg) => {
                        error!("data '{}': expr '{}' failed: {}", entry.id, expr, msg);
                        self.internal_error_execution();
                        Data::Null()
                    }
                }
            } else if let Some(content) = &entry.content {
                // Content is first tried as an expression, falling back to
                // the whitespace-normalized text.
                match self.eval(content) {
                    Ok(v) => v,
                    Err(_) => Data::String(normalize_whitespace(content)),
                }
            } else {
                Data::Null()
            };
            self.data.insert(entry.id.clone(), value);
        }
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn get_path(data: &HashMap<String, Data>, path: &[&str]) -> Result<Data, String> {
    let mut current = match data.get(path[0]) {
        Some(v) => v,
        None => {
            return Err(format!("'{}' is not declared", path[0]));
        }
    };
    for segment in &path[1..] {
        current = match current {
            Data::Map(map) => match map.get(*segment) {
                Some(v) => v,
                None => {
                    return Err(format!("no member '{}'", segment));
                }
            },
            _ => {
                return Err(format!("'{}' has no members", segment));
            }
        };
    }
    Ok(current.clone())
}

fn set_path(data: &mut HashMap<String, Data>, path: &[&str], value: Data) -> Result<(), String> {
    if path.len() == 1 {
        data.insert(path[0].to_string(), value);
        return Ok(());
    }
    let mut current = match data.get_mut(path[0]) {
        Some(v) => v,
        None => {
            return Err(format!("'{}' is not declared", path[0]));
        }
    };
    for segment in &path[1..path.len() - 1] {
        current = match current {
            Data::Map(map) => match map.get_mut(*segment) {
                Some(v) => v,
                None => {
                    return Err(format!("no member '{}'", segment));
                }
            },
            _ => {
                return Err(format!("'{}' has no members", segment));
            }
        };
    }
    match current {
        Data::Map(map) => {
            map.insert(path[path.len() - 1].to_string(), value);
            Ok(())
        }
        _ => Err(format!("'{}' has no members", path[path.len() - 2])),
    }
}

impl Datamodel for ExpressionDatamodel {
    fn global(&mut self) -> &mut GlobalDataArc {
        &mut self.global
    }

    fn global_s(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &str {
        EXPRESSION_DATAMODEL
    }

    fn add_functions(&mut self, fsm: &Fsm) {
        for state in fsm.states.as_slice() {
            self.state_name_to_id.insert(state.name.clone(), state.id);
        }
        let session_name = self.global.lock().session_name.clone();
        self.initialize_read_only(
            SESSION_ID_VARIABLE_NAME,
            Data::String(session_name.clone()),
        );
        self.initialize_read_only(SESSION_NAME_VARIABLE_NAME, Data::String(fsm.name.clone()));

        let location = Data::Map(HashMap::from([(
            "location".to_string(),
            Data::String(format!("#_scxml_{}", session_name)),
        )]));
        let processors = Data::Map(HashMap::from([
            ("scxml".to_string(), location.clone()),
            (SCXML_EVENT_PROCESSOR.to_string(), location),
        ]));
        self.initialize_read_only(IO_PROCESSORS_VARIABLE_NAME, processors);
    }

    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, fsm: &Fsm, state: StateId) {
        if state == fsm.pseudo_root {
            // All ids get declared first, values follow the binding mode.
            for s in fsm.states.as_slice() {
                for entry in &s.data.entries {
                    self.data.entry(entry.id.clone()).or_insert(Data::Null());
                }
            }
            self.init_data_entries(fsm, fsm.pseudo_root);
            if fsm.binding == BindingType::Early {
                let mut others: Vec<&crate::fsm::State> = fsm
                    .states
                    .iter()
                    .filter(|s| s.id != fsm.pseudo_root)
                    .collect();
                others.sort_by_key(|s| s.doc_id);
                let ids: Vec<StateId> = others.iter().map(|s| s.id).collect();
                for sid in ids {
                    self.init_data_entries(fsm, sid);
                }
            }
        } else {
            self.init_data_entries(fsm, state);
        }
    }

    fn initialize_read_only(&mut self, name: &str, value: Data) {
        self.data.insert(name.to_string(), value);
    }

    fn set(&mut self, name: &str, data: Data) {
        self.data.insert(name.to_string(), data);
    }

    fn set_event(&mut self, event: &Event) {
        let mut map: HashMap<String, Data> = HashMap::new();
        map.insert("name".to_string(), Data::String(event.name.clone()));
        map.insert(
            "type".to_string(),
            Data::String(event.etype.name().to_string()),
        );
        map.insert(
            "sendid".to_string(),
            match &event.sendid {
                Some(id) => Data::String(id.clone()),
                None => Data::Null(),
            },
        );
        map.insert(
            "origin".to_string(),
            match &event.origin {
                Some(origin) => Data::String(origin.clone()),
                None => Data::Null(),
            },
        );
        map.insert(
            "origintype".to_string(),
            match &event.origin_type {
                Some(t) => Data::String(t.clone()),
                None => Data::Null(),
            },
        );
        map.insert(
            "invokeid".to_string(),
            match &event.invoke_id {
                Some(id) => Data::String(id.clone()),
                None => Data::Null(),
            },
        );
        let data = if let Some(params) = &event.param_values {
            Data::Map(params.clone())
        } else if let Some(content) = &event.content {
            content.clone()
        } else {
            Data::Null()
        };
        map.insert("data".to_string(), data);
        self.data
            .insert(EVENT_VARIABLE_NAME.to_string(), Data::Map(map));
    }

    fn assign(&mut self, location: &str, expr: &str) -> bool {
        let value = match self.eval(expr) {
            Ok(v) => v,
            Err(msg) => {
                error!("assign: expr '{}' failed: {}", expr, msg);
                self.internal_error_execution();
                return false;
            }
        };
        let path: Vec<&str> = location.split('.').collect();
        if !is_legal_name(path[0]) || is_protected_name(path[0]) {
            error!("assign: can't assign to the name '{}'", location);
            self.internal_error_execution();
            return false;
        }
        if !self.data.contains_key(path[0]) {
            error!(
                "assign: the location '{}' was not instantiated in the datamodel",
                location
            );
            self.internal_error_execution();
            return false;
        }
        match set_path(&mut self.data, &path, value) {
            Ok(()) => true,
            Err(msg) => {
                error!("assign to '{}' failed: {}", location, msg);
                self.internal_error_execution();
                false
            }
        }
    }

    fn get_by_location(&mut self, location: &str) -> Result<Data, String> {
        let path: Vec<&str> = location.split('.').collect();
        match get_path(&self.data, &path) {
            Ok(v) => Ok(v),
            Err(msg) => {
                self.internal_error_execution();
                Err(msg)
            }
        }
    }

    fn has_location(&mut self, location: &str) -> bool {
        let path: Vec<&str> = location.split('.').collect();
        get_path(&self.data, &path).is_ok()
    }

    fn clear(&mut self) {
        self.data.clear();
    }

    fn log(&mut self, label: &str, msg: &str) {
        crate::datamodel::default_log(&self.global, label, msg);
    }

    fn execute(&mut self, script: &str) -> Result<Data, String> {
        if script.trim().is_empty() {
            return Ok(Data::Null());
        }
        self.eval(script)
    }

    fn execute_for_each(
        &mut self,
        array_expression: &str,
        item: &str,
        index: &str,
        execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool {
        let array = match self.eval(array_expression) {
            Ok(Data::Array(values)) => values,
            Ok(_) => {
                error!("foreach: '{}' is not an array", array_expression);
                self.internal_error_execution();
                return false;
            }
            Err(msg) => {
                error!("foreach: array '{}' failed: {}", array_expression, msg);
                self.internal_error_execution();
                return false;
            }
        };
        if !is_legal_name(item) || is_protected_name(item) {
            error!("foreach: illegal item name '{}'", item);
            self.internal_error_execution();
            return false;
        }
        if index != INDEX_TEMP && (!is_legal_name(index) || is_protected_name(index)) {
            error!("foreach: illegal index name '{}'", index);
            self.internal_error_execution();
            return false;
        }
        for (i, value) in array.into_iter().enumerate() {
            self.data.insert(item.to_string(), value);
            self.data
                .insert(index.to_string(), Data::Integer(i as i64));
            if !execute_body(self) {
                return false;
            }
        }
        true
    }

    fn execute_condition(&mut self, script: &str) -> Result<bool, String> {
        Ok(self.eval(script)?.is_truthy())
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

////////////////////////////////////////////////////////////////////////////////
// Expression parser/evaluator

struct ExprParser<'a> {
    src: &'a [u8],
    pos: usize,
    data: &'a HashMap<String, Data>,
    states: &'a HashMap<String, StateId>,
    global: &'a GlobalDataArc,
}

impl ExprParser<'_> {
    fn parse(mut self) -> Result<Data, String> {
        let value = self.parse_or()?;
        self.skip_ws();
        if self.pos < self.src.len() {
            return Err(format!("unexpected input at offset {}", self.pos));
        }
        Ok(value)
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> u8 {
        if self.pos < self.src.len() {
            self.src[self.pos]
        } else {
            0
        }
    }

    /// Consumes the operator if it follows, with a look-ahead guard so that
    /// e.g. "==" is not consumed as "=".
    fn eat(&mut self, op: &str) -> bool {
        self.skip_ws();
        let bytes = op.as_bytes();
        if self.src.len() - self.pos < bytes.len() || &self.src[self.pos..self.pos + bytes.len()] != bytes
        {
            return false;
        }
        if (op == "<" || op == ">") && self.src.len() - self.pos > 1 && self.src[self.pos + 1] == b'='
        {
            return false;
        }
        self.pos += bytes.len();
        true
    }

    fn parse_or(&mut self) -> Result<Data, String> {
        let mut left = self.parse_and()?;
        loop {
            if self.eat("||") {
                let right = self.parse_and()?;
                left = Data::Boolean(left.is_truthy() || right.is_truthy());
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Data, String> {
        let mut left = self.parse_comparison()?;
        loop {
            if self.eat("&&") {
                let right = self.parse_comparison()?;
                left = Data::Boolean(left.is_truthy() && right.is_truthy());
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_comparison(&mut self) -> Result<Data, String> {
        let left = self.parse_additive()?;
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if self.eat(op) {
                let right = self.parse_additive()?;
                return compare(op, &left, &right);
            }
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Data, String> {
        let mut left = self.parse_multiplicative()?;
        loop {
            if self.eat("+") {
                let right = self.parse_multiplicative()?;
                left = add(&left, &right)?;
            } else if self.eat("-") {
                let right = self.parse_multiplicative()?;
                left = numeric_op("-", &left, &right)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Data, String> {
        let mut left = self.parse_unary()?;
        loop {
            if self.eat("*") {
                let right = self.parse_unary()?;
                left = numeric_op("*", &left, &right)?;
            } else if self.eat("/") {
                let right = self.parse_unary()?;
                left = numeric_op("/", &left, &right)?;
            } else if self.eat("%") {
                let right = self.parse_unary()?;
                left = numeric_op("%", &left, &right)?;
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Data, String> {
        if self.eat("!") {
            let value = self.parse_unary()?;
            return Ok(Data::Boolean(!value.is_truthy()));
        }
        if self.eat("-") {
            let value = self.parse_unary()?;
            return match value {
                Data::Integer(v) => Ok(Data::Integer(-v)),
                Data::Double(v) => Ok(Data::Double(-v)),
                _ => Err("unary '-' needs a number".to_string()),
            };
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Data, String> {
        self.skip_ws();
        match self.peek() {
            0 => Err("unexpected end of expression".to_string()),
            b'(' => {
                self.pos += 1;
                let value = self.parse_or()?;
                if !self.eat(")") {
                    return Err("missing ')'".to_string());
                }
                Ok(value)
            }
            b'[' => {
                self.pos += 1;
                let mut values = Vec::new();
                self.skip_ws();
                if self.peek() == b']' {
                    self.pos += 1;
                    return Ok(Data::Array(values));
                }
                loop {
                    values.push(self.parse_or()?);
                    if self.eat(",") {
                        continue;
                    }
                    if self.eat("]") {
                        return Ok(Data::Array(values));
                    }
                    return Err("missing ']'".to_string());
                }
            }
            b'\'' | b'"' => self.parse_string(),
            c if c.is_ascii_digit() => self.parse_number(),
            c if c == b'_' || c.is_ascii_alphabetic() => self.parse_identifier(),
            c => Err(format!("unexpected character '{}'", c as char)),
        }
    }

    fn parse_string(&mut self) -> Result<Data, String> {
        let quote = self.src[self.pos];
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos] != quote {
            self.pos += 1;
        }
        if self.pos >= self.src.len() {
            return Err("unterminated string".to_string());
        }
        let value = String::from_utf8_lossy(&self.src[start..self.pos]).to_string();
        self.pos += 1;
        Ok(Data::String(value))
    }

    fn parse_number(&mut self) -> Result<Data, String> {
        let start = self.pos;
        let mut is_double = false;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.' && !is_double && self.pos + 1 < self.src.len() && self.src[self.pos + 1].is_ascii_digit()
            {
                is_double = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = String::from_utf8_lossy(&self.src[start..self.pos]).to_string();
        if is_double {
            text.parse::<f64>()
                .map(Data::Double)
                .map_err(|e| e.to_string())
        } else {
            text.parse::<i64>()
                .map(Data::Integer)
                .map_err(|e| e.to_string())
        }
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c == b'_' || c.is_ascii_alphanumeric() {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).to_string()
    }

    fn parse_identifier(&mut self) -> Result<Data, String> {
        let name = self.read_name();
        match name.as_str() {
            "true" => return Ok(Data::Boolean(true)),
            "false" => return Ok(Data::Boolean(false)),
            "null" => return Ok(Data::Null()),
            "In" => {
                if self.eat("(") {
                    let argument = self.parse_or()?;
                    if !self.eat(")") {
                        return Err("In: missing ')'".to_string());
                    }
                    let state_name = argument.to_string();
                    return Ok(Data::Boolean(match self.states.get(&state_name) {
                        Some(state_id) => self.global.lock().configuration.isMember(state_id),
                        None => false,
                    }));
                }
                return Err("In: missing '('".to_string());
            }
            _ => {}
        }
        let mut value = match self.data.get(&name) {
            Some(v) => v.clone(),
            None => {
                return Err(format!("'{}' is not defined", name));
            }
        };
        loop {
            self.skip_ws();
            if self.peek() == b'.'
                && self.pos + 1 < self.src.len()
                && !self.src[self.pos + 1].is_ascii_digit()
            {
                self.pos += 1;
                let member = self.read_name();
                value = match &value {
                    Data::Map(map) => match map.get(&member) {
                        Some(v) => v.clone(),
                        None => {
                            return Err(format!("'{}' has no member '{}'", name, member));
                        }
                    },
                    _ => {
                        return Err(format!("'{}' has no members", name));
                    }
                };
            } else {
                return Ok(value);
            }
        }
    }
}

fn as_number(data: &Data) -> Option<f64> {
    match data {
        Data::Integer(v) => Some(*v as f64),
        Data::Double(v) => Some(*v),
        _ => None,
    }
}

fn value_eq(left: &Data, right: &Data) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(op: &str, left: &Data, right: &Data) -> Result<Data, String> {
    match op {
        "==" => Ok(Data::Boolean(value_eq(left, right))),
        "!=" => Ok(Data::Boolean(!value_eq(left, right))),
        _ => {
            let ordering = match (left, right) {
                (Data::String(l), Data::String(r)) => l.cmp(r),
                _ => match (as_number(left), as_number(right)) {
                    (Some(l), Some(r)) => l
                        .partial_cmp(&r)
                        .ok_or_else(|| "values are not comparable".to_string())?,
                    _ => {
                        return Err("values are not comparable".to_string());
                    }
                },
            };
            Ok(Data::Boolean(match op {
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                _ => false,
            }))
        }
    }
}

fn add(left: &Data, right: &Data) -> Result<Data, String> {
    match (left, right) {
        (Data::String(_), _) | (_, Data::String(_)) => {
            Ok(Data::String(format!("{}{}", left, right)))
        }
        _ => numeric_op("+", left, right),
    }
}

fn numeric_op(op: &str, left: &Data, right: &Data) -> Result<Data, String> {
    if let (Data::Integer(l), Data::Integer(r)) = (left, right) {
        match op {
            "+" => return Ok(Data::Integer(l + r)),
            "-" => return Ok(Data::Integer(l - r)),
            "*" => return Ok(Data::Integer(l * r)),
            "%" => {
                return if *r == 0 {
                    Err("modulo by zero".to_string())
                } else {
                    Ok(Data::Integer(l % r))
                };
            }
            _ => {}
        }
    }
    let (l, r) = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(format!("'{}' needs numbers", op));
        }
    };
    match op {
        "+" => Ok(Data::Double(l + r)),
        "-" => Ok(Data::Double(l - r)),
        "*" => Ok(Data::Double(l * r)),
        "/" => {
            if r == 0.0 {
                Err("division by zero".to_string())
            } else {
                Ok(Data::Double(l / r))
            }
        }
        "%" => Err("modulo needs integers".to_string()),
        _ => Err(format!("unknown operator '{}'", op)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::datamodel::{Data, Datamodel, GlobalDataArc};
    use crate::fsm::EventType;

    fn datamodel() -> ExpressionDatamodel {
        ExpressionDatamodel::new(GlobalDataArc::new())
    }

    #[test]
    fn literals() {
        let mut dm = datamodel();
        assert_eq!(dm.execute("42"), Ok(Data::Integer(42)));
        assert_eq!(dm.execute("4.5"), Ok(Data::Double(4.5)));
        assert_eq!(dm.execute("'abc'"), Ok(Data::String("abc".to_string())));
        assert_eq!(dm.execute("true"), Ok(Data::Boolean(true)));
        assert_eq!(dm.execute("null"), Ok(Data::Null()));
        assert_eq!(
            dm.execute("[1, 2, 3]"),
            Ok(Data::Array(vec![
                Data::Integer(1),
                Data::Integer(2),
                Data::Integer(3)
            ]))
        );
    }

    #[test]
    fn arithmetic() {
        let mut dm = datamodel();
        assert_eq!(dm.execute("1 + 2 * 3"), Ok(Data::Integer(7)));
        assert_eq!(dm.execute("(1 + 2) * 3"), Ok(Data::Integer(9)));
        assert_eq!(dm.execute("10 % 3"), Ok(Data::Integer(1)));
        assert_eq!(dm.execute("7 / 2"), Ok(Data::Double(3.5)));
        assert_eq!(dm.execute("-4 + 1"), Ok(Data::Integer(-3)));
        assert!(dm.execute("1 / 0").is_err());
        assert_eq!(
            dm.execute("'a' + 1"),
            Ok(Data::String("a1".to_string()))
        );
    }

    #[test]
    fn comparisons_and_boolean_ops() {
        let mut dm = datamodel();
        assert_eq!(dm.execute("1 == 1.0"), Ok(Data::Boolean(true)));
        assert_eq!(dm.execute("1 != 2"), Ok(Data::Boolean(true)));
        assert_eq!(dm.execute("2 <= 2"), Ok(Data::Boolean(true)));
        assert_eq!(dm.execute("'a' < 'b'"), Ok(Data::Boolean(true)));
        assert_eq!(dm.execute("true && !false"), Ok(Data::Boolean(true)));
        assert_eq!(dm.execute("false || 1 > 2"), Ok(Data::Boolean(false)));
    }

    #[test]
    fn variables_and_members() {
        let mut dm = datamodel();
        dm.set("x", Data::Integer(5));
        dm.set(
            "m",
            Data::Map(HashMap::from([("a".to_string(), Data::Integer(1))])),
        );
        assert_eq!(dm.execute("x + 1"), Ok(Data::Integer(6)));
        assert_eq!(dm.execute("m.a"), Ok(Data::Integer(1)));
        assert!(dm.execute("y").is_err());
        assert!(dm.execute("m.b").is_err());
    }

    #[test]
    fn event_data_access() {
        let mut dm = datamodel();
        let mut event = crate::fsm::Event::new_simple("job.done");
        event.etype = EventType::external;
        event.param_values = Some(HashMap::from([(
            "result".to_string(),
            Data::Integer(17),
        )]));
        dm.set_event(&event);
        assert_eq!(
            dm.execute("_event.name"),
            Ok(Data::String("job.done".to_string()))
        );
        assert_eq!(dm.execute("_event.data.result"), Ok(Data::Integer(17)));
    }

    #[test]
    fn assign_to_undeclared_location_raises_error() {
        let mut dm = datamodel();
        assert!(!dm.assign("undeclared", "1"));
        let mut lock = dm.global.lock();
        assert!(!lock.internalQueue.isEmpty());
        let event = lock.internalQueue.dequeue();
        assert_eq!(event.name, "error.execution");
    }

    #[test]
    fn assign_to_protected_key_raises_error() {
        let mut dm = datamodel();
        dm.initialize_read_only("_sessionid", Data::String("s1".to_string()));
        assert!(!dm.assign("_sessionid", "'other'"));
        assert!(!dm.global.lock().internalQueue.isEmpty());
    }

    #[test]
    fn assign_to_declared_location() {
        let mut dm = datamodel();
        dm.set("counter", Data::Integer(0));
        assert!(dm.assign("counter", "counter + 1"));
        assert_eq!(dm.execute("counter"), Ok(Data::Integer(1)));
    }

    #[test]
    fn foreach_iterates_with_index() {
        let mut dm = datamodel();
        dm.set("sum", Data::Integer(0));
        dm.set("items", Data::Array(vec![Data::Integer(4), Data::Integer(5)]));
        let mut seen = Vec::new();
        let ok = dm.execute_for_each("items", "it", "i", &mut |dm| {
            let item = dm.execute("it").unwrap();
            let index = dm.execute("i").unwrap();
            seen.push((index.to_string(), item.to_string()));
            true
        });
        assert!(ok);
        assert_eq!(
            seen,
            vec![
                ("0".to_string(), "4".to_string()),
                ("1".to_string(), "5".to_string())
            ]
        );
    }
}
