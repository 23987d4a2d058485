use std::collections::HashMap;
use std::sync::Arc;

use serde_json::value::Value as Json;

use crate::error::RenderError;

/// A user callback: receives the evaluated arguments, returns a value.
pub type CallbackFunction =
    Arc<dyn Fn(&[&Json]) -> Result<Json, RenderError> + Send + Sync>;

/// In-place variant used for the self-assignment optimization
/// `{% set x = f(x, ...) %}`: mutates the bound value directly instead of
/// computing a copy. Receives the target and the remaining arguments.
pub type InPlaceCallbackFunction =
    Arc<dyn Fn(&mut Json, &[&Json]) -> Result<(), RenderError> + Send + Sync>;

/// Marks a registry entry as accepting any number of arguments.
pub const VARIADIC: i32 = -1;

/// The fixed set of built-in operations, plus `Callback` for user
/// functions and `None` for names nothing matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Not,
    And,
    Or,
    In,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Add,
    Subtract,
    Multiplication,
    Division,
    Power,
    Modulo,
    AtId,
    At,
    Capitalize,
    Default,
    DivisibleBy,
    Even,
    Exists,
    ExistsInObject,
    First,
    Float,
    Int,
    IsArray,
    IsBoolean,
    IsFloat,
    IsInteger,
    IsNumber,
    IsObject,
    IsString,
    Last,
    Length,
    Lower,
    Max,
    Min,
    Odd,
    Range,
    Replace,
    Round,
    Sort,
    Upper,
    Super,
    Join,
    Callback,
    None,
}

/// What a `(name, arity)` lookup resolves to.
#[derive(Clone)]
pub struct FunctionEntry {
    pub operation: Operation,
    pub callback: Option<CallbackFunction>,
    pub inplace_callback: Option<InPlaceCallbackFunction>,
}

impl FunctionEntry {
    fn builtin(operation: Operation) -> FunctionEntry {
        FunctionEntry {
            operation,
            callback: None,
            inplace_callback: None,
        }
    }
}

/// Built-in functions and user-registered callbacks, keyed by name and
/// arity. Published copy-on-write by the environment; read-only once a
/// render holds a snapshot.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: HashMap<(String, i32), FunctionEntry>,
}

impl Default for FunctionRegistry {
    fn default() -> FunctionRegistry {
        FunctionRegistry::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> FunctionRegistry {
        let mut r = FunctionRegistry {
            functions: HashMap::new(),
        };
        r.add_builtin("at", 2, Operation::At);
        r.add_builtin("capitalize", 1, Operation::Capitalize);
        r.add_builtin("default", 2, Operation::Default);
        r.add_builtin("divisibleBy", 2, Operation::DivisibleBy);
        r.add_builtin("even", 1, Operation::Even);
        r.add_builtin("exists", 1, Operation::Exists);
        r.add_builtin("existsIn", 2, Operation::ExistsInObject);
        r.add_builtin("first", 1, Operation::First);
        r.add_builtin("float", 1, Operation::Float);
        r.add_builtin("int", 1, Operation::Int);
        r.add_builtin("isArray", 1, Operation::IsArray);
        r.add_builtin("isBoolean", 1, Operation::IsBoolean);
        r.add_builtin("isFloat", 1, Operation::IsFloat);
        r.add_builtin("isInteger", 1, Operation::IsInteger);
        r.add_builtin("isNumber", 1, Operation::IsNumber);
        r.add_builtin("isObject", 1, Operation::IsObject);
        r.add_builtin("isString", 1, Operation::IsString);
        r.add_builtin("last", 1, Operation::Last);
        r.add_builtin("length", 1, Operation::Length);
        r.add_builtin("lower", 1, Operation::Lower);
        r.add_builtin("max", 1, Operation::Max);
        r.add_builtin("min", 1, Operation::Min);
        r.add_builtin("odd", 1, Operation::Odd);
        r.add_builtin("range", 1, Operation::Range);
        r.add_builtin("replace", 3, Operation::Replace);
        r.add_builtin("round", 2, Operation::Round);
        r.add_builtin("sort", 1, Operation::Sort);
        r.add_builtin("upper", 1, Operation::Upper);
        r.add_builtin("super", 0, Operation::Super);
        r.add_builtin("super", 1, Operation::Super);
        r.add_builtin("join", 2, Operation::Join);
        r
    }

    pub fn add_builtin(&mut self, name: &str, num_args: i32, operation: Operation) {
        self.functions
            .insert((name.to_string(), num_args), FunctionEntry::builtin(operation));
    }

    pub fn add_callback(&mut self, name: &str, num_args: i32, callback: CallbackFunction) {
        self.functions.insert(
            (name.to_string(), num_args),
            FunctionEntry {
                operation: Operation::Callback,
                callback: Some(callback),
                inplace_callback: None,
            },
        );
    }

    pub fn add_callback_with_inplace(
        &mut self,
        name: &str,
        num_args: i32,
        callback: CallbackFunction,
        inplace_callback: InPlaceCallbackFunction,
    ) {
        self.functions.insert(
            (name.to_string(), num_args),
            FunctionEntry {
                operation: Operation::Callback,
                callback: Some(callback),
                inplace_callback: Some(inplace_callback),
            },
        );
    }

    /// Looks up `(name, num_args)`, falling back to the variadic entry
    /// when the exact arity misses and `num_args > 0`.
    pub fn find(&self, name: &str, num_args: i32) -> Option<FunctionEntry> {
        if let Some(entry) = self.functions.get(&(name.to_string(), num_args)) {
            return Some(entry.clone());
        }
        if num_args > 0 {
            if let Some(entry) = self.functions.get(&(name.to_string(), VARIADIC)) {
                return Some(entry.clone());
            }
        }
        None
    }
}
