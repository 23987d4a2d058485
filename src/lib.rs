//! # stencil
//!
//! Stencil is a text-template engine: template source is compiled into
//! an AST and evaluated against JSON data to produce a string.
//!
//! ```
//! use serde_json::json;
//!
//! let result = stencil::render(
//!     "Hello {{ name }}!",
//!     &json!({ "name": "world" }),
//! ).unwrap();
//! assert_eq!(result, "Hello world!");
//! ```
//!
//! The full surface lives on [`Environment`]: expression substitution
//! with filters and operators, control flow (`if`, `for`, `set`),
//! template inheritance (`extends`/`block`/`super`) and inclusion,
//! user-registered callbacks with an optional in-place variant, an LRU +
//! TTL callback cache, and a graceful mode in which failing expressions
//! render as their original source text instead of aborting:
//!
//! ```
//! use serde_json::json;
//! use stencil::Environment;
//!
//! let mut env = Environment::new();
//! env.set_graceful_errors(true);
//! let out = env.render(
//!     "{{ user.name }} / {{ user.email }}",
//!     &json!({ "user": { "name": "Alice" } }),
//! ).unwrap();
//! assert_eq!(out, "Alice / {{ user.email }}");
//! ```
//!
//! An environment can be shared between threads: renders pin immutable
//! snapshots of the registry and template store, and registrations
//! publish new snapshots copy-on-write.

pub mod ast;
pub mod cache;
pub mod config;
pub mod environment;
pub mod error;
pub mod lexer;
pub mod output;
pub mod parser;
pub mod registry;
pub mod render;
pub mod template;
pub mod value;

pub use crate::cache::{CachePredicate, CallbackCache, CallbackCacheConfig};
pub use crate::config::{
    callback_wrapper, CallbackThunk, CallbackWrapper, IncludeCallback, InstrumentationCallback,
    InstrumentationData, InstrumentationEvent, LexerConfig, ParserConfig, RenderConfig,
};
pub use crate::environment::{render, render_to, Environment};
pub use crate::error::{
    Error, FileError, ParseError, ParseErrorKind, RenderError, RenderErrorInfo, RenderErrorKind,
};
pub use crate::output::{Output, StringOutput, WriteOutput};
pub use crate::registry::{
    CallbackFunction, FunctionRegistry, InPlaceCallbackFunction, Operation, VARIADIC,
};
pub use crate::render::Renderer;
pub use crate::template::{Template, TemplateStore};
