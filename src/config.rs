use std::path::PathBuf;
use std::sync::Arc;

use serde_json::value::Value as Json;

use crate::error::{ParseError, RenderError};

/// Deferred execution of the wrapped callback; invoked at most once.
pub type CallbackThunk<'a> = Box<dyn FnOnce() -> Result<Json, RenderError> + 'a>;

/// A function interposed on every user-callback invocation.
///
/// The wrapper receives the callback name, the evaluated arguments and a
/// thunk running the actual callback; whatever the wrapper returns is what
/// the render uses. This is the hook the callback cache installs itself
/// through, and the one external code uses for timing or tracing spans.
pub type CallbackWrapper = Arc<
    dyn for<'a> Fn(&str, &[&Json], CallbackThunk<'a>) -> Result<Json, RenderError>
        + Send
        + Sync,
>;

/// Builds a [`CallbackWrapper`] from a closure, pinning down the
/// higher-ranked thunk lifetime so plain closures coerce cleanly.
pub fn callback_wrapper<F>(f: F) -> CallbackWrapper
where
    F: for<'a> Fn(&str, &[&Json], CallbackThunk<'a>) -> Result<Json, RenderError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Loads a template body for an `include`/`extends` name the parser could
/// not resolve from the store or the file system.
pub type IncludeCallback =
    Arc<dyn Fn(&std::path::Path, &str) -> Result<String, ParseError> + Send + Sync>;

/// Internal events the renderer emits when an instrumentation callback is
/// installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationEvent {
    RenderStart,
    RenderEnd,
    SetStatementStart,
    SetStatementEnd,
    InplaceOptUsed,
    InplaceOptSkipped,
    ForLoopStart,
    ForLoopEnd,
    IncludeStart,
    IncludeEnd,
}

/// Payload delivered with each instrumentation event.
#[derive(Debug, Clone)]
pub struct InstrumentationData {
    pub event: InstrumentationEvent,
    /// Variable, template or function name, depending on the event.
    pub name: String,
    /// Outcome tag, skip reason, loop kind or include status.
    pub detail: String,
    /// Iteration count or container size where applicable.
    pub count: usize,
}

impl InstrumentationData {
    pub fn new(event: InstrumentationEvent) -> InstrumentationData {
        InstrumentationData {
            event,
            name: String::new(),
            detail: String::new(),
            count: 0,
        }
    }

    pub fn with_name(mut self, name: &str) -> InstrumentationData {
        self.name = name.to_string();
        self
    }

    pub fn with_detail(mut self, detail: &str) -> InstrumentationData {
        self.detail = detail.to_string();
        self
    }

    pub fn with_count(mut self, count: usize) -> InstrumentationData {
        self.count = count;
        self
    }
}

/// Receives instrumentation events. Called synchronously on the render
/// thread, so implementations must be fast.
pub type InstrumentationCallback = Arc<dyn Fn(&InstrumentationData) + Send + Sync>;

/// Delimiters and whitespace handling for the lexer. The `-`/`+` strip
/// modifiers are derived from these openers and closers at scan time.
#[derive(Debug, Clone)]
pub struct LexerConfig {
    pub statement_open: String,
    pub statement_close: String,
    pub line_statement: String,
    pub expression_open: String,
    pub expression_close: String,
    pub comment_open: String,
    pub comment_close: String,
    /// Remove the first newline after a statement or comment block.
    pub trim_blocks: bool,
    /// Strip spaces and tabs from the start of a line to a statement.
    pub lstrip_blocks: bool,
}

impl Default for LexerConfig {
    fn default() -> LexerConfig {
        LexerConfig {
            statement_open: "{%".to_string(),
            statement_close: "%}".to_string(),
            line_statement: "##".to_string(),
            expression_open: "{{".to_string(),
            expression_close: "}}".to_string(),
            comment_open: "{#".to_string(),
            comment_close: "#}".to_string(),
            trim_blocks: false,
            lstrip_blocks: false,
        }
    }
}

/// Parser behaviour.
#[derive(Clone)]
pub struct ParserConfig {
    /// Resolve unknown include names against the environment's input path.
    pub search_included_templates_in_files: bool,
    /// Allow unknown functions at parse time; they become render-time
    /// graceful errors instead of parse errors.
    pub graceful_errors: bool,
    pub include_callback: Option<IncludeCallback>,
    pub input_path: PathBuf,
}

impl Default for ParserConfig {
    fn default() -> ParserConfig {
        ParserConfig {
            search_included_templates_in_files: true,
            graceful_errors: false,
            include_callback: None,
            input_path: PathBuf::new(),
        }
    }
}

/// Renderer behaviour, snapshotted per render.
#[derive(Clone)]
pub struct RenderConfig {
    pub throw_at_missing_includes: bool,
    pub html_autoescape: bool,
    /// Missing variables and failing operations render as the original
    /// template text instead of aborting.
    pub graceful_errors: bool,
    pub callback_wrapper: Option<CallbackWrapper>,
    pub instrumentation_callback: Option<InstrumentationCallback>,
}

impl Default for RenderConfig {
    fn default() -> RenderConfig {
        RenderConfig {
            throw_at_missing_includes: true,
            html_autoescape: false,
            graceful_errors: false,
            callback_wrapper: None,
            instrumentation_callback: None,
        }
    }
}
