use std::fmt;
use std::io::Error as IOError;
use std::path::PathBuf;

use thiserror::Error;

/// Reasons a template fails to parse.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("unexpected end of template")]
    UnexpectedEof,
    #[error("expected token {expected:?}, found {found:?}")]
    ExpectedToken { expected: String, found: String },
    #[error("unknown statement {0:?}")]
    UnknownStatement(String),
    #[error("unknown function {name:?} with {arity} arguments")]
    UnknownFunction { name: String, arity: usize },
    #[error("{open:?} was opened, but {close:?} is closing")]
    MismatchedBlockClose { open: String, close: String },
    #[error("invalid literal: {0}")]
    InvalidLiteral(String),
}

/// Error on parsing a template.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub template_name: Option<String>,
    pub line_no: Option<usize>,
    pub column_no: Option<usize>,
}

impl ParseError {
    pub fn of(kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            template_name: None,
            line_no: None,
            column_no: None,
        }
    }

    pub fn at(mut self, line_no: usize, column_no: usize) -> ParseError {
        self.line_no = Some(line_no);
        self.column_no = Some(column_no);
        self
    }

    pub fn in_template(mut self, name: Option<String>) -> ParseError {
        self.template_name = name;
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line_no, self.column_no) {
            (Some(line), Some(col)) => write!(
                f,
                "Template {:?} line {}, col {}: {}",
                self.template_name.as_deref().unwrap_or("unnamed"),
                line,
                col,
                self.kind
            ),
            _ => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for ParseError {}

/// Reasons a render fails in strict mode, and the messages recorded in
/// graceful mode.
#[derive(Error, Debug)]
pub enum RenderErrorKind {
    #[error("variable '{name}' not found")]
    VariableNotFound { name: String },
    #[error("empty expression")]
    EmptyExpression,
    #[error("malformed expression")]
    MalformedExpression,
    #[error("{0}")]
    TypeMismatch(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("member '{name}' not found")]
    MemberNotFound { name: String },
    #[error("index {index} out of bounds (size {size})")]
    IndexOutOfRange { index: i64, size: usize },
    #[error("function '{name}' not found or has no callback")]
    FunctionNotFound { name: String },
    #[error("operation '{op}' failed: {detail}")]
    BadOperationInput { op: String, detail: String },
    #[error("{0}")]
    SuperMisuse(String),
    #[error("include '{name}' not found")]
    MissingInclude { name: String },
    #[error("extends '{name}' not found")]
    MissingExtends { name: String },
    #[error("cannot take '{op}' of an empty array")]
    EmptyArray { op: String },
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Io(#[from] IOError),
}

/// Error when rendering a template against data.
#[derive(Debug)]
pub struct RenderError {
    pub kind: RenderErrorKind,
    pub template_name: Option<String>,
    pub line_no: Option<usize>,
    pub column_no: Option<usize>,
}

impl RenderError {
    pub fn new(kind: RenderErrorKind) -> RenderError {
        RenderError {
            kind,
            template_name: None,
            line_no: None,
            column_no: None,
        }
    }

    /// Convenience constructor for user callbacks.
    pub fn message<T: Into<String>>(msg: T) -> RenderError {
        RenderError::new(RenderErrorKind::Message(msg.into()))
    }

    pub fn at(mut self, line_no: usize, column_no: usize) -> RenderError {
        self.line_no = Some(line_no);
        self.column_no = Some(column_no);
        self
    }

    pub fn in_template(mut self, name: Option<String>) -> RenderError {
        self.template_name = name;
        self
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line_no, self.column_no) {
            (Some(line), Some(col)) => write!(
                f,
                "Error rendering {:?} line {}, col {}: {}",
                self.template_name.as_deref().unwrap_or("unnamed"),
                line,
                col,
                self.kind
            ),
            _ => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RenderErrorKind::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IOError> for RenderError {
    fn from(e: IOError) -> RenderError {
        RenderError::new(RenderErrorKind::Io(e))
    }
}

/// A render error captured in graceful mode. The render continues; the
/// caller inspects these afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderErrorInfo {
    pub message: String,
    pub template_name: Option<String>,
    pub line_no: usize,
    pub column_no: usize,
    /// The original template fragment that was replayed into the output,
    /// empty for statement-level recoveries.
    pub original_text: String,
}

/// Error accessing a file on behalf of the environment.
#[derive(Error, Debug)]
#[error("failed accessing file at {path:?}: {source}")]
pub struct FileError {
    pub path: PathBuf,
    #[source]
    pub source: IOError,
}

/// Any error the environment surface can produce.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Render(#[from] RenderError),
    #[error("{0}")]
    File(#[from] FileError),
}

/// Derives a 1-based line and column from a byte position in the
/// template source.
pub fn source_location(content: &str, pos: usize) -> (usize, usize) {
    let pos = pos.min(content.len());
    let before = &content[..pos];
    let line = before.bytes().filter(|b| *b == b'\n').count() + 1;
    let column = pos - before.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1;
    (line, column)
}
