use std::fmt;
use std::sync::Arc;

use serde_json::value::Value as Json;

use crate::registry::{CallbackFunction, Operation};

/// A literal value embedded in the template source.
#[derive(Debug, Clone)]
pub struct LiteralNode {
    pub value: Json,
    pub pos: usize,
}

/// A reference into the data context: the dotted name as written, and
/// its JSON-pointer form.
#[derive(Debug, Clone)]
pub struct DataNode {
    pub name: String,
    pub pointer: String,
    pub pos: usize,
}

impl DataNode {
    pub fn new(name: &str, pos: usize) -> DataNode {
        DataNode {
            pointer: crate::value::dotted_to_pointer(name),
            name: name.to_string(),
            pos,
        }
    }
}

/// A function or operator application. Operators parse into the fixed
/// built-in tags; user functions capture their registry callback at parse
/// time so published templates keep working when the registry is
/// republished underneath them.
#[derive(Clone)]
pub struct FunctionNode {
    pub name: String,
    pub operation: Operation,
    pub arguments: Vec<Expression>,
    pub callback: Option<CallbackFunction>,
    pub pos: usize,
}

impl fmt::Debug for FunctionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionNode")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .field("arguments", &self.arguments)
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .field("pos", &self.pos)
            .finish()
    }
}

/// One expression atom.
#[derive(Debug, Clone)]
pub enum Expression {
    Literal(LiteralNode),
    Data(DataNode),
    Function(Box<FunctionNode>),
}

impl Expression {
    pub fn pos(&self) -> usize {
        match self {
            Expression::Literal(n) => n.pos,
            Expression::Data(n) => n.pos,
            Expression::Function(n) => n.pos,
        }
    }
}

/// A self-contained expression with the source span it came from, kept
/// for byte-exact graceful replay. For `{{ ... }}` output expressions the
/// span covers both delimiters.
#[derive(Debug, Clone)]
pub struct ExpressionListNode {
    pub root: Option<Expression>,
    pub pos: usize,
    pub length: usize,
}

/// A sequence of statement-level nodes.
#[derive(Debug, Clone, Default)]
pub struct BlockNode {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct ForArrayNode {
    pub value: String,
    pub condition: ExpressionListNode,
    pub body: BlockNode,
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub struct ForObjectNode {
    pub key: String,
    pub value: String,
    pub condition: ExpressionListNode,
    pub body: BlockNode,
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub struct IfNode {
    pub condition: ExpressionListNode,
    pub true_branch: BlockNode,
    pub false_branch: Option<BlockNode>,
    pub pos: usize,
}

#[derive(Debug, Clone)]
pub struct SetNode {
    pub key: String,
    pub pointer: String,
    pub expression: ExpressionListNode,
    pub pos: usize,
}

/// A named, overridable region used by template inheritance. Shared
/// between the tree position it occupies and the owning template's block
/// map.
#[derive(Debug, Clone)]
pub struct BlockStatementNode {
    pub name: String,
    pub block: BlockNode,
    pub pos: usize,
}

/// Statement-level AST node. Text and raw spans index into the owning
/// template's source, which is immutable once the template is published.
#[derive(Debug, Clone)]
pub enum Node {
    Text {
        pos: usize,
        length: usize,
    },
    Raw {
        pos: usize,
        length: usize,
    },
    ExpressionList(ExpressionListNode),
    ForArray(ForArrayNode),
    ForObject(ForObjectNode),
    If(IfNode),
    Include {
        name: String,
        pos: usize,
    },
    Extends {
        name: String,
        pos: usize,
    },
    Block(Arc<BlockStatementNode>),
    Set(SetNode),
}
