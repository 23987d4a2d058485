use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{BlockNode, BlockStatementNode};

/// Named, preparsed templates reachable by `include`/`extends`. Readers
/// hold an immutable snapshot; writers clone the map and publish a new
/// one, so the `Arc` per template keeps publication cheap.
pub type TemplateStore = HashMap<String, Arc<Template>>;

/// A compiled template: the source it was compiled from, the root node
/// sequence, and the block map used by inheritance lookups.
///
/// Immutable once published to a store; text spans in the AST stay valid
/// for the template's lifetime because the source is owned here.
#[derive(Debug, Clone, Default)]
pub struct Template {
    pub name: Option<String>,
    pub source: String,
    pub root: BlockNode,
    pub blocks: HashMap<String, Arc<BlockStatementNode>>,
}

impl Template {
    /// The raw source slice `[pos, pos + length)`, used for text output
    /// and graceful replay of failed expressions.
    pub fn span(&self, pos: usize, length: usize) -> &str {
        &self.source[pos..pos + length]
    }
}
