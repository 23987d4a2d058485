use std::sync::Arc;

use serde_json::value::Value as Json;

use crate::ast::{
    BlockNode, BlockStatementNode, DataNode, Expression, ExpressionListNode, ForArrayNode,
    ForObjectNode, FunctionNode, IfNode, LiteralNode, Node, SetNode,
};
use crate::config::{LexerConfig, ParserConfig};
use crate::error::{source_location, ParseError, ParseErrorKind};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::registry::{FunctionRegistry, Operation};
use crate::template::{Template, TemplateStore};
use crate::value::dotted_to_pointer;

const END_KEYWORDS: &[&str] = &["else", "endif", "endfor", "endblock", "endraw"];

/// Shared parsing state: the registry and store snapshots pinned for this
/// parse, and the per-thread publish buffer where templates discovered
/// through `include`/`extends` accumulate until the parse succeeds.
pub struct ParserContext<'a> {
    pub parser_config: &'a ParserConfig,
    pub functions: &'a FunctionRegistry,
    pub store: &'a TemplateStore,
    pub publish_buffer: &'a mut TemplateStore,
    /// Names currently being parsed, to break include cycles.
    pub in_progress: Vec<String>,
}

/// Compiles one template source into a [`Template`], recursively pulling
/// referenced templates into the publish buffer.
pub fn parse_template(
    lexer_config: &LexerConfig,
    ctx: &mut ParserContext<'_>,
    source: &str,
    name: Option<&str>,
) -> Result<Template, ParseError> {
    let mut parser = TemplateParser {
        lexer: Lexer::new(lexer_config, source),
        lexer_config,
        source,
        template_name: name.map(|n| n.to_string()),
        blocks: Default::default(),
        ctx,
    };
    parser.parse()
}

struct Term {
    keyword: String,
    close: TokenKind,
}

struct TemplateParser<'a, 'c> {
    lexer: Lexer<'a>,
    lexer_config: &'a LexerConfig,
    source: &'a str,
    template_name: Option<String>,
    blocks: std::collections::HashMap<String, Arc<BlockStatementNode>>,
    ctx: &'a mut ParserContext<'c>,
}

impl<'a, 'c> TemplateParser<'a, 'c> {
    fn parse(&mut self) -> Result<Template, ParseError> {
        let (root, _) = self.parse_block_contents(&[])?;
        Ok(Template {
            name: self.template_name.clone(),
            source: self.source.to_string(),
            root,
            blocks: std::mem::take(&mut self.blocks),
        })
    }

    fn err(&self, kind: ParseErrorKind, pos: usize) -> ParseError {
        let (line, col) = source_location(self.source, pos);
        ParseError::of(kind)
            .at(line, col)
            .in_template(self.template_name.clone())
    }

    fn unexpected(&self, token: &Token) -> ParseError {
        if token.kind == TokenKind::Eof {
            self.err(ParseErrorKind::UnexpectedEof, token.pos)
        } else {
            self.err(
                ParseErrorKind::UnexpectedToken(self.lexer.text(token).to_string()),
                token.pos,
            )
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        let token = self.lexer.next_token();
        if token.kind == kind {
            Ok(token)
        } else {
            Err(self.err(
                ParseErrorKind::ExpectedToken {
                    expected: what.to_string(),
                    found: self.lexer.text(&token).to_string(),
                },
                token.pos,
            ))
        }
    }

    fn expect_id(&mut self) -> Result<(Token, String), ParseError> {
        let token = self.expect(TokenKind::Id, "identifier")?;
        let text = self.lexer.text(&token).to_string();
        Ok((token, text))
    }

    /// Parses statement-level content until EOF or one of `terminators`
    /// opens. The terminator's closing delimiter is left unconsumed so
    /// `else if` chains can keep reading the same statement.
    fn parse_block_contents(
        &mut self,
        terminators: &[&str],
    ) -> Result<(BlockNode, Option<Term>), ParseError> {
        let mut nodes = Vec::new();
        loop {
            let token = self.lexer.next_token();
            match token.kind {
                TokenKind::Text => nodes.push(Node::Text {
                    pos: token.pos,
                    length: token.len,
                }),
                TokenKind::ExpressionOpen => {
                    nodes.push(Node::ExpressionList(self.parse_output_expression(token)?));
                }
                TokenKind::StatementOpen | TokenKind::LineStatementOpen => {
                    let close = if token.kind == TokenKind::StatementOpen {
                        TokenKind::StatementClose
                    } else {
                        TokenKind::LineStatementClose
                    };
                    let (kw_token, keyword) = self.expect_id()?;
                    if terminators.contains(&keyword.as_str()) {
                        return Ok((
                            BlockNode { nodes },
                            Some(Term { keyword, close }),
                        ));
                    }
                    if END_KEYWORDS.contains(&keyword.as_str()) {
                        return Err(self.err(
                            ParseErrorKind::MismatchedBlockClose {
                                open: terminators.join("/"),
                                close: keyword,
                            },
                            kw_token.pos,
                        ));
                    }
                    let node = self.parse_statement(&keyword, kw_token.pos, token.pos, close)?;
                    nodes.push(node);
                }
                TokenKind::Eof => {
                    if terminators.is_empty() {
                        return Ok((BlockNode { nodes }, None));
                    }
                    return Err(self.err(ParseErrorKind::UnexpectedEof, token.pos));
                }
                _ => return Err(self.unexpected(&token)),
            }
        }
    }

    fn required_term(&self, term: Option<Term>) -> Result<Term, ParseError> {
        term.ok_or_else(|| self.err(ParseErrorKind::UnexpectedEof, self.source.len()))
    }

    fn expect_close(&mut self, close: TokenKind) -> Result<Token, ParseError> {
        self.expect(close, "statement close")
    }

    fn parse_statement(
        &mut self,
        keyword: &str,
        kw_pos: usize,
        stmt_pos: usize,
        close: TokenKind,
    ) -> Result<Node, ParseError> {
        match keyword {
            "if" => Ok(Node::If(self.parse_if(stmt_pos, close)?)),
            "for" => self.parse_for(stmt_pos, close),
            "set" => self.parse_set(stmt_pos, close),
            "include" => {
                let name = self.parse_template_name()?;
                self.expect_close(close)?;
                self.resolve_referenced_template(&name)?;
                Ok(Node::Include {
                    name,
                    pos: stmt_pos,
                })
            }
            "extends" => {
                let name = self.parse_template_name()?;
                self.expect_close(close)?;
                self.resolve_referenced_template(&name)?;
                Ok(Node::Extends {
                    name,
                    pos: stmt_pos,
                })
            }
            "block" => self.parse_block_statement(stmt_pos, close),
            "raw" => {
                self.expect_close(close)?;
                match self.lexer.find_raw_end() {
                    Some((pos, length)) => Ok(Node::Raw { pos, length }),
                    None => Err(self.err(ParseErrorKind::UnexpectedEof, self.source.len())),
                }
            }
            _ => Err(self.err(
                ParseErrorKind::UnknownStatement(keyword.to_string()),
                kw_pos,
            )),
        }
    }

    fn parse_if(&mut self, pos: usize, close: TokenKind) -> Result<IfNode, ParseError> {
        let condition = self.parse_condition()?;
        self.expect_close(close)?;
        let (true_branch, term) = self.parse_block_contents(&["else", "endif"])?;
        let term = self.required_term(term)?;
        match term.keyword.as_str() {
            "endif" => {
                self.expect_close(term.close)?;
                Ok(IfNode {
                    condition,
                    true_branch,
                    false_branch: None,
                    pos,
                })
            }
            _ => {
                // else or else if
                let next = self.lexer.peek_token();
                if next.kind == TokenKind::Id && self.lexer.text(&next) == "if" {
                    self.lexer.next_token();
                    let nested = self.parse_if(next.pos, term.close)?;
                    Ok(IfNode {
                        condition,
                        true_branch,
                        false_branch: Some(BlockNode {
                            nodes: vec![Node::If(nested)],
                        }),
                        pos,
                    })
                } else {
                    self.expect_close(term.close)?;
                    let (false_branch, term2) = self.parse_block_contents(&["endif"])?;
                    let term2 = self.required_term(term2)?;
                    self.expect_close(term2.close)?;
                    Ok(IfNode {
                        condition,
                        true_branch,
                        false_branch: Some(false_branch),
                        pos,
                    })
                }
            }
        }
    }

    fn parse_for(&mut self, pos: usize, close: TokenKind) -> Result<Node, ParseError> {
        let (_, first) = self.expect_id()?;
        let second = if self.lexer.peek_token().kind == TokenKind::Comma {
            self.lexer.next_token();
            let (_, v) = self.expect_id()?;
            Some(v)
        } else {
            None
        };
        let (in_token, in_kw) = self.expect_id()?;
        if in_kw != "in" {
            return Err(self.err(
                ParseErrorKind::ExpectedToken {
                    expected: "in".to_string(),
                    found: in_kw,
                },
                in_token.pos,
            ));
        }
        let condition = self.parse_condition()?;
        self.expect_close(close)?;
        let (body, term) = self.parse_block_contents(&["endfor"])?;
        let term = self.required_term(term)?;
        self.expect_close(term.close)?;

        match second {
            Some(value) => Ok(Node::ForObject(ForObjectNode {
                key: first,
                value,
                condition,
                body,
                pos,
            })),
            None => Ok(Node::ForArray(ForArrayNode {
                value: first,
                condition,
                body,
                pos,
            })),
        }
    }

    fn parse_set(&mut self, pos: usize, close: TokenKind) -> Result<Node, ParseError> {
        let (_, key) = self.expect_id()?;
        self.expect(TokenKind::Assign, "=")?;
        let expression = self.parse_condition()?;
        self.expect_close(close)?;
        Ok(Node::Set(SetNode {
            pointer: dotted_to_pointer(&key),
            key,
            expression,
            pos,
        }))
    }

    fn parse_block_statement(
        &mut self,
        pos: usize,
        close: TokenKind,
    ) -> Result<Node, ParseError> {
        let (_, name) = self.expect_id()?;
        self.expect_close(close)?;
        let (body, term) = self.parse_block_contents(&["endblock"])?;
        let term = self.required_term(term)?;
        self.expect_close(term.close)?;

        let node = Arc::new(BlockStatementNode {
            name: name.clone(),
            block: body,
            pos,
        });
        // first definition of a name wins within one template
        self.blocks.entry(name).or_insert_with(|| node.clone());
        Ok(Node::Block(node))
    }

    fn parse_template_name(&mut self) -> Result<String, ParseError> {
        let token = self.expect(TokenKind::Str, "template name string")?;
        self.string_literal(&token)
    }

    fn string_literal(&mut self, token: &Token) -> Result<String, ParseError> {
        serde_json::from_str::<String>(self.lexer.text(token))
            .map_err(|e| self.err(ParseErrorKind::InvalidLiteral(e.to_string()), token.pos))
    }

    /// Makes an `include`/`extends` target available: publish buffer
    /// first, then the store snapshot, then (optionally) the file system
    /// and the include callback. Unresolvable names are left to the
    /// render-time missing-include policy.
    fn resolve_referenced_template(&mut self, name: &str) -> Result<(), ParseError> {
        if self.ctx.publish_buffer.contains_key(name)
            || self.ctx.store.contains_key(name)
            || self.ctx.in_progress.iter().any(|n| n == name)
        {
            return Ok(());
        }

        let mut source = None;
        if self.ctx.parser_config.search_included_templates_in_files {
            let path = self.ctx.parser_config.input_path.join(name);
            if let Ok(content) = std::fs::read_to_string(&path) {
                source = Some(content);
            }
        }
        if source.is_none() {
            if let Some(cb) = self.ctx.parser_config.include_callback.clone() {
                source = Some(cb(&self.ctx.parser_config.input_path, name)?);
            }
        }

        if let Some(content) = source {
            self.ctx.in_progress.push(name.to_string());
            let parsed = parse_template(self.lexer_config, self.ctx, &content, Some(name));
            self.ctx.in_progress.pop();
            let template = parsed?;
            self.ctx
                .publish_buffer
                .insert(name.to_string(), Arc::new(template));
        }
        Ok(())
    }

    /// An output expression `{{ ... }}`; the recorded span covers both
    /// delimiters so graceful mode can replay the exact original text.
    fn parse_output_expression(
        &mut self,
        open: Token,
    ) -> Result<ExpressionListNode, ParseError> {
        let root = if self.lexer.peek_token().kind == TokenKind::ExpressionClose {
            None
        } else {
            Some(self.parse_expression(0)?)
        };
        let close = self.expect(TokenKind::ExpressionClose, "expression close")?;
        Ok(ExpressionListNode {
            root,
            pos: open.pos,
            length: close.pos + close.len - open.pos,
        })
    }

    /// A statement condition; the recorded span covers the expression
    /// text itself.
    fn parse_condition(&mut self) -> Result<ExpressionListNode, ParseError> {
        let start = self.lexer.peek_token().pos;
        let root = self.parse_expression(0)?;
        let end = self.lexer.peek_token().pos.max(start).min(self.source.len());
        let length = self.source[start..end].trim_end().len();
        Ok(ExpressionListNode {
            root: Some(root),
            pos: start,
            length,
        })
    }

    fn binary_op(&self, token: &Token) -> Option<(&'static str, Operation, u8, bool)> {
        let op = match token.kind {
            TokenKind::Id => match self.lexer.text(token) {
                "or" => ("or", Operation::Or, 1, false),
                "and" => ("and", Operation::And, 2, false),
                "in" => ("in", Operation::In, 3, false),
                _ => return None,
            },
            TokenKind::Eq => ("equal", Operation::Equal, 3, false),
            TokenKind::NotEq => ("not equal", Operation::NotEqual, 3, false),
            TokenKind::Gt => ("greater", Operation::Greater, 3, false),
            TokenKind::Gte => ("greater equal", Operation::GreaterEqual, 3, false),
            TokenKind::Lt => ("less", Operation::Less, 3, false),
            TokenKind::Lte => ("less equal", Operation::LessEqual, 3, false),
            TokenKind::Plus => ("add", Operation::Add, 4, false),
            TokenKind::Minus => ("subtract", Operation::Subtract, 4, false),
            TokenKind::Times => ("multiply", Operation::Multiplication, 5, false),
            TokenKind::Slash => ("division", Operation::Division, 5, false),
            TokenKind::Percent => ("modulo", Operation::Modulo, 5, false),
            TokenKind::Power => ("power", Operation::Power, 6, true),
            _ => return None,
        };
        Some(op)
    }

    fn parse_expression(&mut self, min_prec: u8) -> Result<Expression, ParseError> {
        let mut left = self.parse_primary()?;
        left = self.parse_postfix(left)?;
        loop {
            let token = self.lexer.peek_token();
            if token.kind == TokenKind::Pipe && min_prec == 0 {
                self.lexer.next_token();
                left = self.parse_filter(left)?;
                left = self.parse_postfix(left)?;
                continue;
            }
            let (name, operation, prec, right_assoc) = match self.binary_op(&token) {
                Some(op) => op,
                None => break,
            };
            if prec < min_prec {
                break;
            }
            self.lexer.next_token();
            let next_min = if right_assoc { prec } else { prec + 1 };
            let right = self.parse_expression(next_min)?;
            left = Expression::Function(Box::new(FunctionNode {
                name: name.to_string(),
                operation,
                arguments: vec![left, right],
                callback: None,
                pos: token.pos,
            }));
        }
        Ok(left)
    }

    fn parse_filter(&mut self, input: Expression) -> Result<Expression, ParseError> {
        let (name_token, name) = self.expect_id()?;
        let mut arguments = vec![input];
        if self.lexer.peek_token().kind == TokenKind::LeftParen {
            self.lexer.next_token();
            self.parse_call_arguments(&mut arguments)?;
        }
        self.make_function(name, arguments, name_token.pos)
    }

    /// Dynamic member access: a `.`-postfix on a computed value, as in
    /// `first(users).name`. Each segment becomes an access node whose
    /// member argument is a data reference carrying the name through the
    /// not-found channel; plain dotted identifiers never reach here
    /// because the lexer absorbs their dots into one token.
    fn parse_postfix(&mut self, mut expr: Expression) -> Result<Expression, ParseError> {
        while self.lexer.peek_token().kind == TokenKind::Dot {
            let dot = self.lexer.next_token();
            let (name_token, name) = self.expect_id()?;
            for segment in name.split('.') {
                let member = Expression::Data(DataNode::new(segment, name_token.pos));
                expr = Expression::Function(Box::new(FunctionNode {
                    name: "at_id".to_string(),
                    operation: Operation::AtId,
                    arguments: vec![expr, member],
                    callback: None,
                    pos: dot.pos,
                }));
            }
        }
        Ok(expr)
    }

    fn parse_call_arguments(
        &mut self,
        arguments: &mut Vec<Expression>,
    ) -> Result<(), ParseError> {
        if self.lexer.peek_token().kind == TokenKind::RightParen {
            self.lexer.next_token();
            return Ok(());
        }
        loop {
            arguments.push(self.parse_expression(0)?);
            let token = self.lexer.next_token();
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::RightParen => return Ok(()),
                _ => return Err(self.unexpected(&token)),
            }
        }
    }

    fn make_function(
        &mut self,
        name: String,
        arguments: Vec<Expression>,
        pos: usize,
    ) -> Result<Expression, ParseError> {
        let arity = arguments.len();
        let entry = self.ctx.functions.find(&name, arity as i32);
        let (operation, callback) = match entry {
            Some(e) => (e.operation, e.callback),
            None => {
                if self.ctx.parser_config.graceful_errors {
                    (Operation::None, None)
                } else {
                    return Err(
                        self.err(ParseErrorKind::UnknownFunction { name, arity }, pos)
                    );
                }
            }
        };
        Ok(Expression::Function(Box::new(FunctionNode {
            name,
            operation,
            arguments,
            callback,
            pos,
        })))
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        let token = self.lexer.next_token();
        match token.kind {
            TokenKind::Number | TokenKind::JsonLiteral => {
                let value: Json = serde_json::from_str(self.lexer.text(&token))
                    .map_err(|e| {
                        self.err(ParseErrorKind::InvalidLiteral(e.to_string()), token.pos)
                    })?;
                Ok(Expression::Literal(LiteralNode {
                    value,
                    pos: token.pos,
                }))
            }
            TokenKind::Str => {
                let value = self.string_literal(&token)?;
                Ok(Expression::Literal(LiteralNode {
                    value: Json::String(value),
                    pos: token.pos,
                }))
            }
            TokenKind::Minus => {
                let number = self.expect(TokenKind::Number, "number")?;
                let text = format!("-{}", self.lexer.text(&number));
                let value: Json = serde_json::from_str(&text).map_err(|e| {
                    self.err(ParseErrorKind::InvalidLiteral(e.to_string()), token.pos)
                })?;
                Ok(Expression::Literal(LiteralNode {
                    value,
                    pos: token.pos,
                }))
            }
            TokenKind::LeftParen => {
                let inner = self.parse_expression(0)?;
                self.expect(TokenKind::RightParen, ")")?;
                Ok(inner)
            }
            TokenKind::Id => {
                let name = self.lexer.text(&token).to_string();
                match name.as_str() {
                    "true" => Ok(Expression::Literal(LiteralNode {
                        value: Json::Bool(true),
                        pos: token.pos,
                    })),
                    "false" => Ok(Expression::Literal(LiteralNode {
                        value: Json::Bool(false),
                        pos: token.pos,
                    })),
                    "null" => Ok(Expression::Literal(LiteralNode {
                        value: Json::Null,
                        pos: token.pos,
                    })),
                    "not" => {
                        let operand = self.parse_expression(3)?;
                        Ok(Expression::Function(Box::new(FunctionNode {
                            name: "not".to_string(),
                            operation: Operation::Not,
                            arguments: vec![operand],
                            callback: None,
                            pos: token.pos,
                        })))
                    }
                    "and" | "or" | "in" => Err(self.unexpected(&token)),
                    _ => {
                        if self.lexer.peek_token().kind == TokenKind::LeftParen {
                            self.lexer.next_token();
                            let mut arguments = Vec::new();
                            self.parse_call_arguments(&mut arguments)?;
                            self.make_function(name, arguments, token.pos)
                        } else {
                            Ok(Expression::Data(DataNode::new(&name, token.pos)))
                        }
                    }
                }
            }
            _ => Err(self.unexpected(&token)),
        }
    }
}
