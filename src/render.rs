use std::convert::TryFrom;
use std::rc::Rc;

use log::debug;
use serde_json::json;
use serde_json::value::Value as Json;
use serde_json::Map;

use crate::ast::{
    BlockNode, BlockStatementNode, DataNode, Expression, ExpressionListNode, ForArrayNode,
    ForObjectNode, FunctionNode, IfNode, Node, SetNode,
};
use crate::config::{InstrumentationData, InstrumentationEvent, RenderConfig};
use crate::error::{
    source_location, RenderError, RenderErrorInfo, RenderErrorKind,
};
use crate::output::Output;
use crate::registry::{CallbackFunction, FunctionRegistry, Operation};
use crate::template::{Template, TemplateStore};
use crate::value::{
    dotted_to_pointer, html_escape, set_pointer, truthy, value_cmp, value_eq,
};

/// A value on the evaluation stack. `Borrowed` points into the data
/// input or an AST literal, both alive for the whole render; `Owned`
/// anchors a temporary (or a value read out of the locals) so popped
/// slots stay valid on their own.
#[derive(Clone)]
enum EvalValue<'r> {
    Borrowed(&'r Json),
    Owned(Rc<Json>),
}

impl<'r> EvalValue<'r> {
    fn owned(value: Json) -> EvalValue<'r> {
        EvalValue::Owned(Rc::new(value))
    }

    fn null() -> EvalValue<'r> {
        EvalValue::owned(Json::Null)
    }

    fn as_json(&self) -> &Json {
        match self {
            EvalValue::Borrowed(v) => v,
            EvalValue::Owned(rc) => rc,
        }
    }

    fn into_owned(self) -> Json {
        match self {
            EvalValue::Borrowed(v) => v.clone(),
            EvalValue::Owned(rc) => Rc::try_unwrap(rc).unwrap_or_else(|rc| (*rc).clone()),
        }
    }

    /// Projects into a sub-value, keeping a data-input reference borrowed
    /// and cloning out of owned anchors.
    fn project<F>(&self, f: F) -> Option<EvalValue<'r>>
    where
        F: for<'x> FnOnce(&'x Json) -> Option<&'x Json>,
    {
        match self {
            EvalValue::Borrowed(v) => f(*v).map(EvalValue::Borrowed),
            EvalValue::Owned(rc) => f(rc.as_ref()).map(|sub| EvalValue::owned(sub.clone())),
        }
    }
}

/// Pairs a pushed unresolved slot with the symbol that failed to
/// resolve, for error reporting and graceful replay.
struct NotFound {
    name: String,
    pos: usize,
}

/// An evaluated argument: either a value, or the record of what failed
/// to resolve.
enum Arg<'r> {
    Value(EvalValue<'r>),
    Missing(NotFound),
}

/// The tree-walking evaluator. One renderer renders one template against
/// one data value and is then consumed; `extends` re-enters the same
/// renderer, `include` spawns a fresh one sharing the snapshots.
pub struct Renderer<'r> {
    config: &'r RenderConfig,
    templates: &'r TemplateStore,
    functions: &'r FunctionRegistry,

    data_input: &'r Json,
    current_template: &'r Template,
    current_level: usize,
    template_stack: Vec<&'r Template>,
    block_stack: Vec<String>,

    additional_data: Json,
    eval_stack: Vec<Option<EvalValue<'r>>>,
    not_found_stack: Vec<NotFound>,
    break_rendering: bool,
    render_errors: Vec<RenderErrorInfo>,
}

impl<'r> Renderer<'r> {
    pub fn new(
        config: &'r RenderConfig,
        templates: &'r TemplateStore,
        functions: &'r FunctionRegistry,
        template: &'r Template,
        data: &'r Json,
    ) -> Renderer<'r> {
        Renderer {
            config,
            templates,
            functions,
            data_input: data,
            current_template: template,
            current_level: 0,
            template_stack: Vec::new(),
            block_stack: Vec::new(),
            additional_data: Json::Object(Map::new()),
            eval_stack: Vec::new(),
            not_found_stack: Vec::new(),
            break_rendering: false,
            render_errors: Vec::new(),
        }
    }

    /// Seeds the per-render locals, used by `include` to propagate the
    /// caller's `set` bindings and `loop` object.
    pub fn with_locals(mut self, locals: Json) -> Renderer<'r> {
        self.additional_data = locals;
        self
    }

    pub fn render_to(&mut self, out: &mut dyn Output) -> Result<(), RenderError> {
        debug!("rendering template {:?}", self.current_template.name);
        let template = self.current_template;
        self.render_template(out, template)
    }

    pub fn render_errors(&self) -> &[RenderErrorInfo] {
        &self.render_errors
    }

    pub fn into_render_errors(self) -> Vec<RenderErrorInfo> {
        self.render_errors
    }

    fn render_template(
        &mut self,
        out: &mut dyn Output,
        template: &'r Template,
    ) -> Result<(), RenderError> {
        self.current_template = template;
        self.template_stack.push(template);
        self.emit(
            InstrumentationData::new(InstrumentationEvent::RenderStart)
                .with_name(template.name.as_deref().unwrap_or("")),
        );
        self.visit_block(out, &template.root)?;
        self.emit(
            InstrumentationData::new(InstrumentationEvent::RenderEnd)
                .with_name(template.name.as_deref().unwrap_or("")),
        );
        Ok(())
    }

    fn emit(&self, data: InstrumentationData) {
        if let Some(cb) = &self.config.instrumentation_callback {
            cb(&data);
        }
    }

    /// Records the error in graceful mode, or raises it with a source
    /// location in strict mode.
    fn report(
        &mut self,
        kind: RenderErrorKind,
        pos: usize,
        original_text: String,
    ) -> Result<(), RenderError> {
        let (line_no, column_no) = source_location(&self.current_template.source, pos);
        if self.config.graceful_errors {
            self.render_errors.push(RenderErrorInfo {
                message: kind.to_string(),
                template_name: self.current_template.name.clone(),
                line_no,
                column_no,
                original_text,
            });
            Ok(())
        } else {
            Err(RenderError::new(kind)
                .at(line_no, column_no)
                .in_template(self.current_template.name.clone()))
        }
    }

    fn located(&self, mut error: RenderError, pos: usize) -> RenderError {
        if error.line_no.is_none() {
            let (line_no, column_no) = source_location(&self.current_template.source, pos);
            error = error
                .at(line_no, column_no)
                .in_template(self.current_template.name.clone());
        }
        error
    }

    /// The replayed fragment for a failed expression, graceful mode only.
    fn replay_text(&self, node: &ExpressionListNode) -> String {
        if self.config.graceful_errors && node.length > 0 {
            self.current_template.span(node.pos, node.length).to_string()
        } else {
            String::new()
        }
    }

    fn visit_block(&mut self, out: &mut dyn Output, block: &'r BlockNode) -> Result<(), RenderError> {
        for node in &block.nodes {
            self.visit_node(out, node)?;
            if self.break_rendering {
                break;
            }
        }
        Ok(())
    }

    fn visit_node(&mut self, out: &mut dyn Output, node: &'r Node) -> Result<(), RenderError> {
        match node {
            Node::Text { pos, length } | Node::Raw { pos, length } => {
                out.write(self.current_template.span(*pos, *length))?;
                Ok(())
            }
            Node::ExpressionList(el) => self.visit_expression_list_output(out, el),
            Node::If(n) => self.visit_if(out, n),
            Node::ForArray(n) => self.visit_for_array(out, n),
            Node::ForObject(n) => self.visit_for_object(out, n),
            Node::Include { name, pos } => self.visit_include(out, name, *pos),
            Node::Extends { name, pos } => self.visit_extends(out, name, *pos),
            Node::Block(n) => self.visit_block_statement(out, n),
            Node::Set(n) => self.visit_set(out, n),
        }
    }

    // ---- expression evaluation ------------------------------------------

    /// Evaluates one expression list. Exactly one slot must remain above
    /// the entry depth; an unresolved slot turns into a
    /// "variable not found" report against the paired symbol.
    ///
    /// Strict mode surfaces every failure as `Err`, so `Ok(None)` can only
    /// be observed in graceful mode.
    fn eval_expression_list(
        &mut self,
        out: &mut dyn Output,
        node: &'r ExpressionListNode,
    ) -> Result<Option<EvalValue<'r>>, RenderError> {
        let root = match &node.root {
            Some(root) => root,
            None => {
                let text = self.replay_text(node);
                self.report(RenderErrorKind::EmptyExpression, node.pos, text)?;
                return Ok(None);
            }
        };

        let base = self.eval_stack.len();
        self.visit_expression(out, root)?;

        let depth = self.eval_stack.len();
        if depth != base + 1 {
            while self.eval_stack.len() > base {
                if let Some(None) = self.eval_stack.pop() {
                    self.not_found_stack.pop();
                }
            }
            let kind = if depth <= base {
                RenderErrorKind::EmptyExpression
            } else {
                RenderErrorKind::MalformedExpression
            };
            let text = self.replay_text(node);
            self.report(kind, node.pos, text)?;
            return Ok(None);
        }

        match self.eval_stack.pop() {
            Some(Some(value)) => Ok(Some(value)),
            _ => {
                let text = self.replay_text(node);
                match self.not_found_stack.pop() {
                    Some(not_found) => {
                        self.report(
                            RenderErrorKind::VariableNotFound {
                                name: not_found.name,
                            },
                            not_found.pos,
                            text,
                        )?;
                    }
                    None => {
                        self.report(RenderErrorKind::MalformedExpression, node.pos, text)?;
                    }
                }
                Ok(None)
            }
        }
    }

    fn visit_expression_list_output(
        &mut self,
        out: &mut dyn Output,
        node: &'r ExpressionListNode,
    ) -> Result<(), RenderError> {
        match self.eval_expression_list(out, node)? {
            Some(value) => self.print_value(out, value.as_json()),
            None => {
                if self.config.graceful_errors && node.length > 0 {
                    out.write(self.current_template.span(node.pos, node.length))?;
                }
                Ok(())
            }
        }
    }

    fn print_value(&self, out: &mut dyn Output, value: &Json) -> Result<(), RenderError> {
        match value {
            Json::String(s) => {
                if self.config.html_autoescape {
                    out.write(&html_escape(s))?;
                } else {
                    out.write(s)?;
                }
            }
            Json::Null => {}
            other => out.write(&other.to_string())?,
        }
        Ok(())
    }

    fn visit_expression(
        &mut self,
        out: &mut dyn Output,
        expr: &'r Expression,
    ) -> Result<(), RenderError> {
        match expr {
            Expression::Literal(node) => {
                self.eval_stack.push(Some(EvalValue::Borrowed(&node.value)));
                Ok(())
            }
            Expression::Data(node) => self.visit_data(out, node),
            Expression::Function(node) => self.visit_function(out, node),
        }
    }

    /// Variable resolution: locals first, then the data input, then a
    /// zero-arity callback of the same name, otherwise unresolved.
    fn visit_data(&mut self, _out: &mut dyn Output, node: &'r DataNode) -> Result<(), RenderError> {
        let local = self.additional_data.pointer(&node.pointer).cloned();
        if let Some(value) = local {
            self.eval_stack.push(Some(EvalValue::owned(value)));
            return Ok(());
        }

        let data = self.data_input;
        if let Some(value) = data.pointer(&node.pointer) {
            self.eval_stack.push(Some(EvalValue::Borrowed(value)));
            return Ok(());
        }

        if let Some(entry) = self.functions.find(&node.name, 0) {
            if entry.operation == Operation::Callback {
                if let Some(callback) = entry.callback {
                    match self.call_callback(&node.name, &callback, &[], node.pos) {
                        Ok(value) => {
                            self.eval_stack.push(Some(EvalValue::owned(value)));
                            return Ok(());
                        }
                        Err(e) => {
                            if self.config.graceful_errors {
                                self.push_unresolved(&node.name, node.pos);
                                return Ok(());
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }

        self.push_unresolved(&node.name, node.pos);
        Ok(())
    }

    fn push_unresolved(&mut self, name: &str, pos: usize) {
        self.eval_stack.push(None);
        self.not_found_stack.push(NotFound {
            name: name.to_string(),
            pos,
        });
    }

    fn call_callback(
        &self,
        name: &str,
        callback: &CallbackFunction,
        args: &[&Json],
        pos: usize,
    ) -> Result<Json, RenderError> {
        let result = match &self.config.callback_wrapper {
            Some(wrapper) => wrapper(name, args, Box::new(move || callback(args))),
            None => callback(args),
        };
        result.map_err(|e| self.located(e, pos))
    }

    // ---- argument gathering ---------------------------------------------

    /// Evaluates `count` argument expressions starting at `start`,
    /// keeping unresolved slots visible to the caller.
    fn eval_args(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
        start: usize,
        count: usize,
    ) -> Result<Vec<Arg<'r>>, RenderError> {
        if node.arguments.len() < start + count {
            self.report(
                RenderErrorKind::BadOperationInput {
                    op: node.name.clone(),
                    detail: format!(
                        "needs {} arguments, but found {}",
                        start + count,
                        node.arguments.len()
                    ),
                },
                node.pos,
                String::new(),
            )?;
        }

        let available = node.arguments.len().saturating_sub(start).min(count);
        let base = self.eval_stack.len();
        for argument in node.arguments.iter().skip(start).take(available) {
            self.visit_expression(out, argument)?;
        }

        let mut args = Vec::with_capacity(count);
        while self.eval_stack.len() > base {
            match self.eval_stack.pop() {
                Some(Some(value)) => args.push(Arg::Value(value)),
                Some(None) => {
                    let not_found = self.not_found_stack.pop().unwrap_or(NotFound {
                        name: node.name.clone(),
                        pos: node.pos,
                    });
                    args.push(Arg::Missing(not_found));
                }
                None => break,
            }
        }
        args.reverse();
        while args.len() < count {
            args.push(Arg::Missing(NotFound {
                name: node.name.clone(),
                pos: node.pos,
            }));
        }
        Ok(args)
    }

    /// Required arguments: a missing value is reported, and in graceful
    /// mode a null stands in so the operation can proceed defensively.
    fn get_arguments(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
        start: usize,
        count: usize,
    ) -> Result<Vec<EvalValue<'r>>, RenderError> {
        let args = self.eval_args(out, node, start, count)?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                Arg::Value(value) => values.push(value),
                Arg::Missing(not_found) => {
                    self.report(
                        RenderErrorKind::VariableNotFound {
                            name: not_found.name,
                        },
                        not_found.pos,
                        String::new(),
                    )?;
                    values.push(EvalValue::null());
                }
            }
        }
        Ok(values)
    }

    fn get_argument_vector(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
    ) -> Result<Vec<EvalValue<'r>>, RenderError> {
        self.get_arguments(out, node, 0, node.arguments.len())
    }

    /// An operation failed: in graceful mode push one unresolved slot
    /// named after the operation so the enclosing expression replays its
    /// span; in strict mode raise the precise kind.
    fn op_failed(
        &mut self,
        node: &'r FunctionNode,
        name: &str,
        kind: RenderErrorKind,
    ) -> Result<(), RenderError> {
        if self.config.graceful_errors {
            self.push_unresolved(name, node.pos);
            Ok(())
        } else {
            let (line_no, column_no) = source_location(&self.current_template.source, node.pos);
            Err(RenderError::new(kind)
                .at(line_no, column_no)
                .in_template(self.current_template.name.clone()))
        }
    }

    fn push_result(&mut self, value: Json) {
        self.eval_stack.push(Some(EvalValue::owned(value)));
    }

    // ---- operations ------------------------------------------------------

    fn visit_function(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
    ) -> Result<(), RenderError> {
        use crate::registry::Operation as Op;

        match node.operation {
            Op::Not => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = !truthy(args[0].as_json());
                self.push_result(Json::Bool(v));
            }
            Op::And => {
                let mut result = truthy(self.get_arguments(out, node, 0, 1)?[0].as_json());
                if result {
                    result = truthy(self.get_arguments(out, node, 1, 1)?[0].as_json());
                }
                self.push_result(Json::Bool(result));
            }
            Op::Or => {
                let mut result = truthy(self.get_arguments(out, node, 0, 1)?[0].as_json());
                if !result {
                    result = truthy(self.get_arguments(out, node, 1, 1)?[0].as_json());
                }
                self.push_result(Json::Bool(result));
            }
            Op::In => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_in(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "in", kind)?,
                }
            }
            Op::Equal => {
                let args = self.get_arguments(out, node, 0, 2)?;
                let v = value_eq(args[0].as_json(), args[1].as_json());
                self.push_result(Json::Bool(v));
            }
            Op::NotEqual => {
                let args = self.get_arguments(out, node, 0, 2)?;
                let v = !value_eq(args[0].as_json(), args[1].as_json());
                self.push_result(Json::Bool(v));
            }
            Op::Greater => {
                let args = self.get_arguments(out, node, 0, 2)?;
                let v = value_cmp(args[0].as_json(), args[1].as_json()).is_gt();
                self.push_result(Json::Bool(v));
            }
            Op::GreaterEqual => {
                let args = self.get_arguments(out, node, 0, 2)?;
                let v = value_cmp(args[0].as_json(), args[1].as_json()).is_ge();
                self.push_result(Json::Bool(v));
            }
            Op::Less => {
                let args = self.get_arguments(out, node, 0, 2)?;
                let v = value_cmp(args[0].as_json(), args[1].as_json()).is_lt();
                self.push_result(Json::Bool(v));
            }
            Op::LessEqual => {
                let args = self.get_arguments(out, node, 0, 2)?;
                let v = value_cmp(args[0].as_json(), args[1].as_json()).is_le();
                self.push_result(Json::Bool(v));
            }
            Op::Add => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_add(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "add", kind)?,
                }
            }
            Op::Subtract => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_subtract(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "subtract", kind)?,
                }
            }
            Op::Multiplication => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_multiply(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "multiply", kind)?,
                }
            }
            Op::Division => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_divide(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "division", kind)?,
                }
            }
            Op::Power => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_power(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "power", kind)?,
                }
            }
            Op::Modulo => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_modulo(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "modulo", kind)?,
                }
            }
            Op::At => self.visit_at(out, node)?,
            Op::AtId => self.visit_at_id(out, node)?,
            Op::Capitalize => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match op_capitalize(args[0].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "capitalize", kind)?,
                }
            }
            Op::Default => {
                let mut first = self.eval_args(out, node, 0, 1)?;
                match first.pop() {
                    Some(Arg::Value(value)) => self.eval_stack.push(Some(value)),
                    _ => {
                        let fallback = self.get_arguments(out, node, 1, 1)?;
                        let value = fallback.into_iter().next().unwrap_or_else(EvalValue::null);
                        self.eval_stack.push(Some(value));
                    }
                }
            }
            Op::DivisibleBy => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_divisible_by(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "divisibleBy", kind)?,
                }
            }
            Op::Even => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match int_arg(args[0].as_json(), "even") {
                    Ok(n) => self.push_result(Json::Bool(n % 2 == 0)),
                    Err(kind) => self.op_failed(node, "even", kind)?,
                }
            }
            Op::Odd => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match int_arg(args[0].as_json(), "odd") {
                    Ok(n) => self.push_result(Json::Bool(n % 2 != 0)),
                    Err(kind) => self.op_failed(node, "odd", kind)?,
                }
            }
            Op::Exists => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match str_arg(args[0].as_json(), "exists") {
                    Ok(name) => {
                        let pointer = dotted_to_pointer(name);
                        // by design the data input only, never the locals
                        let v = self.data_input.pointer(&pointer).is_some();
                        self.push_result(Json::Bool(v));
                    }
                    Err(kind) => self.op_failed(node, "exists", kind)?,
                }
            }
            Op::ExistsInObject => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_exists_in(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "existsIn", kind)?,
                }
            }
            Op::First => self.visit_element(out, node, "first", |arr| arr.first())?,
            Op::Last => self.visit_element(out, node, "last", |arr| arr.last())?,
            Op::Float => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match op_float(args[0].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "float", kind)?,
                }
            }
            Op::Int => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match op_int(args[0].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "int", kind)?,
                }
            }
            Op::Length => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = op_length(args[0].as_json());
                self.push_result(v);
            }
            Op::Lower => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match str_arg(args[0].as_json(), "lower") {
                    Ok(s) => self.push_result(Json::String(s.to_lowercase())),
                    Err(kind) => self.op_failed(node, "lower", kind)?,
                }
            }
            Op::Upper => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match str_arg(args[0].as_json(), "upper") {
                    Ok(s) => self.push_result(Json::String(s.to_uppercase())),
                    Err(kind) => self.op_failed(node, "upper", kind)?,
                }
            }
            Op::Max => self.visit_extremum(out, node, "max", std::cmp::Ordering::Greater)?,
            Op::Min => self.visit_extremum(out, node, "min", std::cmp::Ordering::Less)?,
            Op::Range => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match op_range(args[0].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "range", kind)?,
                }
            }
            Op::Replace => {
                let args = self.get_arguments(out, node, 0, 3)?;
                match op_replace(
                    args[0].as_json(),
                    args[1].as_json(),
                    args[2].as_json(),
                ) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "replace", kind)?,
                }
            }
            Op::Round => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_round(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "round", kind)?,
                }
            }
            Op::Sort => {
                let args = self.get_arguments(out, node, 0, 1)?;
                match args[0].as_json().as_array() {
                    Some(arr) => {
                        // always a new copy, the input is never mutated
                        let mut sorted = arr.clone();
                        sorted.sort_by(|a, b| value_cmp(a, b));
                        self.push_result(Json::Array(sorted));
                    }
                    None => self.op_failed(
                        node,
                        "sort",
                        bad("sort", "expected an array argument"),
                    )?,
                }
            }
            Op::Join => {
                let args = self.get_arguments(out, node, 0, 2)?;
                match op_join(args[0].as_json(), args[1].as_json()) {
                    Ok(v) => self.push_result(v),
                    Err(kind) => self.op_failed(node, "join", kind)?,
                }
            }
            Op::IsArray => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = args[0].as_json().is_array();
                self.push_result(Json::Bool(v));
            }
            Op::IsBoolean => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = args[0].as_json().is_boolean();
                self.push_result(Json::Bool(v));
            }
            Op::IsFloat => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = args[0].as_json().is_f64();
                self.push_result(Json::Bool(v));
            }
            Op::IsInteger => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let j = args[0].as_json();
                let v = j.is_i64() || j.is_u64();
                self.push_result(Json::Bool(v));
            }
            Op::IsNumber => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = args[0].as_json().is_number();
                self.push_result(Json::Bool(v));
            }
            Op::IsObject => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = args[0].as_json().is_object();
                self.push_result(Json::Bool(v));
            }
            Op::IsString => {
                let args = self.get_arguments(out, node, 0, 1)?;
                let v = args[0].as_json().is_string();
                self.push_result(Json::Bool(v));
            }
            Op::Callback => self.visit_callback(out, node)?,
            Op::Super => self.visit_super(out, node)?,
            Op::None => {
                if self.config.graceful_errors {
                    self.push_unresolved(&node.name, node.pos);
                }
                // strict mode leaves the stack short; the enclosing
                // expression list reports it
            }
        }
        Ok(())
    }

    fn visit_at(&mut self, out: &mut dyn Output, node: &'r FunctionNode) -> Result<(), RenderError> {
        let args = self.get_arguments(out, node, 0, 2)?;
        let key = args[1].as_json().clone();
        match args[0].as_json() {
            Json::Object(_) => match key.as_str() {
                Some(k) => match args[0].project(|j| j.get(k)) {
                    Some(value) => self.eval_stack.push(Some(value)),
                    Option::None => self.op_failed(
                        node,
                        k,
                        RenderErrorKind::MemberNotFound { name: k.to_string() },
                    )?,
                },
                Option::None => self.op_failed(
                    node,
                    "at",
                    bad("at", "object key must be a string"),
                )?,
            },
            Json::Array(arr) => match key.as_i64() {
                Some(index) if index >= 0 && (index as usize) < arr.len() => {
                    let i = index as usize;
                    match args[0].project(|j| j.get(i)) {
                        Some(value) => self.eval_stack.push(Some(value)),
                        Option::None => self.op_failed(
                            node,
                            "at",
                            bad("at", "index projection failed"),
                        )?,
                    }
                }
                Some(index) => {
                    let name = format!("index[{}]", index);
                    let size = arr.len();
                    self.op_failed(
                        node,
                        &name,
                        RenderErrorKind::IndexOutOfRange { index, size },
                    )?;
                }
                Option::None => self.op_failed(
                    node,
                    "at",
                    bad("at", "array index must be an integer"),
                )?,
            },
            _ => self.op_failed(
                node,
                "at",
                RenderErrorKind::TypeMismatch(
                    "cannot access element on non-container type".to_string(),
                ),
            )?,
        }
        Ok(())
    }

    /// Dynamic member access: the second argument is read as a *name*
    /// through the not-found machinery rather than as a value.
    fn visit_at_id(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
    ) -> Result<(), RenderError> {
        if node.arguments.len() < 2 {
            return self.op_failed(
                node,
                "at_id",
                bad("at_id", "needs 2 arguments"),
            );
        }
        let mut first = self.eval_args(out, node, 0, 1)?;
        let container = match first.pop() {
            Some(Arg::Value(value)) => Some(value),
            _ => Option::None,
        };

        self.visit_expression(out, &node.arguments[1])?;
        let slot = self.eval_stack.pop();
        let not_found = match slot {
            Some(Option::None) => self.not_found_stack.pop(),
            _ => Option::None,
        };

        match not_found {
            Option::None => self.op_failed(
                node,
                "at_id",
                bad("at_id", "could not find element with given name"),
            ),
            Some(not_found) => {
                let name = not_found.name;
                let projected = container.as_ref().and_then(|c| {
                    if c.as_json().is_object() {
                        c.project(|j| j.get(name.as_str()))
                    } else {
                        Option::None
                    }
                });
                match projected {
                    Some(value) => {
                        self.eval_stack.push(Some(value));
                        Ok(())
                    }
                    Option::None => self.op_failed(
                        node,
                        &name,
                        RenderErrorKind::MemberNotFound { name: name.clone() },
                    ),
                }
            }
        }
    }

    fn visit_element<F>(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
        op: &str,
        pick: F,
    ) -> Result<(), RenderError>
    where
        F: for<'x> Fn(&'x Vec<Json>) -> Option<&'x Json>,
    {
        let args = self.get_arguments(out, node, 0, 1)?;
        match args[0].as_json() {
            Json::Array(arr) if arr.is_empty() => self.op_failed(
                node,
                op,
                RenderErrorKind::EmptyArray { op: op.to_string() },
            ),
            Json::Array(_) => {
                match args[0].project(|j| j.as_array().and_then(|a| pick(a))) {
                    Some(value) => {
                        self.eval_stack.push(Some(value));
                        Ok(())
                    }
                    Option::None => {
                        self.op_failed(node, op, bad(op, "element projection failed"))
                    }
                }
            }
            _ => self.op_failed(node, op, bad(op, "expected an array argument")),
        }
    }

    fn visit_extremum(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
        op: &str,
        wanted: std::cmp::Ordering,
    ) -> Result<(), RenderError> {
        let args = self.get_arguments(out, node, 0, 1)?;
        let index = match args[0].as_json().as_array() {
            Some(arr) if arr.is_empty() => {
                return self.op_failed(
                    node,
                    op,
                    RenderErrorKind::EmptyArray { op: op.to_string() },
                );
            }
            Some(arr) => {
                let mut best = 0;
                for (i, item) in arr.iter().enumerate().skip(1) {
                    if value_cmp(item, &arr[best]) == wanted {
                        best = i;
                    }
                }
                best
            }
            Option::None => {
                return self.op_failed(node, op, bad(op, "expected an array argument"));
            }
        };
        match args[0].project(|j| j.get(index)) {
            Some(value) => {
                self.eval_stack.push(Some(value));
                Ok(())
            }
            Option::None => self.op_failed(node, op, bad(op, "element projection failed")),
        }
    }

    fn visit_callback(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
    ) -> Result<(), RenderError> {
        let callback = match &node.callback {
            Some(cb) => cb,
            Option::None => {
                let name = node.name.clone();
                return self.op_failed(
                    node,
                    &name,
                    RenderErrorKind::FunctionNotFound { name: name.clone() },
                );
            }
        };

        let args = self.get_argument_vector(out, node)?;
        let refs: Vec<&Json> = args.iter().map(|a| a.as_json()).collect();
        match self.call_callback(&node.name, callback, &refs, node.pos) {
            Ok(value) => {
                self.push_result(value);
                Ok(())
            }
            Err(e) => {
                if self.config.graceful_errors {
                    let name = node.name.clone();
                    self.push_unresolved(&name, node.pos);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// `super([level])`: re-render the current block as defined `level`
    /// templates up the inheritance stack.
    fn visit_super(
        &mut self,
        out: &mut dyn Output,
        node: &'r FunctionNode,
    ) -> Result<(), RenderError> {
        let args = self.get_argument_vector(out, node)?;
        let level_diff = match args.first() {
            Some(v) => match v.as_json().as_i64() {
                Some(n) => n,
                Option::None => {
                    return self.op_failed(
                        node,
                        "super",
                        RenderErrorKind::SuperMisuse(
                            "super() level must be an integer".to_string(),
                        ),
                    );
                }
            },
            Option::None => 1,
        };

        if self.block_stack.is_empty() {
            return self.op_failed(
                node,
                "super",
                RenderErrorKind::SuperMisuse("super() call is not within a block".to_string()),
            );
        }

        let level = self.current_level as i64 + level_diff;
        let max_level = self.template_stack.len() as i64 - 1;
        if level < 1 || level > max_level {
            return self.op_failed(
                node,
                "super",
                RenderErrorKind::SuperMisuse(format!(
                    "level of super() call does not match parent templates (between 1 and {})",
                    max_level
                )),
            );
        }

        let block_name = match self.block_stack.last() {
            Some(name) => name.clone(),
            Option::None => {
                return self.op_failed(
                    node,
                    "super",
                    RenderErrorKind::SuperMisuse("super() call is not within a block".to_string()),
                );
            }
        };

        let parent: &'r Template = self.template_stack[level as usize];
        let block = match parent.blocks.get(&block_name) {
            Some(bs) => &**bs,
            Option::None => {
                return self.op_failed(
                    node,
                    "super",
                    RenderErrorKind::SuperMisuse(format!(
                        "could not find block with name '{}'",
                        block_name
                    )),
                );
            }
        };

        let old_level = self.current_level;
        let old_template = self.current_template;
        self.current_template = parent;
        self.current_level = level as usize;
        let result = self.visit_block(out, &block.block);
        self.current_level = old_level;
        self.current_template = old_template;
        result?;

        // the expression value of super() is null
        self.eval_stack.push(Some(EvalValue::null()));
        Ok(())
    }

    // ---- control flow ----------------------------------------------------

    fn visit_if(&mut self, out: &mut dyn Output, node: &'r IfNode) -> Result<(), RenderError> {
        let condition = self.eval_expression_list(out, &node.condition)?;
        let is_true = condition
            .as_ref()
            .map(|v| truthy(v.as_json()))
            .unwrap_or(false);
        if is_true {
            self.visit_block(out, &node.true_branch)
        } else if let Some(false_branch) = &node.false_branch {
            self.visit_block(out, false_branch)
        } else {
            Ok(())
        }
    }

    fn visit_for_array(
        &mut self,
        out: &mut dyn Output,
        node: &'r ForArrayNode,
    ) -> Result<(), RenderError> {
        let result = match self.eval_expression_list(out, &node.condition)? {
            Some(v) => v,
            Option::None => return Ok(()), // graceful mode skips the loop
        };
        let arr = match result.as_json().as_array() {
            Some(a) => a,
            Option::None => {
                return self.report(
                    RenderErrorKind::TypeMismatch("object must be an array".to_string()),
                    node.pos,
                    String::new(),
                );
            }
        };

        self.emit(
            InstrumentationData::new(InstrumentationEvent::ForLoopStart)
                .with_name(&node.value)
                .with_detail("array")
                .with_count(arr.len()),
        );

        self.loop_enter();
        let size = arr.len();
        self.loop_init(size);
        let mut index = 0usize;
        for item in arr {
            self.set_local(&node.value, item.clone());
            self.loop_iteration(index, size);
            self.visit_block(out, &node.body)?;
            index += 1;
        }
        self.remove_local(&node.value);
        self.loop_exit();

        self.emit(
            InstrumentationData::new(InstrumentationEvent::ForLoopEnd)
                .with_name(&node.value)
                .with_detail("array")
                .with_count(index),
        );
        Ok(())
    }

    fn visit_for_object(
        &mut self,
        out: &mut dyn Output,
        node: &'r ForObjectNode,
    ) -> Result<(), RenderError> {
        let result = match self.eval_expression_list(out, &node.condition)? {
            Some(v) => v,
            Option::None => return Ok(()), // graceful mode skips the loop
        };
        let object = match result.as_json().as_object() {
            Some(o) => o,
            Option::None => {
                return self.report(
                    RenderErrorKind::TypeMismatch("object must be an object".to_string()),
                    node.pos,
                    String::new(),
                );
            }
        };

        self.emit(
            InstrumentationData::new(InstrumentationEvent::ForLoopStart)
                .with_name(&node.value)
                .with_detail("object")
                .with_count(object.len()),
        );

        self.loop_enter();
        let size = object.len();
        self.loop_init(size);
        let mut index = 0usize;
        for (key, item) in object {
            self.set_local(&node.key, Json::String(key.clone()));
            self.set_local(&node.value, item.clone());
            self.loop_iteration(index, size);
            self.visit_block(out, &node.body)?;
            index += 1;
        }
        self.remove_local(&node.key);
        self.remove_local(&node.value);
        self.loop_exit();

        self.emit(
            InstrumentationData::new(InstrumentationEvent::ForLoopEnd)
                .with_name(&node.value)
                .with_detail("object")
                .with_count(index),
        );
        Ok(())
    }

    fn visit_include(
        &mut self,
        out: &mut dyn Output,
        name: &str,
        pos: usize,
    ) -> Result<(), RenderError> {
        self.emit(InstrumentationData::new(InstrumentationEvent::IncludeStart).with_name(name));

        match self.templates.get(name) {
            Some(template) => {
                debug!("including template {:?}", name);
                let template: &'r Template = template;
                let mut sub = Renderer::new(
                    self.config,
                    self.templates,
                    self.functions,
                    template,
                    self.data_input,
                )
                .with_locals(self.additional_data.clone());
                let result = sub.render_to(out);
                self.render_errors.append(&mut sub.render_errors);
                result?;
                self.emit(
                    InstrumentationData::new(InstrumentationEvent::IncludeEnd)
                        .with_name(name)
                        .with_detail("success"),
                );
            }
            Option::None if self.config.throw_at_missing_includes => {
                self.emit(
                    InstrumentationData::new(InstrumentationEvent::IncludeEnd)
                        .with_name(name)
                        .with_detail("not_found"),
                );
                self.report(
                    RenderErrorKind::MissingInclude {
                        name: name.to_string(),
                    },
                    pos,
                    String::new(),
                )?;
            }
            Option::None => {
                self.emit(
                    InstrumentationData::new(InstrumentationEvent::IncludeEnd)
                        .with_name(name)
                        .with_detail("not_found_ignored"),
                );
            }
        }
        Ok(())
    }

    fn visit_extends(
        &mut self,
        out: &mut dyn Output,
        name: &str,
        pos: usize,
    ) -> Result<(), RenderError> {
        match self.templates.get(name) {
            Some(parent) => {
                let parent: &'r Template = parent;
                self.render_template(out, parent)?;
                // the rest of the child template is suppressed
                self.break_rendering = true;
            }
            Option::None if self.config.throw_at_missing_includes => {
                self.report(
                    RenderErrorKind::MissingExtends {
                        name: name.to_string(),
                    },
                    pos,
                    String::new(),
                )?;
            }
            Option::None => {}
        }
        Ok(())
    }

    /// Block bodies always resolve against the most-derived template in
    /// the inheritance stack, so child overrides win.
    fn visit_block_statement(
        &mut self,
        out: &mut dyn Output,
        node: &'r std::sync::Arc<BlockStatementNode>,
    ) -> Result<(), RenderError> {
        let old_level = self.current_level;
        let old_template = self.current_template;

        let root_template = self.template_stack.first().copied().unwrap_or(old_template);
        self.current_level = 0;
        self.current_template = root_template;

        let mut result = Ok(());
        if let Some(bs) = root_template.blocks.get(&node.name) {
            let bs: &'r BlockStatementNode = bs;
            self.block_stack.push(node.name.clone());
            result = self.visit_block(out, &bs.block);
            self.block_stack.pop();
        }

        self.current_level = old_level;
        self.current_template = self
            .template_stack
            .last()
            .copied()
            .unwrap_or(old_template);
        result
    }

    // ---- set and the in-place optimization -------------------------------

    fn visit_set(&mut self, out: &mut dyn Output, node: &'r SetNode) -> Result<(), RenderError> {
        self.emit(
            InstrumentationData::new(InstrumentationEvent::SetStatementStart).with_name(&node.key),
        );

        if self.try_inplace_self_assignment(out, node)? {
            self.emit(
                InstrumentationData::new(InstrumentationEvent::SetStatementEnd)
                    .with_name(&node.key)
                    .with_detail("inplace"),
            );
            return Ok(());
        }

        match self.eval_expression_list(out, &node.expression) {
            Ok(Some(value)) => {
                set_pointer(&mut self.additional_data, &node.pointer, value.into_owned());
                self.emit(
                    InstrumentationData::new(InstrumentationEvent::SetStatementEnd)
                        .with_name(&node.key)
                        .with_detail("copy"),
                );
                Ok(())
            }
            Ok(Option::None) => {
                // graceful mode, the expression failed
                set_pointer(&mut self.additional_data, &node.pointer, Json::Null);
                self.emit(
                    InstrumentationData::new(InstrumentationEvent::SetStatementEnd)
                        .with_name(&node.key)
                        .with_detail("null_graceful"),
                );
                Ok(())
            }
            Err(e) => {
                if self.config.graceful_errors {
                    set_pointer(&mut self.additional_data, &node.pointer, Json::Null);
                    self.emit(
                        InstrumentationData::new(InstrumentationEvent::SetStatementEnd)
                            .with_name(&node.key)
                            .with_detail("exception_graceful"),
                    );
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Detects `{% set x = f(x, ...) %}` where `f` has an in-place
    /// variant and `x` is already bound in the locals, and mutates the
    /// binding directly instead of computing a copy.
    fn try_inplace_self_assignment(
        &mut self,
        out: &mut dyn Output,
        node: &'r SetNode,
    ) -> Result<bool, RenderError> {
        let func = match &node.expression.root {
            Some(Expression::Function(f)) if f.operation == Operation::Callback => f,
            _ => return Ok(false),
        };
        if func.arguments.is_empty() {
            return Ok(false);
        }
        match &func.arguments[0] {
            Expression::Data(d) if d.name == node.key => {}
            _ => return Ok(false),
        }

        let entry = self.functions.find(&func.name, func.arguments.len() as i32);
        let inplace = match entry.and_then(|e| {
            if e.operation == Operation::Callback {
                e.inplace_callback
            } else {
                Option::None
            }
        }) {
            Some(cb) => cb,
            Option::None => {
                self.emit(
                    InstrumentationData::new(InstrumentationEvent::InplaceOptSkipped)
                        .with_name(&node.key)
                        .with_detail(&format!("no_inplace_cb:{}", func.name)),
                );
                return Ok(false);
            }
        };

        if self.additional_data.pointer(&node.pointer).is_none() {
            self.emit(
                InstrumentationData::new(InstrumentationEvent::InplaceOptSkipped)
                    .with_name(&node.key)
                    .with_detail(&format!("var_not_exists:{}", func.name)),
            );
            return Ok(false);
        }

        // evaluate the remaining arguments before borrowing the target;
        // they may read the target's current value
        let mut remaining: Vec<EvalValue<'r>> = Vec::with_capacity(func.arguments.len() - 1);
        for argument in &func.arguments[1..] {
            self.visit_expression(out, argument)?;
            match self.eval_stack.pop() {
                Some(Some(value)) => remaining.push(value),
                Some(Option::None) => {
                    self.not_found_stack.pop();
                    return Ok(false);
                }
                Option::None => return Ok(false),
            }
        }

        let pre_size = self
            .additional_data
            .pointer(&node.pointer)
            .and_then(|t| t.as_array().map(|a| a.len()))
            .unwrap_or(0);
        let wrapper = self.config.callback_wrapper.clone();
        let name = func.name.clone();
        let pos = func.pos;
        let template_source = &self.current_template.source;
        let template_name = self.current_template.name.clone();

        let target = match self.additional_data.pointer_mut(&node.pointer) {
            Some(t) => t,
            Option::None => return Ok(false),
        };

        let call_result: Result<(), RenderError> = match wrapper {
            Some(wrapper) => {
                // the wrapper sees an O(1) size summary instead of the
                // target, and the thunk returns the post-mutation summary
                let summary = json!({ "_inplace": true, "size": pre_size });
                let mut wrapper_args: Vec<&Json> = Vec::with_capacity(remaining.len() + 1);
                wrapper_args.push(&summary);
                for value in &remaining {
                    wrapper_args.push(value.as_json());
                }
                let inplace_ref = &inplace;
                let remaining_ref = &remaining;
                wrapper(
                    &name,
                    &wrapper_args,
                    Box::new(move || {
                        let refs: Vec<&Json> =
                            remaining_ref.iter().map(|v| v.as_json()).collect();
                        inplace_ref(target, &refs)?;
                        let size = target.as_array().map(|a| a.len()).unwrap_or(0);
                        Ok(json!({ "_inplace": true, "size": size }))
                    }),
                )
                .map(|_| ())
            }
            Option::None => {
                let refs: Vec<&Json> = remaining.iter().map(|v| v.as_json()).collect();
                inplace(target, &refs)
            }
        };

        call_result.map_err(|mut e| {
            if e.line_no.is_none() {
                let (line_no, column_no) = source_location(template_source, pos);
                e = e.at(line_no, column_no).in_template(template_name.clone());
            }
            e
        })?;

        let size = self
            .additional_data
            .pointer(&node.pointer)
            .and_then(|t| t.as_array().map(|a| a.len()))
            .unwrap_or(0);
        self.emit(
            InstrumentationData::new(InstrumentationEvent::InplaceOptUsed)
                .with_name(&node.key)
                .with_detail(&name)
                .with_count(size),
        );
        Ok(true)
    }

    // ---- loop metadata ---------------------------------------------------

    fn locals_object(&mut self) -> &mut Map<String, Json> {
        if !self.additional_data.is_object() {
            self.additional_data = Json::Object(Map::new());
        }
        match self.additional_data {
            Json::Object(ref mut map) => map,
            _ => unreachable!("locals is always an object"),
        }
    }

    fn set_local(&mut self, name: &str, value: Json) {
        self.locals_object().insert(name.to_string(), value);
    }

    fn remove_local(&mut self, name: &str) {
        self.locals_object().remove(name);
    }

    /// On loop entry the current `loop` object moves under
    /// `loop.parent`, building the chain nested loops observe.
    fn loop_enter(&mut self) {
        let locals = self.locals_object();
        let current = locals.get("loop").cloned();
        let mut fresh = Map::new();
        if let Some(Json::Object(old)) = current {
            if !old.is_empty() {
                fresh.insert("parent".to_string(), Json::Object(old));
            }
        }
        locals.insert("loop".to_string(), Json::Object(fresh));
    }

    fn loop_object(&mut self) -> &mut Map<String, Json> {
        let locals = self.locals_object();
        let entry = locals
            .entry("loop".to_string())
            .or_insert_with(|| Json::Object(Map::new()));
        if !entry.is_object() {
            *entry = Json::Object(Map::new());
        }
        match entry {
            Json::Object(map) => map,
            _ => unreachable!("loop is always an object"),
        }
    }

    fn loop_init(&mut self, size: usize) {
        let loop_obj = self.loop_object();
        loop_obj.insert("is_first".to_string(), Json::Bool(true));
        loop_obj.insert("is_last".to_string(), Json::Bool(size <= 1));
    }

    fn loop_iteration(&mut self, index: usize, size: usize) {
        let loop_obj = self.loop_object();
        loop_obj.insert("index".to_string(), Json::from(index as i64));
        loop_obj.insert("index1".to_string(), Json::from(index as i64 + 1));
        if index == 1 {
            loop_obj.insert("is_first".to_string(), Json::Bool(false));
        }
        if index + 1 == size {
            loop_obj.insert("is_last".to_string(), Json::Bool(true));
        }
    }

    /// On loop exit the parent is hoisted back up, or the metadata is
    /// removed entirely when the outermost loop ends.
    fn loop_exit(&mut self) {
        let locals = self.locals_object();
        let parent = locals
            .get("loop")
            .and_then(|l| l.get("parent"))
            .cloned();
        match parent {
            Some(Json::Object(p)) if !p.is_empty() => {
                locals.insert("loop".to_string(), Json::Object(p));
            }
            _ => {
                locals.remove("loop");
            }
        }
    }
}

// ---- operation helpers -----------------------------------------------

fn bad(op: &str, detail: &str) -> RenderErrorKind {
    RenderErrorKind::BadOperationInput {
        op: op.to_string(),
        detail: detail.to_string(),
    }
}

fn str_arg<'x>(value: &'x Json, op: &str) -> Result<&'x str, RenderErrorKind> {
    value.as_str().ok_or_else(|| bad(op, "expected a string argument"))
}

fn int_arg(value: &Json, op: &str) -> Result<i64, RenderErrorKind> {
    value
        .as_i64()
        .ok_or_else(|| bad(op, "expected an integer argument"))
}

fn float_args(a: &Json, b: &Json, op: &str) -> Result<(f64, f64), RenderErrorKind> {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(bad(op, "expected numeric arguments")),
    }
}

fn op_in(needle: &Json, haystack: &Json) -> Result<Json, RenderErrorKind> {
    match haystack {
        Json::Array(items) => Ok(Json::Bool(items.iter().any(|i| value_eq(i, needle)))),
        Json::Object(map) => Ok(Json::Bool(map.values().any(|i| value_eq(i, needle)))),
        _ => Err(bad("in", "expected an array or object on the right side")),
    }
}

fn op_add(a: &Json, b: &Json) -> Result<Json, RenderErrorKind> {
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        let mut s = String::with_capacity(x.len() + y.len());
        s.push_str(x);
        s.push_str(y);
        return Ok(Json::String(s));
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x
            .checked_add(y)
            .map(Json::from)
            .ok_or_else(|| bad("add", "integer overflow"));
    }
    let (x, y) = float_args(a, b, "add")?;
    Ok(Json::from(x + y))
}

fn op_subtract(a: &Json, b: &Json) -> Result<Json, RenderErrorKind> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x
            .checked_sub(y)
            .map(Json::from)
            .ok_or_else(|| bad("subtract", "integer overflow"));
    }
    let (x, y) = float_args(a, b, "subtract")?;
    Ok(Json::from(x - y))
}

fn op_multiply(a: &Json, b: &Json) -> Result<Json, RenderErrorKind> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x
            .checked_mul(y)
            .map(Json::from)
            .ok_or_else(|| bad("multiply", "integer overflow"));
    }
    let (x, y) = float_args(a, b, "multiply")?;
    Ok(Json::from(x * y))
}

fn op_divide(a: &Json, b: &Json) -> Result<Json, RenderErrorKind> {
    let (x, y) = float_args(a, b, "division")?;
    if y == 0.0 {
        return Err(RenderErrorKind::DivisionByZero);
    }
    Ok(Json::from(x / y))
}

fn op_power(a: &Json, b: &Json) -> Result<Json, RenderErrorKind> {
    if let (Some(base), Some(exp)) = (a.as_i64(), b.as_i64()) {
        if exp >= 0 {
            let exp = u32::try_from(exp).map_err(|_| bad("power", "exponent too large"))?;
            return base
                .checked_pow(exp)
                .map(Json::from)
                .ok_or_else(|| bad("power", "integer overflow"));
        }
    }
    let (x, y) = float_args(a, b, "power")?;
    Ok(Json::from(x.powf(y)))
}

fn op_modulo(a: &Json, b: &Json) -> Result<Json, RenderErrorKind> {
    let x = int_arg(a, "modulo")?;
    let y = int_arg(b, "modulo")?;
    if y == 0 {
        return Err(bad("modulo", "modulo by zero"));
    }
    Ok(Json::from(x % y))
}

fn op_capitalize(value: &Json) -> Result<Json, RenderErrorKind> {
    let s = str_arg(value, "capitalize")?;
    let mut chars = s.chars();
    let result = match chars.next() {
        Some(first) => {
            let mut r: String = first.to_uppercase().collect();
            r.push_str(&chars.as_str().to_lowercase());
            r
        }
        None => String::new(),
    };
    Ok(Json::String(result))
}

fn op_divisible_by(a: &Json, b: &Json) -> Result<Json, RenderErrorKind> {
    let x = int_arg(a, "divisibleBy")?;
    let divisor = int_arg(b, "divisibleBy")?;
    Ok(Json::Bool(divisor != 0 && x % divisor == 0))
}

fn op_exists_in(container: &Json, name: &Json) -> Result<Json, RenderErrorKind> {
    let key = str_arg(name, "existsIn")?;
    match container {
        Json::Object(map) => Ok(Json::Bool(map.contains_key(key))),
        _ => Err(bad("existsIn", "expected an object argument")),
    }
}

fn op_float(value: &Json) -> Result<Json, RenderErrorKind> {
    let s = str_arg(value, "float")?;
    s.trim()
        .parse::<f64>()
        .map(Json::from)
        .map_err(|_| bad("float", "string is not a number"))
}

fn op_int(value: &Json) -> Result<Json, RenderErrorKind> {
    let s = str_arg(value, "int")?;
    s.trim()
        .parse::<i64>()
        .map(Json::from)
        .map_err(|_| bad("int", "string is not an integer"))
}

/// String length is byte length; containers count elements; null counts
/// zero and any other scalar one, mirroring the canonical value library.
fn op_length(value: &Json) -> Json {
    let n = match value {
        Json::Null => 0,
        Json::String(s) => s.len(),
        Json::Array(a) => a.len(),
        Json::Object(o) => o.len(),
        _ => 1,
    };
    Json::from(n as i64)
}

fn op_range(value: &Json) -> Result<Json, RenderErrorKind> {
    let n = int_arg(value, "range")?;
    if n < 0 {
        return Err(bad("range", "negative length"));
    }
    Ok(Json::Array((0..n).map(Json::from).collect()))
}

fn op_replace(value: &Json, from: &Json, to: &Json) -> Result<Json, RenderErrorKind> {
    let s = str_arg(value, "replace")?;
    let from = str_arg(from, "replace")?;
    let to = str_arg(to, "replace")?;
    if from.is_empty() {
        return Ok(Json::String(s.to_string()));
    }
    Ok(Json::String(s.replace(from, to)))
}

fn op_round(value: &Json, precision: &Json) -> Result<Json, RenderErrorKind> {
    let x = value.as_f64().ok_or_else(|| bad("round", "expected a number"))?;
    let p = int_arg(precision, "round")?;
    let factor = 10f64.powi(p as i32);
    let rounded = (x * factor).round() / factor;
    if p == 0 {
        Ok(Json::from(rounded as i64))
    } else {
        Ok(Json::from(rounded))
    }
}

fn op_join(array: &Json, separator: &Json) -> Result<Json, RenderErrorKind> {
    let items = array
        .as_array()
        .ok_or_else(|| bad("join", "expected an array argument"))?;
    let sep = str_arg(separator, "join")?;
    let mut result = String::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            result.push_str(sep);
        }
        match item {
            Json::String(s) => result.push_str(s),
            other => result.push_str(&other.to_string()),
        }
    }
    Ok(Json::String(result))
}
