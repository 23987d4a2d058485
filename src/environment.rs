use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::debug;
use serde_json::value::Value as Json;

use crate::cache::{CachePredicate, CallbackCache, CallbackCacheConfig};
use crate::config::{
    CallbackWrapper, IncludeCallback, InstrumentationCallback, InstrumentationData, LexerConfig,
    ParserConfig, RenderConfig,
};
use crate::error::{Error, FileError, ParseError, RenderError, RenderErrorInfo};
use crate::output::{Output, StringOutput, WriteOutput};
use crate::parser::{parse_template, ParserContext};
use crate::registry::FunctionRegistry;
use crate::render::Renderer;
use crate::template::{Template, TemplateStore};

thread_local! {
    // per-thread error list: each rendering thread sees its own errors
    static RENDER_ERRORS: RefCell<Vec<RenderErrorInfo>> = RefCell::new(Vec::new());
    // templates discovered while parsing, merged into the store on success
    static PARSE_BUFFER: RefCell<TemplateStore> = RefCell::new(TemplateStore::new());
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Render-path state kept under one lock so the cache handle and the
/// wrapper it installs stay coherent.
struct RenderState {
    config: RenderConfig,
    cache: Option<Arc<CallbackCache>>,
}

/// The façade binding configuration, function registry, template store
/// and the optional callback cache.
///
/// Registry and store are published copy-on-write: a render clones the
/// current `Arc` snapshots at start and is unaffected by later
/// registrations. Lexer and parser configuration is set up front with
/// `&mut self`; everything on the render path is `&self` and safe to
/// call while other threads render.
pub struct Environment {
    functions: RwLock<Arc<FunctionRegistry>>,
    templates: RwLock<Arc<TemplateStore>>,
    render_state: RwLock<RenderState>,
    lexer_config: LexerConfig,
    parser_config: ParserConfig,
    output_path: PathBuf,
}

impl Default for Environment {
    fn default() -> Environment {
        Environment::new()
    }
}

impl Environment {
    pub fn new() -> Environment {
        Environment {
            functions: RwLock::new(Arc::new(FunctionRegistry::new())),
            templates: RwLock::new(Arc::new(TemplateStore::new())),
            render_state: RwLock::new(RenderState {
                config: RenderConfig::default(),
                cache: None,
            }),
            lexer_config: LexerConfig::default(),
            parser_config: ParserConfig::default(),
            output_path: PathBuf::new(),
        }
    }

    /// An environment reading templates from and writing output to
    /// `path`.
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Environment {
        let path = path.into();
        Environment::with_paths(path.clone(), path)
    }

    pub fn with_paths<P: Into<PathBuf>>(input_path: P, output_path: P) -> Environment {
        let mut env = Environment::new();
        env.parser_config.input_path = input_path.into();
        env.output_path = output_path.into();
        env
    }

    // ---- lexer and parser configuration ---------------------------------

    /// Sets the opener and closer for template statements.
    pub fn set_statement(&mut self, open: &str, close: &str) {
        self.lexer_config.statement_open = open.to_string();
        self.lexer_config.statement_close = close.to_string();
    }

    /// Sets the opener for template line statements.
    pub fn set_line_statement(&mut self, open: &str) {
        self.lexer_config.line_statement = open.to_string();
    }

    /// Sets the opener and closer for template expressions.
    pub fn set_expression(&mut self, open: &str, close: &str) {
        self.lexer_config.expression_open = open.to_string();
        self.lexer_config.expression_close = close.to_string();
    }

    /// Sets the opener and closer for template comments.
    pub fn set_comment(&mut self, open: &str, close: &str) {
        self.lexer_config.comment_open = open.to_string();
        self.lexer_config.comment_close = close.to_string();
    }

    /// Removes the first newline after a statement or comment block.
    pub fn set_trim_blocks(&mut self, trim_blocks: bool) {
        self.lexer_config.trim_blocks = trim_blocks;
    }

    /// Strips spaces and tabs from the start of a line to a statement.
    pub fn set_lstrip_blocks(&mut self, lstrip_blocks: bool) {
        self.lexer_config.lstrip_blocks = lstrip_blocks;
    }

    /// Resolves unknown include names against the input path.
    pub fn set_search_included_templates_in_files(&mut self, search_in_files: bool) {
        self.parser_config.search_included_templates_in_files = search_in_files;
    }

    /// Called when an included template is found neither in the store
    /// nor on disk; returns the template source to parse.
    pub fn set_include_callback(&mut self, callback: IncludeCallback) {
        self.parser_config.include_callback = Some(callback);
    }

    /// Graceful mode: missing variables and failing operations render as
    /// the original template text and are recorded per thread instead of
    /// aborting the render.
    pub fn set_graceful_errors(&mut self, graceful: bool) {
        self.parser_config.graceful_errors = graceful;
        write_lock(&self.render_state).config.graceful_errors = graceful;
    }

    // ---- render configuration -------------------------------------------

    pub fn set_throw_at_missing_includes(&self, will_throw: bool) {
        write_lock(&self.render_state).config.throw_at_missing_includes = will_throw;
    }

    pub fn set_html_autoescape(&self, will_escape: bool) {
        write_lock(&self.render_state).config.html_autoescape = will_escape;
    }

    /// Interposes `wrapper` on every user-callback invocation. This is
    /// also the hook the callback cache installs itself through, so
    /// setting a wrapper replaces an enabled cache's wrapper.
    pub fn set_callback_wrapper(&self, wrapper: CallbackWrapper) {
        write_lock(&self.render_state).config.callback_wrapper = Some(wrapper);
    }

    pub fn clear_callback_wrapper(&self) {
        write_lock(&self.render_state).config.callback_wrapper = None;
    }

    /// Receives renderer events (set statements, loops, includes,
    /// in-place optimizations) synchronously on the render thread.
    pub fn set_instrumentation_callback<F>(&self, callback: F)
    where
        F: Fn(&InstrumentationData) + Send + Sync + 'static,
    {
        let callback: InstrumentationCallback = Arc::new(callback);
        write_lock(&self.render_state).config.instrumentation_callback = Some(callback);
    }

    pub fn clear_instrumentation_callback(&self) {
        write_lock(&self.render_state).config.instrumentation_callback = None;
    }

    // ---- callback cache --------------------------------------------------

    /// Enables callback caching; results are memoised by function name
    /// and arguments until their TTL runs out.
    pub fn enable_callback_cache(&self, config: CallbackCacheConfig) {
        let cache = Arc::new(CallbackCache::new(config));
        let mut state = write_lock(&self.render_state);
        state.config.callback_wrapper = Some(cache.caching_wrapper());
        state.cache = Some(cache);
    }

    /// Enables caching restricted to callbacks the predicate accepts.
    pub fn enable_callback_cache_with_predicate(
        &self,
        config: CallbackCacheConfig,
        predicate: CachePredicate,
    ) {
        let cache = Arc::new(CallbackCache::new(config));
        cache.set_cache_predicate(predicate);
        let mut state = write_lock(&self.render_state);
        state.config.callback_wrapper = Some(cache.caching_wrapper());
        state.cache = Some(cache);
    }

    /// Enables caching chained over another wrapper; the inner wrapper
    /// runs on cache misses only.
    pub fn enable_callback_cache_with_wrapper(
        &self,
        config: CallbackCacheConfig,
        inner: CallbackWrapper,
        predicate: Option<CachePredicate>,
    ) {
        let cache = Arc::new(CallbackCache::new(config));
        if let Some(predicate) = predicate {
            cache.set_cache_predicate(predicate);
        }
        let mut state = write_lock(&self.render_state);
        state.config.callback_wrapper = Some(cache.caching_wrapper_with_inner(inner));
        state.cache = Some(cache);
    }

    /// Installs an externally owned cache, so several environments can
    /// share one.
    pub fn set_callback_cache(&self, cache: Arc<CallbackCache>) {
        let mut state = write_lock(&self.render_state);
        state.config.callback_wrapper = Some(cache.caching_wrapper());
        state.cache = Some(cache);
    }

    /// Drops the cache and its wrapper. A wrapper installed before
    /// enabling the cache must be re-set by the caller.
    pub fn disable_callback_cache(&self) {
        let mut state = write_lock(&self.render_state);
        state.config.callback_wrapper = None;
        state.cache = None;
    }

    pub fn callback_cache(&self) -> Option<Arc<CallbackCache>> {
        read_lock(&self.render_state).cache.clone()
    }

    pub fn clear_callback_cache(&self) {
        if let Some(cache) = self.callback_cache() {
            cache.clear();
        }
    }

    pub fn invalidate_callback_cache(&self, function_name: &str) -> usize {
        match self.callback_cache() {
            Some(cache) => cache.invalidate(function_name),
            None => 0,
        }
    }

    // ---- callbacks and templates ----------------------------------------

    fn publish_functions<F: FnOnce(&mut FunctionRegistry)>(&self, mutate: F) {
        let mut guard = write_lock(&self.functions);
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    /// Registers a callback under `(name, num_args)`; pass
    /// [`crate::registry::VARIADIC`] to accept any arity. Published
    /// copy-on-write, so renders already in flight keep their snapshot.
    pub fn add_callback<F>(&self, name: &str, num_args: i32, callback: F)
    where
        F: Fn(&[&Json]) -> Result<Json, RenderError> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        self.publish_functions(move |registry| registry.add_callback(name, num_args, callback));
    }

    /// A callback invoked for its side effects; its value is null.
    pub fn add_void_callback<F>(&self, name: &str, num_args: i32, callback: F)
    where
        F: Fn(&[&Json]) -> Result<(), RenderError> + Send + Sync + 'static,
    {
        self.add_callback(name, num_args, move |args| {
            callback(args)?;
            Ok(Json::Null)
        });
    }

    /// Registers a callback together with an in-place variant used for
    /// the `{% set x = f(x, ...) %}` self-assignment optimization.
    pub fn add_callback_with_inplace<F, G>(
        &self,
        name: &str,
        num_args: i32,
        callback: F,
        inplace_callback: G,
    ) where
        F: Fn(&[&Json]) -> Result<Json, RenderError> + Send + Sync + 'static,
        G: Fn(&mut Json, &[&Json]) -> Result<(), RenderError> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let inplace_callback = Arc::new(inplace_callback);
        self.publish_functions(move |registry| {
            registry.add_callback_with_inplace(name, num_args, callback, inplace_callback)
        });
    }

    /// Publishes a preparsed template under `name` for `include` and
    /// `extends` to find.
    pub fn include_template(&self, name: &str, template: Template) {
        let mut template = template;
        template.name = Some(name.to_string());
        let mut guard = write_lock(&self.templates);
        let mut next = (**guard).clone();
        next.insert(name.to_string(), Arc::new(template));
        *guard = Arc::new(next);
    }

    pub fn get_template(&self, name: &str) -> Option<Arc<Template>> {
        read_lock(&self.templates).get(name).cloned()
    }

    // ---- parsing ---------------------------------------------------------

    /// Compiles template source. Templates discovered through
    /// `include`/`extends` land in a per-thread buffer and are merged
    /// into the store only when the whole parse succeeds.
    pub fn parse(&self, source: &str) -> Result<Template, ParseError> {
        self.parse_named(source, None)
    }

    fn parse_named(&self, source: &str, name: Option<&str>) -> Result<Template, ParseError> {
        let functions = read_lock(&self.functions).clone();
        let store = read_lock(&self.templates).clone();

        let result = PARSE_BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();
            let mut ctx = ParserContext {
                parser_config: &self.parser_config,
                functions: &functions,
                store: &store,
                publish_buffer: &mut buffer,
                in_progress: Vec::new(),
            };
            parse_template(&self.lexer_config, &mut ctx, source, name)
        });

        match result {
            Ok(template) => {
                self.merge_parse_buffer();
                Ok(template)
            }
            Err(e) => {
                PARSE_BUFFER.with(|buffer| buffer.borrow_mut().clear());
                Err(e)
            }
        }
    }

    fn merge_parse_buffer(&self) {
        let buffered = PARSE_BUFFER.with(|buffer| std::mem::take(&mut *buffer.borrow_mut()));
        if buffered.is_empty() {
            return;
        }
        debug!("publishing {} templates discovered during parse", buffered.len());
        let mut guard = write_lock(&self.templates);
        let mut next = (**guard).clone();
        for (name, template) in buffered {
            next.entry(name).or_insert(template);
        }
        *guard = Arc::new(next);
    }

    pub fn parse_file(&self, filename: &str) -> Result<Template, Error> {
        let source = self.load_file(filename)?;
        self.parse_named(&source, Some(filename)).map_err(Error::from)
    }

    // ---- rendering -------------------------------------------------------

    pub fn render(&self, source: &str, data: &Json) -> Result<String, Error> {
        let template = self.parse(source)?;
        self.render_template(&template, data).map_err(Error::from)
    }

    pub fn render_template(&self, template: &Template, data: &Json) -> Result<String, RenderError> {
        let mut out = StringOutput::new();
        self.render_to_output(&mut out, template, data)?;
        Ok(out.into_string())
    }

    pub fn render_to<W: Write>(
        &self,
        writer: &mut W,
        template: &Template,
        data: &Json,
    ) -> Result<(), RenderError> {
        let mut out = WriteOutput::new(writer);
        self.render_to_output(&mut out, template, data)
    }

    fn render_to_output(
        &self,
        out: &mut dyn Output,
        template: &Template,
        data: &Json,
    ) -> Result<(), RenderError> {
        RENDER_ERRORS.with(|errors| errors.borrow_mut().clear());

        // pin snapshots for the whole render; the config clone happens
        // under the lock so function-typed fields are never torn
        let templates = read_lock(&self.templates).clone();
        let functions = read_lock(&self.functions).clone();
        let config = read_lock(&self.render_state).config.clone();

        let mut renderer = Renderer::new(&config, &templates, &functions, template, data);
        let result = renderer.render_to(out);
        RENDER_ERRORS.with(|errors| *errors.borrow_mut() = renderer.into_render_errors());
        result
    }

    pub fn render_file(&self, filename: &str, data: &Json) -> Result<String, Error> {
        let template = self.parse_file(filename)?;
        self.render_template(&template, data).map_err(Error::from)
    }

    pub fn render_file_with_data_file(
        &self,
        filename: &str,
        data_filename: &str,
    ) -> Result<String, Error> {
        let data = self.load_json(data_filename)?;
        self.render_file(filename, &data)
    }

    /// Renders a template file and writes the result under the output
    /// path.
    pub fn write(&self, filename: &str, data: &Json, filename_out: &str) -> Result<(), Error> {
        let rendered = self.render_file(filename, data)?;
        let path = self.output_path.join(filename_out);
        fs::write(&path, rendered).map_err(|source| FileError { path, source })?;
        Ok(())
    }

    pub fn write_template(
        &self,
        template: &Template,
        data: &Json,
        filename_out: &str,
    ) -> Result<(), Error> {
        let rendered = self.render_template(template, data)?;
        let path = self.output_path.join(filename_out);
        fs::write(&path, rendered).map_err(|source| FileError { path, source })?;
        Ok(())
    }

    pub fn load_file(&self, filename: &str) -> Result<String, FileError> {
        let path = self.parser_config.input_path.join(filename);
        fs::read_to_string(&path).map_err(|source| FileError { path, source })
    }

    pub fn load_json(&self, filename: &str) -> Result<Json, FileError> {
        let path = self.parser_config.input_path.join(filename);
        let content = fs::read_to_string(&path).map_err(|source| FileError {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| FileError {
            path,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    // ---- per-thread render errors ---------------------------------------

    /// Errors recorded by this thread's last graceful render.
    pub fn last_render_errors(&self) -> Vec<RenderErrorInfo> {
        RENDER_ERRORS.with(|errors| errors.borrow().clone())
    }

    pub fn clear_render_errors(&self) {
        RENDER_ERRORS.with(|errors| errors.borrow_mut().clear());
    }
}

/// Renders `source` against `data` with default settings.
pub fn render(source: &str, data: &Json) -> Result<String, Error> {
    Environment::new().render(source, data)
}

/// Renders `source` against `data` into a writer with default settings.
pub fn render_to<W: Write>(writer: &mut W, source: &str, data: &Json) -> Result<(), Error> {
    let env = Environment::new();
    let template = env.parse(source)?;
    env.render_to(writer, &template, data).map_err(Error::from)
}
