// ABOUTME: Sandboxed template executor built on an isolated rhai engine per execution
// ABOUTME: Runs info() and execute(tpl, params), resolves imports depth-first and maps script errors

use super::capability::{self, Session, TemplateHandle};
use super::helpers::params_to_dynamic;
use super::loader::TemplateLoader;
use crate::error::{EngineError, Result};
use crate::model::TemplateModel;
use crate::params::{self, TemplateInfo};
use envforge_config::EngineSettings;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use serde_json::{Map, Value};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INFO_FN: &str = "info";
const EXECUTE_FN: &str = "execute";

const MAX_CALL_LEVELS: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
const MAX_STRING_SIZE: usize = 16 * 1024 * 1024;
const MAX_ARRAY_SIZE: usize = 16 * 1024 * 1024;
const MAX_MAP_SIZE: usize = 64 * 1024;

/// Resource limits applied to every template execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub max_operations: u64,
    pub max_import_depth: usize,
}

impl SandboxLimits {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            max_operations: settings.script_max_operations,
            max_import_depth: settings.max_import_depth,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

/// One requested template run
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub template: String,
    pub version: Option<String>,
    pub parameters: Map<String, Value>,
    /// Invocation index of this template within its environment
    pub instance: String,
}

impl Invocation {
    pub fn new(template: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            template: template.into(),
            parameters,
            instance: "0".to_string(),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
struct ExecContext {
    loader: Arc<dyn TemplateLoader>,
    limits: SandboxLimits,
    cancel: CancellationToken,
}

/// Import entry point available to a running template
pub(crate) struct ImportScope {
    ctx: ExecContext,
    depth: usize,
    instance: String,
    count: Cell<usize>,
}

impl ImportScope {
    pub(crate) fn run(&self, name: &str, params: &Map<String, Value>) -> Result<TemplateModel> {
        let ordinal = self.count.get();
        self.count.set(ordinal + 1);

        let instance = format!("{}.{}", self.instance, ordinal);
        self.ctx.run(name, None, params, instance, self.depth + 1)
    }
}

fn has_function(ast: &AST, name: &str) -> bool {
    ast.iter_functions().any(|f| f.name == name)
}

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => innermost(inner),
        other => other,
    }
}

impl ExecContext {
    fn engine(&self, template: &str) -> Engine {
        let mut engine = Engine::new();

        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        engine.set_max_operations(self.limits.max_operations);
        engine.set_max_call_levels(MAX_CALL_LEVELS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
        engine.set_max_string_size(MAX_STRING_SIZE);
        engine.set_max_array_size(MAX_ARRAY_SIZE);
        engine.set_max_map_size(MAX_MAP_SIZE);

        let name = template.to_string();
        engine.on_print(move |s| info!("[{}] {}", name, s));

        let name = template.to_string();
        engine.on_debug(move |s, _source, pos| debug!("[{}] {} ({})", name, s, pos));

        let cancel = self.cancel.clone();
        engine.on_progress(move |_| {
            if cancel.is_cancelled() {
                Some(Dynamic::from("cancelled"))
            } else {
                None
            }
        });

        capability::register(&mut engine);
        engine
    }

    fn compile(&self, engine: &Engine, template: &str, script: &str) -> Result<AST> {
        engine
            .compile(script)
            .map_err(|e| EngineError::template(template, format!("syntax error: {}", e)))
    }

    fn read_info(&self, engine: &Engine, ast: &AST, template: &str) -> Result<TemplateInfo> {
        if !has_function(ast, INFO_FN) {
            return Ok(TemplateInfo::default());
        }

        let value: Dynamic = engine
            .call_fn(&mut Scope::new(), ast, INFO_FN, ())
            .map_err(|e| EngineError::template(template, format!("info() failed: {}", e)))?;

        rhai::serde::from_dynamic(&value)
            .map_err(|e| EngineError::template(template, format!("invalid info(): {}", e)))
    }

    fn run(
        &self,
        name: &str,
        version: Option<&str>,
        raw: &Map<String, Value>,
        instance: String,
        depth: usize,
    ) -> Result<TemplateModel> {
        if depth > self.limits.max_import_depth {
            return Err(EngineError::template(
                name,
                format!(
                    "import depth limit of {} exceeded",
                    self.limits.max_import_depth
                ),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(EngineError::template(name, "execution cancelled"));
        }

        let source = self.loader.load(name)?;
        let template = source.name.clone();
        let engine = self.engine(&template);
        let ast = self.compile(&engine, &template, &source.script)?;

        let info = self.read_info(&engine, &ast, &template)?;
        if let Some(wanted) = version {
            if info.version.as_deref() != Some(wanted) {
                return Err(EngineError::template(
                    &template,
                    format!(
                        "version {} requested but the template declares {}",
                        wanted,
                        info.version.as_deref().unwrap_or("no version")
                    ),
                ));
            }
        }

        if !has_function(&ast, EXECUTE_FN) {
            return Err(EngineError::template(
                &template,
                "template does not define execute(tpl, params)",
            ));
        }

        let params = params::validate(&template, &info.parameters, raw)?;
        let params = params_to_dynamic(params)
            .map_err(|e| EngineError::template(&template, e.to_string()))?;

        let session = Rc::new(Session::new(
            template.clone(),
            instance.clone(),
            source.data.clone(),
            ImportScope {
                ctx: self.clone(),
                depth,
                instance: instance.clone(),
                count: Cell::new(0),
            },
        ));

        debug!("Executing template {} (instance {})", template, instance);

        let result: std::result::Result<Dynamic, _> = engine.call_fn(
            &mut Scope::new(),
            &ast,
            EXECUTE_FN,
            (TemplateHandle::new(session.clone()), params),
        );

        match result {
            Ok(_) => Ok(session.take_model()),
            Err(err) => {
                let err = self.script_error(&session, &template, &err);
                warn!("Template {} failed: {}", template, err);
                Err(err)
            }
        }
    }

    fn script_error(&self, session: &Session, template: &str, err: &EvalAltResult) -> EngineError {
        let root = innermost(err);

        match root {
            EvalAltResult::ErrorTerminated(..) => {
                EngineError::template(template, "execution cancelled")
            }
            EvalAltResult::ErrorRuntime(value, _) => value
                .clone()
                .into_string()
                .ok()
                .and_then(|message| session.take_raised(&message))
                .unwrap_or_else(|| EngineError::template(template, root.to_string())),
            _ => EngineError::template(template, root.to_string()),
        }
    }
}

/// Runs templates against the capability API.
///
/// Every execution gets a fresh engine, so templates share no script state.
/// Executions are synchronous; callers run them on a blocking thread.
#[derive(Clone)]
pub struct TemplateExecutor {
    loader: Arc<dyn TemplateLoader>,
    limits: SandboxLimits,
}

impl TemplateExecutor {
    pub fn new(loader: Arc<dyn TemplateLoader>, settings: &EngineSettings) -> Self {
        Self::with_limits(loader, SandboxLimits::from_settings(settings))
    }

    pub fn with_limits(loader: Arc<dyn TemplateLoader>, limits: SandboxLimits) -> Self {
        Self { loader, limits }
    }

    fn context(&self, cancel: &CancellationToken) -> ExecContext {
        ExecContext {
            loader: self.loader.clone(),
            limits: self.limits,
            cancel: cancel.clone(),
        }
    }

    /// Validate parameters and run `execute`, returning the template's contribution
    pub fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<TemplateModel> {
        self.context(cancel).run(
            &invocation.template,
            invocation.version.as_deref(),
            &invocation.parameters,
            invocation.instance.clone(),
            0,
        )
    }

    /// Metadata of one template, including its data files
    pub fn info(&self, name: &str) -> Result<TemplateInfo> {
        let ctx = self.context(&CancellationToken::new());
        let source = self.loader.load(name)?;
        let engine = ctx.engine(&source.name);
        let ast = ctx.compile(&engine, &source.name, &source.script)?;

        let mut info = ctx.read_info(&engine, &ast, &source.name)?;
        info.data_files = source
            .data
            .collect("")?
            .into_iter()
            .map(|f| f.path)
            .collect();
        Ok(info)
    }

    /// Metadata of every template that declares `info()`
    pub fn catalogue(&self) -> Result<BTreeMap<String, TemplateInfo>> {
        let ctx = self.context(&CancellationToken::new());
        let mut catalogue = BTreeMap::new();

        for name in self.loader.list()? {
            let source = self.loader.load(&name)?;
            let engine = ctx.engine(&source.name);
            let ast = ctx.compile(&engine, &source.name, &source.script)?;
            if !has_function(&ast, INFO_FN) {
                continue;
            }
            catalogue.insert(name.clone(), self.info(&name)?);
        }

        Ok(catalogue)
    }
}
