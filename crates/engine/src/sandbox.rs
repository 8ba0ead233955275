//! Rhai sandbox that runs task scripts on a blocking worker.
//!
//! Scripts only see the functions registered here. Page, log and progress calls are marshalled
//! over a channel to the async side, which drives the page and reports to the observer.

use async_trait::async_trait;
use autobrowse_browser::PageDriver;
use autobrowse_core::config::EngineConfig;
use autobrowse_core::{Error, LogLevel, Progress, Result};
use rhai::module_resolvers::StaticModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Module, Scope};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::convert::{dynamic_to_json, json_to_dynamic};
use crate::validate::ENTRY_FN;

/// Longest single `wait` a script may request.
const MAX_WAIT_MS: i64 = 60_000;

/// A resolved package that ships a Rhai module, importable by its package name.
#[derive(Debug, Clone)]
pub struct ScriptModule {
    pub name: String,
    pub path: PathBuf,
}

pub struct ScriptContext {
    pub page: Arc<dyn PageDriver>,
    pub modules: Vec<ScriptModule>,
    pub cancelled: Arc<AtomicBool>,
    pub timeout: Duration,
}

/// Receives what a running script reports.
#[async_trait]
pub trait ScriptObserver: Send + Sync {
    async fn log(&self, level: LogLevel, message: String);
    async fn progress(&self, progress: Progress);
}

enum PageOp {
    Navigate(String),
    CurrentUrl,
    Query(String),
    Click(String),
    TypeText(String, String),
    GetText(String),
    GetAttribute(String, String),
    Screenshot(bool),
    Evaluate(String),
}

impl PageOp {
    async fn apply(self, page: &dyn PageDriver) -> Result<Value> {
        match self {
            PageOp::Navigate(url) => page.navigate(&url).await.map(|_| Value::Null),
            PageOp::CurrentUrl => page.current_url().await.map(Value::String),
            PageOp::Query(selector) => page.query_count(&selector).await.map(|n| json!(n)),
            PageOp::Click(selector) => page.click(&selector).await.map(|_| Value::Null),
            PageOp::TypeText(selector, text) => {
                page.type_text(&selector, &text).await.map(|_| Value::Null)
            }
            PageOp::GetText(selector) => page
                .text(&selector)
                .await
                .map(|t| t.map(Value::String).unwrap_or(Value::Null)),
            PageOp::GetAttribute(selector, name) => page
                .attribute(&selector, &name)
                .await
                .map(|a| a.map(Value::String).unwrap_or(Value::Null)),
            PageOp::Screenshot(full_page) => page.screenshot(full_page).await.map(Value::String),
            PageOp::Evaluate(expression) => page.evaluate(&expression).await,
        }
    }
}

enum HostCall {
    Log(LogLevel, String),
    Progress(Progress),
    Page(PageOp, oneshot::Sender<Result<Value>>),
}

/// Script-side handle to the async host.
#[derive(Clone)]
struct Host {
    tx: mpsc::UnboundedSender<HostCall>,
    cancelled: Arc<AtomicBool>,
}

impl Host {
    fn log(&self, level: LogLevel, message: &Dynamic) {
        let _ = self.tx.send(HostCall::Log(level, message.to_string()));
    }

    fn page(&self, op: PageOp) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HostCall::Page(op, reply_tx))
            .map_err(|_| "page host is gone")?;
        match reply_rx.blocking_recv() {
            Ok(Ok(value)) => Ok(json_to_dynamic(&value)),
            Ok(Err(e)) => Err(e.to_string().into()),
            Err(_) => Err("page call was dropped".into()),
        }
    }
}

pub struct ScriptSandbox {
    config: EngineConfig,
}

impl ScriptSandbox {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Run `run(params)` to completion and return its value as JSON.
    pub async fn run(
        &self,
        script: &str,
        params: Value,
        ctx: ScriptContext,
        observer: &dyn ScriptObserver,
    ) -> Result<Value> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = Host {
            tx,
            cancelled: ctx.cancelled.clone(),
        };
        let config = self.config.clone();
        let script = script.to_string();
        let modules = ctx.modules.clone();
        let timeout = ctx.timeout;

        let mut handle = tokio::task::spawn_blocking(move || {
            run_blocking(&config, &script, params, &modules, host, timeout)
        });

        let joined = loop {
            tokio::select! {
                Some(call) = rx.recv() => serve(call, ctx.page.as_ref(), observer).await,
                joined = &mut handle => break joined,
            }
        };
        // Logs sent just before the script returned
        while let Ok(call) = rx.try_recv() {
            serve(call, ctx.page.as_ref(), observer).await;
        }

        joined.map_err(|e| Error::Execution(format!("Script worker failed: {}", e)))?
    }
}

async fn serve(call: HostCall, page: &dyn PageDriver, observer: &dyn ScriptObserver) {
    match call {
        HostCall::Log(level, message) => observer.log(level, message).await,
        HostCall::Progress(progress) => observer.progress(progress).await,
        HostCall::Page(op, reply) => {
            let _ = reply.send(op.apply(page).await);
        }
    }
}

fn create_engine(config: &EngineConfig, timeout: Duration) -> (Engine, Arc<AtomicU64>) {
    let mut engine = Engine::new();
    engine.set_max_string_size(config.max_string_size);
    engine.set_max_array_size(config.max_array_size);
    engine.set_max_map_size(config.max_map_size);
    engine.set_max_call_levels(config.max_call_depth);
    engine.set_max_expr_depths(64, 64);

    let operations = Arc::new(AtomicU64::new(0));
    let ops_counter = operations.clone();
    let max_ops = config.max_operations;
    let start_time = Instant::now();
    engine.on_progress(move |_| {
        let count = ops_counter.fetch_add(1, Ordering::Relaxed);
        if count >= max_ops {
            return Some(Dynamic::from(format!(
                "Operation limit exceeded: {} operations",
                max_ops
            )));
        }
        if start_time.elapsed() > timeout {
            return Some(Dynamic::from(format!(
                "Timeout exceeded: {} seconds",
                timeout.as_secs()
            )));
        }
        None
    });

    (engine, operations)
}

fn register_host(engine: &mut Engine, host: &Host) {
    // Logging
    for (name, level) in [
        ("log", LogLevel::Info),
        ("log_info", LogLevel::Info),
        ("log_warn", LogLevel::Warn),
        ("log_error", LogLevel::Error),
        ("log_debug", LogLevel::Debug),
    ] {
        let h = host.clone();
        engine.register_fn(name, move |msg: Dynamic| h.log(level, &msg));
    }
    // print/debug go to the execution log, never to the process stdout
    let h = host.clone();
    engine.on_print(move |text| {
        let _ = h.tx.send(HostCall::Log(LogLevel::Info, text.to_string()));
    });
    let h = host.clone();
    engine.on_debug(move |text, _source, _pos| {
        let _ = h.tx.send(HostCall::Log(LogLevel::Debug, text.to_string()));
    });

    {
        let h = host.clone();
        engine.register_fn(
            "progress",
            move |current: i64, total: i64, message: &str| {
                let _ = h.tx.send(HostCall::Progress(Progress {
                    current: current.max(0) as u64,
                    total: total.max(0) as u64,
                    message: message.to_string(),
                }));
            },
        );
        let h = host.clone();
        engine.register_fn("progress", move |current: i64, total: i64| {
            let _ = h.tx.send(HostCall::Progress(Progress {
                current: current.max(0) as u64,
                total: total.max(0) as u64,
                message: String::new(),
            }));
        });
    }

    // Page
    let h = host.clone();
    engine.register_fn("navigate", move |url: &str| {
        h.page(PageOp::Navigate(url.to_string())).map(|_| ())
    });
    let h = host.clone();
    engine.register_fn("current_url", move || h.page(PageOp::CurrentUrl));
    let h = host.clone();
    engine.register_fn("query", move |selector: &str| {
        h.page(PageOp::Query(selector.to_string()))
    });
    let h = host.clone();
    engine.register_fn("click", move |selector: &str| {
        h.page(PageOp::Click(selector.to_string())).map(|_| ())
    });
    let h = host.clone();
    engine.register_fn("type_text", move |selector: &str, text: &str| {
        h.page(PageOp::TypeText(selector.to_string(), text.to_string()))
            .map(|_| ())
    });
    let h = host.clone();
    engine.register_fn("get_text", move |selector: &str| {
        h.page(PageOp::GetText(selector.to_string()))
    });
    let h = host.clone();
    engine.register_fn("get_attribute", move |selector: &str, name: &str| {
        h.page(PageOp::GetAttribute(selector.to_string(), name.to_string()))
    });
    let h = host.clone();
    engine.register_fn("screenshot", move || h.page(PageOp::Screenshot(false)));
    let h = host.clone();
    engine.register_fn("screenshot", move |full_page: bool| {
        h.page(PageOp::Screenshot(full_page))
    });
    let h = host.clone();
    engine.register_fn("evaluate", move |expression: &str| {
        h.page(PageOp::Evaluate(expression.to_string()))
    });

    // Data helpers
    engine.register_fn("wait", |ms: i64| {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms.min(MAX_WAIT_MS) as u64));
        }
    });
    engine.register_fn("to_json", |val: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(&val)).unwrap_or_default()
    });
    engine.register_fn("from_json", |s: &str| -> Dynamic {
        match serde_json::from_str::<Value>(s) {
            Ok(v) => json_to_dynamic(&v),
            Err(_) => Dynamic::UNIT,
        }
    });
    engine.register_fn("timestamp", || -> i64 { chrono::Utc::now().timestamp_millis() });
    engine.register_fn("now_iso", || -> String { chrono::Utc::now().to_rfc3339() });
    let h = host.clone();
    engine.register_fn("is_cancelled", move || h.cancelled.load(Ordering::SeqCst));
}

fn load_modules(engine: &Engine, modules: &[ScriptModule]) -> Result<StaticModuleResolver> {
    let mut resolver = StaticModuleResolver::new();
    for module in modules {
        let source = std::fs::read_to_string(&module.path).map_err(|e| {
            Error::Dependency(format!("Cannot read module of {}: {}", module.name, e))
        })?;
        let ast = engine.compile(&source).map_err(|e| {
            Error::Dependency(format!("Module of {} does not compile: {}", module.name, e))
        })?;
        let compiled = Module::eval_ast_as_new(Scope::new(), &ast, engine).map_err(|e| {
            Error::Dependency(format!("Module of {} failed to load: {}", module.name, e))
        })?;
        debug!(package = %module.name, "Rhai module registered");
        resolver.insert(module.name.as_str(), compiled);
    }
    Ok(resolver)
}

fn run_blocking(
    config: &EngineConfig,
    script: &str,
    params: Value,
    modules: &[ScriptModule],
    host: Host,
    timeout: Duration,
) -> Result<Value> {
    let (mut engine, operations) = create_engine(config, timeout);
    register_host(&mut engine, &host);
    // Only resolved packages are importable; no filesystem imports
    let resolver = load_modules(&engine, modules)?;
    engine.set_module_resolver(resolver);

    let ast = engine
        .compile(script)
        .map_err(|e| Error::Validation(format!("Script does not compile: {}", e)))?;
    let takes_params = ast
        .iter_functions()
        .any(|f| f.name == ENTRY_FN && f.params.len() == 1);

    let start = Instant::now();
    let mut scope = Scope::new();
    let options = CallFnOptions::new().eval_ast(true).rewind_scope(true);
    let result = if takes_params {
        engine.call_fn_with_options::<Dynamic>(
            options,
            &mut scope,
            &ast,
            ENTRY_FN,
            (json_to_dynamic(&params),),
        )
    } else {
        engine.call_fn_with_options::<Dynamic>(options, &mut scope, &ast, ENTRY_FN, ())
    };

    debug!(
        operations = operations.load(Ordering::Relaxed),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Rhai script execution completed"
    );

    match result {
        Ok(value) => Ok(dynamic_to_json(&value)),
        Err(e) => {
            if let EvalAltResult::ErrorTerminated(ref reason, _) = *e {
                warn!(reason = %reason, "Script terminated");
                return Err(Error::Execution(format!("Script terminated: {}", reason)));
            }
            Err(Error::Execution(format!("Runtime error: {}", e)))
        }
    }
}
