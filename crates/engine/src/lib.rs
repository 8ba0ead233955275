pub mod convert;
pub mod engine;
pub mod events;
pub mod result_cache;
pub mod sandbox;
pub mod validate;

pub use engine::TaskExecutionEngine;
pub use events::ExecutionEvent;
pub use result_cache::{CachedResult, ResultCache};
pub use sandbox::{ScriptContext, ScriptModule, ScriptObserver, ScriptSandbox};
