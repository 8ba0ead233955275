//! Checks run before an execution is accepted.

use autobrowse_core::config::EngineConfig;
use autobrowse_core::{Error, ParameterSpec, Result};
use rhai::Engine;
use serde_json::{Map, Value};

/// Name of the routine every task script must define.
pub const ENTRY_FN: &str = "run";

/// The script compiles and defines `run` with zero or one parameter.
/// Returns the entry routine's arity.
pub fn validate_script(config: &EngineConfig, script: &str) -> Result<usize> {
    if script.trim().is_empty() {
        return Err(Error::Validation("Task script is empty".to_string()));
    }
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 64);
    engine.set_max_call_levels(config.max_call_depth);
    let ast = engine
        .compile(script)
        .map_err(|e| Error::Validation(format!("Script does not compile: {}", e)))?;

    let entry = ast
        .iter_functions()
        .filter(|f| f.name == ENTRY_FN)
        .map(|f| f.params.len())
        .min();
    match entry {
        Some(arity) if arity <= 1 => Ok(arity),
        Some(arity) => Err(Error::Validation(format!(
            "Entry routine `{}` must take at most one parameter, found {}",
            ENTRY_FN, arity
        ))),
        None => Err(Error::Validation(format!(
            "Script must define `fn {}(params)`",
            ENTRY_FN
        ))),
    }
}

pub fn validate_schema(specs: &[ParameterSpec]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation("Parameter name must not be empty".to_string()));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::Validation(format!(
                "Duplicate parameter '{}'",
                spec.name
            )));
        }
        if let Some(default) = &spec.default {
            if !spec.kind.matches(default) {
                return Err(Error::Validation(format!(
                    "Default of parameter '{}' is not of type {}",
                    spec.name,
                    spec.kind.as_str()
                )));
            }
        }
    }
    Ok(())
}

/// Check `params` against the schema and apply defaults. Unknown keys are kept.
pub fn validate_parameters(specs: &[ParameterSpec], params: Value) -> Result<Value> {
    let mut obj = match params {
        Value::Null => Map::new(),
        Value::Object(obj) => obj,
        other => {
            return Err(Error::Validation(format!(
                "Parameters must be an object, got {}",
                type_name(&other)
            )))
        }
    };

    let mut problems = Vec::new();
    for spec in specs {
        match obj.get(&spec.name) {
            Some(value) if !value.is_null() => {
                if !spec.kind.matches(value) {
                    problems.push(format!(
                        "parameter '{}' must be {}, got {}",
                        spec.name,
                        spec.kind.as_str(),
                        type_name(value)
                    ));
                }
            }
            _ => {
                if let Some(default) = &spec.default {
                    obj.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    problems.push(format!("missing required parameter '{}'", spec.name));
                }
            }
        }
    }

    if problems.is_empty() {
        Ok(Value::Object(obj))
    } else {
        Err(Error::Validation(problems.join("; ")))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobrowse_core::ParamType;
    use serde_json::json;

    fn spec(name: &str, kind: ParamType, required: bool, default: Option<Value>) -> ParameterSpec {
        ParameterSpec {
            name: name.to_string(),
            kind,
            required,
            default,
            description: None,
        }
    }

    #[test]
    fn test_script_needs_run() {
        let config = EngineConfig::default();
        assert_eq!(validate_script(&config, "fn run(params) { 1 }").unwrap(), 1);
        assert_eq!(validate_script(&config, "fn run() { 1 }").unwrap(), 0);
        assert!(validate_script(&config, "  ").is_err());
        assert!(validate_script(&config, "fn main() { 1 }").is_err());
        assert!(validate_script(&config, "fn run(params { 1 }").is_err());
        assert!(validate_script(&config, "fn run(a, b) { 1 }").is_err());
    }

    #[test]
    fn test_page_helpers_compile() {
        let script = r##"
            fn run(params) {
                navigate(params.url);
                click("#submit");
                type_text("input[name=q]", "rust");
                wait(10);
                progress(1, 2, "typed");
                log_info(current_url());
                #{
                    count: query("a"),
                    text: get_text("h1"),
                    href: get_attribute("a", "href"),
                    shot: screenshot(true),
                    title: evaluate("document.title"),
                    stop: is_cancelled(),
                }
            }
        "##;
        assert_eq!(validate_script(&EngineConfig::default(), script).unwrap(), 1);
    }

    #[test]
    fn test_parameters_defaults_and_types() {
        let specs = vec![
            spec("url", ParamType::String, true, None),
            spec("pages", ParamType::Integer, false, Some(json!(1))),
            spec("headless", ParamType::Boolean, false, None),
        ];
        let params = validate_parameters(&specs, json!({"url": "https://example.com", "extra": 5})).unwrap();
        assert_eq!(params, json!({"url": "https://example.com", "pages": 1, "extra": 5}));

        let err = validate_parameters(&specs, json!({"pages": "two"})).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing required parameter 'url'"));
        assert!(msg.contains("'pages' must be integer, got string"));

        assert!(validate_parameters(&specs, json!([1])).is_err());
        assert!(validate_parameters(&[], Value::Null).unwrap().as_object().unwrap().is_empty());
    }

    #[test]
    fn test_schema_rejects_bad_default() {
        assert!(validate_schema(&[spec("n", ParamType::Number, false, Some(json!("x")))]).is_err());
        assert!(validate_schema(&[
            spec("n", ParamType::Number, false, None),
            spec("n", ParamType::String, false, None)
        ])
        .is_err());
    }
}
