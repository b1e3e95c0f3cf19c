//! Execution configuration, threaded explicitly through the engine rather
//! than read from module-scope state (see DESIGN.md, "global configuration").

use std::collections::HashMap;
use std::env;

const ENV_PREFIX: &str = "FLOWRITE_";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub step_timeout_seconds: u64,
    pub activity_timeout_seconds: u64,
    pub eval_timeout_seconds: u64,
    pub max_retries: u32,
    /// Opaque endpoint for the distributed back-end this engine can be
    /// wrapped by. Never consulted by this in-process implementation.
    pub backend_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            step_timeout_seconds: 300,
            activity_timeout_seconds: 30,
            eval_timeout_seconds: 10,
            max_retries: 3,
            backend_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EnvValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

fn coerce(raw: &str) -> EnvValue {
    match raw.to_ascii_lowercase().as_str() {
        "true" => return EnvValue::Bool(true),
        "false" => return EnvValue::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return EnvValue::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return EnvValue::Float(f);
    }
    EnvValue::Str(raw.to_string())
}

impl Config {
    /// Overlays `FLOWRITE_`-prefixed environment variables onto the
    /// defaults. Unrecognized keys are ignored; type mismatches (e.g. a
    /// non-numeric `FLOWRITE_MAX_RETRIES`) fall back to the existing value.
    pub fn from_env() -> Self {
        Self::default().overlay_env(env::vars())
    }

    fn overlay_env(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut values: HashMap<String, EnvValue> = HashMap::new();
        for (key, raw) in vars {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                values.insert(stripped.to_ascii_lowercase(), coerce(&raw));
            }
        }

        if let Some(EnvValue::Int(v)) = values.get("step_timeout_seconds") {
            self.step_timeout_seconds = *v as u64;
        }
        if let Some(EnvValue::Int(v)) = values.get("activity_timeout_seconds") {
            self.activity_timeout_seconds = *v as u64;
        }
        if let Some(EnvValue::Int(v)) = values.get("eval_timeout_seconds") {
            self.eval_timeout_seconds = *v as u64;
        }
        if let Some(EnvValue::Int(v)) = values.get("max_retries") {
            self.max_retries = *v as u32;
        }
        if let Some(value) = values.get("backend_endpoint") {
            self.backend_endpoint = Some(match value {
                EnvValue::Str(s) => s.clone(),
                EnvValue::Bool(b) => b.to_string(),
                EnvValue::Int(i) => i.to_string(),
                EnvValue::Float(f) => f.to_string(),
            });
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.step_timeout_seconds, 300);
        assert_eq!(cfg.activity_timeout_seconds, 30);
        assert_eq!(cfg.eval_timeout_seconds, 10);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.backend_endpoint, None);
    }

    #[test]
    fn overlay_parses_int_and_string() {
        let cfg = Config::default().overlay_env(vec![
            ("FLOWRITE_MAX_RETRIES".to_string(), "7".to_string()),
            (
                "FLOWRITE_BACKEND_ENDPOINT".to_string(),
                "https://backend.example".to_string(),
            ),
            ("UNRELATED".to_string(), "true".to_string()),
        ]);
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(
            cfg.backend_endpoint.as_deref(),
            Some("https://backend.example")
        );
    }

    #[test]
    fn overlay_ignores_type_mismatch() {
        let cfg = Config::default().overlay_env(vec![(
            "FLOWRITE_MAX_RETRIES".to_string(),
            "not-a-number".to_string(),
        )]);
        assert_eq!(cfg.max_retries, 3);
    }
}
