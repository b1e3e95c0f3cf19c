//! Parses the side-channel output produced by the shell sub-executor.
//!
//! The primary path reads the three sentinel lines the executor writes
//! around the contents of the `GITHUB_OUTPUT`/`GITHUB_ENV` temp files. A
//! secondary, best-effort path lexically scans the *command text itself*
//! for the legacy `echo "KEY=VALUE" >> "$GITHUB_OUTPUT"` idiom, so a step
//! that never got to run (or whose temp files were never flushed) still
//! surfaces outputs a human reading the workflow clearly intended.

use std::collections::HashMap;

use regex::Regex;

pub const OUTPUT_SENTINEL: &str = "=== GITHUB_OUTPUT ===";
pub const ENV_SENTINEL: &str = "=== GITHUB_ENV ===";
pub const END_SENTINEL: &str = "=== END ===";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSideChannel {
    pub user_stdout: String,
    pub outputs: HashMap<String, String>,
    pub env: HashMap<String, String>,
}

fn parse_key_value_lines(block: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in block.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if !key.is_empty() {
                map.insert(key.to_string(), value.to_string());
            }
        }
    }
    map
}

/// Splits captured stdout into the user's own output and the two sentinel
/// blocks. If the sentinels are absent (e.g. the command was killed before
/// reaching them), the whole capture is treated as user stdout and both
/// blocks come back empty.
pub fn parse_sentinel_output(captured_stdout: &str) -> ParsedSideChannel {
    let Some(output_start) = captured_stdout.find(OUTPUT_SENTINEL) else {
        return ParsedSideChannel {
            user_stdout: captured_stdout.to_string(),
            outputs: HashMap::new(),
            env: HashMap::new(),
        };
    };

    let user_stdout = captured_stdout[..output_start].to_string();
    let after_output = &captured_stdout[output_start + OUTPUT_SENTINEL.len()..];

    let env_start = after_output.find(ENV_SENTINEL).unwrap_or(after_output.len());
    let outputs_block = &after_output[..env_start];

    let after_env = after_output.get(env_start..).unwrap_or("");
    let after_env = after_env.strip_prefix(ENV_SENTINEL).unwrap_or(after_env);
    let end_start = after_env.find(END_SENTINEL).unwrap_or(after_env.len());
    let env_block = &after_env[..end_start];

    ParsedSideChannel {
        user_stdout,
        outputs: parse_key_value_lines(outputs_block.trim()),
        env: parse_key_value_lines(env_block.trim()),
    }
}

fn legacy_output_pattern() -> Regex {
    Regex::new(
        r#"echo\s+"([A-Za-z_][A-Za-z0-9_]*)=([^"$]*)"\s*>>\s*"?\$\{?GITHUB_OUTPUT\}?"?"#,
    )
    .expect("static pattern")
}

/// Scans a step's raw `run:` text for literal `echo "K=V" >> "$GITHUB_OUTPUT"`
/// statements. Only literal values (no `$` interpolation) are extracted,
/// since anything else can't be resolved without actually running the
/// command.
pub fn scan_legacy_output_statements(command: &str) -> HashMap<String, String> {
    legacy_output_pattern()
        .captures_iter(command)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sentinel_delimited_blocks() {
        let captured = format!(
            "hello from the step\n{OUTPUT_SENTINEL}\nresult=ok\ncount=3\n{ENV_SENTINEL}\nSTAGE=prod\n{END_SENTINEL}\n"
        );
        let parsed = parse_sentinel_output(&captured);
        assert_eq!(parsed.user_stdout, "hello from the step\n");
        assert_eq!(parsed.outputs.get("result"), Some(&"ok".to_string()));
        assert_eq!(parsed.outputs.get("count"), Some(&"3".to_string()));
        assert_eq!(parsed.env.get("STAGE"), Some(&"prod".to_string()));
    }

    #[test]
    fn missing_sentinels_yield_all_stdout_no_outputs() {
        let parsed = parse_sentinel_output("plain output, no side channel\n");
        assert_eq!(parsed.user_stdout, "plain output, no side channel\n");
        assert!(parsed.outputs.is_empty());
        assert!(parsed.env.is_empty());
    }

    #[test]
    fn legacy_scanner_extracts_literal_assignments() {
        let command = r#"echo "version=1.2.3" >> "$GITHUB_OUTPUT""#;
        let outputs = scan_legacy_output_statements(command);
        assert_eq!(outputs.get("version"), Some(&"1.2.3".to_string()));
    }

    #[test]
    fn legacy_scanner_ignores_interpolated_values() {
        let command = r#"echo "version=$VERSION" >> "$GITHUB_OUTPUT""#;
        let outputs = scan_legacy_output_statements(command);
        assert!(outputs.is_empty());
    }
}
