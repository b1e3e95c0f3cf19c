//! Variable substitution for step `run:` commands.
//!
//! Two forms, resolved in a fixed order and a single pass (no recursive
//! re-expansion of a substituted value):
//!
//! 1. `${{ needs.JOB.outputs.KEY }}` / `${{ steps.STEP.outputs.KEY }}` —
//!    templated references, resolved first.
//! 2. `$NAME` / `${NAME}` — shell-style references into the accumulated
//!    environment, resolved second so a templated value can feed a plain
//!    substitution but not vice versa.

use std::collections::HashMap;

use regex::Regex;

/// Everything a step's command can reference: the outputs of jobs it
/// depends on, the outputs of steps run earlier in the same job, and the
/// flat environment (process env plus `GITHUB_ENV` accumulation).
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    pub needs_outputs: HashMap<String, HashMap<String, String>>,
    pub step_outputs: HashMap<String, HashMap<String, String>>,
    pub env: HashMap<String, String>,
}

fn templated_pattern() -> Regex {
    Regex::new(r"\$\{\{\s*(needs|steps)\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_.-]+)\s*\}\}")
        .expect("static pattern")
}

fn shell_style_pattern() -> Regex {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static pattern")
}

/// Resolves templated references first, then shell-style references,
/// leaving anything unresolved untouched in the output.
pub fn substitute(command: &str, ctx: &SubstitutionContext) -> String {
    let after_templates = templated_pattern().replace_all(command, |caps: &regex::Captures| {
        let source = &caps[1];
        let scope_id = &caps[2];
        let key = &caps[3];
        let table = match source {
            "needs" => &ctx.needs_outputs,
            _ => &ctx.step_outputs,
        };
        table
            .get(scope_id)
            .and_then(|outputs| outputs.get(key))
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    });

    shell_style_pattern()
        .replace_all(&after_templates, |caps: &regex::Captures| {
            let name = caps.get(1).or_else(|| caps.get(2)).unwrap().as_str();
            ctx.env
                .get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
