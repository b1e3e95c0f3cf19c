//! Guard-condition evaluator for `if:` (job and step) and `until:` (loop)
//! expressions.
//!
//! This is a small fixed grammar, not a general expression language:
//! compound expressions split on `||` (lowest precedence) then `&&`, and
//! each leaf is one of a handful of recognized atoms. There is no
//! parenthesization and no operator beyond `==`/`!=`. An atom the grammar
//! doesn't recognize evaluates to `true` (fail-open) rather than erroring.
//!
//! `success()`/`failure()`/`cancelled()` mean different things depending on
//! where the condition is evaluated: a job/step guard has no notion of "the
//! previous attempt," so those atoms fail open there, while a loop's
//! `until:` condition is handed the outcome of the attempt that just ran.

use std::collections::HashMap;

use flowrite_core::{JobId, JobStatus};

/// Everything a condition might reference beyond the control atoms:
/// dependency outputs/results (for `needs.J...`) and the accumulated
/// environment (for `env.X...`).
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub needs_outputs: HashMap<JobId, HashMap<String, String>>,
    pub needs_results: HashMap<JobId, JobStatus>,
    pub env: HashMap<String, String>,
}

impl EvalContext {
    /// `needs.J.result` for a job not present in `needs_results` (not a
    /// dependency, or not yet recorded) defaults to `"success"` rather than
    /// treating the comparison as false.
    fn needs_result(&self, job_id: &str) -> &'static str {
        self.needs_results
            .get(&JobId::from(job_id))
            .map(|s| s.normalized_name())
            .unwrap_or("success")
    }

    fn needs_output(&self, job_id: &str, key: &str) -> Option<&str> {
        self.needs_outputs
            .get(&JobId::from(job_id))
            .and_then(|outputs| outputs.get(key))
            .map(|s| s.as_str())
    }

    fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Guard,
    LoopUntil { last_step_success: bool },
}

mod atoms {
    //! Atom patterns compiled once per call via `regex::Regex::new`; the
    //! teacher's own expression module builds `Regex::new` inline rather
    //! than lazily caching it, and conditions are short enough that this
    //! is not worth the extra machinery.
    use regex::Regex;

    pub struct AtomRegexes {
        pub needs_output: Regex,
        pub needs_result: Regex,
        pub env: Regex,
    }

    pub fn atom_regexes() -> AtomRegexes {
        AtomRegexes {
            needs_output: Regex::new(
                r"^needs\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_.-]+)\s*(==|!=)\s*'([^']*)'$",
            )
            .expect("static pattern"),
            needs_result: Regex::new(r"^needs\.([A-Za-z0-9_-]+)\.result\s*(==|!=)\s*'([^']*)'$")
                .expect("static pattern"),
            env: Regex::new(r"^env\.([A-Za-z0-9_-]+)\s*(==|!=)\s*'([^']*)'$")
                .expect("static pattern"),
        }
    }
}

/// Comparison against a value that may be absent. A missing reference
/// compares `false` for `==` and `true` for `!=`, regardless of the
/// expected value — it never "accidentally" matches an expectation of `''`.
fn apply_op_optional(op: &str, actual: Option<&str>, expected: &str) -> bool {
    match actual {
        Some(actual) => match op {
            "==" => actual == expected,
            "!=" => actual != expected,
            _ => true,
        },
        None => op == "!=",
    }
}

fn eval_atom(atom: &str, ctx: &EvalContext, mode: Mode, patterns: &atoms::AtomRegexes) -> bool {
    let atom = atom.trim();

    match atom {
        "always()" => return true,
        "cancelled()" => return false,
        "success()" => {
            return match mode {
                Mode::Guard => true,
                Mode::LoopUntil { last_step_success } => last_step_success,
            }
        }
        "failure()" => {
            return match mode {
                Mode::Guard => true,
                Mode::LoopUntil { last_step_success } => !last_step_success,
            }
        }
        _ => {}
    }

    if let Some(caps) = patterns.needs_output.captures(atom) {
        let job_id = &caps[1];
        let key = &caps[2];
        let op = &caps[3];
        let expected = &caps[4];
        return apply_op_optional(op, ctx.needs_output(job_id, key), expected);
    }

    if let Some(caps) = patterns.needs_result.captures(atom) {
        let job_id = &caps[1];
        let op = &caps[2];
        let expected = &caps[3];
        let actual = ctx.needs_result(job_id);
        return match op {
            "==" => actual == expected,
            "!=" => actual != expected,
            _ => true,
        };
    }

    if let Some(caps) = patterns.env.captures(atom) {
        let key = &caps[1];
        let op = &caps[2];
        let expected = &caps[3];
        return apply_op_optional(op, ctx.env_value(key), expected);
    }

    // Unrecognized atom: fail open rather than block the workflow.
    true
}

fn evaluate_compound(condition: &str, ctx: &EvalContext, mode: Mode) -> bool {
    let patterns = atoms::atom_regexes();
    condition
        .split("||")
        .any(|and_clause| and_clause.split("&&").all(|atom| eval_atom(atom, ctx, mode, &patterns)))
}

/// Evaluates a job or step `if:` guard. Empty/whitespace-only conditions
/// are true.
pub fn evaluate_condition(condition: &str, ctx: &EvalContext) -> bool {
    if condition.trim().is_empty() {
        return true;
    }
    evaluate_compound(condition, ctx, Mode::Guard)
}

/// Evaluates a loop's `until:` condition. An empty condition has a
/// different meaning here than in a guard: rather than always being true,
/// the loop simply runs until `iteration >= max_iterations`.
pub fn evaluate_until(
    condition: &str,
    iteration: u32,
    max_iterations: u32,
    last_step_success: bool,
    ctx: &EvalContext,
) -> bool {
    if condition.trim().is_empty() {
        return iteration >= max_iterations;
    }
    evaluate_compound(condition, ctx, Mode::LoopUntil { last_step_success })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvalContext {
        let mut needs_outputs = HashMap::new();
        let mut a_outputs = HashMap::new();
        a_outputs.insert("result".to_string(), "yes".to_string());
        needs_outputs.insert(JobId::from("a"), a_outputs);

        let mut needs_results = HashMap::new();
        needs_results.insert(JobId::from("a"), JobStatus::Completed);

        let mut env = HashMap::new();
        env.insert("STAGE".to_string(), "prod".to_string());

        EvalContext {
            needs_outputs,
            needs_results,
            env,
        }
    }

    #[test]
    fn always_is_always_true() {
        assert!(evaluate_condition("always()", &ctx()));
    }

    #[test]
    fn guard_success_and_failure_are_always_true() {
        assert!(evaluate_condition("success()", &ctx()));
        assert!(evaluate_condition("failure()", &ctx()));
    }

    #[test]
    fn cancelled_is_always_false() {
        assert!(!evaluate_condition("cancelled()", &ctx()));
    }

    #[test]
    fn loop_until_success_and_failure_reflect_last_attempt() {
        assert!(evaluate_until("success()", 1, 5, true, &ctx()));
        assert!(!evaluate_until("success()", 1, 5, false, &ctx()));
        assert!(evaluate_until("failure()", 1, 5, false, &ctx()));
    }

    #[test]
    fn empty_loop_until_condition_terminates_at_max_iterations() {
        assert!(!evaluate_until("", 1, 5, false, &ctx()));
        assert!(evaluate_until("", 5, 5, false, &ctx()));
        assert!(evaluate_until("   ", 5, 5, false, &ctx()));
    }

    #[test]
    fn empty_guard_condition_is_true() {
        assert!(evaluate_condition("", &ctx()));
        assert!(evaluate_condition("   ", &ctx()));
    }

    #[test]
    fn needs_output_equality() {
        assert!(evaluate_condition(
            "needs.a.outputs.result == 'yes'",
            &ctx()
        ));
        assert!(!evaluate_condition(
            "needs.a.outputs.result != 'yes'",
            &ctx()
        ));
    }

    #[test]
    fn missing_needs_output_compares_false_for_equality() {
        assert!(!evaluate_condition(
            "needs.ghost.outputs.k == 'v'",
            &ctx()
        ));
        assert!(evaluate_condition("needs.ghost.outputs.k != 'v'", &ctx()));
    }

    #[test]
    fn missing_env_compares_false_for_equality() {
        assert!(!evaluate_condition("env.MISSING == 'x'", &ctx()));
        assert!(evaluate_condition("env.MISSING != 'x'", &ctx()));
    }

    #[test]
    fn needs_result_defaults_to_success_when_missing() {
        assert!(evaluate_condition("needs.ghost.result == 'success'", &ctx()));
    }

    #[test]
    fn and_has_higher_precedence_than_or() {
        assert!(evaluate_condition(
            "env.STAGE == 'dev' && always() || always()",
            &ctx()
        ));
        assert!(!evaluate_condition("env.STAGE == 'dev' && always()", &ctx()));
    }

    #[test]
    fn unrecognized_atom_fails_open() {
        assert!(evaluate_condition("something.unparseable(1, 2)", &ctx()));
    }
}
