//! Rule evaluation for job activation.
//!
//! Rules are evaluated in declaration order against the pipeline context;
//! the first matching rule decides the outcome and short-circuits the rest.
//! If no rule matches the job is skipped. Predicates are a small typed
//! language (equality, regex match, set membership, `&&`/`||`); free-form
//! shell evaluation belongs to the runner agent, not the core.

use crate::config::{RuleConfig, When};
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What triggered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Push,
    MergeRequest,
    Schedule,
    Api,
    Manual,
    Web,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Push => "push",
            TriggerSource::MergeRequest => "merge_request",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Api => "api",
            TriggerSource::Manual => "manual",
            TriggerSource::Web => "web",
        }
    }
}

/// Per-pipeline evaluation context. Created once per pipeline run, passed by
/// reference into rule evaluation and scheduling, discarded when the
/// pipeline reaches a terminal state.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub ref_name: String,
    pub sha: String,
    pub is_tag: bool,
    /// Protection flag for the ref; gates protected variables and secrets.
    pub protected: bool,
    pub source: TriggerSource,
    /// Changed paths from the VCS collaborator. `None` means the diff is
    /// unavailable; `changes:` predicates then fail safe (treated as
    /// matched).
    pub changed_paths: Option<Vec<String>>,
}

/// Outcome of evaluating a job's rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Run,
    Manual,
    Skip,
}

#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub action: RuleAction,
    /// Variables injected by the matched rule, highest-precedence scope.
    pub variables: HashMap<String, String>,
    pub allow_failure: Option<bool>,
}

impl RuleOutcome {
    fn skipped() -> Self {
        Self {
            action: RuleAction::Skip,
            variables: HashMap::new(),
            allow_failure: None,
        }
    }
}

/// Evaluate a rule list in declaration order. Pure with respect to its
/// inputs: the same rules, variables, and context always produce the same
/// outcome.
pub fn evaluate(
    rules: &[RuleConfig],
    variables: &HashMap<String, String>,
    ctx: &PipelineContext,
) -> Result<RuleOutcome> {
    for rule in rules {
        if !matches_rule(rule, variables, ctx)? {
            continue;
        }

        let action = match rule.when {
            Some(When::Never) => RuleAction::Skip,
            Some(When::Manual) => RuleAction::Manual,
            Some(When::Always) | Some(When::OnSuccess) | None => RuleAction::Run,
        };
        return Ok(RuleOutcome {
            action,
            variables: rule.variables.clone(),
            allow_failure: rule.allow_failure,
        });
    }

    Ok(RuleOutcome::skipped())
}

fn matches_rule(
    rule: &RuleConfig,
    variables: &HashMap<String, String>,
    ctx: &PipelineContext,
) -> Result<bool> {
    if let Some(ref expr) = rule.if_expr
        && !evaluate_expr(expr, variables)?
    {
        return Ok(false);
    }

    if !rule.changes.is_empty() && !matches_changes(&rule.changes, ctx) {
        return Ok(false);
    }

    Ok(true)
}

fn matches_changes(patterns: &[String], ctx: &PipelineContext) -> bool {
    let Some(ref paths) = ctx.changed_paths else {
        // Diff unavailable: fail safe, treat everything as changed.
        return true;
    };
    patterns
        .iter()
        .any(|pattern| paths.iter().any(|path| glob_match(pattern, path)))
}

/// Minimal glob matching: `**` crosses directories, `*` and `?` stay within
/// one path segment.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() * 2);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // swallow a following slash so `src/**/x` matches `src/x`
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(path)).unwrap_or(false)
}

/// Evaluate a predicate expression. `||` binds looser than `&&`; there is no
/// parenthesization in the predicate language. Connectives inside `/regex/`
/// or quoted literals are part of the term, not the expression; terms
/// containing a bare `/` must be quoted.
pub fn evaluate_expr(expr: &str, variables: &HashMap<String, String>) -> Result<bool> {
    for disjunct in split_connective(expr, "||") {
        let mut all = true;
        for clause in split_connective(disjunct, "&&") {
            if !evaluate_clause(clause.trim(), variables)? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Split on a connective, ignoring occurrences inside `/.../`, `"..."`, or
/// `'...'` terms. Backslash escapes the next character inside a term.
fn split_connective<'a>(expr: &'a str, op: &str) -> Vec<&'a str> {
    let bytes = expr.as_bytes();
    let op = op.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut delim: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        match delim {
            Some(d) => {
                if bytes[i] == b'\\' {
                    i += 2;
                    continue;
                }
                if bytes[i] == d {
                    delim = None;
                }
            }
            None => match bytes[i] {
                b'/' | b'"' | b'\'' => delim = Some(bytes[i]),
                _ if bytes[i..].starts_with(op) => {
                    parts.push(&expr[start..i]);
                    i += op.len();
                    start = i;
                    continue;
                }
                _ => {}
            },
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

fn evaluate_clause(clause: &str, variables: &HashMap<String, String>) -> Result<bool> {
    if clause.is_empty() {
        return Err(Error::Configuration("empty rule clause".to_string()));
    }

    if let Some((lhs, rhs)) = split_operator(clause, "==") {
        return Ok(term_value(lhs, variables) == term_value(rhs, variables));
    }
    if let Some((lhs, rhs)) = split_operator(clause, "!=") {
        return Ok(term_value(lhs, variables) != term_value(rhs, variables));
    }
    if let Some((lhs, rhs)) = split_operator(clause, "=~") {
        return Ok(regex_term(rhs)?.is_match(&term_value(lhs, variables)));
    }
    if let Some((lhs, rhs)) = split_operator(clause, "!~") {
        return Ok(!regex_term(rhs)?.is_match(&term_value(lhs, variables)));
    }
    if let Some((lhs, rhs)) = split_operator(clause, " in ") {
        let value = term_value(lhs, variables);
        return in_list(&value, rhs, variables);
    }

    // Bare term: truthy when it resolves to a non-empty string.
    Ok(!term_value(clause, variables).is_empty())
}

fn split_operator<'a>(clause: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    clause
        .split_once(op)
        .map(|(lhs, rhs)| (lhs.trim(), rhs.trim()))
}

/// Resolve a term to its string value: `$VAR`/`${VAR}` looks up the variable
/// (missing variables resolve empty), quotes strip, anything else is
/// literal.
fn term_value(term: &str, variables: &HashMap<String, String>) -> String {
    let term = term.trim();
    if let Some(name) = term.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        return variables.get(name).cloned().unwrap_or_default();
    }
    if let Some(name) = term.strip_prefix('$') {
        return variables.get(name).cloned().unwrap_or_default();
    }
    if (term.starts_with('"') && term.ends_with('"') && term.len() >= 2)
        || (term.starts_with('\'') && term.ends_with('\'') && term.len() >= 2)
    {
        return term[1..term.len() - 1].to_string();
    }
    term.to_string()
}

fn regex_term(term: &str) -> Result<Regex> {
    let inner = term
        .strip_prefix('/')
        .and_then(|t| t.strip_suffix('/'))
        .ok_or_else(|| {
            Error::Configuration(format!("expected /regex/ on match operator, got {}", term))
        })?;
    Regex::new(inner).map_err(|e| Error::Configuration(format!("invalid regex {}: {}", term, e)))
}

fn in_list(value: &str, rhs: &str, variables: &HashMap<String, String>) -> Result<bool> {
    let inner = rhs
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| {
            Error::Configuration(format!("expected [list] on in operator, got {}", rhs))
        })?;
    for item in inner.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if item.starts_with('/') && item.ends_with('/') && item.len() > 1 {
            if regex_term(item)?.is_match(value) {
                return Ok(true);
            }
        } else if term_value(item, variables) == value {
            return Ok(true);
        }
    }
    Ok(false)
}
