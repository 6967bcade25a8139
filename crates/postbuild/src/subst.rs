//! `${...}` variable substitution over manifest text.
//!
//! Understood forms: `${NAME}`, `${NAME:=default}`, `${NAME:offset}`,
//! `${NAME:offset:length}` and `${NAME/old/new}`. Anything else is left as written.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::PostBuildError;

pub type Vars = BTreeMap<String, String>;

static EXPR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^{}]*)\}").unwrap());
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9]*$").unwrap());

#[derive(Debug, PartialEq, Eq)]
enum Op<'a> {
    Plain,
    Default(&'a str),
    Slice { offset: usize, length: Option<usize> },
    Replace { old: &'a str, new: &'a str },
}

pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Reject variable maps carrying names that could never be referenced.
pub fn validate_names(vars: &Vars) -> Result<(), PostBuildError> {
    match vars.keys().find(|k| !is_valid_name(k)) {
        Some(bad) => Err(PostBuildError::Substitution(format!(
            "'{}' is not a valid variable name, must match [_a-zA-Z][_a-zA-Z0-9]*",
            bad
        ))),
        None => Ok(()),
    }
}

fn parse_expr(inner: &str) -> Option<(&str, Op<'_>)> {
    let end = inner
        .char_indices()
        .find(|&(i, c)| !(c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit())))
        .map(|(i, _)| i)
        .unwrap_or(inner.len());
    if end == 0 {
        return None;
    }
    let (name, rest) = inner.split_at(end);
    let op = if rest.is_empty() {
        Op::Plain
    } else if let Some(default) = rest.strip_prefix(":=") {
        Op::Default(default)
    } else if let Some(slice) = rest.strip_prefix(':') {
        let (offset, length) = match slice.split_once(':') {
            Some((o, l)) => (o, Some(l)),
            None => (slice, None),
        };
        let offset = offset.trim().parse().ok()?;
        let length = match length {
            Some(l) => Some(l.trim().parse().ok()?),
            None => None,
        };
        Op::Slice { offset, length }
    } else if let Some(repl) = rest.strip_prefix('/') {
        let (old, new) = repl.split_once('/').unwrap_or((repl, ""));
        if old.is_empty() {
            return None;
        }
        Op::Replace { old, new }
    } else {
        return None;
    };
    Some((name, op))
}

fn apply_op(value: &str, op: &Op<'_>) -> String {
    match op {
        Op::Plain | Op::Default(_) => value.to_string(),
        Op::Slice { offset, length } => {
            let tail = value.chars().skip(*offset);
            match length {
                Some(n) => tail.take(*n).collect(),
                None => tail.collect(),
            }
        }
        Op::Replace { old, new } => value.replacen(old, new, 1),
    }
}

/// Replace every understood expression. Unset variables without a default stay
/// verbatim, or fail the whole text when `strict` is set.
pub fn substitute(text: &str, vars: &Vars, strict: bool) -> Result<String, PostBuildError> {
    let mut missing: Option<String> = None;
    let out = EXPR_RE.replace_all(text, |caps: &Captures<'_>| {
        let whole = &caps[0];
        let Some((name, op)) = parse_expr(&caps[1]) else {
            return whole.to_string();
        };
        match (vars.get(name), &op) {
            (Some(v), Op::Default(d)) if v.is_empty() => d.to_string(),
            (Some(v), _) => apply_op(v, &op),
            (None, Op::Default(d)) => d.to_string(),
            (None, _) => {
                if missing.is_none() {
                    missing = Some(name.to_string());
                }
                whole.to_string()
            }
        }
    });
    match missing {
        Some(name) if strict => Err(PostBuildError::Substitution(format!("variable not set (strict mode): {}", name))),
        _ => Ok(out.into_owned()),
    }
}
