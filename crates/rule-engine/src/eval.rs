use std::borrow::Cow;

use http_assembler::Request;

use crate::script::{Expr, Field, Operand, Program, Stmt};

/// A runtime failure inside one rule. The rule contributes no verdict and no
/// tags; evaluation of the remaining rules continues.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("type mismatch: {0}")]
    TypeMismatch(&'static str),
}

/// Verdict recorded by a single rule, before cross-rule merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RuleVerdict {
    Accept,
    Drop,
}

/// What one rule contributed for one request.
#[derive(Debug, Default)]
pub(crate) struct RuleOutcome {
    /// Last `accept()`/`drop()` call wins; `None` when neither ran.
    pub verdict: Option<RuleVerdict>,
    pub tags: Vec<String>,
}

/// Execute a compiled rule script against a request.
///
/// `drop()` also records a tag equal to the rule's own name, so every block
/// is attributable to its origin rule.
pub(crate) fn run(
    program: &Program,
    request: &Request,
    rule_name: &str,
) -> Result<RuleOutcome, EvalError> {
    let mut outcome = RuleOutcome::default();
    exec(&program.stmts, request, rule_name, &mut outcome)?;
    Ok(outcome)
}

fn exec(
    stmts: &[Stmt],
    request: &Request,
    rule_name: &str,
    outcome: &mut RuleOutcome,
) -> Result<(), EvalError> {
    for stmt in stmts {
        match stmt {
            Stmt::Accept => outcome.verdict = Some(RuleVerdict::Accept),
            Stmt::Drop => {
                outcome.verdict = Some(RuleVerdict::Drop);
                outcome.tags.push(rule_name.to_string());
            }
            Stmt::Mark(tag) => outcome.tags.push(tag.clone()),
            Stmt::If { cond, body } => {
                if eval_expr(cond, request)? {
                    exec(body, request, rule_name, outcome)?;
                }
            }
        }
    }
    Ok(())
}

enum Value<'a> {
    Str(Cow<'a, str>),
    Int(i64),
}

fn operand<'a>(op: &'a Operand, request: &'a Request) -> Value<'a> {
    match op {
        Operand::Str(s) => Value::Str(Cow::Borrowed(s)),
        Operand::Int(n) => Value::Int(*n),
        Operand::Field(field) => field_value(field, request),
    }
}

fn field_value<'a>(field: &'a Field, request: &'a Request) -> Value<'a> {
    match field {
        Field::Method => Value::Str(Cow::Borrowed(&request.method)),
        Field::Path => Value::Str(Cow::Borrowed(&request.path)),
        Field::Version => Value::Str(Cow::Borrowed(&request.version)),
        Field::Body => Value::Str(request.body_text()),
        Field::ClientIp => Value::Str(match request.client_ip {
            Some(ip) => Cow::Owned(ip.to_string()),
            None => Cow::Borrowed(""),
        }),
        Field::Port => Value::Int(i64::from(request.destination_port)),
        Field::Header(name) => Value::Str(Cow::Borrowed(request.header(name).unwrap_or(""))),
    }
}

fn eval_expr(expr: &Expr, request: &Request) -> Result<bool, EvalError> {
    match expr {
        Expr::And(left, right) => Ok(eval_expr(left, request)? && eval_expr(right, request)?),
        Expr::Or(left, right) => Ok(eval_expr(left, request)? || eval_expr(right, request)?),
        Expr::Not(inner) => Ok(!eval_expr(inner, request)?),
        Expr::Eq(left, right) => values_equal(left, right, request),
        Expr::Ne(left, right) => Ok(!values_equal(left, right, request)?),
        Expr::Contains(left, right) => {
            match (operand(left, request), operand(right, request)) {
                (Value::Str(haystack), Value::Str(needle)) => {
                    Ok(haystack.contains(needle.as_ref()))
                }
                _ => Err(EvalError::TypeMismatch("'contains' needs two strings")),
            }
        }
        Expr::Matches(subject, regex) => match operand(subject, request) {
            Value::Str(text) => Ok(regex.is_match(&text)),
            Value::Int(_) => Err(EvalError::TypeMismatch("'matches' needs a string subject")),
        },
    }
}

fn values_equal(left: &Operand, right: &Operand, request: &Request) -> Result<bool, EvalError> {
    match (operand(left, request), operand(right, request)) {
        (Value::Str(a), Value::Str(b)) => Ok(a == b),
        (Value::Int(a), Value::Int(b)) => Ok(a == b),
        _ => Err(EvalError::TypeMismatch(
            "'==' and '!=' need two strings or two integers",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse;

    fn req(path: &str, port: u16) -> Request {
        Request {
            method: "GET".to_string(),
            path: path.to_string(),
            version: "1.1".to_string(),
            destination_port: port,
            ..Request::default()
        }
    }

    fn outcome(source: &str, request: &Request) -> RuleOutcome {
        let program = parse(source).expect("script should parse");
        run(&program, request, "test_rule").expect("script should evaluate")
    }

    #[test]
    fn bare_drop_sets_verdict_and_auto_tag() {
        let out = outcome("drop()", &req("/", 80));
        assert_eq!(out.verdict, Some(RuleVerdict::Drop));
        assert_eq!(out.tags, vec!["test_rule"]);
    }

    #[test]
    fn mark_does_not_touch_verdict() {
        let out = outcome("mark(\"seen\")", &req("/", 80));
        assert_eq!(out.verdict, None);
        assert_eq!(out.tags, vec!["seen"]);
    }

    #[test]
    fn last_verdict_call_wins() {
        let out = outcome("drop()\naccept()", &req("/", 80));
        assert_eq!(out.verdict, Some(RuleVerdict::Accept));
        // The auto-tag from the earlier drop() call survives.
        assert_eq!(out.tags, vec!["test_rule"]);
    }

    #[test]
    fn condition_gates_the_body() {
        let src = "if path contains \"bad\" { drop() }";
        assert_eq!(outcome(src, &req("/bad", 80)).verdict, Some(RuleVerdict::Drop));
        assert_eq!(outcome(src, &req("/good", 80)).verdict, None);
    }

    #[test]
    fn port_compares_as_integer() {
        let src = "if port == 8080 { mark(\"svc\") }";
        assert_eq!(outcome(src, &req("/", 8080)).tags, vec!["svc"]);
        assert!(outcome(src, &req("/", 9090)).tags.is_empty());
    }

    #[test]
    fn regex_match_on_path() {
        let src = "if path matches \"^/api/v[0-9]+\" { mark(\"api\") }";
        assert_eq!(outcome(src, &req("/api/v1/users", 80)).tags, vec!["api"]);
        assert!(outcome(src, &req("/home", 80)).tags.is_empty());
    }

    #[test]
    fn header_lookup_is_exact_key_and_defaults_empty() {
        let mut request = req("/", 80);
        request
            .headers
            .insert("User-Agent".to_string(), "curl/8".to_string());
        let hit = outcome("if header(\"User-Agent\") contains \"curl\" { drop() }", &request);
        assert_eq!(hit.verdict, Some(RuleVerdict::Drop));
        let miss = outcome("if header(\"user-agent\") == \"\" { mark(\"absent\") }", &request);
        assert_eq!(miss.tags, vec!["absent"]);
    }

    #[test]
    fn client_ip_compares_as_string() {
        let mut request = req("/", 80);
        request.client_ip = Some("10.0.0.9".parse().unwrap());
        let out = outcome("if client_ip == \"10.0.0.9\" { drop() }", &request);
        assert_eq!(out.verdict, Some(RuleVerdict::Drop));
    }

    #[test]
    fn boolean_operators_combine() {
        let src = "if method == \"GET\" and (path contains \"/a\" or path contains \"/b\") { mark(\"hit\") }";
        assert_eq!(outcome(src, &req("/b/x", 80)).tags, vec!["hit"]);
        assert!(outcome(src, &req("/c", 80)).tags.is_empty());
    }

    #[test]
    fn type_mismatch_is_an_eval_error() {
        let program = parse("if port == \"8080\" { drop() }").unwrap();
        let err = run(&program, &req("/", 8080), "r").unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch(_)));
    }

    #[test]
    fn body_is_visible_as_lossy_text() {
        let mut request = req("/", 80);
        request.body = b"login=admin".to_vec();
        let out = outcome("if body contains \"admin\" { mark(\"admin\") }", &request);
        assert_eq!(out.tags, vec!["admin"]);
    }
}
