//! Single-pass template resolver
//!
//! A template is a string in which `{{ expr }}` fragments are substituted
//! against the execution context. Supported expression forms:
//!
//! - `input.<path>` - dotted path into the workflow input
//! - `tasks.<id>.output.<path>` - dotted path into a completed step's output
//! - `<itemVar>` / `<itemVar>.<path>` - the current forEach element
//!   (plus the implicit `index` and `isLast` bindings)
//! - numeric / string / boolean literals
//!
//! Resolution is string-preserving when embedded in surrounding text and
//! type-preserving when the entire template is a single expression:
//! `"{{ input.count }}"` yields a number, not `"42"`.
//!
//! Whitespace inside `{{ }}` is ignored. Nested templates are rejected.

use std::ops::Range;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::ResolutionScope;
use crate::error::StepError;

// ============================================================================
// EXPRESSIONS
// ============================================================================

/// A parsed `{{ ... }}` expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateExpr {
    /// `input.a.b`
    Input(Vec<String>),
    /// `tasks.<id>.output.a.b` (path may be empty: the whole output map)
    TaskOutput { step: String, path: Vec<String> },
    /// Bare identifier head: forEach itemVar (or `index` / `isLast`)
    Scoped { var: String, path: Vec<String> },
    /// Quoted string, number, or boolean literal
    Literal(Value),
}

impl TemplateExpr {
    /// Dotted display form used in error messages and usage analysis.
    pub fn display_path(&self) -> String {
        match self {
            TemplateExpr::Input(path) => format!("input.{}", path.join(".")),
            TemplateExpr::TaskOutput { step, path } => {
                if path.is_empty() {
                    format!("tasks.{step}.output")
                } else {
                    format!("tasks.{}.output.{}", step, path.join("."))
                }
            }
            TemplateExpr::Scoped { var, path } => {
                if path.is_empty() {
                    var.clone()
                } else {
                    format!("{}.{}", var, path.join("."))
                }
            }
            TemplateExpr::Literal(v) => v.to_string(),
        }
    }
}

/// A fragment of a parsed template.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Literal text (range into the original string).
    Literal(Range<usize>),
    /// A substitution expression.
    Expr(TemplateExpr),
}

/// Parsed template, ready for repeated resolution.
#[derive(Debug, Clone)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unterminated '{{{{' at byte {0}")]
    Unterminated(usize),
    #[error("nested template inside '{{{{ }}}}'")]
    Nested,
    #[error("empty expression inside '{{{{ }}}}'")]
    EmptyExpr,
    #[error("malformed expression '{0}'")]
    BadExpr(String),
}

// ============================================================================
// PARSING
// ============================================================================

impl Template {
    /// Tokenize a template string in a single pass.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let bytes = raw.as_bytes();
        let mut segments = Vec::new();
        let mut literal_start = 0;
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
                if i > literal_start {
                    segments.push(Segment::Literal(literal_start..i));
                }
                let expr_start = i + 2;
                let Some(rel_end) = raw[expr_start..].find("}}") else {
                    return Err(TemplateError::Unterminated(i));
                };
                let inner = &raw[expr_start..expr_start + rel_end];
                if inner.contains("{{") {
                    return Err(TemplateError::Nested);
                }
                segments.push(Segment::Expr(parse_expr(inner)?));
                i = expr_start + rel_end + 2;
                literal_start = i;
            } else {
                i += 1;
            }
        }

        if literal_start < raw.len() {
            segments.push(Segment::Literal(literal_start..raw.len()));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// All substitution expressions, in order of appearance.
    pub fn exprs(&self) -> impl Iterator<Item = &TemplateExpr> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(e) => Some(e),
            Segment::Literal(_) => None,
        })
    }

    /// True when the template is exactly one expression with no
    /// surrounding text - the type-preserving case.
    pub fn is_single_expr(&self) -> bool {
        self.segments.len() == 1 && matches!(self.segments[0], Segment::Expr(_))
    }
}

/// Parse the inside of one `{{ ... }}`.
pub fn parse_expr(inner: &str) -> Result<TemplateExpr, TemplateError> {
    let expr = inner.trim();
    if expr.is_empty() {
        return Err(TemplateError::EmptyExpr);
    }

    // Quoted string literal
    if (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2)
        || (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
    {
        return Ok(TemplateExpr::Literal(Value::String(
            expr[1..expr.len() - 1].to_string(),
        )));
    }

    // Boolean literals
    if expr == "true" {
        return Ok(TemplateExpr::Literal(Value::Bool(true)));
    }
    if expr == "false" {
        return Ok(TemplateExpr::Literal(Value::Bool(false)));
    }

    // Numeric literals
    if let Ok(n) = expr.parse::<i64>() {
        return Ok(TemplateExpr::Literal(Value::from(n)));
    }
    if let Ok(f) = expr.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(f) {
            return Ok(TemplateExpr::Literal(Value::Number(num)));
        }
    }

    // Dotted path
    let parts: Vec<&str> = expr.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) || !parts.iter().all(|p| is_path_segment(p)) {
        return Err(TemplateError::BadExpr(expr.to_string()));
    }

    match parts[0] {
        "input" => {
            if parts.len() < 2 {
                return Err(TemplateError::BadExpr(expr.to_string()));
            }
            Ok(TemplateExpr::Input(
                parts[1..].iter().map(|s| s.to_string()).collect(),
            ))
        }
        "tasks" => {
            // tasks.<id>.output[.<path>]
            if parts.len() < 3 || parts[2] != "output" {
                return Err(TemplateError::BadExpr(expr.to_string()));
            }
            Ok(TemplateExpr::TaskOutput {
                step: parts[1].to_string(),
                path: parts[3..].iter().map(|s| s.to_string()).collect(),
            })
        }
        head => Ok(TemplateExpr::Scoped {
            var: head.to_string(),
            path: parts[1..].iter().map(|s| s.to_string()).collect(),
        }),
    }
}

fn is_path_segment(seg: &str) -> bool {
    !seg.is_empty()
        && seg
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

// ============================================================================
// RESOLUTION
// ============================================================================

impl Template {
    /// Resolve against a scope, preserving the value type for
    /// single-expression templates.
    pub fn resolve(&self, scope: &ResolutionScope<'_>) -> Result<Value, StepError> {
        if self.is_single_expr() {
            if let Segment::Expr(expr) = &self.segments[0] {
                return resolve_expr(expr, scope);
            }
        }

        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(range) => out.push_str(&self.raw[range.clone()]),
                Segment::Expr(expr) => {
                    let value = resolve_expr(expr, scope)?;
                    out.push_str(&value_to_string(&value));
                }
            }
        }
        Ok(Value::String(out))
    }

    /// Best-effort resolution for dry runs: resolvable expressions are
    /// substituted, the rest are left verbatim. Never fails.
    pub fn resolve_partial(&self, scope: &ResolutionScope<'_>) -> Value {
        if self.is_single_expr() {
            if let Segment::Expr(expr) = &self.segments[0] {
                if let Ok(value) = resolve_expr(expr, scope) {
                    return value;
                }
                return Value::String(self.raw.clone());
            }
        }

        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(range) => out.push_str(&self.raw[range.clone()]),
                Segment::Expr(expr) => match resolve_expr(expr, scope) {
                    Ok(value) => out.push_str(&value_to_string(&value)),
                    Err(_) => {
                        out.push_str("{{ ");
                        out.push_str(&expr.display_path());
                        out.push_str(" }}");
                    }
                },
            }
        }
        Value::String(out)
    }
}

/// Resolve one expression to a typed value.
pub fn resolve_expr(
    expr: &TemplateExpr,
    scope: &ResolutionScope<'_>,
) -> Result<Value, StepError> {
    let unresolved = || StepError::TemplateUnresolved {
        path: expr.display_path(),
    };

    match expr {
        TemplateExpr::Literal(v) => Ok(v.clone()),
        TemplateExpr::Input(path) => {
            let root = scope
                .input_root()
                .get(&path[0])
                .ok_or_else(unresolved)?;
            walk_path(root, &path[1..]).ok_or_else(unresolved)
        }
        TemplateExpr::TaskOutput { step, path } => {
            let output = scope.task_output(step).ok_or_else(unresolved)?;
            walk_path(output, path).ok_or_else(unresolved)
        }
        TemplateExpr::Scoped { var, path } => {
            let root = scope.scoped(var).ok_or_else(unresolved)?;
            walk_path(&root, path).ok_or_else(unresolved)
        }
    }
}

/// Walk a dotted path through objects and arrays (numeric segments index
/// into arrays).
fn walk_path(root: &Value, path: &[String]) -> Option<Value> {
    let mut current = root;
    for seg in path {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// String form used when a value is embedded in surrounding text.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// CONVENIENCE HELPERS
// ============================================================================

/// Parse + resolve in one step. A syntax error surfaces as an unresolved
/// template naming the raw string (the validator rejects these earlier).
pub fn resolve_str(raw: &str, scope: &ResolutionScope<'_>) -> Result<Value, StepError> {
    let template = Template::parse(raw).map_err(|_| StepError::TemplateUnresolved {
        path: raw.to_string(),
    })?;
    template.resolve(scope)
}

/// Resolve a map of field -> template into a map of field -> value.
pub fn resolve_map(
    bindings: &std::collections::BTreeMap<String, String>,
    scope: &ResolutionScope<'_>,
) -> Result<Map<String, Value>, StepError> {
    let mut out = Map::new();
    for (field, raw) in bindings {
        out.insert(field.clone(), resolve_str(raw, scope)?);
    }
    Ok(out)
}

/// Lenient map resolution for dry runs.
pub fn resolve_map_partial(
    bindings: &std::collections::BTreeMap<String, String>,
    scope: &ResolutionScope<'_>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (field, raw) in bindings {
        let value = match Template::parse(raw) {
            Ok(t) => t.resolve_partial(scope),
            Err(_) => Value::String(raw.clone()),
        };
        out.insert(field.clone(), value);
    }
    out
}

/// Expand a URL template against a flat value map (the step's resolved
/// input). Bare identifiers and `input.<field>` both read from the map;
/// task output references are not allowed in URLs.
pub fn expand_with_map(raw: &str, map: &Map<String, Value>) -> Result<String, StepError> {
    let template = Template::parse(raw).map_err(|_| StepError::TemplateUnresolved {
        path: raw.to_string(),
    })?;

    let mut out = String::with_capacity(raw.len());
    for segment in &template.segments {
        match segment {
            Segment::Literal(range) => out.push_str(&template.raw[range.clone()]),
            Segment::Expr(expr) => {
                let unresolved = || StepError::TemplateUnresolved {
                    path: expr.display_path(),
                };
                let value = match expr {
                    TemplateExpr::Literal(v) => v.clone(),
                    TemplateExpr::Input(path) => {
                        let root = map.get(&path[0]).ok_or_else(unresolved)?;
                        walk_path(root, &path[1..]).ok_or_else(unresolved)?
                    }
                    TemplateExpr::Scoped { var, path } => {
                        let root = map.get(var).ok_or_else(unresolved)?;
                        walk_path(root, path).ok_or_else(unresolved)?
                    }
                    TemplateExpr::TaskOutput { .. } => return Err(unresolved()),
                };
                out.push_str(&value_to_string(&value));
            }
        }
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionContext, ForEachScope, TaskState, TaskStatus};
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        let mut input = Map::new();
        input.insert("count".into(), json!(42));
        input.insert("name".into(), json!("ada"));
        input.insert("nested".into(), json!({"a": {"b": "deep"}}));
        input.insert("ids".into(), json!(["u1", "u2"]));

        let mut ctx = ExecutionContext::new(input);
        let mut state = TaskState::empty(TaskStatus::Succeeded);
        state.output = Some(json!({"value": 7, "user": {"email": "a@b.c"}}));
        ctx.record("fetch", state);
        ctx.record("skipped", TaskState::skipped("condition evaluated to false"));
        ctx
    }

    #[test]
    fn single_expression_preserves_type() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);

        assert_eq!(resolve_str("{{ input.count }}", &scope).unwrap(), json!(42));
        assert_eq!(
            resolve_str("{{ tasks.fetch.output.value }}", &scope).unwrap(),
            json!(7)
        );
        assert_eq!(resolve_str("{{ true }}", &scope).unwrap(), json!(true));
        assert_eq!(resolve_str("{{ 3 }}", &scope).unwrap(), json!(3));
    }

    #[test]
    fn embedded_expressions_become_strings() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);

        assert_eq!(
            resolve_str("count={{ input.count }}!", &scope).unwrap(),
            json!("count=42!")
        );
        assert_eq!(
            resolve_str("{{ input.name }} <{{ tasks.fetch.output.user.email }}>", &scope).unwrap(),
            json!("ada <a@b.c>")
        );
    }

    #[test]
    fn whitespace_inside_braces_is_ignored() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);
        assert_eq!(
            resolve_str("{{input.count}}", &scope).unwrap(),
            resolve_str("{{   input.count   }}", &scope).unwrap()
        );
    }

    #[test]
    fn dotted_paths_and_array_indices() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);

        assert_eq!(
            resolve_str("{{ input.nested.a.b }}", &scope).unwrap(),
            json!("deep")
        );
        assert_eq!(
            resolve_str("{{ input.ids.1 }}", &scope).unwrap(),
            json!("u2")
        );
    }

    #[test]
    fn unresolved_path_names_the_path() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);

        let err = resolve_str("{{ input.missing }}", &scope).unwrap_err();
        match err {
            StepError::TemplateUnresolved { path } => assert_eq!(path, "input.missing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn skipped_step_output_is_unresolved() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);

        let err = resolve_str("{{ tasks.skipped.output.id }}", &scope).unwrap_err();
        match err {
            StepError::TemplateUnresolved { path } => {
                assert_eq!(path, "tasks.skipped.output.id")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn for_each_scope_resolution() {
        let ctx = ctx();
        let frame = ForEachScope {
            var: "id".into(),
            item: json!({"sku": "X9"}),
            index: 1,
            is_last: false,
        };
        let scope = ResolutionScope::with_for_each(&ctx, &frame);

        assert_eq!(resolve_str("{{ id.sku }}", &scope).unwrap(), json!("X9"));
        assert_eq!(resolve_str("{{ index }}", &scope).unwrap(), json!(1));
        assert_eq!(resolve_str("{{ isLast }}", &scope).unwrap(), json!(false));
    }

    #[test]
    fn nested_templates_rejected() {
        assert_eq!(
            Template::parse("{{ a {{ b }} }}").unwrap_err(),
            TemplateError::Nested
        );
    }

    #[test]
    fn unterminated_template_rejected() {
        assert!(matches!(
            Template::parse("before {{ input.x").unwrap_err(),
            TemplateError::Unterminated(_)
        ));
    }

    #[test]
    fn malformed_expressions_rejected() {
        assert!(Template::parse("{{ }}").is_err());
        assert!(Template::parse("{{ input. }}").is_err());
        assert!(Template::parse("{{ tasks.a.result }}").is_err());
        assert!(Template::parse("{{ a b }}").is_err());
    }

    #[test]
    fn partial_resolution_keeps_unknown_refs() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);
        let template = Template::parse("x={{ tasks.later.output.v }} y={{ input.count }}").unwrap();

        assert_eq!(
            template.resolve_partial(&scope),
            json!("x={{ tasks.later.output.v }} y=42")
        );
    }

    #[test]
    fn url_expansion_from_input_map() {
        let mut map = Map::new();
        map.insert("id".into(), json!("u-9"));
        map.insert("page".into(), json!(2));

        let url =
            expand_with_map("https://api.example.com/users/{{ id }}?page={{ page }}", &map)
                .unwrap();
        assert_eq!(url, "https://api.example.com/users/u-9?page=2");

        let err = expand_with_map("https://x/{{ tasks.a.output.id }}", &map).unwrap_err();
        assert!(matches!(err, StepError::TemplateUnresolved { .. }));
    }

    #[test]
    fn resolve_map_collects_all_fields() {
        let ctx = ctx();
        let scope = ResolutionScope::new(&ctx);
        let mut bindings = std::collections::BTreeMap::new();
        bindings.insert("n".to_string(), "{{ input.count }}".to_string());
        bindings.insert("who".to_string(), "hi {{ input.name }}".to_string());

        let resolved = resolve_map(&bindings, &scope).unwrap();
        assert_eq!(resolved.get("n"), Some(&json!(42)));
        assert_eq!(resolved.get("who"), Some(&json!("hi ada")));
    }
}
