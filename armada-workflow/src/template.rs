//! Step parameter templates
//!
//! String values inside `params_template` may contain `{{expr}}`
//! placeholders:
//!
//! | Expression            | Resolves to                                  |
//! |-----------------------|----------------------------------------------|
//! | `previous`            | result of the previous step (`null` at step 0) |
//! | `previous.a.b`        | field path into the previous result          |
//! | `steps.N`             | result of step `N` (0-based, earlier steps only) |
//! | `steps.N.a.b`         | field path into that result                  |
//! | `cycle.name`          | name of the running cycle                    |
//!
//! A string that is exactly one placeholder is replaced by the resolved JSON
//! value, keeping its type. Placeholders embedded in longer text are spliced
//! in as text. Numeric path segments index into arrays.

use serde_json::Value;

/// Values available to placeholders while rendering one step.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub cycle: &'a str,
    /// Results of the steps that already completed, in order.
    pub steps: &'a [Value],
}

impl<'a> TemplateContext<'a> {
    pub fn new(cycle: &'a str, steps: &'a [Value]) -> Self {
        Self { cycle, steps }
    }

    fn resolve(&self, expr: &str) -> Result<Value, String> {
        let mut segments = expr.split('.').map(str::trim);
        let root = segments.next().unwrap_or_default();

        let (base, rest): (Value, Vec<&str>) = match root {
            "previous" => (
                self.steps.last().cloned().unwrap_or(Value::Null),
                segments.collect(),
            ),
            "steps" => {
                let index = segments
                    .next()
                    .ok_or_else(|| "`steps` needs an index".to_string())?;
                let index: usize = index
                    .parse()
                    .map_err(|_| format!("invalid step index `{}`", index))?;
                let value = self.steps.get(index).cloned().ok_or_else(|| {
                    format!("step {} has no result yet", index)
                })?;
                (value, segments.collect())
            }
            "cycle" => {
                return match segments.next() {
                    Some("name") if segments.next().is_none() => {
                        Ok(Value::String(self.cycle.to_string()))
                    }
                    _ => Err(format!("unknown placeholder `{}`", expr)),
                };
            }
            _ => return Err(format!("unknown placeholder `{}`", expr)),
        };

        lookup(&base, &rest).ok_or_else(|| format!("`{}` does not resolve", expr))
    }
}

fn lookup(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Render `template` against `ctx`, returning the concrete parameters.
pub fn render(template: &Value, ctx: &TemplateContext<'_>) -> Result<Value, String> {
    match template {
        Value::String(text) => render_string(text, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rendered.insert(key.clone(), render(value, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(text: &str, ctx: &TemplateContext<'_>) -> Result<Value, String> {
    if let Some(expr) = whole_placeholder(text) {
        return ctx.resolve(expr);
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let end = rest[start..]
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder in `{}`", text))?;
        out.push_str(&rest[..start]);
        let expr = rest[start + 2..start + end].trim();
        match ctx.resolve(expr)? {
            Value::String(s) => out.push_str(&s),
            value => out.push_str(&value.to_string()),
        }
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

/// `Some(expr)` when `text` is exactly `{{ expr }}`.
fn whole_placeholder(text: &str) -> Option<&str> {
    let inner = text.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
