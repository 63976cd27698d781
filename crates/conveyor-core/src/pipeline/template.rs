// Dotted-path template resolution
//
// Steps reference values as `steps.<name>.<field>`, `trigger.<field>`,
// `meta.<field>` or a bare path into the working values. The reserved
// prefixes always win: user data cannot shadow `steps`, `trigger` or
// `meta` because those roots are consulted before the working values.

use serde_json::Value;

use super::context::PipelineContext;
use crate::value::{DataMap, DataMapExt};

/// Resolve a dotted path against the pipeline context.
pub fn resolve<'a>(ctx: &'a PipelineContext, path: &str) -> Option<&'a Value> {
    if let Some(rest) = path.strip_prefix("steps.") {
        let (step, field) = rest.split_once('.')?;
        return ctx.step_outputs.get(step)?.lookup_path(field);
    }
    if let Some(rest) = path.strip_prefix("trigger.") {
        return ctx.trigger_data.lookup_path(rest);
    }
    if let Some(rest) = path.strip_prefix("meta.") {
        return ctx.metadata.lookup_path(rest);
    }
    // Reserved roots are never served from user data, even as bare keys.
    match path {
        "steps" | "trigger" | "meta" => None,
        _ => ctx.current.lookup_path(path),
    }
}

/// Render a string containing `{{path}}` placeholders. A string that is a
/// single placeholder resolves to the referenced value with its type
/// preserved; otherwise placeholders are replaced inline with their string
/// rendering and unresolved references become empty.
pub fn render(ctx: &PipelineContext, template: &str) -> Value {
    let trimmed = template.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{") {
        let path = trimmed[2..trimmed.len() - 2].trim();
        return resolve(ctx, path).cloned().unwrap_or(Value::Null);
    }

    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match tail.find("}}") {
            Some(end) => {
                let path = tail[..end].trim();
                if let Some(value) = resolve(ctx, path) {
                    match value {
                        Value::String(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                rest = &tail[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// Deep-render a config value: strings go through [`render`], arrays and
/// objects recurse, everything else passes through.
pub fn render_value(ctx: &PipelineContext, value: &Value) -> Value {
    match value {
        Value::String(s) => render(ctx, s),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(ctx, v)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render_value(ctx, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render every value of a config map.
pub fn render_map(ctx: &PipelineContext, map: &DataMap) -> DataMap {
    map.iter()
        .map(|(k, v)| (k.clone(), render_value(ctx, v)))
        .collect()
}
