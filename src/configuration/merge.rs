use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::format::{ini_entry, ini_section, is_comment, toml_to_json, LineSyntax};
use crate::{
    resources::{CfgFileFormat, FileFormatConfig},
    Error, Result,
};

/// Parameter updates for one file; `None` removes the parameter
pub type ParameterUpdates = BTreeMap<String, Option<String>>;

/// Write `updates` back into the content of a config file, keeping its format
///
/// Keys follow the naming of [`super::parse`]: section-prefixed for ini files without a
/// pinned section, dotted paths for structured formats.
pub fn merge_parameters(
    file: &str,
    content: &str,
    format: &FileFormatConfig,
    updates: &ParameterUpdates,
) -> Result<String> {
    let err = |reason: String| Error::ConfigParse {
        file: file.to_string(),
        format: format.format.to_string(),
        reason,
    };
    match format.format {
        CfgFileFormat::Ini => {
            let pinned = format
                .ini_config
                .as_ref()
                .and_then(|c| c.section_name.as_deref());
            merge_ini(content, pinned, updates).map_err(err)
        }
        CfgFileFormat::Properties => Ok(merge_lines(content, LineSyntax::Properties, updates)),
        CfgFileFormat::Dotenv => Ok(merge_lines(content, LineSyntax::Dotenv, updates)),
        CfgFileFormat::Redis => Ok(merge_lines(content, LineSyntax::Redis, updates)),
        CfgFileFormat::Yaml => {
            let mut doc: Value = if content.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                serde_yaml::from_str(content).map_err(|e| err(e.to_string()))?
            };
            apply_paths(&mut doc, updates).map_err(err)?;
            serde_yaml::to_string(&doc).map_err(|e| err(e.to_string()))
        }
        CfgFileFormat::Json => {
            let mut doc: Value = serde_json::from_str(content).map_err(|e| err(e.to_string()))?;
            apply_paths(&mut doc, updates).map_err(err)?;
            serde_json::to_string_pretty(&doc).map_err(|e| err(e.to_string()))
        }
        CfgFileFormat::Toml => {
            let table: toml::Table = toml::from_str(content).map_err(|e| err(e.to_string()))?;
            let mut doc = toml_to_json(toml::Value::Table(table));
            apply_paths(&mut doc, updates).map_err(err)?;
            toml::to_string(&doc).map_err(|e| err(e.to_string()))
        }
    }
}

/// Section each line belongs to, `None` before the first header
fn line_sections(lines: &[String]) -> Result<Vec<Option<String>>, String> {
    let mut current = None;
    let mut sections = Vec::with_capacity(lines.len());
    for line in lines {
        if let Some(name) = ini_section(line.trim())? {
            current = Some(name.to_string());
        }
        sections.push(current.clone());
    }
    Ok(sections)
}

fn merge_ini(content: &str, pinned: Option<&str>, updates: &ParameterUpdates) -> Result<String, String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for (key, value) in updates {
        let (section, key) = match pinned {
            Some(pinned) => (Some(pinned.to_string()), key.as_str()),
            None => match key.split_once('.') {
                Some((section, key)) => (Some(section.to_string()), key),
                None => (None, key.as_str()),
            },
        };
        let sections = line_sections(&lines)?;
        let position = lines.iter().enumerate().position(|(i, line)| {
            let line = line.trim();
            sections[i] == section
                && !is_comment(line, &['#', ';'])
                && !line.starts_with('[')
                && ini_entry(line).0 == key
        });

        match (position, value) {
            (Some(i), Some(value)) => lines[i] = format!("{key}={value}"),
            (Some(i), None) => {
                lines.remove(i);
            }
            (None, None) => {}
            (None, Some(value)) => {
                let entry = format!("{key}={value}");
                // insert after the last line of the section
                let end = sections.iter().rposition(|s| *s == section);
                match (end, &section) {
                    (Some(end), _) => lines.insert(end + 1, entry),
                    (None, None) => lines.insert(0, entry),
                    (None, Some(name)) => {
                        lines.push(format!("[{name}]"));
                        lines.push(entry);
                    }
                }
            }
        }
    }

    let mut merged = lines.join("\n");
    merged.push('\n');
    Ok(merged)
}

fn merge_lines(content: &str, syntax: LineSyntax, updates: &ParameterUpdates) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for (key, value) in updates {
        let matches = |line: &String| {
            let line = line.trim();
            !is_comment(line, syntax.comment_prefixes())
                && syntax.split(line).map_or(false, |(k, _)| k == key)
        };
        let first = lines.iter().position(matches);
        lines.retain(|l| !matches(l));

        if let Some(value) = value {
            let rendered: Vec<String> = value
                .split('\n')
                .map(|v| syntax.render(key, v))
                .collect();
            let at = first.unwrap_or(lines.len()).min(lines.len());
            lines.splice(at..at, rendered);
        }
    }

    let mut merged = lines.join("\n");
    merged.push('\n');
    merged
}

fn parse_scalar(value: &str) -> Value {
    if value.starts_with('[') || value.starts_with('{') {
        if let Ok(v) = serde_json::from_str(value) {
            return v;
        }
    }
    match value {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = value.parse::<i64>() {
        return Value::from(i);
    }
    match value.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::String(value.to_string()),
    }
}

fn apply_paths(doc: &mut Value, updates: &ParameterUpdates) -> Result<(), String> {
    if doc.is_null() {
        *doc = Value::Object(Map::new());
    }
    let Value::Object(root) = doc else {
        return Err("expected a mapping at the top level".into());
    };
    for (path, value) in updates {
        let segments: Vec<&str> = path.split('.').collect();
        apply_path(root, &segments, value.as_deref(), path)?;
    }
    Ok(())
}

/// Set or remove the value at `segments` below `node`; removing a missing path is a no-op
fn apply_path(
    node: &mut Map<String, Value>,
    segments: &[&str],
    value: Option<&str>,
    path: &str,
) -> Result<(), String> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };
    if rest.is_empty() {
        match value {
            Some(v) => {
                node.insert(head.to_string(), parse_scalar(v));
            }
            None => {
                node.remove(*head);
            }
        }
        return Ok(());
    }
    if value.is_none() && !node.get(*head).map_or(false, Value::is_object) {
        return Ok(());
    }
    match node
        .entry(head.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
    {
        Value::Object(child) => apply_path(child, rest, value, path),
        _ => Err(format!("cannot set {path}: {head} is not a mapping")),
    }
}
