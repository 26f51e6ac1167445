//! Parsing of config file content into flat `key -> value` maps.
//!
//! Line based formats keep their keys as written. Structured formats (yaml, json, toml)
//! are flattened into dotted paths, with arrays rendered as compact json.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::{
    resources::{CfgFileFormat, FileFormatConfig},
    Error, Result,
};

pub type Parameters = BTreeMap<String, String>;

/// Parse `content` of `file` according to its declared format
pub fn parse(file: &str, content: &str, format: &FileFormatConfig) -> Result<Parameters> {
    let err = |reason: String| Error::ConfigParse {
        file: file.to_string(),
        format: format.format.to_string(),
        reason,
    };
    match format.format {
        CfgFileFormat::Ini => {
            let section = format
                .ini_config
                .as_ref()
                .and_then(|c| c.section_name.as_deref());
            parse_ini(content, section).map_err(err)
        }
        CfgFileFormat::Properties => parse_lines(content, LineSyntax::Properties).map_err(err),
        CfgFileFormat::Dotenv => parse_lines(content, LineSyntax::Dotenv).map_err(err),
        CfgFileFormat::Redis => parse_lines(content, LineSyntax::Redis).map_err(err),
        CfgFileFormat::Yaml => {
            let value: Value = if content.trim().is_empty() {
                Value::Null
            } else {
                serde_yaml::from_str(content).map_err(|e| err(e.to_string()))?
            };
            flatten_document(value).map_err(err)
        }
        CfgFileFormat::Json => {
            let value: Value = serde_json::from_str(content).map_err(|e| err(e.to_string()))?;
            flatten_document(value).map_err(err)
        }
        CfgFileFormat::Toml => {
            let table: toml::Table = toml::from_str(content).map_err(|e| err(e.to_string()))?;
            flatten_document(toml_to_json(toml::Value::Table(table))).map_err(err)
        }
    }
}

pub(crate) fn is_comment(line: &str, prefixes: &[char]) -> bool {
    line.is_empty() || line.starts_with(prefixes)
}

/// Parse a section header line, `Ok(None)` when the line is not a header
pub(crate) fn ini_section(line: &str) -> Result<Option<&str>, String> {
    if !line.starts_with('[') {
        return Ok(None);
    }
    line.strip_suffix(']')
        .map(|s| Some(s[1..].trim()))
        .ok_or_else(|| format!("unterminated section header {line:?}"))
}

pub(crate) fn ini_entry(line: &str) -> (&str, &str) {
    match line.split_once('=') {
        Some((k, v)) => (k.trim(), unquote(v.trim())),
        // a bare flag such as `skip-name-resolve`
        None => (line.trim(), ""),
    }
}

fn parse_ini(content: &str, pinned: Option<&str>) -> Result<Parameters, String> {
    let mut params = Parameters::new();
    let mut section: Option<String> = None;
    for raw in content.lines() {
        let line = raw.trim();
        if is_comment(line, &['#', ';']) {
            continue;
        }
        if let Some(name) = ini_section(line)? {
            section = Some(name.to_string());
            continue;
        }
        let (key, value) = ini_entry(line);
        let key = match (pinned, section.as_deref()) {
            (Some(pinned), Some(current)) if pinned == current => key.to_string(),
            (Some(_), _) => continue,
            (None, Some(current)) => format!("{current}.{key}"),
            (None, None) => key.to_string(),
        };
        params.insert(key, value.to_string());
    }
    Ok(params)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LineSyntax {
    Properties,
    Dotenv,
    Redis,
}

impl LineSyntax {
    pub(crate) fn comment_prefixes(&self) -> &'static [char] {
        match self {
            LineSyntax::Properties => &['#', '!'],
            LineSyntax::Dotenv | LineSyntax::Redis => &['#'],
        }
    }

    /// Split a non-comment line into key and value
    pub(crate) fn split<'a>(&self, line: &'a str) -> Result<(&'a str, &'a str), String> {
        match self {
            LineSyntax::Properties => {
                let at = line
                    .find(|c: char| c == '=' || c == ':' || c.is_whitespace())
                    .unwrap_or(line.len());
                let (key, rest) = line.split_at(at);
                let rest = rest.trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                Ok((key, rest.trim()))
            }
            LineSyntax::Dotenv => {
                let line = line.strip_prefix("export ").unwrap_or(line);
                let (key, value) = line
                    .split_once('=')
                    .ok_or_else(|| format!("expected KEY=VALUE, got {line:?}"))?;
                Ok((key.trim(), unquote(value.trim())))
            }
            LineSyntax::Redis => Ok(match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            }),
        }
    }

    pub(crate) fn render(&self, key: &str, value: &str) -> String {
        match self {
            LineSyntax::Properties | LineSyntax::Dotenv => format!("{key}={value}"),
            LineSyntax::Redis => format!("{key} {value}"),
        }
    }
}

fn parse_lines(content: &str, syntax: LineSyntax) -> Result<Parameters, String> {
    let mut params = Parameters::new();
    for raw in content.lines() {
        let line = raw.trim();
        if is_comment(line, syntax.comment_prefixes()) {
            continue;
        }
        let (key, value) = syntax.split(line)?;
        if key.is_empty() {
            return Err(format!("missing key in line {line:?}"));
        }
        // redis allows repeated directives such as `save`, they are kept together
        match params.get_mut(key) {
            Some(existing) if syntax == LineSyntax::Redis => {
                existing.push('\n');
                existing.push_str(value);
            }
            _ => {
                params.insert(key.to_string(), value.to_string());
            }
        }
    }
    Ok(params)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn flatten_document(value: Value) -> Result<Parameters, String> {
    let mut params = Parameters::new();
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, value) in map {
                flatten_into(&mut params, key, value);
            }
        }
        other => return Err(format!("expected a mapping at the top level, got {other}")),
    }
    Ok(params)
}

fn flatten_into(params: &mut Parameters, prefix: String, value: Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, value) in map {
                flatten_into(params, format!("{prefix}.{key}"), value);
            }
        }
        Value::String(s) => {
            params.insert(prefix, s);
        }
        Value::Null => {
            params.insert(prefix, String::new());
        }
        other => {
            params.insert(prefix, other.to_string());
        }
    }
}

pub(crate) fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(a) => Value::Array(a.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(t) => Value::Object(
            t.into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::resources::IniConfig;

    fn format(format: CfgFileFormat) -> FileFormatConfig {
        FileFormatConfig {
            format,
            ini_config: None,
        }
    }

    #[test]
    fn ini_with_pinned_section() {
        let content = indoc! {"
            [client]
            port=3306
            [mysqld]
            # comment
            max_connections = 100
            skip-name-resolve
        "};
        let config = FileFormatConfig {
            format: CfgFileFormat::Ini,
            ini_config: Some(IniConfig {
                section_name: Some("mysqld".into()),
            }),
        };
        let params = parse("my.cnf", content, &config).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["max_connections"], "100");
        assert_eq!(params["skip-name-resolve"], "");
    }

    #[test]
    fn ini_without_section_prefixes_keys() {
        let content = "top=1\n[mysqld]\nport=3306\n";
        let params = parse("my.cnf", content, &format(CfgFileFormat::Ini)).unwrap();
        assert_eq!(params["top"], "1");
        assert_eq!(params["mysqld.port"], "3306");
    }

    #[test]
    fn ini_rejects_broken_header() {
        let err = parse("my.cnf", "[mysqld\nport=1", &format(CfgFileFormat::Ini)).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn line_formats() {
        let props = parse(
            "app.properties",
            "a.b=1\nc: two\n! comment\nd three\n",
            &format(CfgFileFormat::Properties),
        )
        .unwrap();
        assert_eq!(props["a.b"], "1");
        assert_eq!(props["c"], "two");
        assert_eq!(props["d"], "three");

        let env = parse("env", "export A=\"x y\"\nB=2\n", &format(CfgFileFormat::Dotenv)).unwrap();
        assert_eq!(env["A"], "x y");
        assert!(parse("env", "NOEQUALS\n", &format(CfgFileFormat::Dotenv)).is_err());

        let redis = parse(
            "redis.conf",
            "maxmemory 1gb\nsave 900 1\nsave 300 10\n",
            &format(CfgFileFormat::Redis),
        )
        .unwrap();
        assert_eq!(redis["maxmemory"], "1gb");
        assert_eq!(redis["save"], "900 1\n300 10");
    }

    #[test]
    fn structured_formats_flatten() {
        let yaml = indoc! {"
            server:
              port: 8080
              hosts: [a, b]
            debug: true
        "};
        let params = parse("app.yaml", yaml, &format(CfgFileFormat::Yaml)).unwrap();
        assert_eq!(params["server.port"], "8080");
        assert_eq!(params["server.hosts"], r#"["a","b"]"#);
        assert_eq!(params["debug"], "true");

        let toml = "[server]\nport = 8080\nname = \"db\"\n";
        let params = parse("app.toml", toml, &format(CfgFileFormat::Toml)).unwrap();
        assert_eq!(params["server.port"], "8080");
        assert_eq!(params["server.name"], "db");

        assert!(parse("app.json", "[1, 2]", &format(CfgFileFormat::Json)).is_err());
    }
}
