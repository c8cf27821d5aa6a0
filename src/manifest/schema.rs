//! Manifest schema, interpreted from a format-neutral JSON value.
//!
//! Both the current layout (`compilation`, `sources[].name`, `postprocess`)
//! and the older one (`process`, `sources[].filename` + `usage`, top-level
//! `stamp`) are accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::submission::{FileAttributes, FileRole, PostProcess};

/// Declared usage of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Usage {
    Toplevel,
    Include,
    Ignore,
    Append,
}

impl Usage {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "toplevel" | "entry" => Some(Usage::Toplevel),
            "include" | "included" => Some(Usage::Include),
            "ignore" | "ignored" => Some(Usage::Ignore),
            "append" | "appended" => Some(Usage::Append),
            _ => None,
        }
    }

    fn role(self) -> FileRole {
        match self {
            Usage::Toplevel => FileRole::Entry,
            Usage::Include => FileRole::Included,
            Usage::Ignore => FileRole::Ignored,
            Usage::Append => FileRole::Appended,
        }
    }
}

/// One `sources[]` item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDirective {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub included: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appended: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_comments: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landscape: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub font_maps: Vec<String>,
}

/// Why a source directive could not yield a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleConflict {
    /// Two or more mutually exclusive flags are set
    Exclusive,
}

impl SourceDirective {
    /// Role requested by this directive.
    ///
    /// `appended`, `ignored` and `included` are mutually exclusive, and must
    /// agree with `usage` when both are given. No role information at all
    /// means the file is a top-level entry.
    pub fn role(&self) -> Result<FileRole, RoleConflict> {
        let mut flagged: Vec<FileRole> = Vec::new();
        if self.appended == Some(true) {
            flagged.push(FileRole::Appended);
        }
        if self.ignored == Some(true) {
            flagged.push(FileRole::Ignored);
        }
        if self.included == Some(true) {
            flagged.push(FileRole::Included);
        }
        if self.entry == Some(true) {
            flagged.push(FileRole::Entry);
        }
        if let Some(usage) = self.usage {
            let role = usage.role();
            if !flagged.contains(&role) {
                flagged.push(role);
            }
        }
        match flagged.as_slice() {
            [] => Ok(FileRole::Entry),
            [role] => Ok(*role),
            _ => Err(RoleConflict::Exclusive),
        }
    }

    /// Attributes requested by this directive.
    pub fn attributes(&self) -> FileAttributes {
        FileAttributes {
            landscape: self.landscape.unwrap_or(false),
            keep_comments: self.keep_comments.unwrap_or(false),
            font_maps: self.font_maps.clone(),
        }
    }
}

/// A malformed value found while interpreting the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    pub name: String,
    pub key: String,
    pub value: String,
}

/// Interpreted manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub font_maps: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceDirective>,
    #[serde(default)]
    pub postprocess: PostProcess,
    #[serde(skip)]
    pub issues: Vec<SchemaIssue>,
}

/// Accepts real booleans plus the usual string and integer spellings.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::String(s) => Some(vec![s.clone()]),
        _ => None,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct Reader<'a> {
    issues: &'a mut Vec<SchemaIssue>,
}

impl Reader<'_> {
    fn issue(&mut self, name: &str, key: &str, value: &Value) {
        self.issues.push(SchemaIssue {
            name: name.to_string(),
            key: key.to_string(),
            value: render(value),
        });
    }

    fn bool_at(&mut self, obj: &serde_json::Map<String, Value>, name: &str, key: &str) -> Option<bool> {
        let value = obj.get(key)?;
        if value.is_null() {
            return None;
        }
        let parsed = parse_bool(value);
        if parsed.is_none() {
            self.issue(name, key, value);
        }
        parsed
    }

    fn list_at(&mut self, obj: &serde_json::Map<String, Value>, name: &str, key: &str) -> Vec<String> {
        match obj.get(key) {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => string_list(value).unwrap_or_else(|| {
                self.issue(name, key, value);
                Vec::new()
            }),
        }
    }
}

impl Manifest {
    /// Interprets a decoded manifest document.
    pub fn from_value(doc: &Value) -> Self {
        let mut manifest = Manifest::default();
        let Some(root) = doc.as_object() else {
            manifest.issues.push(SchemaIssue {
                name: String::new(),
                key: String::new(),
                value: render(doc),
            });
            return manifest;
        };
        let mut issues = Vec::new();
        let mut reader = Reader {
            issues: &mut issues,
        };

        let compilation = root
            .get("compilation")
            .or_else(|| root.get("process"))
            .and_then(Value::as_object);
        if let Some(compilation) = compilation {
            manifest.compiler = match compilation.get("compiler") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => {
                    reader.issue("compilation", "compiler", other);
                    None
                }
            };
            manifest.font_maps = reader.list_at(compilation, "compilation", "fontmaps");
        }

        if let Some(sources) = root.get("sources") {
            match sources {
                Value::Array(items) => {
                    for item in items {
                        if let Some(directive) = Self::source(item, &mut reader) {
                            manifest.sources.push(directive);
                        }
                    }
                }
                other => reader.issue("sources", "sources", other),
            }
        }

        let postprocess = root.get("postprocess").and_then(Value::as_object);
        if let Some(post) = postprocess {
            manifest.postprocess.stamp = reader.bool_at(post, "postprocess", "stamp").unwrap_or(false);
            manifest.postprocess.assembling_files =
                reader.list_at(post, "postprocess", "assembling_files");
        }
        if let Some(stamp) = reader.bool_at(root, "", "stamp") {
            manifest.postprocess.stamp = stamp;
        }

        manifest.issues = issues;
        manifest
    }

    fn source(item: &Value, reader: &mut Reader<'_>) -> Option<SourceDirective> {
        let obj = match item {
            Value::String(name) => {
                return Some(SourceDirective {
                    name: name.clone(),
                    ..Default::default()
                })
            }
            Value::Object(obj) => obj,
            other => {
                reader.issue("sources", "item", other);
                return None;
            }
        };
        let Some(name) = obj
            .get("name")
            .or_else(|| obj.get("filename"))
            .and_then(Value::as_str)
        else {
            reader.issue("sources", "name", item);
            return None;
        };

        let mut directive = SourceDirective {
            name: name.to_string(),
            ..Default::default()
        };
        if let Some(usage) = obj.get("usage") {
            match usage.as_str().and_then(Usage::parse) {
                Some(u) => directive.usage = Some(u),
                None => reader.issue(name, "usage", usage),
            }
        }
        directive.entry = reader
            .bool_at(obj, name, "entry")
            .or_else(|| reader.bool_at(obj, name, "toplevel"));
        directive.ignored = reader.bool_at(obj, name, "ignored");
        directive.included = reader.bool_at(obj, name, "included");
        directive.appended = reader.bool_at(obj, name, "appended");
        directive.keep_comments = reader.bool_at(obj, name, "keep_comments");
        if let Some(orientation) = obj.get("orientation") {
            match orientation.as_str().map(|s| s.trim().to_ascii_lowercase()) {
                Some(o) if o == "landscape" => directive.landscape = Some(true),
                Some(o) if o == "portrait" => directive.landscape = Some(false),
                _ => reader.issue(name, "orientation", orientation),
            }
        }
        directive.font_maps = reader.list_at(obj, name, "fontmaps");
        Some(directive)
    }
}
