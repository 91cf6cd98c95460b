// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Class manifests: parsing class-name documents into a [`ClassTable`] and
//! rendering the dataset manifest consumed by training.
//!
//! Two manifest shapes are understood:
//!
//! - **Flat list** (`classes.txt`, `*.names`): one class per line, `#` starts
//!   a comment, surrounding quotes are stripped.
//! - **Structured** (`*.yaml`, `*.yml`): a `names` key holding an inline list
//!   (`[a, b]`), an inline mapping (`{0: a, 1: b}`), or an indented block of
//!   `- name` items or `index: name` entries.

use crate::{FileEntry, paths::split_dir};
use itertools::Itertools as _;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Largest class index accepted from an index-mapped manifest.
pub const MAX_CLASS_INDEX: usize = 10_000;

/// Ordered, index-addressable class names.
///
/// Indices without a name (gaps in an index-mapped manifest) resolve to
/// `"Class {index}"`, as do indices past the end of the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTable {
    names: Vec<Option<String>>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(|n| Some(n.into())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Explicit name at `index`, if the source provided one.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index)?.as_deref()
    }

    /// Name at `index`, synthesizing `"Class {index}"` when unresolved.
    pub fn name(&self, index: usize) -> String {
        self.get(index)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Class {}", index))
    }

    /// Name for a class index read from a label file.
    pub fn name_for(&self, index: f64) -> String {
        if index >= 0.0 && index.fract() == 0.0 && index <= usize::MAX as f64 {
            self.name(index as usize)
        } else {
            format!("Class {}", index)
        }
    }

    /// Every name in index order, gaps filled with synthesized names.
    pub fn names(&self) -> Vec<String> {
        (0..self.names.len()).map(|i| self.name(i)).collect()
    }

    fn push(&mut self, name: String) {
        self.names.push(Some(name));
    }

    fn set(&mut self, index: usize, name: String) {
        if index >= self.names.len() {
            self.names.resize(index + 1, None);
        }
        self.names[index] = Some(name);
    }
}

/// Parsed class manifest, tagged by its source shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDocument {
    FlatList(Vec<String>),
    Structured(ClassTable),
}

impl ManifestDocument {
    /// Parse `text`, choosing the shape from the file extension of `name`.
    pub fn parse(name: &str, text: &str) -> Self {
        if is_structured_name(name) {
            ManifestDocument::Structured(parse_structured(text))
        } else {
            ManifestDocument::FlatList(parse_flat_list(text))
        }
    }

    pub fn into_table(self) -> ClassTable {
        match self {
            ManifestDocument::FlatList(names) => ClassTable::from_names(names),
            ManifestDocument::Structured(table) => table,
        }
    }
}

pub(crate) fn is_structured_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".yaml") || lower.ends_with(".yml")
}

/// Build the session's class table from an optional manifest file.
///
/// Falls back to `fallback` when no manifest is given or it yields no
/// classes.
pub fn resolve(manifest: Option<&FileEntry>, fallback: &[String]) -> ClassTable {
    if let Some(entry) = manifest {
        let text = String::from_utf8_lossy(entry.bytes());
        let table = ManifestDocument::parse(&entry.original_name, &text).into_table();
        if !table.is_empty() {
            debug!(
                "Resolved {} classes from {}",
                table.len(),
                entry.original_name
            );
            return table;
        }
        warn!(
            "Class manifest {} has no classes; using defaults",
            entry.original_name
        );
    }
    ClassTable::from_names(fallback.iter().cloned())
}

fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    for (i, c) in line.char_indices() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(q)) if c == q => quote = None,
            ('#', None) => return &line[..i],
            _ => {}
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Split on commas that are not inside quotes.
fn split_flow(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            (c, Some(q)) if c == q => quote = None,
            (',', None) => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

fn parse_flat_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| unquote(strip_comment(line)))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn parse_structured(text: &str) -> ClassTable {
    let mut table = ClassTable::new();
    let lines: Vec<&str> = text.lines().collect();

    let Some((key_line, names_indent, rest)) =
        lines.iter().enumerate().find_map(|(i, line)| {
            let trimmed = strip_comment(line).trim();
            trimmed
                .strip_prefix("names:")
                .map(|rest| (i, indent_of(line), rest.trim().to_string()))
        })
    else {
        return table;
    };

    if let Some(body) = rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        for item in split_flow(body) {
            table.push(unquote(item).to_string());
        }
        return table;
    }

    if let Some(body) = rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        for item in split_flow(body) {
            insert_mapped(&mut table, item);
        }
        return table;
    }

    for line in &lines[key_line + 1..] {
        let content = strip_comment(line);
        if content.trim().is_empty() {
            continue;
        }
        if indent_of(content) <= names_indent {
            break;
        }

        let item = content.trim();
        if let Some(name) = item.strip_prefix('-') {
            table.push(unquote(name).to_string());
        } else {
            insert_mapped(&mut table, item);
        }
    }

    table
}

fn insert_mapped(table: &mut ClassTable, item: &str) {
    let Some((key, value)) = item.split_once(':') else {
        warn!("Ignoring class entry without an index: {:?}", item);
        return;
    };
    match unquote(key).parse::<usize>() {
        Ok(index) if index <= MAX_CLASS_INDEX => table.set(index, unquote(value).to_string()),
        Ok(_) => warn!(
            "Ignoring class entry with index above {}: {:?}",
            MAX_CLASS_INDEX, item
        ),
        Err(_) => warn!("Ignoring class entry with non-numeric index: {:?}", item),
    }
}

/// Dataset manifest artifact describing the class table and split layout.
#[derive(Debug, Clone)]
pub struct DatasetManifest {
    /// Dataset root, `{project}/{step}`.
    pub root: String,
    /// Split group names in plan order.
    pub groups: Vec<String>,
    pub classes: ClassTable,
}

impl DatasetManifest {
    pub const FILE_NAME: &'static str = "data.yaml";
    pub const CONTENT_TYPE: &'static str = "application/x-yaml";

    /// Manifest key for a split group.
    pub fn group_key(group: &str) -> String {
        match group {
            "Training" => "train".to_string(),
            "Validation" => "val".to_string(),
            other => split_dir(other).to_lowercase(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("path: {}\n", self.root);
        for group in &self.groups {
            out.push_str(&format!(
                "{}: images/{}\n",
                Self::group_key(group),
                split_dir(group)
            ));
        }
        out.push_str(&format!("nc: {}\n", self.classes.len()));
        let names = self
            .classes
            .names()
            .iter()
            .map(|name| serde_json::Value::String(name.clone()).to_string())
            .join(", ");
        out.push_str(&format!("names: [{}]\n", names));
        out
    }
}
