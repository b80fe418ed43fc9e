//! Rendering of dependency trees as text, CSV table, JSON and Graphviz DOT

use crate::common::{decanonicalize, path_to_string, LookupError};
use crate::models::{CombinedReport, DependencyNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;
use std::path::Path;

const TABLE_COLUMNS: [&str; 5] = ["file", "depth", "parent", "name", "path"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// indented tree, one module per line
    Text,
    /// CSV, one row per module
    Table,
    Json,
    /// Graphviz digraph
    Dot,
}

impl OutputFormat {
    /// Render the tree of a single executable
    pub fn render_tree(self, tree: &DependencyNode) -> Result<String, LookupError> {
        Ok(match self {
            Self::Text => text_tree(tree),
            Self::Table => table([(display_path(tree.resolved_path.as_deref()), tree)])?,
            Self::Json => serde_json::to_string_pretty(tree)?,
            Self::Dot => {
                let mut out = String::from("digraph dependencies {\n");
                dot_graph(&mut out, tree, "", "    ");
                out.push_str("}\n");
                out
            }
        })
    }

    /// Render the trees of several executables into one document
    pub fn render_report(self, report: &CombinedReport) -> Result<String, LookupError> {
        Ok(match self {
            // the root line only has the file name: head each tree with the full path
            Self::Text => report
                .files
                .iter()
                .map(|f| {
                    format!(
                        "{}:\n{}",
                        display_path(Some(&f.file_path)),
                        text_tree(&f.tree)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Table => table(
                report
                    .files
                    .iter()
                    .map(|f| (display_path(Some(&f.file_path)), &f.tree)),
            )?,
            Self::Json => serde_json::to_string_pretty(report)?,
            Self::Dot => {
                let mut out = String::from("digraph dependencies {\n");
                for (i, f) in report.files.iter().enumerate() {
                    let _ = writeln!(out, "    subgraph cluster_{} {{", i);
                    let _ = writeln!(
                        out,
                        "        label=\"{}\";",
                        dot_escape(&display_path(Some(&f.file_path)))
                    );
                    dot_graph(&mut out, &f.tree, &format!("{}:", i), "        ");
                    out.push_str("    }\n");
                }
                out.push_str("}\n");
                out
            }
        })
    }
}

fn display_path(p: Option<&Path>) -> String {
    p.map(|p| decanonicalize(&path_to_string(p)))
        .unwrap_or_default()
}

fn text_tree(tree: &DependencyNode) -> String {
    let mut out = String::new();
    tree.visit_depth_first(&mut |n, _| {
        let location = match &n.resolved_path {
            Some(p) => display_path(Some(p)),
            None => "not found".to_owned(),
        };
        let _ = writeln!(out, "{}{} => {}", "\t".repeat(n.depth), n.name, location);
    });
    out
}

fn table_rows<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    file: &str,
    tree: &DependencyNode,
) -> Result<(), LookupError> {
    let mut rows = Vec::new();
    tree.visit_depth_first(&mut |n, parent| {
        rows.push(TableRow {
            file: file.to_owned(),
            depth: n.depth,
            parent: parent.map(|p| p.name.clone()),
            name: n.name.clone(),
            path: n.resolved_path.as_deref().map(|p| display_path(Some(p))),
        })
    });
    for row in &rows {
        writer.serialize(row)?;
    }
    Ok(())
}

fn table<'a, I>(files: I) -> Result<String, LookupError>
where
    I: IntoIterator<Item = (String, &'a DependencyNode)>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(TABLE_COLUMNS)?;
    for (file, tree) in files {
        table_rows(&mut writer, &file, tree)?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(bytes).map_err(|e| LookupError::ParseError(e.to_string()))
}

/// One row of the table format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub file: String,
    pub depth: usize,
    pub parent: Option<String>,
    pub name: String,
    pub path: Option<String>,
}

/// Read back a document produced with `OutputFormat::Table`
pub fn parse_table(s: &str) -> Result<Vec<TableRow>, LookupError> {
    let mut reader = csv::Reader::from_reader(s.as_bytes());
    if !reader.headers()?.iter().eq(TABLE_COLUMNS) {
        return Err(LookupError::ParseError("missing table header".to_owned()));
    }
    reader
        .deserialize()
        .map(|row| row.map_err(LookupError::from))
        .collect()
}

fn dot_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Nodes are identified by name (prefixed, to keep the trees of a combined report apart)
fn dot_graph(out: &mut String, tree: &DependencyNode, prefix: &str, indent: &str) {
    let mut declared = HashSet::new();
    let mut edges = HashSet::new();
    tree.visit_depth_first(&mut |n, parent| {
        let id = format!("{}{}", prefix, n.name);
        if declared.insert(id.clone()) {
            let style = if n.is_found() { "" } else { ", style=dashed" };
            let _ = writeln!(
                out,
                "{}\"{}\" [label=\"{}\"{}];",
                indent,
                dot_escape(&id),
                dot_escape(&n.name),
                style
            );
        }
        if let Some(p) = parent {
            let parent_id = format!("{}{}", prefix, p.name);
            if edges.insert((parent_id.clone(), id.clone())) {
                let _ = writeln!(
                    out,
                    "{}\"{}\" -> \"{}\";",
                    indent,
                    dot_escape(&parent_id),
                    dot_escape(&id)
                );
            }
        }
    });
}
