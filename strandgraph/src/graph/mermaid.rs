//! Mermaid flowchart export.
//!
//! Consumes the [`GraphInfo`] a compiled plan emits and renders a
//! `graph TD` document: control edges as solid arrows, data edges as
//! dashed arrows, and the reserved start/end endpoints as rounded
//! rectangles.

use std::fmt::Write;

use rustc_hash::{FxHashMap, FxHashSet};

use super::node::NodeKey;
use super::plan::GraphInfo;

/// Render `info` as a Mermaid `graph TD` document.
#[must_use]
pub fn to_mermaid(info: &GraphInfo) -> String {
    let mut out = String::from("graph TD\n");

    let mut id_map: FxHashMap<&str, String> = FxHashMap::default();
    for (key, _) in &info.nodes {
        id_map.insert(key.as_str(), format!("N_{}", escape_id(key)));
    }
    id_map.insert(NodeKey::START, "StartNode".to_string());
    id_map.insert(NodeKey::END, "EndNode".to_string());

    writeln!(out, "    StartNode([Start])").ok();
    writeln!(out, "    EndNode([End])").ok();
    for (key, component) in &info.nodes {
        let id = &id_map[key.as_str()];
        writeln!(out, "    {id}[\"{key}: {component}\"]").ok();
    }
    out.push('\n');

    let mut seen: FxHashSet<(String, String)> = FxHashSet::default();
    let mut emit = |out: &mut String, from: &str, to: &str, arrow: &str| {
        let (Some(from_id), Some(to_id)) = (id_map.get(from), id_map.get(to)) else {
            return;
        };
        if seen.insert((from_id.clone(), to_id.clone())) {
            writeln!(out, "    {from_id} {arrow} {to_id}").ok();
        }
    };

    for (from, to) in &info.edges {
        emit(&mut out, from, to, "-->");
    }
    for (from, to) in &info.data_edges {
        emit(&mut out, from, to, "-.->");
    }
    // Branch decisions connect the source to every declared candidate.
    for (from, candidates) in &info.branches {
        for candidate in candidates {
            emit(&mut out, from, candidate, "-->");
        }
    }

    out
}

/// Replace characters that are invalid in Mermaid node ids.
fn escape_id(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
