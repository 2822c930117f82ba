// src/classify/classify_stats.rs

use ahash::AHashMap;
use std::fmt::Write as _;

use crate::types::{Lineage, LineagePair, LineageReportRow};

/// Node key in the report tree; `None` is the root.
type NodeKey = Option<LineagePair>;

#[derive(Default, Debug, Clone, Copy)]
struct NodeStats {
    /// Hashes resolved exactly to this node
    count_at: u32,
    /// Hashes at this node or anywhere below it
    count_below: u32,
}

/// Build a map of `parent -> Vec<child>` from the lineages in `hash_counts`.
pub fn build_children_map(hash_counts: &[(Lineage, u32)]) -> AHashMap<NodeKey, Vec<LineagePair>> {
    let mut children_map: AHashMap<NodeKey, Vec<LineagePair>> = AHashMap::new();
    children_map.entry(None).or_default();

    for (lineage, _) in hash_counts {
        let mut parent: NodeKey = None;
        for pair in lineage.pairs() {
            let kids = children_map.entry(parent).or_default();
            if !kids.contains(pair) {
                kids.push(pair.clone());
            }
            children_map.entry(Some(pair.clone())).or_default();
            parent = Some(pair.clone());
        }
    }
    children_map
}

fn accumulate_node_stats(hash_counts: &[(Lineage, u32)]) -> AHashMap<NodeKey, NodeStats> {
    let mut stats_map: AHashMap<NodeKey, NodeStats> = AHashMap::new();
    for (lineage, count) in hash_counts {
        stats_map.entry(None).or_default().count_below += count;
        for pair in lineage.pairs() {
            stats_map.entry(Some(pair.clone())).or_default().count_below += count;
        }
        let key = lineage.last().cloned();
        stats_map.entry(key).or_default().count_at += count;
    }
    stats_map
}

/// Kraken-style report over the per-hash resolved nodes of one query.
///
/// The first row is the unclassified hashes (code `U`), followed by the root
/// (code `R`) and a depth-first walk with children ordered by `count_below`
/// descending. Percentages are relative to `total_hashes`.
pub fn build_lineage_report(hash_counts: &[(Lineage, u32)], total_hashes: usize) -> Vec<LineageReportRow> {
    let children_map = build_children_map(hash_counts);
    let stats_map = accumulate_node_stats(hash_counts);
    let pct = |count: u32| {
        if total_hashes == 0 {
            0.0
        } else {
            100.0 * count as f32 / total_hashes as f32
        }
    };

    let assigned = stats_map.get(&None).map(|s| s.count_below).unwrap_or(0);
    let unassigned = (total_hashes as u32).saturating_sub(assigned);

    let mut rows = Vec::new();
    if unassigned > 0 {
        rows.push(LineageReportRow {
            pct: pct(unassigned),
            count_below: unassigned,
            count_at: unassigned,
            rank_code: 'U',
            name: "unclassified".to_string(),
            depth: 0,
        });
    }
    if assigned == 0 {
        return rows;
    }

    fn dfs(
        node: &NodeKey,
        depth: usize,
        children_map: &AHashMap<NodeKey, Vec<LineagePair>>,
        stats_map: &AHashMap<NodeKey, NodeStats>,
        pct: &dyn Fn(u32) -> f32,
        rows: &mut Vec<LineageReportRow>,
    ) {
        let stats = stats_map.get(node).copied().unwrap_or_default();
        if stats.count_below == 0 {
            return;
        }

        let (rank_code, name) = match node {
            Some(pair) => (pair.rank.code(), pair.name.clone()),
            None => ('R', "root".to_string()),
        };
        rows.push(LineageReportRow {
            pct: pct(stats.count_below),
            count_below: stats.count_below,
            count_at: stats.count_at,
            rank_code,
            name,
            depth,
        });

        let mut kids = children_map.get(node).cloned().unwrap_or_default();
        kids.sort_by(|a, b| {
            let below = |p: &LineagePair| {
                stats_map.get(&Some(p.clone())).map(|s| s.count_below).unwrap_or(0)
            };
            below(b).cmp(&below(a)).then_with(|| a.name.cmp(&b.name))
        });
        for child in kids {
            dfs(&Some(child), depth + 1, children_map, stats_map, pct, rows);
        }
    }

    dfs(&None, 0, &children_map, &stats_map, &pct, &mut rows);
    rows
}

/// Tab-separated text for `rows`, names indented by depth.
pub fn render_lineage_report(rows: &[LineageReportRow]) -> String {
    let mut report_text = String::from("%\tbelow\tat\tcode\tname\n");
    for row in rows {
        let indent = "\t".repeat(row.depth);
        writeln!(
            report_text,
            "{:.2}\t{}\t{}\t{}\t{}{}",
            row.pct, row.count_below, row.count_at, row.rank_code, indent, row.name
        )
        .unwrap();
    }
    report_text
}
