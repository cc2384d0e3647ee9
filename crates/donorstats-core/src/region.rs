//! County-name normalization for regional breakdowns.

use std::collections::BTreeMap;

use strsim::jaro_winkler;

use crate::RegionTotal;

/// Group label for records without a county.
pub const UNKNOWN_REGION: &str = "Ukjent";

/// Current Norwegian counties.
pub const KNOWN_COUNTIES: [&str; 15] = [
    "Oslo",
    "Akershus",
    "Buskerud",
    "Østfold",
    "Vestfold",
    "Telemark",
    "Agder",
    "Rogaland",
    "Vestland",
    "Møre og Romsdal",
    "Trøndelag",
    "Nordland",
    "Troms",
    "Finnmark",
    "Innlandet",
];

/// Counties merged away by earlier reforms whose successor is unambiguous.
const HISTORICAL_COUNTIES: [(&str, &str); 8] = [
    ("hordaland", "Vestland"),
    ("sogn og fjordane", "Vestland"),
    ("aust-agder", "Agder"),
    ("vest-agder", "Agder"),
    ("hedmark", "Innlandet"),
    ("oppland", "Innlandet"),
    ("sør-trøndelag", "Trøndelag"),
    ("nord-trøndelag", "Trøndelag"),
];

const FUZZY_MATCH_THRESHOLD: f64 = 0.92;

fn fold(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Maps a free-text county onto its current name.
///
/// Case and whitespace variants, historical names and near-miss spellings
/// resolve to an entry of [`KNOWN_COUNTIES`]. Anything else is returned
/// trimmed but otherwise untouched; blank input yields `None`.
pub fn normalize_county(raw: &str) -> Option<String> {
    let folded = fold(raw);
    if folded.is_empty() {
        return None;
    }

    if let Some(known) = KNOWN_COUNTIES.iter().find(|c| c.to_lowercase() == folded) {
        return Some((*known).to_string());
    }
    if let Some((_, successor)) = HISTORICAL_COUNTIES.iter().find(|(old, _)| *old == folded) {
        return Some((*successor).to_string());
    }

    let best = KNOWN_COUNTIES
        .iter()
        .map(|c| (*c, jaro_winkler(&c.to_lowercase(), &folded)))
        .max_by(|a, b| a.1.total_cmp(&b.1));
    match best {
        Some((county, score)) if score >= FUZZY_MATCH_THRESHOLD => Some(county.to_string()),
        _ => Some(raw.split_whitespace().collect::<Vec<_>>().join(" ")),
    }
}

/// Re-groups raw per-county totals under normalized names, largest count first.
pub fn merge_region_totals(rows: Vec<RegionTotal>) -> Vec<RegionTotal> {
    let mut merged: BTreeMap<String, (i64, f64)> = BTreeMap::new();
    for row in rows {
        let region = normalize_county(&row.region).unwrap_or_else(|| UNKNOWN_REGION.to_string());
        let entry = merged.entry(region).or_default();
        entry.0 += row.count;
        entry.1 += row.sum;
    }

    let mut out = merged
        .into_iter()
        .map(|(region, (count, sum))| RegionTotal { region, count, sum })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.region.cmp(&b.region)));
    out
}
