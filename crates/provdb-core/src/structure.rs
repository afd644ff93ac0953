//! Chemical formulas for structure nodes and the closest-structure lookup
//! used by bands listings.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const BANDS_NODE_TYPE: &str = "data.array.bands.BandsData.";
pub const STRUCTURE_NODE_TYPE: &str = "data.structure.StructureData.";

/// Formula reported when a site points at a kind that does not exist.
pub const UNKNOWN_FORMULA: &str = "<<UNKNOWN>>";

const WEIGHT_SUM_THRESHOLD: f64 = 1.0e-6;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FormulaError {
    #[error("site references unknown kind '{0}'")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Kind {
    pub name: String,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub weights: Vec<f64>,
}

impl Kind {
    fn weight(&self, index: usize) -> f64 {
        self.weights.get(index).copied().unwrap_or(1.0)
    }

    /// Leading symbol, the only one considered by element filters.
    #[must_use]
    pub fn leading_symbol(&self) -> Option<&str> {
        self.symbols.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub kind_name: String,
    #[serde(default)]
    pub position: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FormulaMode {
    #[default]
    Hill,
    HillCompact,
    Reduce,
    Count,
    CountCompact,
}

impl FormulaMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hill => "hill",
            Self::HillCompact => "hill_compact",
            Self::Reduce => "reduce",
            Self::Count => "count",
            Self::CountCompact => "count_compact",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hill" => Some(Self::Hill),
            "hill_compact" => Some(Self::HillCompact),
            "reduce" => Some(Self::Reduce),
            "count" => Some(Self::Count),
            "count_compact" => Some(Self::CountCompact),
            _ => None,
        }
    }
}

/// Symbol string for one kind: the bare symbol for a pure kind, otherwise
/// `{A0.50B0.50}` with an `X` vacancy term when weights do not sum to one.
#[must_use]
pub fn get_symbols_string(symbols: &[String], weights: &[f64]) -> String {
    let weight = |index: usize| weights.get(index).copied().unwrap_or(1.0);

    if symbols.len() == 1 && (weight(0) - 1.0).abs() < f64::EPSILON {
        return symbols[0].clone();
    }

    let mut pieces: Vec<String> = symbols
        .iter()
        .enumerate()
        .map(|(index, symbol)| format!("{symbol}{:4.2}", weight(index)))
        .collect();

    let total: f64 = (0..symbols.len()).map(weight).sum();
    if (total - 1.0).abs() >= WEIGHT_SUM_THRESHOLD {
        pieces.push(format!("X{:4.2}", 1.0 - total));
    }
    pieces.sort();

    format!("{{{}}}", pieces.concat())
}

fn gcd(mut lhs: usize, mut rhs: usize) -> usize {
    while rhs != 0 {
        (lhs, rhs) = (rhs, lhs % rhs);
    }
    lhs
}

fn group_runs(symbols: &[String]) -> Vec<(usize, String)> {
    let mut runs: Vec<(usize, String)> = Vec::new();
    for symbol in symbols {
        match runs.last_mut() {
            Some((count, last)) if last == symbol => *count += 1,
            _ => runs.push((1, symbol.clone())),
        }
    }
    runs
}

fn count_in_order(symbols: &[String], order: impl IntoIterator<Item = String>) -> Vec<(usize, String)> {
    order
        .into_iter()
        .map(|element| {
            let count = symbols.iter().filter(|symbol| **symbol == element).count();
            (count, element)
        })
        .collect()
}

/// Chemical formula of a list of per-site symbol strings.
#[must_use]
pub fn get_formula(symbols: &[String], mode: FormulaMode) -> String {
    let mut counted = match mode {
        FormulaMode::Hill | FormulaMode::HillCompact => {
            let mut remaining: BTreeSet<String> = symbols.iter().cloned().collect();
            let mut order = Vec::new();
            if remaining.remove("C") {
                order.push("C".to_string());
                if remaining.remove("H") {
                    order.push("H".to_string());
                }
            }
            order.extend(remaining);
            count_in_order(symbols, order)
        }
        FormulaMode::Count | FormulaMode::CountCompact => {
            let mut seen = HashSet::new();
            let order: Vec<String> = symbols
                .iter()
                .filter(|symbol| seen.insert(symbol.as_str()))
                .cloned()
                .collect();
            count_in_order(symbols, order)
        }
        FormulaMode::Reduce => group_runs(symbols),
    };

    if matches!(mode, FormulaMode::HillCompact | FormulaMode::CountCompact) {
        let divisor = counted.iter().fold(0, |acc, (count, _)| gcd(acc, *count));
        if divisor > 1 {
            for (count, _) in &mut counted {
                *count /= divisor;
            }
        }
    }

    counted
        .into_iter()
        .map(|(count, symbol)| {
            if count == 1 {
                symbol
            } else {
                format!("{symbol}{count}")
            }
        })
        .collect()
}

/// Formula of a structure given its kinds and sites.
///
/// # Errors
/// Returns [`FormulaError::UnknownKind`] when a site names a missing kind.
pub fn structure_formula(
    kinds: &[Kind],
    sites: &[Site],
    mode: FormulaMode,
) -> Result<String, FormulaError> {
    let by_name: HashMap<&str, String> = kinds
        .iter()
        .map(|kind| {
            let weights: Vec<f64> = (0..kind.symbols.len()).map(|index| kind.weight(index)).collect();
            (kind.name.as_str(), get_symbols_string(&kind.symbols, &weights))
        })
        .collect();

    let per_site = sites
        .iter()
        .map(|site| {
            by_name
                .get(site.kind_name.as_str())
                .cloned()
                .ok_or_else(|| FormulaError::UnknownKind(site.kind_name.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(get_formula(&per_site, mode))
}

/// One joined row: a bands node and one of its ancestor structures.
#[derive(Debug, Clone, PartialEq)]
pub struct BandsStructureRow {
    pub bands_id: i64,
    pub label: String,
    pub bands_ctime: OffsetDateTime,
    pub structure_id: i64,
    pub kinds: Option<Vec<Kind>>,
    pub sites: Option<Vec<Site>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructureFilter {
    /// Keep structures where at least one kind leads with one of these.
    pub elements: Option<Vec<String>>,
    /// Keep structures whose kinds lead with every one of these.
    pub elements_only: Option<Vec<String>>,
    pub formula_mode: FormulaMode,
}

impl StructureFilter {
    fn accepts(&self, kinds: &[Kind]) -> bool {
        let leading: Vec<&str> = kinds.iter().filter_map(Kind::leading_symbol).collect();

        if let Some(elements) = &self.elements {
            if !leading.iter().any(|symbol| elements.iter().any(|e| e == symbol)) {
                return false;
            }
        }

        if let Some(required) = &self.elements_only {
            if !required.iter().all(|element| leading.contains(&element.as_str())) {
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructureMatch {
    pub record_id: i64,
    pub structure_id: i64,
    pub formula: String,
    #[serde(with = "time::serde::rfc3339")]
    pub creation_date: OffsetDateTime,
    pub label: String,
}

/// Picks, for every bands node, the first accepted structure in `rows`.
///
/// Rows must arrive ordered by structure creation time, newest first; the
/// newest ancestor structure stands in for the closest one.
pub fn resolve_closest_structures(
    rows: impl IntoIterator<Item = BandsStructureRow>,
    filter: &StructureFilter,
) -> Vec<StructureMatch> {
    let mut matched = HashSet::new();
    let mut out = Vec::new();

    for row in rows {
        if matched.contains(&row.bands_id) {
            continue;
        }

        let (Some(kinds), Some(sites)) = (row.kinds, row.sites) else {
            continue;
        };

        if !filter.accepts(&kinds) {
            continue;
        }

        let formula = match structure_formula(&kinds, &sites, filter.formula_mode) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(
                    structure_id = row.structure_id,
                    error = %err,
                    "formula derivation failed"
                );
                UNKNOWN_FORMULA.to_string()
            }
        };

        matched.insert(row.bands_id);
        out.push(StructureMatch {
            record_id: row.bands_id,
            structure_id: row.structure_id,
            formula,
            creation_date: row.bands_ctime,
            label: row.label,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Date, Duration, Month, Time};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    fn kind(name: &str, symbols: &[&str], weights: &[f64]) -> Kind {
        Kind {
            name: name.to_string(),
            symbols: strings(symbols),
            weights: weights.to_vec(),
        }
    }

    fn sites(names: &[&str]) -> Vec<Site> {
        names
            .iter()
            .map(|name| Site {
                kind_name: (*name).to_string(),
                position: Some([0.0, 0.0, 0.0]),
            })
            .collect()
    }

    fn day(offset: i64) -> OffsetDateTime {
        match Date::from_calendar_date(2024, Month::May, 1) {
            Ok(value) => value.with_time(Time::MIDNIGHT).assume_utc() + Duration::days(offset),
            Err(err) => panic!("invalid fixture date: {err}"),
        }
    }

    fn row(bands_id: i64, structure_id: i64, kinds: Option<Vec<Kind>>) -> BandsStructureRow {
        BandsStructureRow {
            bands_id,
            label: format!("bands-{bands_id}"),
            bands_ctime: day(5),
            structure_id,
            sites: kinds.as_ref().map(|items| {
                sites(&items.iter().map(|item| item.name.as_str()).collect::<Vec<_>>())
            }),
            kinds,
        }
    }

    #[test]
    fn symbols_string_handles_pure_and_alloy_kinds() {
        assert_eq!(get_symbols_string(&strings(&["Fe"]), &[1.0]), "Fe");
        assert_eq!(
            get_symbols_string(&strings(&["Ni", "Fe"]), &[0.5, 0.5]),
            "{Fe0.50Ni0.50}"
        );
        assert_eq!(
            get_symbols_string(&strings(&["Ba"]), &[0.8]),
            "{Ba0.80X0.20}"
        );
    }

    #[test]
    fn formula_modes_follow_their_ordering_rules() {
        let symbols = strings(&["Ba", "Ti", "O", "O", "O", "Ba", "Ti", "O", "O", "O"]);
        assert_eq!(get_formula(&symbols, FormulaMode::Hill), "Ba2O6Ti2");
        assert_eq!(get_formula(&symbols, FormulaMode::HillCompact), "BaO3Ti");
        assert_eq!(get_formula(&symbols, FormulaMode::Reduce), "BaTiO3BaTiO3");
        assert_eq!(get_formula(&symbols, FormulaMode::Count), "Ba2Ti2O6");
        assert_eq!(get_formula(&symbols, FormulaMode::CountCompact), "BaTiO3");

        let organic = strings(&["O", "H", "C", "H", "H", "H"]);
        assert_eq!(get_formula(&organic, FormulaMode::Hill), "CH4O");
    }

    #[test]
    fn unknown_kind_is_a_formula_error() {
        let kinds = vec![kind("Si", &["Si"], &[1.0])];
        let result = structure_formula(&kinds, &sites(&["Si", "Ge"]), FormulaMode::Hill);
        assert_eq!(result, Err(FormulaError::UnknownKind("Ge".to_string())));
    }

    #[test]
    fn newest_structure_wins_for_each_bands_node() {
        let older = vec![kind("Si", &["Si"], &[1.0])];
        let newer = vec![kind("Ga", &["Ga"], &[1.0]), kind("As", &["As"], &[1.0])];

        let matches = resolve_closest_structures(
            vec![row(10, 2, Some(newer)), row(10, 1, Some(older))],
            &StructureFilter::default(),
        );

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].structure_id, 2);
        assert_eq!(matches[0].formula, "AsGa");
        assert_eq!(matches[0].label, "bands-10");
    }

    #[test]
    fn rows_without_attributes_keep_the_scan_going() {
        let fallback = vec![kind("Si", &["Si"], &[1.0])];
        let matches = resolve_closest_structures(
            vec![row(10, 3, None), row(10, 1, Some(fallback))],
            &StructureFilter::default(),
        );

        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].structure_id, 1);
    }

    #[test]
    fn element_filters_look_at_leading_symbols_only() {
        let alloy = vec![kind("FeNi", &["Fe", "Ni"], &[0.5, 0.5])];

        let with_ni = StructureFilter {
            elements: Some(strings(&["Ni"])),
            ..StructureFilter::default()
        };
        assert!(resolve_closest_structures(vec![row(1, 1, Some(alloy.clone()))], &with_ni).is_empty());

        let with_fe = StructureFilter {
            elements: Some(strings(&["Fe"])),
            ..StructureFilter::default()
        };
        let matches = resolve_closest_structures(vec![row(1, 1, Some(alloy.clone()))], &with_fe);
        assert_eq!(matches[0].formula, "{Fe0.50Ni0.50}");

        let only = StructureFilter {
            elements_only: Some(strings(&["Fe", "Ni"])),
            ..StructureFilter::default()
        };
        assert!(resolve_closest_structures(vec![row(1, 1, Some(alloy))], &only).is_empty());
    }

    #[test]
    fn unknown_kind_yields_sentinel_and_still_matches() {
        let mut broken = row(4, 9, Some(vec![kind("Si", &["Si"], &[1.0])]));
        broken.sites = Some(sites(&["Ge"]));

        let matches = resolve_closest_structures(vec![broken], &StructureFilter::default());
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].formula, UNKNOWN_FORMULA);
    }

    #[test]
    fn kinds_deserialize_from_stored_attribute_json() {
        let raw = serde_json::json!([
            {"name": "Ba", "symbols": ["Ba"], "weights": [1.0], "mass": 137.327}
        ]);
        let kinds: Vec<Kind> = match serde_json::from_value(raw) {
            Ok(value) => value,
            Err(err) => panic!("failed to decode kinds: {err}"),
        };
        assert_eq!(kinds[0].leading_symbol(), Some("Ba"));
    }
}
