//! Coverage indicators computed from a monthly extract.
//!
//! Every indicator is a row-wise count over the selected rows of a [`Table`]:
//! rows that can be evaluated go into the denominator, rows that satisfy the
//! indicator rule go into the numerator. Nothing here is persisted; a report
//! is recomputed from the source file for every selection.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::parser::{cell, fold, parse_count, parse_date, Table};

/// Prenatal visits needed for "adequate" care
const MIN_PRENATAL_VISITS: u32 = 4;

/// Enrollment before this gestational age counts as early
const EARLY_ENROLLMENT_WEEKS: i64 = 12;

/// Gestational ages above this are treated as data errors
const MAX_GESTATION_WEEKS: i64 = 45;

const IPS_COLUMNS: &[&[&str]] = &[&["ips"], &["prestador"]];
const MUNICIPALITY_COLUMNS: &[&[&str]] = &[&["municipio"]];
const REPORT_DATE_COLUMNS: &[&[&str]] = &[&["fecha", "atencion"], &["fecha", "control"], &["fecha"]];

/// Last menstrual period
const LMP_COLUMNS: &[&[&str]] = &[&["fum"], &["fecha", "ultima", "menstruacion"]];
const FIRST_VISIT_COLUMNS: &[&[&str]] = &[&["fecha", "primer", "control"], &["fecha", "ingreso"]];

/// Cell texts meaning the test was not done or not recorded
const NOT_RECORDED: &[&str] = &["sin datos", "no realiz", "pendiente"];

/// How a row is classified for one indicator
#[derive(Debug, Clone, Copy)]
enum Rule {
    /// Every row counts; numerator unless empty or "sin datos"
    NotMissing,
    /// Every row counts; numerator when a result is recorded
    Recorded,
    /// Rows with a count; numerator when the count reaches the minimum
    AtLeast(u32),
    /// Rows with a gestational age; numerator below the limit in weeks
    EarlyEnrollment(i64),
}

struct IndicatorDef {
    key: &'static str,
    label: &'static str,
    columns: &'static [&'static [&'static str]],
    rule: Rule,
}

const INDICATORS: &[IndicatorDef] = &[
    IndicatorDef {
        key: "tamizaje_completo",
        label: "Tamizaje prenatal completo",
        columns: &[&["tamizaje"]],
        rule: Rule::NotMissing,
    },
    IndicatorDef {
        key: "control_prenatal_adecuado",
        label: "Control prenatal adecuado (≥ 4 controles)",
        columns: &[&["numero", "control"], &["controles", "prenatal"], &["controles"]],
        rule: Rule::AtLeast(MIN_PRENATAL_VISITS),
    },
    IndicatorDef {
        key: "captacion_temprana",
        label: "Captación temprana (< 12 semanas)",
        columns: &[&["semanas", "ingreso"], &["edad", "gestacional"]],
        rule: Rule::EarlyEnrollment(EARLY_ENROLLMENT_WEEKS),
    },
    IndicatorDef {
        key: "tamizaje_vih",
        label: "Prueba de VIH realizada",
        columns: &[&["vih"]],
        rule: Rule::Recorded,
    },
    IndicatorDef {
        key: "tamizaje_sifilis",
        label: "Prueba de sífilis realizada",
        columns: &[&["sifilis"], &["vdrl"]],
        rule: Rule::Recorded,
    },
    IndicatorDef {
        key: "valoracion_odontologica",
        label: "Valoración odontológica",
        columns: &[&["odontolog"]],
        rule: Rule::Recorded,
    },
];

/// Row selection applied before counting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub ips: Option<String>,
    pub municipality: Option<String>,
    /// `YYYY-MM`
    pub month: Option<String>,
}

impl Filter {
    /// Drop blank values so `?ips=` means "all"
    pub fn normalized(self) -> Self {
        let keep = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            ips: keep(self.ips),
            municipality: keep(self.municipality),
            month: keep(self.month),
        }
    }

    /// First day of the selected month, or a user-facing error
    pub fn month_start(&self) -> Result<Option<NaiveDate>, String> {
        match &self.month {
            None => Ok(None),
            Some(month) => NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d")
                .map(Some)
                .map_err(|_| format!("Mes no válido: {} (use AAAA-MM)", month)),
        }
    }
}

/// One computed indicator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorResult {
    pub key: String,
    pub label: String,
    /// Header(s) the values came from, `None` when no column matched
    pub column: Option<String>,
    pub numerator: usize,
    pub denominator: usize,
    pub percentage: f64,
}

/// All indicators for one extract and selection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KpiReport {
    pub source: String,
    pub total_rows: usize,
    pub selected_rows: usize,
    pub filter: Filter,
    pub indicators: Vec<IndicatorResult>,
    /// Keys of indicators with no matching column
    pub missing_columns: Vec<String>,
    pub ips_options: Vec<String>,
    pub municipality_options: Vec<String>,
}

/// `numerator / denominator × 100`, one decimal, 0 when there is no denominator
pub fn percentage(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    (numerator as f64 / denominator as f64 * 1000.0).round() / 10.0
}

/// Where the values of an indicator come from
enum Source {
    Column(usize),
    Dates { lmp: usize, first_visit: usize },
}

/// Compute every indicator for the rows matching `filter`.
///
/// The filter must already be validated with [`Filter::month_start`]; an
/// invalid month selects nothing.
pub fn compute(table: &Table, filter: &Filter, source: &str) -> KpiReport {
    let selected = select_rows(table, filter);

    let mut indicators = Vec::with_capacity(INDICATORS.len());
    let mut missing_columns = Vec::new();

    for def in INDICATORS {
        let result = match resolve_source(table, def) {
            Some((source, column)) => {
                let (numerator, denominator) = count(&selected, &source, def.rule);
                IndicatorResult {
                    key: def.key.to_string(),
                    label: def.label.to_string(),
                    column: Some(column),
                    numerator,
                    denominator,
                    percentage: percentage(numerator, denominator),
                }
            }
            None => {
                missing_columns.push(def.key.to_string());
                IndicatorResult {
                    key: def.key.to_string(),
                    label: def.label.to_string(),
                    column: None,
                    numerator: 0,
                    denominator: 0,
                    percentage: 0.0,
                }
            }
        };
        indicators.push(result);
    }

    KpiReport {
        source: source.to_string(),
        total_rows: table.rows.len(),
        selected_rows: selected.len(),
        filter: filter.clone(),
        indicators,
        missing_columns,
        ips_options: distinct_values(table, IPS_COLUMNS),
        municipality_options: distinct_values(table, MUNICIPALITY_COLUMNS),
    }
}

fn resolve_source(table: &Table, def: &IndicatorDef) -> Option<(Source, String)> {
    if let Some(index) = table.column(def.columns) {
        return Some((Source::Column(index), table.header(index).to_string()));
    }

    if let Rule::EarlyEnrollment(_) = def.rule {
        let lmp = table.column(LMP_COLUMNS)?;
        let first_visit = table.column(FIRST_VISIT_COLUMNS)?;
        let label = format!("{} → {}", table.header(lmp), table.header(first_visit));
        return Some((Source::Dates { lmp, first_visit }, label));
    }

    None
}

fn select_rows<'a>(table: &'a Table, filter: &Filter) -> Vec<&'a [String]> {
    let month = match filter.month_start() {
        Ok(month) => month,
        Err(_) => return Vec::new(),
    };

    let ips = filter.ips.as_deref().map(fold);
    let municipality = filter.municipality.as_deref().map(fold);
    let ips_col = table.column(IPS_COLUMNS);
    let municipality_col = table.column(MUNICIPALITY_COLUMNS);
    let date_col = table.column(REPORT_DATE_COLUMNS);

    table
        .rows
        .iter()
        .map(Vec::as_slice)
        .filter(|row| matches_value(row, ips_col, ips.as_deref()))
        .filter(|row| matches_value(row, municipality_col, municipality.as_deref()))
        .filter(|row| match month {
            None => true,
            Some(start) => date_col
                .and_then(|i| parse_date(cell(row, i)))
                .map(|d| d.format("%Y-%m").to_string() == start.format("%Y-%m").to_string())
                .unwrap_or(false),
        })
        .collect()
}

fn matches_value(row: &[String], column: Option<usize>, wanted: Option<&str>) -> bool {
    match (wanted, column) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(wanted), Some(i)) => fold(cell(row, i)) == wanted,
    }
}

fn count(rows: &[&[String]], source: &Source, rule: Rule) -> (usize, usize) {
    let mut numerator = 0;
    let mut denominator = 0;

    for row in rows {
        if let Some(hit) = classify(row, source, rule) {
            denominator += 1;
            if hit {
                numerator += 1;
            }
        }
    }

    (numerator, denominator)
}

/// `None` when the row does not enter the denominator
fn classify(row: &[String], source: &Source, rule: Rule) -> Option<bool> {
    match (rule, source) {
        (Rule::NotMissing, Source::Column(i)) => {
            let value = fold(cell(row, *i));
            Some(!value.is_empty() && !value.contains("sin datos"))
        }
        (Rule::Recorded, Source::Column(i)) => {
            let value = fold(cell(row, *i));
            Some(!value.is_empty() && !NOT_RECORDED.iter().any(|kw| value.contains(kw)))
        }
        (Rule::AtLeast(min), Source::Column(i)) => parse_count(cell(row, *i)).map(|n| n >= min),
        (Rule::EarlyEnrollment(limit), source) => gestational_weeks(row, source).map(|w| w < limit),
        (_, Source::Dates { .. }) => None,
    }
}

fn gestational_weeks(row: &[String], source: &Source) -> Option<i64> {
    let weeks = match source {
        Source::Column(i) => i64::from(parse_count(cell(row, *i))?),
        Source::Dates { lmp, first_visit } => {
            let lmp = parse_date(cell(row, *lmp))?;
            let visit = parse_date(cell(row, *first_visit))?;
            let days = (visit - lmp).num_days();
            if days < 0 {
                return None;
            }
            days / 7
        }
    };

    (weeks <= MAX_GESTATION_WEEKS).then_some(weeks)
}

/// Sorted distinct values of the first matching column, compared accent- and case-insensitively
fn distinct_values(table: &Table, columns: &[&[&str]]) -> Vec<String> {
    let Some(index) = table.column(columns) else {
        return Vec::new();
    };

    let mut values: BTreeMap<String, String> = BTreeMap::new();
    for row in &table.rows {
        let value = cell(row, index);
        if !value.is_empty() {
            values.entry(fold(value)).or_insert_with(|| value.to_string());
        }
    }
    values.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Helper functions ==========

    fn table(rows: &[&[&str]]) -> Table {
        Table::from_rows(
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
        .unwrap()
    }

    fn indicator<'a>(report: &'a KpiReport, key: &str) -> &'a IndicatorResult {
        report.indicators.iter().find(|i| i.key == key).unwrap()
    }

    fn sample() -> Table {
        table(&[
            &[
                "IPS",
                "Municipio",
                "Fecha de Atención",
                "Tamizaje Prenatal",
                "Número de Controles",
                "Semanas al Ingreso",
                "Prueba VIH",
                "Sífilis (VDRL)",
            ],
            &["Hospital San José", "Quibdó", "2025-03-10", "Completo", "5", "10", "Negativo", "No reactivo"],
            &["Hospital San José", "Quibdó", "15/03/2025", "Sin datos", "2", "14", "No realizada", "Pendiente"],
            &["Clínica Norte", "Istmina", "45748", "Completo", "4", "8", "Positivo", ""],
            &["clinica norte", "Istmina", "2025-02-20", "", "sin dato", "", "", "Reactivo"],
        ])
    }

    // ========== percentage tests ==========

    #[test]
    fn test_percentage_basic() {
        assert_eq!(percentage(1, 4), 25.0);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(3, 3), 100.0);
    }

    #[test]
    fn test_percentage_zero_denominator() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(5, 0), 0.0);
    }

    // ========== indicator rule tests ==========

    #[test]
    fn test_screening_complete_counts_all_rows() {
        let report = compute(&sample(), &Filter::default(), "marzo.xlsx");
        let kpi = indicator(&report, "tamizaje_completo");

        assert_eq!(kpi.column.as_deref(), Some("Tamizaje Prenatal"));
        assert_eq!(kpi.denominator, 4);
        assert_eq!(kpi.numerator, 2);
        assert_eq!(kpi.percentage, 50.0);
    }

    #[test]
    fn test_prenatal_adequacy_needs_four_visits() {
        let report = compute(&sample(), &Filter::default(), "x");
        let kpi = indicator(&report, "control_prenatal_adecuado");

        // "sin dato" has no count and stays out of the denominator
        assert_eq!(kpi.denominator, 3);
        assert_eq!(kpi.numerator, 2);
        assert_eq!(kpi.percentage, 66.7);
    }

    #[test]
    fn test_early_enrollment_from_weeks_column() {
        let report = compute(&sample(), &Filter::default(), "x");
        let kpi = indicator(&report, "captacion_temprana");

        assert_eq!(kpi.column.as_deref(), Some("Semanas al Ingreso"));
        assert_eq!(kpi.denominator, 3);
        assert_eq!(kpi.numerator, 2);
    }

    #[test]
    fn test_early_enrollment_from_dates() {
        let t = table(&[
            &["FUM", "Fecha Primer Control"],
            &["01/01/2025", "2025-03-01"],  // 8 weeks
            &["2025-01-01", "2025-04-15"],  // 14 weeks
            &["2025-05-01", "2025-04-15"],  // negative, ignored
            &["sin datos", "2025-04-15"],   // ignored
        ]);
        let report = compute(&t, &Filter::default(), "x");
        let kpi = indicator(&report, "captacion_temprana");

        assert_eq!(kpi.column.as_deref(), Some("FUM → Fecha Primer Control"));
        assert_eq!(kpi.denominator, 2);
        assert_eq!(kpi.numerator, 1);
        assert_eq!(kpi.percentage, 50.0);
    }

    #[test]
    fn test_early_enrollment_ignores_impossible_ages() {
        let t = table(&[&["Edad Gestacional"], &["60"], &["9"]]);
        let report = compute(&t, &Filter::default(), "x");
        let kpi = indicator(&report, "captacion_temprana");
        assert_eq!(kpi.denominator, 1);
        assert_eq!(kpi.numerator, 1);
    }

    #[test]
    fn test_recorded_results() {
        let report = compute(&sample(), &Filter::default(), "x");

        let hiv = indicator(&report, "tamizaje_vih");
        assert_eq!(hiv.denominator, 4);
        assert_eq!(hiv.numerator, 2);

        let syphilis = indicator(&report, "tamizaje_sifilis");
        assert_eq!(syphilis.column.as_deref(), Some("Sífilis (VDRL)"));
        assert_eq!(syphilis.numerator, 2);
    }

    #[test]
    fn test_missing_columns_reported() {
        let report = compute(&sample(), &Filter::default(), "x");
        let dental = indicator(&report, "valoracion_odontologica");

        assert!(dental.column.is_none());
        assert_eq!(dental.denominator, 0);
        assert_eq!(dental.percentage, 0.0);
        assert_eq!(report.missing_columns, vec!["valoracion_odontologica"]);
    }

    #[test]
    fn test_every_indicator_present_in_order() {
        let report = compute(&table(&[&["nada"]]), &Filter::default(), "x");
        let keys: Vec<&str> = report.indicators.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "tamizaje_completo",
                "control_prenatal_adecuado",
                "captacion_temprana",
                "tamizaje_vih",
                "tamizaje_sifilis",
                "valoracion_odontologica",
            ]
        );
        assert_eq!(report.missing_columns.len(), 6);
    }

    // ========== filter tests ==========

    #[test]
    fn test_filter_by_ips_ignores_case_and_accents() {
        let filter = Filter {
            ips: Some("CLINICA NORTE".to_string()),
            ..Default::default()
        };
        let report = compute(&sample(), &filter, "x");

        assert_eq!(report.total_rows, 4);
        assert_eq!(report.selected_rows, 2);
        assert_eq!(indicator(&report, "tamizaje_completo").denominator, 2);
    }

    #[test]
    fn test_filter_by_municipality() {
        let filter = Filter {
            municipality: Some("quibdo".to_string()),
            ..Default::default()
        };
        let report = compute(&sample(), &filter, "x");
        assert_eq!(report.selected_rows, 2);
    }

    #[test]
    fn test_filter_by_month_parses_mixed_dates() {
        let filter = Filter {
            month: Some("2025-03".to_string()),
            ..Default::default()
        };
        let report = compute(&sample(), &filter, "x");

        // 2025-03-10, 15/03/2025; serial 45748 is 2025-04-01
        assert_eq!(report.selected_rows, 2);
    }

    #[test]
    fn test_filter_on_missing_column_selects_nothing() {
        let t = table(&[&["Tamizaje"], &["Completo"]]);
        let filter = Filter {
            ips: Some("Hospital".to_string()),
            ..Default::default()
        };
        let report = compute(&t, &filter, "x");
        assert_eq!(report.selected_rows, 0);
        assert_eq!(indicator(&report, "tamizaje_completo").percentage, 0.0);
    }

    #[test]
    fn test_filter_normalized_drops_blanks() {
        let filter = Filter {
            ips: Some("  ".to_string()),
            municipality: Some(" Quibdó ".to_string()),
            month: None,
        }
        .normalized();
        assert_eq!(filter.ips, None);
        assert_eq!(filter.municipality.as_deref(), Some("Quibdó"));
    }

    #[test]
    fn test_filter_month_start_validation() {
        let ok = Filter {
            month: Some("2025-02".to_string()),
            ..Default::default()
        };
        assert_eq!(
            ok.month_start().unwrap(),
            NaiveDate::from_ymd_opt(2025, 2, 1)
        );

        let bad = Filter {
            month: Some("febrero".to_string()),
            ..Default::default()
        };
        assert!(bad.month_start().unwrap_err().contains("Mes no válido"));
    }

    // ========== options tests ==========

    #[test]
    fn test_options_are_distinct_and_sorted() {
        let report = compute(&sample(), &Filter::default(), "x");
        assert_eq!(report.ips_options, vec!["Clínica Norte", "Hospital San José"]);
        assert_eq!(report.municipality_options, vec!["Istmina", "Quibdó"]);
    }

    #[test]
    fn test_report_serializes() {
        let report = compute(&sample(), &Filter::default(), "marzo.xlsx");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["source"], "marzo.xlsx");
        assert_eq!(json["indicators"][0]["key"], "tamizaje_completo");
        assert!(json["indicators"][5]["column"].is_null());
    }
}
