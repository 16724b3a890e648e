//! CSV downloads for audits and KPI reports.
//!
//! Files start with a UTF-8 byte order mark so spreadsheet programs pick the
//! right encoding, and cells that a spreadsheet would evaluate as a formula
//! are prefixed with `'`.

use anyhow::{anyhow, Context, Result};
use std::borrow::Cow;

use crate::kpi::KpiReport;
use crate::types::Audit;

const BOM: &[u8] = b"\xEF\xBB\xBF";

const AUDIT_HEADERS: [&str; 16] = [
    "ID",
    "Fecha de registro",
    "Auditor",
    "Paciente",
    "Tipo de documento",
    "Número de documento",
    "Categoría del evento",
    "Departamento",
    "Municipio",
    "Etnia",
    "Teléfono",
    "Dirección",
    "Seguimiento",
    "Próximos pasos",
    "Tipo de visita",
    "Fecha de visita",
];

/// Prefix cells starting with `=`, `+`, `-` or `@` so they stay text
pub fn neutralize(value: &str) -> Cow<'_, str> {
    if value.starts_with(['=', '+', '-', '@']) {
        Cow::Owned(format!("'{}", value))
    } else {
        Cow::Borrowed(value)
    }
}

fn writer(flexible: bool) -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .flexible(flexible)
        .from_writer(BOM.to_vec())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to finalize CSV export: {}", e))
}

/// Consolidated audit log, one row per audit
pub fn audits_csv(audits: &[Audit]) -> Result<Vec<u8>> {
    let mut csv = writer(false);
    csv.write_record(AUDIT_HEADERS)
        .context("Failed to write CSV header")?;

    for audit in audits {
        let fields = [
            audit.id.as_str(),
            audit.created_at.as_str(),
            audit.auditor.as_str(),
            audit.patient_name.as_str(),
            audit.document_type.as_str(),
            audit.document_number.as_str(),
            audit.event_category.as_str(),
            audit.department.as_str(),
            audit.municipality.as_str(),
            audit.ethnicity.as_str(),
            audit.phone.as_str(),
            audit.address.as_str(),
            audit.follow_up.as_str(),
            audit.next_steps.as_str(),
            audit.visit_type.label(),
            audit.visit_date.as_str(),
        ];
        csv.write_record(fields.iter().map(|f| neutralize(f).into_owned()))
            .context("Failed to write CSV row")?;
    }

    finish(csv)
}

/// KPI results: a short selection summary, then one row per indicator
pub fn kpi_csv(report: &KpiReport) -> Result<Vec<u8>> {
    let mut csv = writer(true);
    let all = "Todos";

    let summary = [
        ("Archivo", report.source.as_str()),
        ("IPS", report.filter.ips.as_deref().unwrap_or(all)),
        ("Municipio", report.filter.municipality.as_deref().unwrap_or(all)),
        ("Mes", report.filter.month.as_deref().unwrap_or(all)),
    ];
    for (label, value) in summary {
        csv.write_record([label, &*neutralize(value)])
            .context("Failed to write CSV summary")?;
    }
    let selected = format!("{} de {}", report.selected_rows, report.total_rows);
    csv.write_record(["Filas seleccionadas", selected.as_str()])
        .context("Failed to write CSV summary")?;
    csv.write_record([""])?;

    csv.write_record(["Indicador", "Clave", "Columna", "Numerador", "Denominador", "Porcentaje"])
        .context("Failed to write CSV header")?;

    for indicator in &report.indicators {
        let column = indicator.column.as_deref().unwrap_or("(no encontrada)");
        csv.write_record([
            indicator.label.clone(),
            indicator.key.clone(),
            neutralize(column).into_owned(),
            indicator.numerator.to_string(),
            indicator.denominator.to_string(),
            format!("{:.1}", indicator.percentage),
        ])
        .context("Failed to write CSV row")?;
    }

    finish(csv)
}
