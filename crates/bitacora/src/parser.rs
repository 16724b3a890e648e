use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Days, NaiveDate};
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::reader::Reader as XmlReader;
use std::fs;
use std::path::Path;

/// File extensions accepted as monthly extracts
pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods", "xml"];

/// Largest spreadsheet serial number Excel can represent (9999-12-31)
const MAX_SERIAL: f64 = 2_958_465.0;

/// A worksheet read as text: one header row plus data rows
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Header cells exactly as they appear in the file
    pub headers: Vec<String>,
    /// Headers after [`normalize_header`], same order as `headers`
    pub normalized: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table from raw rows. The first non-empty row is the header row.
    pub fn from_rows(rows: Vec<Vec<String>>) -> Result<Self> {
        let mut rows = rows
            .into_iter()
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()));

        let headers = rows
            .next()
            .context("El archivo no contiene filas de datos")?;
        let normalized = headers.iter().map(|h| normalize_header(h)).collect();

        Ok(Self {
            headers,
            normalized,
            rows: rows.collect(),
        })
    }

    /// Index of the first column matching any of the fragment sets, tried in order
    pub fn column(&self, alternatives: &[&[&str]]) -> Option<usize> {
        alternatives
            .iter()
            .find_map(|fragments| find_column(&self.normalized, fragments))
    }

    /// Raw header text of a column
    pub fn header(&self, index: usize) -> &str {
        self.headers.get(index).map(String::as_str).unwrap_or("")
    }
}

/// Trimmed cell text, empty when the row is shorter than the header
pub fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(|s| s.trim()).unwrap_or("")
}

/// Read the first worksheet of an extract.
/// Supports SpreadsheetML XML (Excel 2003 exports) and the formats calamine opens (.xlsx, .xlsb, .xls, .ods)
pub fn read_table(path: &Path) -> Result<Table> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;

    if is_spreadsheet_ml(&bytes) {
        let content = String::from_utf8(bytes).context("SpreadsheetML file is not valid UTF-8")?;
        return Table::from_rows(parse_spreadsheet_rows(&content)?);
    }

    read_with_calamine(path)
}

/// SpreadsheetML files are plain XML; sniff the first kilobyte
fn is_spreadsheet_ml(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let head = String::from_utf8_lossy(head);
    let head = head.trim_start_matches('\u{feff}').trim_start();
    head.starts_with("<?xml") || head.contains("<Workbook")
}

fn read_with_calamine(path: &Path) -> Result<Table> {
    let mut workbook =
        open_workbook_auto(path).with_context(|| format!("Failed to open file: {:?}", path))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .context("Workbook has no sheets")?
        .clone();

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read worksheet")?;

    let rows: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    Table::from_rows(rows)
}

/// Parse SpreadsheetML XML into rows of cell values
fn parse_spreadsheet_rows(xml: &str) -> Result<Vec<Vec<String>>> {
    let mut reader = XmlReader::from_str(xml);
    // Trim at cell level to keep spaces around entities
    reader.config_mut().trim_text(false);

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut in_row = false;
    let mut in_cell = false;
    let mut in_data = false;
    let mut current_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Row" => {
                    in_row = true;
                    current_row = Vec::new();
                }
                b"Cell" => {
                    if in_row {
                        in_cell = true;
                        pad_to_index(&mut current_row, &e);
                    }
                }
                b"Data" => {
                    if in_cell {
                        in_data = true;
                        current_text.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                // <Cell/> or <Cell ss:Index="4"/>
                if in_row && e.local_name().as_ref() == b"Cell" {
                    pad_to_index(&mut current_row, &e);
                    current_row.push(String::new());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                // First worksheet only
                b"Worksheet" => break,
                b"Row" => {
                    if in_row && !current_row.is_empty() {
                        rows.push(std::mem::take(&mut current_row));
                    }
                    in_row = false;
                }
                b"Cell" => {
                    if in_cell && !in_data {
                        current_row.push(String::new());
                    }
                    in_cell = false;
                }
                b"Data" => {
                    if in_data {
                        current_row.push(current_text.trim().to_string());
                        current_text.clear();
                    }
                    in_data = false;
                    // Cell already has its value; </Cell> must not push another
                    in_cell = false;
                }
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_data {
                    if let Ok(decoded) = e.decode() {
                        if let Ok(text) = unescape(&decoded) {
                            current_text.push_str(&text);
                        }
                    }
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if in_data {
                    // &#10; &#x20; ...
                    if let Some(ch) = e.resolve_char_ref()? {
                        current_text.push(ch);
                    } else if let Ok(decoded) = e.decode() {
                        let resolved = match decoded.as_ref() {
                            "amp" => "&",
                            "lt" => "<",
                            "gt" => ">",
                            "quot" => "\"",
                            "apos" => "'",
                            other => anyhow::bail!("Unknown XML entity: &{};", other),
                        };
                        current_text.push_str(resolved);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => anyhow::bail!("XML parse error: {}", e),
            _ => {}
        }
    }

    Ok(rows)
}

/// Honour `ss:Index` (1-based), which SpreadsheetML uses to skip empty cells
fn pad_to_index(row: &mut Vec<String>, element: &quick_xml::events::BytesStart<'_>) {
    let index = element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"Index")
        .and_then(|attr| std::str::from_utf8(&attr.value).ok()?.trim().parse::<usize>().ok());

    if let Some(index) = index {
        while row.len() + 1 < index {
            row.push(String::new());
        }
    }
}

/// Convert a calamine Data cell to a String
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(datetime) => datetime.format("%Y-%m-%d").to_string(),
            None => dt.as_f64().to_string(),
        },
        Data::DateTimeIso(s) => s.split('T').next().unwrap_or(s).to_string(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#{:?}", e),
    }
}

/// Replace accented Latin letters with their base letter
pub fn strip_diacritics(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' | 'ã' => 'a',
            'Á' | 'À' | 'Ä' | 'Â' | 'Ã' => 'A',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'É' | 'È' | 'Ë' | 'Ê' => 'E',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'Í' | 'Ì' | 'Ï' | 'Î' => 'I',
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
            'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => 'O',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'Ú' | 'Ù' | 'Ü' | 'Û' => 'U',
            'ñ' => 'n',
            'Ñ' => 'N',
            'ç' => 'c',
            'Ç' => 'C',
            other => other,
        })
        .collect()
}

/// Lowercased, accent-free text used for all cell comparisons
pub fn fold(s: &str) -> String {
    strip_diacritics(s.trim()).to_lowercase()
}

/// Normalize a header: strip diacritics, lowercase, join words with `_`.
///
/// `"Fecha  de Atención "` becomes `fecha_de_atencion`.
pub fn normalize_header(header: &str) -> String {
    let folded = fold(header);
    let mut out = String::with_capacity(folded.len());
    let mut pending_sep = false;

    for c in folded.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
    }

    out
}

/// Find the first normalized header containing every fragment
pub fn find_column(normalized_headers: &[String], fragments: &[&str]) -> Option<usize> {
    if fragments.is_empty() {
        return None;
    }
    normalized_headers
        .iter()
        .position(|header| fragments.iter().all(|f| header.contains(f)))
}

/// Parse the date encodings found in extracts.
///
/// Tries spreadsheet serial numbers, ISO `YYYY-MM-DD`, then `D/M/Y` or
/// `M/D/Y`. Ambiguous day/month pairs are read as `D/M/Y`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(serial) = value.parse::<f64>() {
        return date_from_serial(serial);
    }

    let date_part = value
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(value);

    let parts: Vec<&str> = date_part.split(['/', '-', '.']).collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    // ISO 2025-03-10, also 2025/03/10
    if parts[0].len() == 4 {
        let year: i32 = parts[0].parse().ok()?;
        let month: u32 = parts[1].parse().ok()?;
        let day: u32 = parts[2].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    let first: u32 = parts[0].parse().ok()?;
    let second: u32 = parts[1].parse().ok()?;
    let mut year: i32 = parts[2].parse().ok()?;
    if parts[2].len() == 2 {
        year += 2000;
    }

    let (day, month) = if first > 12 {
        (first, second)
    } else if second > 12 {
        (second, first)
    } else {
        (first, second)
    };

    NaiveDate::from_ymd_opt(year, month, day)
}

/// Spreadsheet serial (1900 date system) to a date. The fraction is the time of day.
fn date_from_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || !(1.0..=MAX_SERIAL).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(serial.trunc() as u64))
}

/// Leading integer of a cell ("5 controles" -> 5, "4.0" -> 4)
pub fn parse_count(raw: &str) -> Option<u32> {
    let value = raw.trim();
    if let Ok(f) = value.parse::<f64>() {
        return (f.is_finite() && f >= 0.0).then_some(f.trunc() as u32);
    }
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
