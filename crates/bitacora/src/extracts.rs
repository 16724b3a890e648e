//! The extracts directory: uploaded monthly spreadsheets and their index

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::parser::{self, Table, SUPPORTED_EXTENSIONS};
use crate::store::StoreError;

/// Index entry for one extract file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractInfo {
    pub name: String,
    pub size: u64,
    /// RFC 3339 modification time
    pub modified: String,
    /// Data rows, `None` when the file could not be read
    pub rows: Option<usize>,
    pub error: Option<String>,
}

fn has_supported_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reduce an uploaded file name to a safe basename.
///
/// Directory parts are dropped and characters outside `[A-Za-z0-9._-]`
/// become `_`. The result must keep a supported extension.
pub fn sanitize_name(raw: &str) -> Result<String, String> {
    let base = raw.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");
    let name: String = parser::strip_diacritics(base.trim())
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_start_matches('.').to_string();

    if name.is_empty() {
        return Err("Nombre de archivo no válido".to_string());
    }
    if !has_supported_extension(&name) {
        return Err(format!(
            "Formato no admitido. Use uno de: {}",
            SUPPORTED_EXTENSIONS.join(", ")
        ));
    }
    Ok(name)
}

/// Path of an existing extract. Names that are not already sanitized never resolve.
pub fn resolve(dir: &Path, name: &str) -> Option<PathBuf> {
    if sanitize_name(name).ok().as_deref() != Some(name) {
        return None;
    }
    let path = dir.join(name);
    path.is_file().then_some(path)
}

/// Read an extract as a table
pub fn load_table(dir: &Path, name: &str) -> Result<Option<Table>> {
    match resolve(dir, name) {
        Some(path) => Ok(Some(parser::read_table(&path)?)),
        None => Ok(None),
    }
}

fn describe(path: &Path) -> Result<ExtractInfo> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let modified = metadata
        .modified()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
        .unwrap_or_default();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let (rows, error) = match parser::read_table(path) {
        Ok(table) => (Some(table.rows.len()), None),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Failed to parse extract");
            (None, Some(e.to_string()))
        }
    };

    Ok(ExtractInfo {
        name,
        size: metadata.len(),
        modified,
        rows,
        error,
    })
}

/// Index every supported file in the directory, sorted by name
pub fn scan(dir: &Path) -> Result<Vec<ExtractInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read extracts directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| !n.starts_with('.') && has_supported_extension(n))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut extracts = Vec::with_capacity(paths.len());
    for path in &paths {
        extracts.push(describe(path)?);
    }

    debug!(count = extracts.len(), dir = %dir.display(), "Scanned extracts");
    Ok(extracts)
}

/// Store an uploaded extract, replacing any file with the same name.
///
/// The upload is parsed before it replaces anything; unreadable files are discarded.
pub fn save_upload(dir: &Path, raw_name: &str, bytes: &[u8]) -> Result<ExtractInfo, StoreError> {
    let name = sanitize_name(raw_name).map_err(StoreError::Invalid)?;
    if bytes.is_empty() {
        return Err(StoreError::Invalid("El archivo está vacío".to_string()));
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    // Hidden and keeps the extension so the parser picks the right reader
    let staging = dir.join(format!(".{}-{}", uuid::Uuid::new_v4(), name));
    std::fs::write(&staging, bytes)
        .with_context(|| format!("Failed to write {}", staging.display()))?;

    if let Err(e) = parser::read_table(&staging) {
        let _ = std::fs::remove_file(&staging);
        return Err(StoreError::Invalid(format!(
            "No se pudo leer el archivo {}: {}",
            name, e
        )));
    }

    let target = dir.join(&name);
    std::fs::rename(&staging, &target)
        .with_context(|| format!("Failed to replace {}", target.display()))?;

    let info = describe(&target)?;
    info!(name = %info.name, rows = ?info.rows, "Extract uploaded");
    Ok(info)
}

/// Delete an extract. Returns false when there was no such file.
pub fn remove(dir: &Path, name: &str) -> Result<bool> {
    match resolve(dir, name) {
        Some(path) => {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            info!(name = %name, "Extract deleted");
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ========== Helper functions ==========

    fn extract_xml(rows: usize) -> String {
        let mut xml = String::from(
            r#"<?xml version="1.0"?>
<Workbook xmlns="urn:schemas-microsoft-com:office:spreadsheet">
<Worksheet ss:Name="Hoja1">
<Table>
<Row><Cell><Data ss:Type="String">IPS</Data></Cell><Cell><Data ss:Type="String">Tamizaje</Data></Cell></Row>
"#,
        );
        for i in 0..rows {
            xml.push_str(&format!(
                "<Row><Cell><Data ss:Type=\"String\">IPS {}</Data></Cell><Cell><Data ss:Type=\"String\">Completo</Data></Cell></Row>\n",
                i
            ));
        }
        xml.push_str("</Table>\n</Worksheet>\n</Workbook>");
        xml
    }

    // ========== sanitize_name tests ==========

    #[test]
    fn test_sanitize_name_keeps_safe_names() {
        assert_eq!(sanitize_name("marzo_2025.xlsx").unwrap(), "marzo_2025.xlsx");
        assert_eq!(sanitize_name("Extracto.XLS").unwrap(), "Extracto.XLS");
    }

    #[test]
    fn test_sanitize_name_drops_directories() {
        assert_eq!(sanitize_name("../../etc/marzo.xlsx").unwrap(), "marzo.xlsx");
        assert_eq!(sanitize_name("C:\\Users\\ana\\abril.ods").unwrap(), "abril.ods");
    }

    #[test]
    fn test_sanitize_name_replaces_unsafe_characters() {
        assert_eq!(
            sanitize_name("Extracto Maternidad (marzo).xlsx").unwrap(),
            "Extracto_Maternidad__marzo_.xlsx"
        );
        assert_eq!(sanitize_name("Atención.xml").unwrap(), "Atencion.xml");
        assert_eq!(sanitize_name(".oculto.xlsx").unwrap(), "oculto.xlsx");
    }

    #[test]
    fn test_sanitize_name_rejects_unsupported() {
        assert!(sanitize_name("notas.txt").is_err());
        assert!(sanitize_name("sin_extension").is_err());
        assert!(sanitize_name("").is_err());
        assert!(sanitize_name("carpeta/").is_err());
    }

    // ========== resolve tests ==========

    #[test]
    fn test_resolve_only_existing_sanitized_names() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("marzo.xml"), extract_xml(1)).unwrap();

        assert!(resolve(temp_dir.path(), "marzo.xml").is_some());
        assert!(resolve(temp_dir.path(), "abril.xml").is_none());
        assert!(resolve(temp_dir.path(), "../marzo.xml").is_none());
        assert!(resolve(temp_dir.path(), "marzo.txt").is_none());
    }

    // ========== scan tests ==========

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(scan(&temp_dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_scan_indexes_supported_files() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        std::fs::write(dir.join("b_marzo.xml"), extract_xml(3)).unwrap();
        std::fs::write(dir.join("a_roto.xlsx"), "no es un libro").unwrap();
        std::fs::write(dir.join("notas.txt"), "ignorado").unwrap();
        std::fs::write(dir.join(".staging-x.xml"), extract_xml(1)).unwrap();

        let extracts = scan(dir).unwrap();
        let names: Vec<&str> = extracts.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a_roto.xlsx", "b_marzo.xml"]);

        assert_eq!(extracts[0].rows, None);
        assert!(extracts[0].error.is_some());

        assert_eq!(extracts[1].rows, Some(3));
        assert!(extracts[1].error.is_none());
        assert!(extracts[1].size > 0);
        assert!(!extracts[1].modified.is_empty());
    }

    // ========== upload tests ==========

    #[test]
    fn test_save_upload_stores_parsed_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("extracts");

        let info = save_upload(&dir, "Marzo 2025.xml", extract_xml(2).as_bytes()).unwrap();
        assert_eq!(info.name, "Marzo_2025.xml");
        assert_eq!(info.rows, Some(2));
        assert!(dir.join("Marzo_2025.xml").is_file());

        let table = load_table(&dir, "Marzo_2025.xml").unwrap().unwrap();
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_save_upload_replaces_existing() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        save_upload(dir, "marzo.xml", extract_xml(1).as_bytes()).unwrap();
        let info = save_upload(dir, "marzo.xml", extract_xml(4).as_bytes()).unwrap();

        assert_eq!(info.rows, Some(4));
        assert_eq!(scan(dir).unwrap().len(), 1);
    }

    #[test]
    fn test_save_upload_rejects_unreadable_file() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        let err = save_upload(dir, "marzo.xlsx", b"not a workbook").unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ref m) if m.contains("No se pudo leer")));

        // Nothing left behind, not even the staging file
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }

    #[test]
    fn test_save_upload_rejects_bad_name_and_empty_body() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        assert!(matches!(
            save_upload(dir, "virus.exe", b"x"),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            save_upload(dir, "marzo.xlsx", b""),
            Err(StoreError::Invalid(_))
        ));
    }

    // ========== remove tests ==========

    #[test]
    fn test_remove_extract() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        save_upload(dir, "marzo.xml", extract_xml(1).as_bytes()).unwrap();

        assert!(remove(dir, "marzo.xml").unwrap());
        assert!(!remove(dir, "marzo.xml").unwrap());
        assert!(load_table(dir, "marzo.xml").unwrap().is_none());
    }
}
