//! SQLite audit backend
//!
//! Schema migrations are embedded in the binary and applied in order on open.
//! The first-visit rule is checked inside the insert transaction and backed by
//! a partial unique index.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::store::{AuditQuery, AuditStore, StoreError};
use crate::types::{Audit, VisitType};

/// `(version, sql)` in the order they must run
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema",
    include_str!("../db/migrations/001_initial_schema.sql"),
)];

const AUDIT_COLUMNS: &str = "id, auditor, patient_name, document_type, document_number, event_category, \
     department, municipality, ethnicity, phone, address, follow_up, next_steps, visit_type, \
     visit_date, created_at";

/// Open the database at the given path, running any pending migrations
pub fn init_db(db_path: &Path) -> Result<Connection> {
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    let count = run_migrations(&conn)?;
    if count > 0 {
        info!(count = count, "Applied migrations");
    }

    Ok(conn)
}

/// Apply embedded migrations not yet recorded in `schema_migrations`
pub fn run_migrations(conn: &Connection) -> Result<usize> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version TEXT PRIMARY KEY,
             applied_at TEXT NOT NULL
         );",
    )?;

    let mut applied = 0;

    for (version, sql) in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
            [version],
            |row| row.get(0),
        )?;

        if already_applied {
            continue;
        }

        conn.execute_batch(sql)
            .with_context(|| format!("Failed to apply migration: {}", version))?;

        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;

        debug!(version = %version, "Applied migration");
        applied += 1;
    }

    Ok(applied)
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<Audit> {
    let visit_type: String = row.get(13)?;
    let visit_type = VisitType::parse(&visit_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            13,
            rusqlite::types::Type::Text,
            format!("unknown visit type: {}", visit_type).into(),
        )
    })?;

    Ok(Audit {
        id: row.get(0)?,
        auditor: row.get(1)?,
        patient_name: row.get(2)?,
        document_type: row.get(3)?,
        document_number: row.get(4)?,
        event_category: row.get(5)?,
        department: row.get(6)?,
        municipality: row.get(7)?,
        ethnicity: row.get(8)?,
        phone: row.get(9)?,
        address: row.get(10)?,
        follow_up: row.get(11)?,
        next_steps: row.get(12)?,
        visit_type,
        visit_date: row.get(14)?,
        created_at: row.get(15)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

/// Audits in a SQLite database
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(init_db(db_path)?),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database lock poisoned"))
    }
}

impl AuditStore for SqliteAuditStore {
    fn list(&self, query: &AuditQuery) -> Result<Vec<Audit>> {
        let conn = self.conn()?;
        let document = query.document.as_deref().unwrap_or("").trim();
        let auditor = query.auditor.as_deref().unwrap_or("").trim();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM audits
             WHERE (?1 = '' OR document_number = ?1 COLLATE NOCASE)
               AND (?2 = '' OR auditor = ?2 COLLATE NOCASE)
             ORDER BY created_at DESC",
            AUDIT_COLUMNS
        ))?;

        let audits = stmt
            .query_map(params![document, auditor], audit_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(audits)
    }

    fn get(&self, id: &str) -> Result<Option<Audit>> {
        let conn = self.conn()?;
        let audit = conn
            .query_row(
                &format!("SELECT {} FROM audits WHERE id = ?1", AUDIT_COLUMNS),
                [id],
                audit_from_row,
            )
            .optional()?;
        Ok(audit)
    }

    fn create(&self, audit: &Audit) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        if audit.visit_type == VisitType::Primera {
            let exists: bool = tx
                .query_row(
                    "SELECT COUNT(*) > 0 FROM audits
                     WHERE visit_type = 'primera' AND document_number = ?1 COLLATE NOCASE",
                    [&audit.document_number],
                    |row| row.get(0),
                )
                .context("Failed to check first visit")?;
            if exists {
                return Err(StoreError::DuplicateFirstVisit(audit.document_number.clone()));
            }
        }

        let inserted = tx.execute(
            &format!(
                "INSERT INTO audits ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                AUDIT_COLUMNS
            ),
            params![
                audit.id,
                audit.auditor,
                audit.patient_name,
                audit.document_type,
                audit.document_number,
                audit.event_category,
                audit.department,
                audit.municipality,
                audit.ethnicity,
                audit.phone,
                audit.address,
                audit.follow_up,
                audit.next_steps,
                audit.visit_type.as_str(),
                audit.visit_date,
                audit.created_at,
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) && audit.visit_type == VisitType::Primera => {
                return Err(StoreError::DuplicateFirstVisit(audit.document_number.clone()));
            }
            Err(e) => return Err(anyhow::Error::from(e).context("Failed to insert audit").into()),
        }

        tx.commit().context("Failed to commit audit")?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn.execute("DELETE FROM audits WHERE id = ?1", [id])?;
        Ok(rows > 0)
    }
}
