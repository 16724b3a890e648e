//! File-backed stores.
//!
//! Users always live in `users.json`. Audits go through [`AuditStore`], backed
//! either by `audits.json` (this module) or by SQLite (`db` module). JSON files
//! are flat arrays rewritten wholesale on every mutation, via a temporary
//! sibling and a rename, under a mutex.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::auth;
use crate::config::StoreKind;
use crate::db::SqliteAuditStore;
use crate::types::{Audit, NewUser, Role, User, UserUpdate, VisitType};

/// Largest accepted signature image (decoded)
pub const MAX_SIGNATURE_BYTES: usize = 512 * 1024;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Invalid(String),

    #[error("Ya existe una primera visita registrada para el documento {0}")]
    DuplicateFirstVisit(String),

    #[error("El nombre de usuario {0} ya está en uso")]
    DuplicateUsername(String),

    #[error("Debe existir al menos un administrador")]
    LastAdmin,

    #[error("No puede eliminar su propia cuenta")]
    SelfDelete,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Optional filters for listing audits
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    pub document: Option<String>,
    pub auditor: Option<String>,
}

impl AuditQuery {
    pub fn matches(&self, audit: &Audit) -> bool {
        let document_ok = match self.document.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(doc) => audit.document_number.eq_ignore_ascii_case(doc),
        };
        let auditor_ok = match self.auditor.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(auditor) => audit.auditor.eq_ignore_ascii_case(auditor),
        };
        document_ok && auditor_ok
    }
}

/// Persistence for audit records. There is no update operation.
pub trait AuditStore: Send + Sync {
    /// Audits matching the query, newest first
    fn list(&self, query: &AuditQuery) -> Result<Vec<Audit>>;

    fn get(&self, id: &str) -> Result<Option<Audit>>;

    /// Insert a new audit, enforcing one first visit per document number
    fn create(&self, audit: &Audit) -> Result<(), StoreError>;

    /// Returns false when no audit had that id
    fn delete(&self, id: &str) -> Result<bool>;
}

/// Open the configured audit backend
pub fn open_audit_store(kind: StoreKind, data_dir: &Path) -> Result<Arc<dyn AuditStore>> {
    let store: Arc<dyn AuditStore> = match kind {
        StoreKind::Json => Arc::new(JsonAuditStore::open(data_dir.join("audits.json"))),
        StoreKind::Sqlite => Arc::new(SqliteAuditStore::open(&data_dir.join("bitacora.db"))?),
    };
    info!(backend = ?kind, "Audit store ready");
    Ok(store)
}

/// A JSON array on disk
struct JsonFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("lock poisoned for {}", self.path.display()))
    }

    /// Missing file means an empty list
    fn load<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let items: Vec<T> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        debug!(count = items.len(), path = %self.path.display(), "Loaded records");
        Ok(items)
    }

    fn save<T: Serialize>(&self, items: &[T]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let json = serde_json::to_string_pretty(items)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Audits in a flat JSON file
pub struct JsonAuditStore {
    file: JsonFile,
}

impl JsonAuditStore {
    pub fn open(path: PathBuf) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }
}

impl AuditStore for JsonAuditStore {
    fn list(&self, query: &AuditQuery) -> Result<Vec<Audit>> {
        let _guard = self.file.guard()?;
        let mut audits: Vec<Audit> = self.file.load()?;
        audits.retain(|a| query.matches(a));
        audits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(audits)
    }

    fn get(&self, id: &str) -> Result<Option<Audit>> {
        let _guard = self.file.guard()?;
        let audits: Vec<Audit> = self.file.load()?;
        Ok(audits.into_iter().find(|a| a.id == id))
    }

    fn create(&self, audit: &Audit) -> Result<(), StoreError> {
        let _guard = self.file.guard()?;
        let mut audits: Vec<Audit> = self.file.load()?;

        if audit.visit_type == VisitType::Primera
            && audits.iter().any(|a| {
                a.visit_type == VisitType::Primera
                    && a.document_number.eq_ignore_ascii_case(&audit.document_number)
            })
        {
            return Err(StoreError::DuplicateFirstVisit(audit.document_number.clone()));
        }

        audits.push(audit.clone());
        self.file.save(&audits)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.file.guard()?;
        let mut audits: Vec<Audit> = self.file.load()?;
        let before = audits.len();
        audits.retain(|a| a.id != id);

        if audits.len() == before {
            return Ok(false);
        }
        self.file.save(&audits)?;
        Ok(true)
    }
}

/// User accounts in `users.json`
pub struct UserStore {
    file: JsonFile,
}

impl UserStore {
    pub fn open(path: PathBuf) -> Self {
        Self {
            file: JsonFile::new(path),
        }
    }

    pub fn list(&self) -> Result<Vec<User>> {
        let _guard = self.file.guard()?;
        let mut users: Vec<User> = self.file.load()?;
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let _guard = self.file.guard()?;
        Ok(self.file.load::<User>()?.is_empty())
    }

    pub fn get(&self, id: &str) -> Result<Option<User>> {
        let _guard = self.file.guard()?;
        let users: Vec<User> = self.file.load()?;
        Ok(users.into_iter().find(|u| u.id == id))
    }

    pub fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let username = username.trim();
        let _guard = self.file.guard()?;
        let users: Vec<User> = self.file.load()?;
        Ok(users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username)))
    }

    /// Check a login. Unknown users and wrong passwords look the same.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        Ok(self
            .find_by_username(username)?
            .filter(|user| auth::verify_password(password, &user.password_hash)))
    }

    pub fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let username = new.username.trim().to_lowercase();
        validate_username(&username)?;
        validate_password(&new.password)?;

        let full_name = new.full_name.trim().to_string();
        if full_name.is_empty() {
            return Err(StoreError::Invalid("El nombre completo es obligatorio".to_string()));
        }
        let role = parse_role(&new.role)?;
        let signature = normalize_signature(new.signature)?;

        let _guard = self.file.guard()?;
        let mut users: Vec<User> = self.file.load()?;
        if users.iter().any(|u| u.username.eq_ignore_ascii_case(&username)) {
            return Err(StoreError::DuplicateUsername(username));
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username,
            password_hash: auth::hash_password(&new.password)?,
            full_name,
            role,
            position: new.position.trim().to_string(),
            signature,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        users.push(user.clone());
        self.file.save(&users)?;

        info!(username = %user.username, role = %user.role, "User created");
        Ok(user)
    }

    /// Apply a partial update. `None` when the user does not exist.
    pub fn update(&self, id: &str, update: UserUpdate) -> Result<Option<User>, StoreError> {
        let role = update.role.as_deref().map(parse_role).transpose()?;
        if let Some(password) = &update.password {
            validate_password(password)?;
        }
        let signature = match update.signature {
            None => None,
            Some(raw) => Some(normalize_signature(Some(raw))?),
        };

        let _guard = self.file.guard()?;
        let mut users: Vec<User> = self.file.load()?;
        let admins = users.iter().filter(|u| u.is_admin()).count();

        let Some(user) = users.iter_mut().find(|u| u.id == id) else {
            return Ok(None);
        };

        if let Some(full_name) = update.full_name {
            let full_name = full_name.trim().to_string();
            if full_name.is_empty() {
                return Err(StoreError::Invalid("El nombre completo es obligatorio".to_string()));
            }
            user.full_name = full_name;
        }
        if let Some(role) = role {
            if user.is_admin() && role != Role::Admin && admins <= 1 {
                return Err(StoreError::LastAdmin);
            }
            user.role = role;
        }
        if let Some(position) = update.position {
            user.position = position.trim().to_string();
        }
        if let Some(signature) = signature {
            user.signature = signature;
        }
        if let Some(password) = update.password {
            user.password_hash = auth::hash_password(&password)?;
        }

        let updated = user.clone();
        self.file.save(&users)?;

        info!(username = %updated.username, "User updated");
        Ok(Some(updated))
    }

    /// Delete a user on behalf of `acting_user_id`. Returns false when absent.
    pub fn delete(&self, id: &str, acting_user_id: &str) -> Result<bool, StoreError> {
        if id == acting_user_id {
            return Err(StoreError::SelfDelete);
        }

        let _guard = self.file.guard()?;
        let mut users: Vec<User> = self.file.load()?;

        let Some(target) = users.iter().find(|u| u.id == id) else {
            return Ok(false);
        };
        if target.is_admin() && users.iter().filter(|u| u.is_admin()).count() <= 1 {
            return Err(StoreError::LastAdmin);
        }

        users.retain(|u| u.id != id);
        self.file.save(&users)?;
        info!(id = %id, "User deleted");
        Ok(true)
    }
}

fn validate_username(username: &str) -> Result<(), StoreError> {
    let valid_len = (3..=32).contains(&username.chars().count());
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));

    if valid_len && valid_chars {
        Ok(())
    } else {
        Err(StoreError::Invalid(
            "El usuario debe tener entre 3 y 32 caracteres (letras, números, '.', '_' o '-')"
                .to_string(),
        ))
    }
}

fn validate_password(password: &str) -> Result<(), StoreError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(StoreError::Invalid(format!(
            "La contraseña debe tener al menos {} caracteres",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn parse_role(raw: &str) -> Result<Role, StoreError> {
    if raw.trim().is_empty() {
        return Ok(Role::User);
    }
    Role::parse(raw).ok_or_else(|| StoreError::Invalid(format!("Rol no válido: {}", raw)))
}

/// Validate a signature data URL. Blank input clears the signature.
pub fn normalize_signature(raw: Option<String>) -> Result<Option<String>, StoreError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let payload = ["data:image/png;base64,", "data:image/jpeg;base64,"]
        .iter()
        .find_map(|prefix| value.strip_prefix(prefix))
        .ok_or_else(|| StoreError::Invalid("La firma debe ser una imagen PNG o JPEG".to_string()))?;

    let decoded = B64
        .decode(payload)
        .map_err(|_| StoreError::Invalid("La imagen de la firma está dañada".to_string()))?;
    if decoded.len() > MAX_SIGNATURE_BYTES {
        return Err(StoreError::Invalid(
            "La imagen de la firma no puede superar 512 KB".to_string(),
        ));
    }

    Ok(Some(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewAudit;
    use tempfile::TempDir;

    // ========== Helper functions ==========

    fn make_audit(document: &str, visit_type: &str, created_at: &str) -> Audit {
        let form = NewAudit {
            patient_name: "Paciente".to_string(),
            document_number: document.to_string(),
            event_category: "Sífilis gestacional".to_string(),
            visit_type: visit_type.to_string(),
            ..Default::default()
        };
        let mut audit = form.into_audit("auditor", chrono::Utc::now()).unwrap();
        audit.created_at = created_at.to_string();
        audit
    }

    fn new_user(username: &str, role: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            password: "clave-larga".to_string(),
            full_name: "Nombre Apellido".to_string(),
            role: role.to_string(),
            position: "Auditora".to_string(),
            signature: None,
        }
    }

    fn setup_users() -> (TempDir, UserStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = UserStore::open(temp_dir.path().join("users.json"));
        (temp_dir, store)
    }

    const TINY_PNG: &str = "data:image/png;base64,iVBORw0KGgo=";

    // ========== JsonAuditStore tests ==========

    #[test]
    fn test_audit_store_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAuditStore::open(temp_dir.path().join("audits.json"));
        assert!(store.list(&AuditQuery::default()).unwrap().is_empty());
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_audit_store_create_get_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAuditStore::open(temp_dir.path().join("data").join("audits.json"));
        let audit = make_audit("111", "primera", "2025-01-01T00:00:00+00:00");

        store.create(&audit).unwrap();
        assert_eq!(store.get(&audit.id).unwrap(), Some(audit.clone()));

        assert!(store.delete(&audit.id).unwrap());
        assert!(!store.delete(&audit.id).unwrap());
        assert!(store.get(&audit.id).unwrap().is_none());
    }

    #[test]
    fn test_audit_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("audits.json");
        let audit = make_audit("111", "primera", "2025-01-01T00:00:00+00:00");

        JsonAuditStore::open(path.clone()).create(&audit).unwrap();
        let reopened = JsonAuditStore::open(path.clone());

        assert_eq!(reopened.list(&AuditQuery::default()).unwrap().len(), 1);
        assert!(!temp_dir.path().join("audits.json.tmp").exists());
    }

    #[test]
    fn test_audit_store_rejects_second_first_visit() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAuditStore::open(temp_dir.path().join("audits.json"));

        store
            .create(&make_audit("ABC123", "primera", "2025-01-01T00:00:00+00:00"))
            .unwrap();
        let err = store
            .create(&make_audit("abc123", "primera", "2025-01-02T00:00:00+00:00"))
            .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateFirstVisit(_)));
        assert_eq!(store.list(&AuditQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_audit_store_allows_follow_ups() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAuditStore::open(temp_dir.path().join("audits.json"));

        store
            .create(&make_audit("111", "seguimiento", "2025-01-01T00:00:00+00:00"))
            .unwrap();
        store
            .create(&make_audit("111", "primera", "2025-01-02T00:00:00+00:00"))
            .unwrap();
        store
            .create(&make_audit("111", "seguimiento", "2025-01-03T00:00:00+00:00"))
            .unwrap();
        store
            .create(&make_audit("111", "cierre", "2025-01-04T00:00:00+00:00"))
            .unwrap();

        assert_eq!(store.list(&AuditQuery::default()).unwrap().len(), 4);
    }

    #[test]
    fn test_audit_store_list_newest_first_and_filtered() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonAuditStore::open(temp_dir.path().join("audits.json"));

        store
            .create(&make_audit("111", "primera", "2025-01-01T00:00:00+00:00"))
            .unwrap();
        store
            .create(&make_audit("222", "primera", "2025-01-03T00:00:00+00:00"))
            .unwrap();
        store
            .create(&make_audit("111", "seguimiento", "2025-01-02T00:00:00+00:00"))
            .unwrap();

        let all = store.list(&AuditQuery::default()).unwrap();
        let dates: Vec<&str> = all.iter().map(|a| &a.created_at[..10]).collect();
        assert_eq!(dates, vec!["2025-01-03", "2025-01-02", "2025-01-01"]);

        let query = AuditQuery {
            document: Some("111".to_string()),
            auditor: None,
        };
        assert_eq!(store.list(&query).unwrap().len(), 2);

        let query = AuditQuery {
            document: None,
            auditor: Some("otro".to_string()),
        };
        assert!(store.list(&query).unwrap().is_empty());
    }

    #[test]
    fn test_audit_store_corrupt_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("audits.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonAuditStore::open(path);
        assert!(store.list(&AuditQuery::default()).is_err());
    }

    // ========== UserStore tests ==========

    #[test]
    fn test_user_create_and_authenticate() {
        let (_temp_dir, store) = setup_users();
        let user = store.create(new_user("Ana.Gomez", "admin")).unwrap();

        assert_eq!(user.username, "ana.gomez");
        assert_eq!(user.role, Role::Admin);
        assert_ne!(user.password_hash, "clave-larga");

        assert!(store.authenticate("ANA.GOMEZ", "clave-larga").unwrap().is_some());
        assert!(store.authenticate("ana.gomez", "otra-clave").unwrap().is_none());
        assert!(store.authenticate("nadie", "clave-larga").unwrap().is_none());
    }

    #[test]
    fn test_user_create_defaults_to_user_role() {
        let (_temp_dir, store) = setup_users();
        let user = store.create(new_user("luis", "")).unwrap();
        assert_eq!(user.role, Role::User);
    }

    #[test]
    fn test_user_unique_username() {
        let (_temp_dir, store) = setup_users();
        store.create(new_user("ana", "admin")).unwrap();
        let err = store.create(new_user("ANA", "user")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUsername(_)));
    }

    #[test]
    fn test_user_create_validation() {
        let (_temp_dir, store) = setup_users();

        assert!(matches!(
            store.create(new_user("a", "user")),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.create(new_user("con espacio", "user")),
            Err(StoreError::Invalid(_))
        ));
        assert!(matches!(
            store.create(new_user("ana", "superadmin")),
            Err(StoreError::Invalid(_))
        ));

        let mut short = new_user("ana", "user");
        short.password = "corta".to_string();
        assert!(matches!(store.create(short), Err(StoreError::Invalid(_))));

        let mut nameless = new_user("ana", "user");
        nameless.full_name = "  ".to_string();
        assert!(matches!(store.create(nameless), Err(StoreError::Invalid(_))));

        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_user_update_fields() {
        let (_temp_dir, store) = setup_users();
        store.create(new_user("admin", "admin")).unwrap();
        let user = store.create(new_user("ana", "user")).unwrap();

        let updated = store
            .update(
                &user.id,
                UserUpdate {
                    full_name: Some("Ana María".to_string()),
                    role: Some("admin".to_string()),
                    position: Some("Coordinadora".to_string()),
                    signature: Some(TINY_PNG.to_string()),
                    password: Some("nueva-clave".to_string()),
                },
            )
            .unwrap()
            .unwrap();

        assert_eq!(updated.full_name, "Ana María");
        assert_eq!(updated.role, Role::Admin);
        assert_eq!(updated.position, "Coordinadora");
        assert_eq!(updated.signature.as_deref(), Some(TINY_PNG));
        assert!(store.authenticate("ana", "nueva-clave").unwrap().is_some());
    }

    #[test]
    fn test_user_update_clears_signature() {
        let (_temp_dir, store) = setup_users();
        let mut form = new_user("ana", "admin");
        form.signature = Some(TINY_PNG.to_string());
        let user = store.create(form).unwrap();
        assert!(user.signature.is_some());

        let updated = store
            .update(
                &user.id,
                UserUpdate {
                    signature: Some(String::new()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert!(updated.signature.is_none());
    }

    #[test]
    fn test_user_update_missing_user() {
        let (_temp_dir, store) = setup_users();
        assert!(store.update("nope", UserUpdate::default()).unwrap().is_none());
    }

    #[test]
    fn test_cannot_demote_last_admin() {
        let (_temp_dir, store) = setup_users();
        let admin = store.create(new_user("admin", "admin")).unwrap();

        let err = store
            .update(
                &admin.id,
                UserUpdate {
                    role: Some("user".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::LastAdmin));
    }

    #[test]
    fn test_user_delete_rules() {
        let (_temp_dir, store) = setup_users();
        let admin = store.create(new_user("admin", "admin")).unwrap();
        let other_admin = store.create(new_user("jefa", "admin")).unwrap();
        let user = store.create(new_user("ana", "user")).unwrap();

        assert!(matches!(
            store.delete(&admin.id, &admin.id),
            Err(StoreError::SelfDelete)
        ));
        assert!(store.delete(&user.id, &admin.id).unwrap());
        assert!(!store.delete(&user.id, &admin.id).unwrap());
        assert!(store.delete(&other_admin.id, &admin.id).unwrap());

        // Only one admin left; someone else cannot remove it
        let helper = store.create(new_user("helper", "user")).unwrap();
        assert!(matches!(
            store.delete(&admin.id, &helper.id),
            Err(StoreError::LastAdmin)
        ));
    }

    #[test]
    fn test_user_list_sorted() {
        let (_temp_dir, store) = setup_users();
        store.create(new_user("zoe", "admin")).unwrap();
        store.create(new_user("ana", "user")).unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|u| u.username).collect();
        assert_eq!(names, vec!["ana", "zoe"]);
    }

    #[test]
    fn test_users_file_accepts_cargo_field() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("users.json");
        std::fs::write(
            &path,
            format!(
                r#"[{{"id":"1","username":"ana","password_hash":"{}","full_name":"Ana","role":"admin","cargo":"Auditora","created_at":"2025-01-01T00:00:00Z"}}]"#,
                auth::hash_password("clave-larga").unwrap()
            ),
        )
        .unwrap();

        let store = UserStore::open(path);
        let user = store.authenticate("ana", "clave-larga").unwrap().unwrap();
        assert_eq!(user.position, "Auditora");
    }

    // ========== signature tests ==========

    #[test]
    fn test_normalize_signature() {
        assert_eq!(normalize_signature(None).unwrap(), None);
        assert_eq!(normalize_signature(Some("  ".to_string())).unwrap(), None);
        assert_eq!(
            normalize_signature(Some(TINY_PNG.to_string())).unwrap().as_deref(),
            Some(TINY_PNG)
        );
    }

    #[test]
    fn test_normalize_signature_rejects_bad_input() {
        assert!(normalize_signature(Some("data:image/gif;base64,R0lG".to_string())).is_err());
        assert!(normalize_signature(Some("data:image/png;base64,@@@".to_string())).is_err());
        assert!(normalize_signature(Some("https://example.com/firma.png".to_string())).is_err());
    }

    #[test]
    fn test_normalize_signature_size_limit() {
        let big = B64.encode(vec![0u8; MAX_SIGNATURE_BYTES + 1]);
        let err = normalize_signature(Some(format!("data:image/png;base64,{}", big))).unwrap_err();
        assert!(err.to_string().contains("512 KB"));
    }
}
