use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of case visit recorded by an auditor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VisitType {
    /// First contact with the case. Only one per document number.
    Primera,
    Seguimiento,
    Cierre,
}

impl VisitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitType::Primera => "primera",
            VisitType::Seguimiento => "seguimiento",
            VisitType::Cierre => "cierre",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VisitType::Primera => "Primera visita",
            VisitType::Seguimiento => "Seguimiento",
            VisitType::Cierre => "Cierre de caso",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "primera" => Some(VisitType::Primera),
            "seguimiento" => Some(VisitType::Seguimiento),
            "cierre" => Some(VisitType::Cierre),
            _ => None,
        }
    }
}

impl fmt::Display for VisitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single case-visit record
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Audit {
    pub id: String,

    /// Username of the session that recorded the visit
    pub auditor: String,

    pub patient_name: String,
    pub document_type: String,
    pub document_number: String,

    /// Event category (e.g., "Morbilidad materna extrema")
    pub event_category: String,

    pub department: String,
    pub municipality: String,
    pub ethnicity: String,

    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,

    /// Follow-up notes
    #[serde(default)]
    pub follow_up: String,
    #[serde(default)]
    pub next_steps: String,

    pub visit_type: VisitType,

    /// Visit date in YYYY-MM-DD format
    pub visit_date: String,

    /// RFC 3339 creation timestamp
    pub created_at: String,
}

/// Form payload for a new audit. Server-assigned fields are absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewAudit {
    pub patient_name: String,
    pub document_type: String,
    pub document_number: String,
    pub event_category: String,
    pub department: String,
    pub municipality: String,
    pub ethnicity: String,
    pub phone: String,
    pub address: String,
    pub follow_up: String,
    pub next_steps: String,
    pub visit_type: String,
    pub visit_date: String,
}

impl NewAudit {
    /// Validate the form and build the stored record.
    ///
    /// Returns a user-facing (Spanish) message on the first invalid field.
    pub fn into_audit(self, auditor: &str, now: chrono::DateTime<chrono::Utc>) -> Result<Audit, String> {
        let patient_name = self.patient_name.trim().to_string();
        if patient_name.is_empty() {
            return Err("El nombre de la paciente es obligatorio".to_string());
        }

        let document_number = self.document_number.trim().to_uppercase();
        if document_number.is_empty() {
            return Err("El número de documento es obligatorio".to_string());
        }
        if !document_number.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err("El número de documento solo puede contener letras y números".to_string());
        }

        let event_category = self.event_category.trim().to_string();
        if event_category.is_empty() {
            return Err("La categoría del evento es obligatoria".to_string());
        }

        let visit_type = VisitType::parse(&self.visit_type)
            .ok_or_else(|| "Tipo de visita no válido".to_string())?;

        let phone = self.phone.trim().to_string();
        if !phone
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '+' | '-'))
        {
            return Err("El teléfono solo puede contener números".to_string());
        }

        let visit_date = match self.visit_date.trim() {
            "" => now.format("%Y-%m-%d").to_string(),
            raw => chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| "La fecha de visita debe tener el formato AAAA-MM-DD".to_string())?
                .format("%Y-%m-%d")
                .to_string(),
        };

        let document_type = match self.document_type.trim() {
            "" => "CC".to_string(),
            other => other.to_uppercase(),
        };

        Ok(Audit {
            id: uuid::Uuid::new_v4().to_string(),
            auditor: auditor.to_string(),
            patient_name,
            document_type,
            document_number,
            event_category,
            department: self.department.trim().to_string(),
            municipality: self.municipality.trim().to_string(),
            ethnicity: self.ethnicity.trim().to_string(),
            phone,
            address: self.address.trim().to_string(),
            follow_up: self.follow_up.trim().to_string(),
            next_steps: self.next_steps.trim().to_string(),
            visit_type,
            visit_date,
            created_at: now.to_rfc3339(),
        })
    }
}

/// Account role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A login identity as persisted in users.json
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub full_name: String,
    pub role: Role,

    /// Job title ("cargo"), printed under the signature
    #[serde(default, alias = "cargo")]
    pub position: String,

    /// Signature image as a data URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    pub created_at: String,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The user without credentials, safe to send to clients
    pub fn public(&self) -> PublicUser {
        PublicUser {
            id: self.id.clone(),
            username: self.username.clone(),
            full_name: self.full_name.clone(),
            role: self.role,
            position: self.position.clone(),
            signature: self.signature.clone(),
            created_at: self.created_at.clone(),
        }
    }
}

/// User as returned by the API (no password hash)
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PublicUser {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub position: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub created_at: String,
}

/// Payload for creating a user
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub full_name: String,
    pub role: String,
    #[serde(alias = "cargo")]
    pub position: String,
    pub signature: Option<String>,
}

/// Partial update for a user. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserUpdate {
    pub full_name: Option<String>,
    pub role: Option<String>,
    #[serde(alias = "cargo")]
    pub position: Option<String>,
    /// `Some("")` removes the signature
    pub signature: Option<String>,
    pub password: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2025, 3, 14, 10, 30, 0).unwrap()
    }

    fn valid_form() -> NewAudit {
        NewAudit {
            patient_name: "María Pérez".to_string(),
            document_type: "cc".to_string(),
            document_number: "1012345678".to_string(),
            event_category: "Morbilidad materna extrema".to_string(),
            department: "Chocó".to_string(),
            municipality: "Quibdó".to_string(),
            ethnicity: "Afrocolombiana".to_string(),
            phone: "+57 300 123-4567".to_string(),
            address: "Barrio Centro".to_string(),
            follow_up: "Se verifica asistencia a control".to_string(),
            next_steps: "Llamar en 8 días".to_string(),
            visit_type: "primera".to_string(),
            visit_date: "2025-03-10".to_string(),
        }
    }

    // ========== VisitType tests ==========

    #[test]
    fn test_visit_type_parse() {
        assert_eq!(VisitType::parse("primera"), Some(VisitType::Primera));
        assert_eq!(VisitType::parse(" Seguimiento "), Some(VisitType::Seguimiento));
        assert_eq!(VisitType::parse("CIERRE"), Some(VisitType::Cierre));
        assert_eq!(VisitType::parse("otra"), None);
    }

    #[test]
    fn test_visit_type_serialization() {
        let json = serde_json::to_string(&VisitType::Seguimiento).unwrap();
        assert_eq!(json, "\"seguimiento\"");
    }

    // ========== NewAudit tests ==========

    #[test]
    fn test_into_audit_valid() {
        let audit = valid_form().into_audit("auditor1", fixed_now()).unwrap();

        assert_eq!(audit.auditor, "auditor1");
        assert_eq!(audit.patient_name, "María Pérez");
        assert_eq!(audit.document_type, "CC");
        assert_eq!(audit.visit_type, VisitType::Primera);
        assert_eq!(audit.visit_date, "2025-03-10");
        assert!(audit.created_at.starts_with("2025-03-14T10:30:00"));
        assert_eq!(audit.id.len(), 36);
    }

    #[test]
    fn test_into_audit_defaults_visit_date_to_today() {
        let mut form = valid_form();
        form.visit_date = String::new();
        let audit = form.into_audit("a", fixed_now()).unwrap();
        assert_eq!(audit.visit_date, "2025-03-14");
    }

    #[test]
    fn test_into_audit_defaults_document_type() {
        let mut form = valid_form();
        form.document_type = "  ".to_string();
        let audit = form.into_audit("a", fixed_now()).unwrap();
        assert_eq!(audit.document_type, "CC");
    }

    #[test]
    fn test_into_audit_requires_patient_name() {
        let mut form = valid_form();
        form.patient_name = "   ".to_string();
        let err = form.into_audit("a", fixed_now()).unwrap_err();
        assert!(err.contains("nombre"));
    }

    #[test]
    fn test_into_audit_rejects_bad_document_number() {
        let mut form = valid_form();
        form.document_number = "10.123.456".to_string();
        assert!(form.into_audit("a", fixed_now()).is_err());
    }

    #[test]
    fn test_into_audit_rejects_unknown_visit_type() {
        let mut form = valid_form();
        form.visit_type = "control".to_string();
        let err = form.into_audit("a", fixed_now()).unwrap_err();
        assert_eq!(err, "Tipo de visita no válido");
    }

    #[test]
    fn test_into_audit_rejects_bad_phone() {
        let mut form = valid_form();
        form.phone = "llamar a la vecina".to_string();
        assert!(form.into_audit("a", fixed_now()).is_err());
    }

    #[test]
    fn test_into_audit_rejects_bad_date() {
        let mut form = valid_form();
        form.visit_date = "10/03/2025".to_string();
        assert!(form.into_audit("a", fixed_now()).is_err());
    }

    #[test]
    fn test_audit_roundtrip_serialization() {
        let audit = valid_form().into_audit("a", fixed_now()).unwrap();
        let json = serde_json::to_string(&audit).unwrap();
        assert!(json.contains("\"visit_type\":\"primera\""));
        let back: Audit = serde_json::from_str(&json).unwrap();
        assert_eq!(audit, back);
    }

    // ========== User tests ==========

    #[test]
    fn test_user_accepts_cargo_alias() {
        let json = r#"{"id":"1","username":"ana","password_hash":"x","full_name":"Ana","role":"admin","cargo":"Enfermera jefe","created_at":"2025-01-01T00:00:00Z"}"#;
        let user: User = serde_json::from_str(json).unwrap();
        assert_eq!(user.position, "Enfermera jefe");
        assert!(user.is_admin());
        assert!(user.signature.is_none());
    }

    #[test]
    fn test_public_user_has_no_password() {
        let user = User {
            id: "1".to_string(),
            username: "ana".to_string(),
            password_hash: "secret-hash".to_string(),
            full_name: "Ana".to_string(),
            role: Role::User,
            position: String::new(),
            signature: None,
            created_at: "2025-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&user.public()).unwrap();
        assert!(!json.contains("secret-hash"));
        assert!(!json.contains("signature"));
        assert!(json.contains("\"role\":\"user\""));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("Admin"), Some(Role::Admin));
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("root"), None);
    }
}
