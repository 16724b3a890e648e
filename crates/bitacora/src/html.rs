use maud::{html, Markup, PreEscaped, DOCTYPE};

use crate::extracts::ExtractInfo;
use crate::kpi::KpiReport;
use crate::parser::fold;
use crate::types::{Audit, PublicUser, Role, User, VisitType};

const DOCUMENT_TYPES: &[(&str, &str)] = &[
    ("CC", "Cédula de ciudadanía"),
    ("TI", "Tarjeta de identidad"),
    ("RC", "Registro civil"),
    ("CE", "Cédula de extranjería"),
    ("PA", "Pasaporte"),
];

const VISIT_TYPES: [VisitType; 3] = [VisitType::Primera, VisitType::Seguimiento, VisitType::Cierre];

fn page(title: &str, body: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="es" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) " · Bitácora" }
                style { (PreEscaped(CSS)) }
            }
            body {
                (body)
            }
        }
    }
}

pub fn render_login() -> Markup {
    page(
        "Ingreso",
        html! {
            div.container.narrow {
                h1 { "Bitácora" }
                p.subtitle { "Auditoría de casos y seguimiento de indicadores maternos" }
                form.card #"login-form" {
                    label { "Usuario" input type="text" name="username" autocomplete="username" required; }
                    label { "Contraseña" input type="password" name="password" autocomplete="current-password" required; }
                    button type="submit" { "Ingresar" }
                    p.error #"login-error" {}
                }
            }
            script { (PreEscaped(LOGIN_JS)) }
        },
    )
}

/// Main page: audit form and log, extract library, and user admin for admins
pub fn render_dashboard(
    user: &User,
    audits: &[Audit],
    extracts: &[ExtractInfo],
    users: Option<&[PublicUser]>,
) -> Markup {
    page(
        "Inicio",
        html! {
            div.container {
                header.topbar {
                    div {
                        h1 { "Bitácora" }
                        p.subtitle {
                            (user.full_name) " · " (user.role)
                            @if !user.position.is_empty() { " · " (user.position) }
                        }
                    }
                    button.secondary #"logout" type="button" { "Cerrar sesión" }
                }

                section.card {
                    h2 { "Nueva auditoría" }
                    (render_audit_form())
                }

                section.card {
                    h2 { "Auditorías registradas" }
                    div.toolbar {
                        span.muted { (audits.len()) " registros" }
                        a.button href="/api/audits/export.csv" { "Descargar CSV" }
                    }
                    (render_audit_table(audits))
                }

                section.card {
                    h2 { "Extractos mensuales" }
                    form #"upload-form" {
                        input type="file" name="file" accept=".xlsx,.xlsm,.xlsb,.xls,.ods,.xml" required;
                        button type="submit" { "Subir extracto" }
                    }
                    (render_extract_table(extracts, user.is_admin()))
                }

                @if let Some(users) = users {
                    section.card #"users" {
                        h2 { "Usuarios" }
                        (render_user_table(users, &user.id))
                        (render_user_edit_form())
                        h3 { "Nuevo usuario" }
                        (render_user_form())
                    }
                }

                p.error #"form-error" {}
            }
            script { (PreEscaped(DASHBOARD_JS)) }
        },
    )
}

fn render_audit_form() -> Markup {
    html! {
        form.grid #"audit-form" {
            label { "Nombre de la paciente" input type="text" name="patient_name" required; }
            label {
                "Tipo de documento"
                select name="document_type" {
                    @for (code, name) in DOCUMENT_TYPES {
                        option value=(code) { (code) " - " (name) }
                    }
                }
            }
            label { "Número de documento" input type="text" name="document_number" pattern="[A-Za-z0-9]+" required; }
            label { "Categoría del evento" input type="text" name="event_category" required; }
            label { "Departamento" input type="text" name="department"; }
            label { "Municipio" input type="text" name="municipality"; }
            label { "Pertenencia étnica" input type="text" name="ethnicity"; }
            label { "Teléfono" input type="tel" name="phone"; }
            label.wide { "Dirección" input type="text" name="address"; }
            label {
                "Tipo de visita"
                select name="visit_type" required {
                    @for visit in VISIT_TYPES {
                        option value=(visit.as_str()) { (visit.label()) }
                    }
                }
            }
            label { "Fecha de la visita" input type="date" name="visit_date"; }
            label.wide { "Seguimiento" textarea name="follow_up" rows="3" {} }
            label.wide { "Próximos pasos" textarea name="next_steps" rows="2" {} }
            button type="submit" { "Guardar auditoría" }
        }
    }
}

fn render_audit_table(audits: &[Audit]) -> Markup {
    html! {
        @if audits.is_empty() {
            p.empty-state { "Aún no hay auditorías registradas." }
        } @else {
            table {
                thead {
                    tr {
                        th { "Fecha" }
                        th { "Paciente" }
                        th { "Documento" }
                        th { "Evento" }
                        th { "Visita" }
                        th { "Auditor" }
                        th {}
                    }
                }
                tbody {
                    @for audit in audits {
                        tr {
                            td { (audit.visit_date) }
                            td { (audit.patient_name) }
                            td { (audit.document_type) " " (audit.document_number) }
                            td { (audit.event_category) }
                            td { span class={"badge " (audit.visit_type.as_str())} { (audit.visit_type.label()) } }
                            td { (audit.auditor) }
                            td.actions {
                                a href={"/audits/" (audit.id) "/report"} target="_blank" { "Informe" }
                                button.link.danger type="button" data-delete-audit=(audit.id) { "Eliminar" }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn render_extract_table(extracts: &[ExtractInfo], is_admin: bool) -> Markup {
    html! {
        @if extracts.is_empty() {
            p.empty-state { "No hay extractos cargados." }
        } @else {
            table {
                thead {
                    tr {
                        th { "Archivo" }
                        th { "Filas" }
                        th { "Modificado" }
                        th {}
                    }
                }
                tbody {
                    @for extract in extracts {
                        tr {
                            td { (extract.name) }
                            td {
                                @match (&extract.rows, &extract.error) {
                                    (Some(rows), _) => { (rows) }
                                    (None, Some(error)) => { span.error-text title=(error) { "No se pudo leer" } }
                                    (None, None) => { "-" }
                                }
                            }
                            td { (extract.modified.get(..10).unwrap_or(&extract.modified)) }
                            td.actions {
                                @if extract.rows.is_some() {
                                    a href={"/extracts/" (extract.name) "/report"} target="_blank" { "Indicadores" }
                                    a href={"/api/extracts/" (extract.name) "/kpi.csv"} { "CSV" }
                                }
                                @if is_admin {
                                    button.link.danger type="button" data-delete-extract=(extract.name) { "Eliminar" }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn render_user_table(users: &[PublicUser], current_id: &str) -> Markup {
    html! {
        table {
            thead {
                tr {
                    th { "Usuario" }
                    th { "Nombre" }
                    th { "Cargo" }
                    th { "Rol" }
                    th { "Firma" }
                    th {}
                }
            }
            tbody {
                @for u in users {
                    tr {
                        td { (u.username) }
                        td { (u.full_name) }
                        td { (u.position) }
                        td { (u.role) }
                        td { @if u.signature.is_some() { "Sí" } @else { "No" } }
                        td.actions {
                            button.link type="button"
                                data-edit-user=(u.id)
                                data-full-name=(u.full_name)
                                data-position=(u.position)
                                data-role=(u.role) { "Editar" }
                            @if u.id != current_id {
                                button.link.danger type="button" data-delete-user=(u.id) { "Eliminar" }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn render_user_form() -> Markup {
    html! {
        form.grid #"user-form" {
            label { "Usuario" input type="text" name="username" pattern="[a-z0-9._-]{3,32}" required; }
            label { "Contraseña" input type="password" name="password" minlength="8" required; }
            label { "Nombre completo" input type="text" name="full_name" required; }
            label { "Cargo" input type="text" name="position"; }
            label {
                "Rol"
                select name="role" {
                    option value=(Role::User.as_str()) { "Usuario" }
                    option value=(Role::Admin.as_str()) { "Administrador" }
                }
            }
            label { "Firma (PNG o JPEG)" input type="file" name="signature" accept="image/png,image/jpeg"; }
            button type="submit" { "Crear usuario" }
        }
    }
}

/// Hidden until "Editar" fills it; blank password and signature keep the current ones
fn render_user_edit_form() -> Markup {
    html! {
        form.grid #"user-edit-form" hidden[true] {
            h3 { "Editar usuario" }
            input type="hidden" name="user_id";
            label { "Nombre completo" input type="text" name="full_name" required; }
            label { "Cargo" input type="text" name="position"; }
            label {
                "Rol"
                select name="role" {
                    option value=(Role::User.as_str()) { "Usuario" }
                    option value=(Role::Admin.as_str()) { "Administrador" }
                }
            }
            label { "Nueva contraseña" input type="password" name="password" minlength="8" placeholder="Sin cambios"; }
            label { "Nueva firma (PNG o JPEG)" input type="file" name="signature" accept="image/png,image/jpeg"; }
            label { input type="checkbox" name="clear_signature"; " Quitar firma" }
            div {
                button type="submit" { "Guardar cambios" }
                " "
                button.secondary #"user-edit-cancel" type="button" { "Cancelar" }
            }
        }
    }
}

/// Printable audit report with the auditor's signature block
pub fn render_audit_report(audit: &Audit, auditor: Option<&User>) -> Markup {
    let fields: [(&str, &str); 14] = [
        ("Paciente", &audit.patient_name),
        ("Tipo de documento", &audit.document_type),
        ("Número de documento", &audit.document_number),
        ("Categoría del evento", &audit.event_category),
        ("Tipo de visita", audit.visit_type.label()),
        ("Fecha de la visita", &audit.visit_date),
        ("Departamento", &audit.department),
        ("Municipio", &audit.municipality),
        ("Pertenencia étnica", &audit.ethnicity),
        ("Teléfono", &audit.phone),
        ("Dirección", &audit.address),
        ("Seguimiento", &audit.follow_up),
        ("Próximos pasos", &audit.next_steps),
        ("Registrado", &audit.created_at),
    ];

    page(
        "Informe de auditoría",
        html! {
            div.container.report {
                div.toolbar.no-print {
                    button type="button" onclick="window.print()" { "Imprimir / Guardar PDF" }
                }
                h1 { "Informe de auditoría" }
                p.subtitle { (audit.patient_name) " · " (audit.document_type) " " (audit.document_number) }
                table.fields {
                    tbody {
                        @for (label, value) in fields {
                            tr {
                                th { (label) }
                                td { @if value.is_empty() { span.muted { "-" } } @else { (value) } }
                            }
                        }
                    }
                }
                div.signature {
                    @match auditor {
                        Some(user) => {
                            @if let Some(signature) = &user.signature {
                                img src=(signature) alt="Firma";
                            } @else {
                                div.signature-line {}
                            }
                            p.signature-name { (user.full_name) }
                            @if !user.position.is_empty() {
                                p.muted { (user.position) }
                            }
                        }
                        None => {
                            div.signature-line {}
                            p.signature-name { (audit.auditor) }
                        }
                    }
                }
            }
        },
    )
}

/// Printable KPI report: filter form, one card per indicator and a bar chart
pub fn render_kpi_report(report: &KpiReport) -> Markup {
    let csv_href = format!("/api/extracts/{}/kpi.csv{}", report.source, query_string(report));

    page(
        "Indicadores",
        html! {
            div.container.report {
                h1 { "Indicadores de cobertura" }
                p.subtitle {
                    (report.source) " · " (report.selected_rows) " de " (report.total_rows) " filas"
                }

                form.toolbar.no-print method="get" {
                    (render_select("ips", "IPS", &report.ips_options, report.filter.ips.as_deref()))
                    (render_select("municipality", "Municipio", &report.municipality_options, report.filter.municipality.as_deref()))
                    label {
                        "Mes"
                        input type="month" name="month" value=(report.filter.month.as_deref().unwrap_or(""));
                    }
                    button type="submit" { "Filtrar" }
                    a.button href=(csv_href) { "Descargar CSV" }
                    button.secondary type="button" onclick="window.print()" { "Imprimir / Guardar PDF" }
                }

                @if !report.missing_columns.is_empty() {
                    p.warning {
                        "Columnas no encontradas en el archivo: " (report.missing_columns.join(", "))
                    }
                }

                div.kpi-grid {
                    @for indicator in &report.indicators {
                        div.kpi-card {
                            div.kpi-value { (format!("{:.1}%", indicator.percentage)) }
                            div.kpi-label { (indicator.label) }
                            div.muted { (indicator.numerator) " / " (indicator.denominator) }
                            @if let Some(column) = &indicator.column {
                                div.kpi-column { "Columna: " (column) }
                            }
                        }
                    }
                }

                h2 { "Comparativo" }
                div.chart {
                    @for indicator in &report.indicators {
                        div.bar-row {
                            span.bar-label { (indicator.label) }
                            div.bar-track {
                                div.bar style=(format!("width: {:.1}%", indicator.percentage.clamp(0.0, 100.0))) {}
                            }
                            span.bar-value { (format!("{:.1}%", indicator.percentage)) }
                        }
                    }
                }
            }
        },
    )
}

fn render_select(name: &str, title: &str, options: &[String], selected: Option<&str>) -> Markup {
    // Rows are matched accent- and case-insensitively, so is the selection
    let selected = selected.map(fold);
    html! {
        label {
            (title)
            select name=(name) {
                option value="" { "Todos" }
                @for value in options {
                    option value=(value) selected[selected.as_deref() == Some(fold(value).as_str())] { (value) }
                }
            }
        }
    }
}

/// Current selection as a query string, empty when nothing is selected
fn query_string(report: &KpiReport) -> String {
    let pairs: Vec<String> = [
        ("ips", report.filter.ips.as_deref()),
        ("municipality", report.filter.municipality.as_deref()),
        ("month", report.filter.month.as_deref()),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.map(|v| format!("{}={}", key, percent_encode(v))))
    .collect();

    if pairs.is_empty() {
        String::new()
    } else {
        format!("?{}", pairs.join("&"))
    }
}

fn percent_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

const CSS: &str = r#"
* { margin: 0; padding: 0; box-sizing: border-box; }

body {
    font-family: 'Inter', -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
    background: #f4f6f8;
    color: #1d2733;
    line-height: 1.45;
}

.container { max-width: 1100px; margin: 0 auto; padding: 32px 20px 60px; }
.container.narrow { max-width: 420px; padding-top: 80px; }

h1 { font-size: 2em; font-weight: 800; color: #7a1f5c; }
h2 { font-size: 1.2em; margin-bottom: 14px; }
h3 { font-size: 1em; margin: 20px 0 10px; }

.subtitle { color: #5b6773; margin-bottom: 24px; }
.muted { color: #7b8794; font-size: 0.9em; }
.error, .error-text { color: #b42318; }
.warning { background: #fff4e5; border-left: 4px solid #f79009; padding: 10px 14px; margin: 16px 0; }

.topbar { display: flex; justify-content: space-between; align-items: flex-start; }

.card {
    background: #fff;
    border-radius: 10px;
    box-shadow: 0 1px 3px rgba(16,24,40,0.1);
    padding: 20px 24px;
    margin-bottom: 24px;
}

form.card label, .grid label, .toolbar label {
    display: flex;
    flex-direction: column;
    gap: 4px;
    font-size: 0.9em;
    font-weight: 600;
    margin-bottom: 12px;
}

.grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(240px, 1fr)); gap: 0 16px; }
.grid .wide { grid-column: 1 / -1; }

input, select, textarea {
    font: inherit;
    font-weight: 400;
    padding: 8px 10px;
    border: 1px solid #cfd6dd;
    border-radius: 6px;
}

button, a.button {
    font: inherit;
    background: #7a1f5c;
    color: #fff;
    border: none;
    border-radius: 6px;
    padding: 8px 16px;
    cursor: pointer;
    text-decoration: none;
    align-self: end;
}

button.secondary { background: #e4e7ec; color: #1d2733; }
button.link { background: none; color: #7a1f5c; padding: 0 6px; }
button.danger { color: #b42318; }

.toolbar { display: flex; gap: 12px; align-items: end; flex-wrap: wrap; margin-bottom: 16px; }

table { width: 100%; border-collapse: collapse; font-size: 0.92em; }
th, td { text-align: left; padding: 8px 10px; border-bottom: 1px solid #eaecf0; vertical-align: top; }
th { color: #5b6773; font-weight: 600; }
td.actions { white-space: nowrap; }
td.actions a { margin-right: 8px; color: #7a1f5c; }

.badge { padding: 2px 8px; border-radius: 10px; font-size: 0.85em; background: #eef2f6; }
.badge.primera { background: #fce7f6; color: #7a1f5c; }
.badge.cierre { background: #e7f6ec; color: #166534; }

.empty-state { color: #7b8794; padding: 20px 0; text-align: center; }

.report table.fields th { width: 220px; }

.signature { margin-top: 60px; width: 320px; text-align: center; }
.signature img { max-width: 260px; max-height: 110px; display: block; margin: 0 auto 6px; }
.signature-line { border-bottom: 1px solid #1d2733; height: 80px; margin-bottom: 6px; }
.signature-name { font-weight: 700; }

.kpi-grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(200px, 1fr)); gap: 16px; margin-bottom: 32px; }
.kpi-card { background: #fff; border-radius: 10px; padding: 16px; box-shadow: 0 1px 3px rgba(16,24,40,0.1); }
.kpi-value { font-size: 2em; font-weight: 800; color: #7a1f5c; }
.kpi-label { font-weight: 600; margin: 4px 0; }
.kpi-column { font-size: 0.8em; color: #7b8794; margin-top: 6px; }

.chart { background: #fff; border-radius: 10px; padding: 16px 20px; }
.bar-row { display: grid; grid-template-columns: 260px 1fr 60px; gap: 12px; align-items: center; margin: 8px 0; }
.bar-track { background: #eef2f6; height: 18px; border-radius: 4px; overflow: hidden; }
.bar { background: #b8327f; height: 100%; }
.bar-value { text-align: right; font-weight: 600; }

@media print {
    body { background: #fff; }
    .no-print { display: none; }
    .card, .kpi-card, .chart { box-shadow: none; border: 1px solid #d0d5dd; }
    .bar { -webkit-print-color-adjust: exact; print-color-adjust: exact; }
}
"#;

const LOGIN_JS: &str = r#"
document.getElementById('login-form').addEventListener('submit', async (event) => {
    event.preventDefault();
    const form = event.target;
    const response = await fetch('/api/login', {
        method: 'POST',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify({
            username: form.username.value,
            password: form.password.value,
        }),
    });
    if (response.ok) {
        window.location = '/';
    } else {
        const body = await response.json().catch(() => ({}));
        document.getElementById('login-error').textContent = body.error || 'No fue posible ingresar';
    }
});
"#;

const DASHBOARD_JS: &str = r#"
function showError(message) {
    document.getElementById('form-error').textContent = message;
    window.scrollTo(0, document.body.scrollHeight);
}

async function send(method, url, body) {
    const options = { method, headers: {} };
    if (body instanceof FormData) {
        options.body = body;
    } else if (body !== undefined) {
        options.headers['Content-Type'] = 'application/json';
        options.body = JSON.stringify(body);
    }
    const response = await fetch(url, options);
    if (response.status === 401) {
        window.location = '/login';
        return false;
    }
    if (!response.ok) {
        const data = await response.json().catch(() => ({}));
        showError(data.error || 'La operación falló');
        return false;
    }
    return true;
}

function formObject(form) {
    const data = {};
    new FormData(form).forEach((value, key) => {
        if (typeof value === 'string') data[key] = value;
    });
    return data;
}

function readDataUrl(file) {
    return new Promise((resolve, reject) => {
        const reader = new FileReader();
        reader.onload = () => resolve(reader.result);
        reader.onerror = reject;
        reader.readAsDataURL(file);
    });
}

document.getElementById('logout').addEventListener('click', async () => {
    await fetch('/api/logout', { method: 'POST' });
    window.location = '/login';
});

document.getElementById('audit-form').addEventListener('submit', async (event) => {
    event.preventDefault();
    if (await send('POST', '/api/audits', formObject(event.target))) window.location.reload();
});

document.getElementById('upload-form').addEventListener('submit', async (event) => {
    event.preventDefault();
    if (await send('POST', '/api/extracts', new FormData(event.target))) window.location.reload();
});

const userForm = document.getElementById('user-form');
if (userForm) {
    userForm.addEventListener('submit', async (event) => {
        event.preventDefault();
        const data = formObject(userForm);
        const file = userForm.signature.files[0];
        if (file) data.signature = await readDataUrl(file);
        if (await send('POST', '/api/users', data)) window.location.reload();
    });
}

const editForm = document.getElementById('user-edit-form');
if (editForm) {
    const fields = editForm.elements;
    document.querySelectorAll('[data-edit-user]').forEach(button => {
        button.addEventListener('click', () => {
            fields.user_id.value = button.dataset.editUser;
            fields.full_name.value = button.dataset.fullName;
            fields.position.value = button.dataset.position;
            fields.role.value = button.dataset.role;
            fields.password.value = '';
            fields.signature.value = '';
            fields.clear_signature.checked = false;
            editForm.hidden = false;
            editForm.scrollIntoView();
        });
    });
    document.getElementById('user-edit-cancel').addEventListener('click', () => {
        editForm.hidden = true;
    });
    editForm.addEventListener('submit', async (event) => {
        event.preventDefault();
        const data = {
            full_name: fields.full_name.value,
            position: fields.position.value,
            role: fields.role.value,
        };
        if (fields.password.value) data.password = fields.password.value;
        const file = fields.signature.files[0];
        if (file) data.signature = await readDataUrl(file);
        else if (fields.clear_signature.checked) data.signature = '';
        if (await send('PUT', `/api/users/${encodeURIComponent(fields.user_id.value)}`, data)) window.location.reload();
    });
}

document.querySelectorAll('[data-delete-audit]').forEach(button => {
    button.addEventListener('click', async () => {
        if (!confirm('¿Eliminar esta auditoría?')) return;
        if (await send('DELETE', `/api/audits/${button.dataset.deleteAudit}`)) window.location.reload();
    });
});

document.querySelectorAll('[data-delete-extract]').forEach(button => {
    button.addEventListener('click', async () => {
        if (!confirm('¿Eliminar este extracto?')) return;
        if (await send('DELETE', `/api/extracts/${encodeURIComponent(button.dataset.deleteExtract)}`)) window.location.reload();
    });
});

document.querySelectorAll('[data-delete-user]').forEach(button => {
    button.addEventListener('click', async () => {
        if (!confirm('¿Eliminar este usuario?')) return;
        if (await send('DELETE', `/api/users/${button.dataset.deleteUser}`)) window.location.reload();
    });
});
"#;
