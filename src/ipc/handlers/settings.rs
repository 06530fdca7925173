use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{authorize, required_str, ADMIN_ONLY};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SettingsSection {
    School,
    Academic,
    System,
}

const SECTIONS: [SettingsSection; 3] = [
    SettingsSection::School,
    SettingsSection::Academic,
    SettingsSection::System,
];

impl SettingsSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "academic" => Some(Self::Academic),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Academic => "academic",
            Self::System => "system",
        }
    }

    fn key(self) -> String {
        format!("settings.{}", self.name())
    }
}

fn default_section(section: SettingsSection) -> Value {
    match section {
        SettingsSection::School => json!({
            "name": "",
            "address": "",
            "phone": "",
            "email": "",
            "website": ""
        }),
        SettingsSection::Academic => json!({
            "academicYear": "2024/2025",
            "semester": "odd",
            "startTime": "07:00",
            "endTime": "15:00"
        }),
        SettingsSection::System => json!({
            "emailNotifications": true,
            "pushNotifications": true,
            "autoBackup": false,
            "maintenanceMode": false,
            "backupFrequency": "weekly"
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_one_of(v: &Value, key: &str, allowed: &[&str]) -> Result<String, String> {
    let s = parse_string_max(v, key, 16)?.to_ascii_lowercase();
    if !allowed.contains(&s.as_str()) {
        return Err(format!("{} must be one of: {}", key, allowed.join(", ")));
    }
    Ok(s)
}

fn parse_clock(v: &Value, key: &str) -> Result<String, String> {
    let s = parse_string_max(v, key, 5)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .map(|t| t.format("%H:%M").to_string())
        .map_err(|_| format!("{} must be HH:MM", key))
}

/// `YYYY/YYYY` where the second year follows the first.
fn parse_academic_year(v: &Value, key: &str) -> Result<String, String> {
    let s = parse_string_max(v, key, 9)?;
    let bad = || format!("{} must look like 2024/2025", key);
    let (a, b) = s.split_once('/').ok_or_else(bad)?;
    let (a, b) = match (a.parse::<u16>(), b.parse::<u16>()) {
        (Ok(a), Ok(b)) if (1000..=9998).contains(&a) && Some(b) == a.checked_add(1) => (a, b),
        _ => return Err(bad()),
    };
    Ok(format!("{}/{}", a, b))
}

fn merge_section_patch(
    section: SettingsSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "stored settings must be a JSON object".to_string())?;
    for (k, v) in patch {
        let value = match section {
            SettingsSection::School => match k.as_str() {
                "name" => Value::String(parse_string_max(v, k, 120)?),
                "address" => Value::String(parse_string_max(v, k, 240)?),
                "phone" => Value::String(parse_string_max(v, k, 32)?),
                "email" => {
                    let s = parse_string_max(v, k, 120)?;
                    if !s.is_empty() && !s.contains('@') {
                        return Err("email must contain @".into());
                    }
                    Value::String(s)
                }
                "website" => Value::String(parse_string_max(v, k, 200)?),
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SettingsSection::Academic => match k.as_str() {
                "academicYear" => Value::String(parse_academic_year(v, k)?),
                "semester" => Value::String(parse_one_of(v, k, &["odd", "even"])?),
                "startTime" | "endTime" => Value::String(parse_clock(v, k)?),
                _ => return Err(format!("unknown academic field: {}", k)),
            },
            SettingsSection::System => match k.as_str() {
                "emailNotifications" | "pushNotifications" | "autoBackup" | "maintenanceMode" => {
                    Value::Bool(parse_bool(v, k)?)
                }
                "backupFrequency" => {
                    Value::String(parse_one_of(v, k, &["daily", "weekly", "monthly"])?)
                }
                _ => return Err(format!("unknown system field: {}", k)),
            },
        };
        obj.insert(k.clone(), value);
    }

    if let SettingsSection::Academic = section {
        let start = obj.get("startTime").and_then(|v| v.as_str()).unwrap_or("");
        let end = obj.get("endTime").and_then(|v| v.as_str()).unwrap_or("");
        // Both are normalised HH:MM, so string order is time order.
        if start >= end {
            return Err("endTime must be after startTime".into());
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SettingsSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // A stale or hand-edited row falls back to defaults instead of failing reads.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn handle_get(conn: &rusqlite::Connection) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for section in SECTIONS {
        out.insert(section.name().to_string(), load_section(conn, section)?);
    }
    Ok(Value::Object(out))
}

fn handle_update(conn: &rusqlite::Connection, params: &Value) -> Result<Value, HandlerErr> {
    let section_raw = required_str(params, "section")?;
    let section = SettingsSection::parse(&section_raw)
        .ok_or_else(|| HandlerErr::BadParams(format!("unknown section: {}", section_raw)))?;
    let patch = params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::BadParams("patch must be an object".into()))?;

    let mut current = load_section(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(HandlerErr::BadParams)?;
    db::settings_set_json(conn, &section.key(), &current)?;
    info!(section = section.name(), "settings updated");
    let mut out = Map::new();
    out.insert(section.name().to_string(), current);
    Ok(Value::Object(out))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Result<Value, HandlerErr>> {
    let result = match req.method.as_str() {
        "settings.get" => authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_get(c)),
        "settings.update" => {
            authorize(state, req, ADMIN_ONLY).and_then(|(c, _)| handle_update(c, &req.params))
        }
        _ => return None,
    };
    Some(result)
}
