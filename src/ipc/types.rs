use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Chairman,
}

impl Role {
    pub fn parse(tag: &str) -> Option<Role> {
        match tag {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "chairman" => Some(Role::Chairman),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Chairman => "chairman",
        }
    }
}

/// Authenticated caller, resolved by the session layer in front of the
/// daemon and passed explicitly on every request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

impl Principal {
    pub fn from_params(params: &serde_json::Value) -> Option<Principal> {
        let p = params.get("principal")?;
        let user_id = p.get("userId")?.as_str()?.to_string();
        let role = Role::parse(p.get("role")?.as_str()?)?;
        Some(Principal { user_id, role })
    }
}
