//! Login accounts whose cookie sets are replayed into crawl sessions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::TaskError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    /// Unique display name
    pub name: String,
    /// JSON object of cookie names to values
    pub cookies: String,
    pub active: bool,
}

impl Account {
    /// Decodes the stored cookie set for a session launch.
    pub fn session_cookies(&self) -> Result<Vec<SessionCookie>, TaskError> {
        parse_cookie_set(&self.cookies).map_err(|reason| {
            TaskError::ResourceInitFailed(format!("account {} has malformed cookies: {reason}", self.name))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub name: String,
    pub cookies: String,
}

impl NewAccount {
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.name.trim().is_empty() {
            return Err(TaskError::precondition("account name must not be empty"));
        }
        parse_cookie_set(&self.cookies)
            .map(|_| ())
            .map_err(|reason| TaskError::precondition(format!("account cookies are malformed: {reason}")))
    }
}

/// One `name=value` pair seeded into a session's cookie jar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
}

impl SessionCookie {
    pub fn header_value(&self) -> String {
        format!("{}={}; Path=/", self.name, self.value)
    }
}

/// Parses `{"z_c0": "...", "d_c0": "..."}`. Numbers and booleans are taken as text.
pub fn parse_cookie_set(raw: &str) -> Result<Vec<SessionCookie>, String> {
    let entries: serde_json::Map<String, Value> = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    entries
        .into_iter()
        .map(|(name, value)| {
            if name.trim().is_empty() || name.contains(['=', ';', ' ']) {
                return Err(format!("invalid cookie name '{name}'"));
            }
            let value = match value {
                Value::String(text) => text,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                other => return Err(format!("cookie {name} has a non-scalar value {other}")),
            };
            if value.contains(';') {
                return Err(format!("cookie {name} value contains ';'"));
            }
            Ok(SessionCookie { name, value })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_set_is_read_from_a_json_object() {
        let cookies = parse_cookie_set(r#"{"z_c0": "token", "_xsrf": 42, "secure": true}"#).unwrap();
        let pairs: Vec<_> = cookies.iter().map(SessionCookie::header_value).collect();
        assert_eq!(pairs, vec!["_xsrf=42; Path=/", "secure=true; Path=/", "z_c0=token; Path=/"]);
        assert!(parse_cookie_set("{}").unwrap().is_empty());
    }

    #[test]
    fn malformed_cookie_sets_are_rejected() {
        assert!(parse_cookie_set("z_c0=token").is_err());
        assert!(parse_cookie_set(r#"["z_c0"]"#).is_err());
        assert!(parse_cookie_set(r#"{"z_c0": {"nested": 1}}"#).is_err());
        assert!(parse_cookie_set(r#"{"bad name": "x"}"#).is_err());
        assert!(parse_cookie_set(r#"{"z_c0": "a;b"}"#).is_err());
    }

    #[test]
    fn malformed_account_cookies_fail_session_setup() {
        let account = Account {
            id: 1,
            name: "reader".into(),
            cookies: "not json".into(),
            active: true,
        };
        assert!(matches!(account.session_cookies(), Err(TaskError::ResourceInitFailed(_))));

        let new = NewAccount {
            name: "reader".into(),
            cookies: "not json".into(),
        };
        assert!(matches!(new.validate(), Err(TaskError::PreconditionFailed(_))));
        assert!(NewAccount { cookies: "{}".into(), ..new }.validate().is_ok());
    }
}
