//! Redaction of sensitive fields inside arbitrary JSON data
//!
//! Two passes are provided:
//!
//! - **Field-name pass** ([`FieldMasking`]): used by the audit logs. Any key
//!   in the `mark` set is replaced by [`FULL_MASK`]; any key in the
//!   `highlight` set is partially redacted; everything else is walked.
//! - **Rule pass** ([`Masker`]): each [`MaskingRule`] addresses one field by
//!   dot path (`*` selects every element of an array) and picks a
//!   [`MaskingType`].
//!
//! Both passes return a new value and never touch their input. Strings that
//! hold a JSON object or array are parsed, masked, and re-encoded.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::sync::OnceLock;

/// Placeholder written over fully masked fields
pub const FULL_MASK: &str = "******";

/// Nesting depth past which subtrees are replaced by [`DEPTH_EXCEEDED`]
pub const MAX_DEPTH: usize = 32;

/// Replacement for subtrees nested deeper than [`MAX_DEPTH`]
pub const DEPTH_EXCEEDED: &str = "[max depth exceeded]";

/// Environment variable holding the HMAC key for [`MaskingType::Hashing`]
pub const HMAC_KEY_ENV: &str = "HMAC_KEY_ENV";

type HmacSha256 = Hmac<Sha256>;

fn email_regex() -> &'static regex::Regex {
    static EMAIL: OnceLock<regex::Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        // Literal pattern, checked by the email masking tests
        regex::Regex::new(r"^[a-zA-Z0-9._-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,4}$")
            .expect("valid regex")
    })
}

// ─── Field-name pass ─────────────────────────────────────────────

/// Key-name driven masking used by the detail log
#[derive(Debug, Clone)]
pub struct FieldMasking {
    /// Keys whose values are partially redacted
    pub highlight: Vec<String>,
    /// Keys whose values are replaced entirely
    pub mark: Vec<String>,
}

impl Default for FieldMasking {
    fn default() -> Self {
        Self {
            highlight: vec!["email".into(), "phone".into()],
            mark: ["password", "pin", "otp", "token", "secret", "api-key"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl FieldMasking {
    /// Mask a structured payload
    pub fn apply(&self, value: &Value) -> Value {
        self.walk(value, 0)
    }

    /// Mask a raw string payload; non-JSON strings come back unchanged
    pub fn apply_raw(&self, raw: &str) -> String {
        match parse_container(raw) {
            Some(parsed) => self.walk(&parsed, 0).to_string(),
            None => raw.to_string(),
        }
    }

    fn walk(&self, value: &Value, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            tracing::warn!(max_depth = MAX_DEPTH, "Masking depth exceeded, subtree dropped");
            return Value::String(DEPTH_EXCEEDED.to_string());
        }
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| (key.clone(), self.mask_field(key, v, depth)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.walk(v, depth + 1)).collect())
            }
            Value::String(s) => match parse_container(s) {
                Some(parsed) => Value::String(self.walk(&parsed, depth + 1).to_string()),
                None => value.clone(),
            },
            _ => value.clone(),
        }
    }

    fn mask_field(&self, key: &str, value: &Value, depth: usize) -> Value {
        if self.mark.iter().any(|m| m == key) {
            return Value::String(FULL_MASK.to_string());
        }
        if self.highlight.iter().any(|h| h == key) {
            return match value {
                Value::String(s) => Value::String(partial_mask(s)),
                other => other.clone(),
            };
        }
        self.walk(value, depth + 1)
    }
}

/// Mask `value` with the default field-name rules
pub fn mask_sensitive(value: &Value) -> Value {
    FieldMasking::default().apply(value)
}

/// Keep a short readable prefix: three local-part characters for an
/// email address, two characters for anything else.
fn partial_mask(value: &str) -> String {
    if email_regex().is_match(value) {
        let (local, domain) = value.split_once('@').unwrap_or((value, ""));
        let len = local.chars().count();
        if len == 0 {
            return String::new();
        }
        let keep = if len > 2 { 3 } else { 1 };
        let masked: String = local
            .chars()
            .take(keep)
            .chain(std::iter::repeat('*').take(len - keep.min(len)))
            .collect();
        return format!("{}@{}", masked, domain);
    }

    let len = value.chars().count();
    if len > 2 {
        value
            .chars()
            .take(2)
            .chain(std::iter::repeat('*').take(len - 2))
            .collect()
    } else {
        value.to_string()
    }
}

fn parse_container(raw: &str) -> Option<Value> {
    let trimmed = raw.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

// ─── Rule pass ───────────────────────────────────────────────────

/// Redaction strategy selected by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MaskingType {
    /// Full replacement
    Password,
    /// Full replacement
    Full,
    /// Keep first 3 and last 4 digits
    Msisdn,
    /// Keep first 6 and last 4, only when at least 11 characters
    CreditCard,
    /// Keep first 4 and last 3
    BankAccount,
    /// Keep first 3 characters of the local part and the domain
    Email,
    /// Keep last 4
    IdCard,
    /// Keep first 3
    Firstname,
    /// Keep first 3
    Lastname,
    /// Keyed HMAC-SHA256, hex encoded
    Hashing,
}

/// One path-addressed masking instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskingRule {
    /// Dot-delimited path; a `*` segment selects every array element
    pub masking_field: String,
    /// Strategy applied to the string found at the path
    pub masking_type: MaskingType,
}

impl MaskingRule {
    pub fn new(field: impl Into<String>, masking_type: MaskingType) -> Self {
        Self {
            masking_field: field.into(),
            masking_type,
        }
    }
}

/// Rule-driven masking engine
#[derive(Clone)]
pub struct Masker {
    display: char,
    hmac_key: Vec<u8>,
}

impl std::fmt::Debug for Masker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Masker")
            .field("display", &self.display)
            .finish_non_exhaustive()
    }
}

impl Default for Masker {
    fn default() -> Self {
        Self::new('*', b"default".to_vec())
    }
}

impl Masker {
    /// Create a masker with a display character and HMAC key
    pub fn new(display: char, hmac_key: impl Into<Vec<u8>>) -> Self {
        Self {
            display,
            hmac_key: hmac_key.into(),
        }
    }

    /// Masker keyed from `HMAC_KEY_ENV` (falls back to `"default"`)
    pub fn from_env() -> Self {
        let key = std::env::var(HMAC_KEY_ENV).unwrap_or_else(|_| "default".to_string());
        Self::new('*', key.into_bytes())
    }

    /// Apply `rules` to a copy of `data`
    pub fn mask(&self, data: &Value, rules: &[MaskingRule]) -> Value {
        let mut out = data.clone();
        for rule in rules {
            let segments: Vec<&str> = rule.masking_field.split('.').collect();
            self.apply_path(&mut out, &segments, rule.masking_type, 0);
        }
        out
    }

    fn apply_path(&self, node: &mut Value, segments: &[&str], kind: MaskingType, depth: usize) {
        if depth > MAX_DEPTH {
            return;
        }

        let Some((head, rest)) = segments.split_first() else {
            match node {
                Value::String(s) if !s.is_empty() => *s = self.mask_value(s, kind),
                Value::String(_) => {}
                other => tracing::debug!(
                    kind = ?kind,
                    value_type = json_type(other),
                    "Masking skipped: value is not a string"
                ),
            }
            return;
        };

        match node {
            Value::Object(map) => {
                if let Some(child) = map.get_mut(*head) {
                    self.apply_path(child, rest, kind, depth + 1);
                }
            }
            Value::Array(items) => {
                if *head == "*" {
                    for item in items.iter_mut() {
                        self.apply_path(item, rest, kind, depth + 1);
                    }
                } else if let Some(item) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i))
                {
                    self.apply_path(item, rest, kind, depth + 1);
                }
            }
            Value::String(s) => {
                if let Some(mut parsed) = parse_container(s) {
                    self.apply_path(&mut parsed, segments, kind, depth + 1);
                    *s = parsed.to_string();
                }
            }
            _ => {}
        }
    }

    /// Mask a single string value
    pub fn mask_value(&self, value: &str, kind: MaskingType) -> String {
        match kind {
            MaskingType::Msisdn => self.keep_ends(value, 3, 4, 7),
            MaskingType::CreditCard => self.keep_ends(value, 6, 4, 11),
            MaskingType::BankAccount => self.keep_ends(value, 4, 3, 7),
            MaskingType::IdCard => self.keep_ends(value, 0, 4, 4),
            MaskingType::Email => self.censor_email(value),
            MaskingType::Full | MaskingType::Password => self.fill(value.chars().count()),
            MaskingType::Firstname | MaskingType::Lastname => self.keep_ends(value, 3, 0, 3),
            MaskingType::Hashing => self.hmac(value),
        }
    }

    /// Keep `head` leading and `tail` trailing characters; values shorter
    /// than `min_len` are returned unchanged.
    fn keep_ends(&self, value: &str, head: usize, tail: usize, min_len: usize) -> String {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() < min_len {
            return value.to_string();
        }
        let hidden = chars.len() - head - tail;
        let mut out: String = chars[..head].iter().collect();
        out.push_str(&self.fill(hidden));
        out.extend(&chars[chars.len() - tail..]);
        out
    }

    fn censor_email(&self, email: &str) -> String {
        let Some((local, domain)) = email.split_once('@') else {
            return email.to_string();
        };
        if local.is_empty() || domain.is_empty() {
            return email.to_string();
        }
        let masked: String = local
            .chars()
            .enumerate()
            .map(|(i, c)| {
                if i >= 3 && c.is_ascii_alphanumeric() {
                    self.display
                } else {
                    c
                }
            })
            .collect();
        format!("{}@{}", masked, domain)
    }

    fn fill(&self, n: usize) -> String {
        std::iter::repeat(self.display).take(n).collect()
    }

    fn hmac(&self, value: &str) -> String {
        match HmacSha256::new_from_slice(&self.hmac_key) {
            Ok(mut mac) => {
                mac.update(value.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            Err(e) => {
                tracing::warn!(error = %e, "HMAC key rejected, falling back to full mask");
                self.fill(value.chars().count())
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
