//! Secret record model and validation.
//!
//! A record is a named bundle of fields. Field values are the only secret
//! part; everything else (key name, field names, tags, timestamps) is
//! metadata stored in clear. Validation happens on `set` — a record that
//! reaches storage has already passed every rule here.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

pub use secretctl_storage::RecordMeta;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// Maximum field-name length.
pub const MAX_FIELD_NAME_LEN: usize = 64;

/// Maximum field value size (1 MiB).
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

/// Maximum number of tags per record.
pub const MAX_TAGS: usize = 10;

/// Maximum tag length in bytes.
pub const MAX_TAG_LEN: usize = 64;

/// Maximum notes size (10 KiB).
pub const MAX_NOTES_LEN: usize = 10 * 1024;

/// Maximum URL length in bytes.
pub const MAX_URL_LEN: usize = 2048;

/// The field name that marks a legacy single-value record.
pub const LEGACY_VALUE_FIELD: &str = "value";

/// Presentation hint for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    #[default]
    Text,
    Textarea,
}

impl InputType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Textarea => "textarea",
        }
    }

    /// Parse the persisted representation; unknown strings fall back to
    /// `text` (the column is a hint, not an invariant).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "textarea" => Self::Textarea,
            _ => Self::Text,
        }
    }
}

/// One field of a record. The value buffer is zeroized on drop.
#[derive(Clone)]
pub struct Field {
    pub value: Zeroizing<Vec<u8>>,
    /// Whether the plaintext may leave the core unmasked to machine callers.
    pub sensitive: bool,
    pub input_type: InputType,
    pub hint: Option<String>,
}

impl Field {
    /// A sensitive text field — the common case.
    #[must_use]
    pub fn sensitive(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            sensitive: true,
            input_type: InputType::Text,
            hint: None,
        }
    }

    /// A non-sensitive text field (hostnames, usernames, ports).
    #[must_use]
    pub fn plain(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            sensitive: false,
            input_type: InputType::Text,
            hint: None,
        }
    }

    /// The masked display form of this value.
    #[must_use]
    pub fn masked(&self) -> String {
        crate::crypto::mask_value(&String::from_utf8_lossy(&self.value))
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("value", &"[REDACTED]")
            .field("sensitive", &self.sensitive)
            .field("input_type", &self.input_type)
            .finish_non_exhaustive()
    }
}

/// A named secret record: an ordered set of fields plus metadata.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    /// Caller-chosen logical name, unique within the vault, case-sensitive.
    pub key: String,
    /// Ordered field-name → field map.
    pub fields: Vec<(String, Field)>,
    /// Ordered env-name → field-name bindings.
    pub bindings: Vec<(String, String)>,
    pub tags: Vec<String>,
    pub notes: String,
    pub url: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SecretRecord {
    /// A record with the given key and fields; timestamps are set by `set`.
    #[must_use]
    pub fn new(key: impl Into<String>, fields: Vec<(String, Field)>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            fields,
            bindings: Vec::new(),
            tags: Vec::new(),
            notes: String::new(),
            url: String::new(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A legacy single-value record: one sensitive field named `value`.
    #[must_use]
    pub fn single_value(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(key, vec![(LEGACY_VALUE_FIELD.to_owned(), Field::sensitive(value))])
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    /// Whether this is a legacy single-value record (exactly one field,
    /// named `value`). Such records behave as scalar secrets: `get` treats
    /// the value as the primary result and `run` derives the env name from
    /// the record key itself.
    #[must_use]
    pub fn is_single_value(&self) -> bool {
        self.fields.len() == 1 && self.fields[0].0 == LEGACY_VALUE_FIELD
    }

    /// Validate every structural rule. Returns the first violation as a
    /// human-readable detail string.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated rule.
    pub fn validate(&self) -> Result<(), String> {
        validate_key(&self.key)?;

        if self.fields.is_empty() {
            return Err("record must have at least one field".to_owned());
        }
        for (name, field) in &self.fields {
            validate_field_name(name)?;
            if self.fields.iter().filter(|(n, _)| n == name).count() > 1 {
                return Err(format!("duplicate field name '{name}'"));
            }
            if field.value.len() > MAX_VALUE_LEN {
                return Err(format!(
                    "field '{name}' exceeds the {MAX_VALUE_LEN}-byte value limit"
                ));
            }
        }

        for (env, target) in &self.bindings {
            validate_env_name(env)?;
            if self.bindings.iter().filter(|(e, _)| e == env).count() > 1 {
                return Err(format!("duplicate binding '{env}'"));
            }
            if self.field(target).is_none() {
                return Err(format!("binding '{env}' targets unknown field '{target}'"));
            }
        }

        if self.tags.len() > MAX_TAGS {
            return Err(format!("at most {MAX_TAGS} tags are allowed"));
        }
        for tag in &self.tags {
            if tag.is_empty() || tag.len() > MAX_TAG_LEN {
                return Err(format!("tag length must be 1–{MAX_TAG_LEN} bytes"));
            }
        }
        if self.notes.len() > MAX_NOTES_LEN {
            return Err(format!("notes exceed {MAX_NOTES_LEN} bytes"));
        }
        if self.url.len() > MAX_URL_LEN {
            return Err(format!("url exceeds {MAX_URL_LEN} bytes"));
        }
        if self.updated_at < self.created_at {
            return Err("updated_at precedes created_at".to_owned());
        }
        Ok(())
    }
}

/// Validate a record key: 1–256 bytes from `[A-Za-z0-9_\-/.]`.
///
/// # Errors
///
/// Returns a description of the violated rule.
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(format!("key length must be 1–{MAX_KEY_LEN} bytes"));
    }
    if let Some(bad) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(*c, '_' | '-' | '/' | '.')))
    {
        return Err(format!("key contains invalid character '{bad}'"));
    }
    Ok(())
}

/// Validate a field name: `[a-z0-9_]{1,64}`, not starting with `_`.
///
/// # Errors
///
/// Returns a description of the violated rule.
pub fn validate_field_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_FIELD_NAME_LEN {
        return Err(format!(
            "field name length must be 1–{MAX_FIELD_NAME_LEN} bytes"
        ));
    }
    if name.starts_with('_') {
        return Err(format!("field name '{name}' must not start with '_'"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(format!("field name contains invalid character '{bad}'"));
    }
    Ok(())
}

/// Validate an env-binding name: `[A-Z][A-Z0-9_]*`.
///
/// # Errors
///
/// Returns a description of the violated rule.
pub fn validate_env_name(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return Err(format!("env name '{name}' must start with A–Z")),
    }
    if let Some(bad) = chars.find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(format!("env name contains invalid character '{bad}'"));
    }
    Ok(())
}

/// Listing filter accepted by the vault.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only records carrying this tag.
    pub tag: Option<String>,
    /// Only records expiring within this duration from now.
    pub expiring_within: Option<Duration>,
}
