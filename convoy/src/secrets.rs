//! Secret scoping
//!
//! Expands the flat secret list carried by a DEPLOY command into a per-service
//! environment. Global entries land in every declared service, service-scoped
//! entries only in their own service, and a service-scoped entry overrides a
//! Global entry with the same key.
//!
//! Plaintext values live in [`SecretValue`], which zeroizes on drop and never
//! prints its contents through `Debug`.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroize;

/// Reserved scope string for secrets visible to every service.
pub const GLOBAL_SCOPE: &str = "global";

/// Placeholder written wherever a secret value would otherwise appear.
pub const REDACTED: &str = "***";

/// Transient plaintext secret value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the plaintext. Only the overlay writer should need this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite the plaintext in place, leaving an empty value behind.
    pub fn scrub(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for SecretValue {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Visibility of a secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Scope {
    Global,
    Service(String),
}

impl Scope {
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(name.into())
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }
}

impl From<String> for Scope {
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case(GLOBAL_SCOPE) {
            Self::Global
        } else {
            Self::Service(s)
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Global => GLOBAL_SCOPE.to_string(),
            Scope::Service(name) => name,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str(GLOBAL_SCOPE),
            Self::Service(name) => f.write_str(name),
        }
    }
}

/// One entry of the flat secret list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretEntry {
    pub key: String,
    pub value: SecretValue,
    pub scope: Scope,
}

impl SecretEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, scope: Scope) -> Self {
        Self {
            key: key.into(),
            value: SecretValue::new(value),
            scope,
        }
    }
}

/// Problems with a secret list. Messages carry keys and scopes, never values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("secret key must not be empty")]
    EmptyKey,

    #[error("secret key '{0}' is not a valid environment variable name")]
    InvalidKey(String),

    #[error("secret scope for key '{0}' must not be empty")]
    EmptyScope(String),

    #[error("duplicate secret '{key}' in scope '{scope}'")]
    Duplicate { key: String, scope: String },
}

/// Check that every entry is well formed and (key, scope) pairs are unique.
pub fn validate(entries: &[SecretEntry]) -> Result<(), SecretError> {
    let mut seen: HashSet<(&str, &Scope)> = HashSet::with_capacity(entries.len());

    for entry in entries {
        if entry.key.is_empty() {
            return Err(SecretError::EmptyKey);
        }
        if !is_env_name(&entry.key) {
            return Err(SecretError::InvalidKey(entry.key.clone()));
        }
        if let Scope::Service(name) = &entry.scope {
            if name.trim().is_empty() {
                return Err(SecretError::EmptyScope(entry.key.clone()));
            }
        }
        if !seen.insert((entry.key.as_str(), &entry.scope)) {
            return Err(SecretError::Duplicate {
                key: entry.key.clone(),
                scope: entry.scope.to_string(),
            });
        }
    }

    Ok(())
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Ordered `(key, value)` pairs for one service.
pub type ServiceEnv = Vec<(String, SecretValue)>;

/// Resolved environment per declared service.
#[derive(Debug, Default)]
pub struct ScopedEnvironment {
    services: BTreeMap<String, ServiceEnv>,
}

impl ScopedEnvironment {
    /// Environment for one service, if it was declared.
    pub fn service(&self, name: &str) -> Option<&ServiceEnv> {
        self.services.get(name)
    }

    /// Look up a single key for a service.
    pub fn get(&self, service: &str, key: &str) -> Option<&SecretValue> {
        self.services
            .get(service)?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn services(&self) -> impl Iterator<Item = (&String, &ServiceEnv)> {
        self.services.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.services.values().all(Vec::is_empty)
    }

    /// Every distinct plaintext value, for redaction.
    pub fn values(&self) -> Vec<&SecretValue> {
        let mut out: Vec<&SecretValue> = Vec::new();
        for (_, value) in self.services.values().flatten() {
            if !out.iter().any(|v| *v == value) {
                out.push(value);
            }
        }
        out
    }

    /// Zero every value and drop the mapping.
    pub fn scrub(&mut self) {
        for env in self.services.values_mut() {
            for (_, value) in env.iter_mut() {
                value.scrub();
            }
        }
        self.services.clear();
    }
}

/// Expand `entries` into one environment per service in `declared`.
///
/// Global entries keep their input order; a service-scoped entry replaces a
/// Global entry with the same key in place, otherwise it is appended.
pub fn resolve(entries: &[SecretEntry], declared: &BTreeSet<String>) -> ScopedEnvironment {
    let mut services: BTreeMap<String, ServiceEnv> = declared
        .iter()
        .map(|name| (name.clone(), Vec::new()))
        .collect();

    for entry in entries.iter().filter(|e| e.scope.is_global()) {
        for env in services.values_mut() {
            env.push((entry.key.clone(), entry.value.clone()));
        }
    }

    for entry in entries {
        let Scope::Service(name) = &entry.scope else {
            continue;
        };
        let Some(env) = services.get_mut(name) else {
            warn!(
                "[secrets] Ignoring secret '{}' scoped to undeclared service '{}'",
                entry.key, name
            );
            continue;
        };
        match env.iter_mut().find(|(k, _)| *k == entry.key) {
            Some(slot) => slot.1 = entry.value.clone(),
            None => env.push((entry.key.clone(), entry.value.clone())),
        }
    }

    ScopedEnvironment { services }
}

/// Values shorter than this are not masked in free text; they would match
/// ordinary words and numbers.
pub const MIN_REDACT_LEN: usize = 4;

/// Replaces known secret values in free text.
pub struct Redactor {
    needles: Vec<SecretValue>,
}

impl Redactor {
    pub fn new<'a>(values: impl IntoIterator<Item = &'a SecretValue>) -> Self {
        let mut needles: Vec<SecretValue> = values
            .into_iter()
            .filter(|v| v.expose().chars().count() >= MIN_REDACT_LEN)
            .cloned()
            .collect();
        // Longest first so a value containing another is masked whole.
        needles.sort_by_key(|v| std::cmp::Reverse(v.expose().len()));
        Self { needles }
    }

    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for needle in &self.needles {
            if out.contains(needle.expose()) {
                out = Cow::Owned(out.replace(needle.expose(), REDACTED));
            }
        }
        out
    }
}
