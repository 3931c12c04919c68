//! Resolution of credential references into secrets.
//!
//! Config files only ever hold the *name* of an environment variable. The
//! store turns those names into [`SecretString`]s at the point of use, and its
//! errors mention the variable name only.

use secrecy::{ExposeSecret, Secret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FerryError, FerryResult};

/// Looks up credential references.
///
/// Reads the process environment unless built from an explicit map.
#[derive(Clone, Default)]
pub struct CredentialStore {
    fixed: Option<Arc<HashMap<String, String>>>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fixed {
            Some(map) => write!(f, "CredentialStore(fixed, {} entries)", map.len()),
            None => write!(f, "CredentialStore(env)"),
        }
    }
}

impl CredentialStore {
    /// Store backed by the process environment.
    pub fn from_env() -> Self {
        Self { fixed: None }
    }

    /// Store backed by a fixed map, ignoring the environment.
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self {
            fixed: Some(Arc::new(map)),
        }
    }

    fn lookup(&self, var: &str) -> Option<String> {
        match &self.fixed {
            Some(map) => map.get(var).cloned(),
            None => std::env::var(var).ok(),
        }
    }

    /// Resolve a reference to a non-empty secret.
    pub fn resolve(&self, var: &str) -> FerryResult<SecretString> {
        if var.trim().is_empty() {
            return Err(FerryError::Configuration(
                "credential reference is empty".to_string(),
            ));
        }
        match self.lookup(var) {
            None => Err(FerryError::Configuration(format!(
                "environment variable {} is not set",
                var
            ))),
            Some(value) if value.trim().is_empty() => Err(FerryError::Configuration(format!(
                "environment variable {} is empty",
                var
            ))),
            Some(value) => Ok(Secret::new(value.trim().to_string())),
        }
    }

    /// Resolve a reference and check its shape without revealing it.
    pub fn resolve_matching(
        &self,
        var: &str,
        what: &str,
        check: impl Fn(&str) -> bool,
    ) -> FerryResult<SecretString> {
        let secret = self.resolve(var)?;
        if !check(secret.expose_secret()) {
            return Err(FerryError::Configuration(format!(
                "environment variable {} does not look like a {}",
                var, what
            )));
        }
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        let mut map = HashMap::new();
        map.insert("TOKEN".to_string(), " abc123 ".to_string());
        map.insert("BLANK".to_string(), "   ".to_string());
        CredentialStore::from_map(map)
    }

    #[test]
    fn test_resolve_trims_and_hides_value() {
        let secret = store().resolve("TOKEN").unwrap();
        assert_eq!(secret.expose_secret(), "abc123");
        assert!(!format!("{:?}", store()).contains("abc123"));
    }

    #[test]
    fn test_missing_and_empty_name_variable_only() {
        let err = store().resolve("NOPE").unwrap_err();
        assert!(err.to_string().contains("NOPE"));

        let err = store().resolve("BLANK").unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[test]
    fn test_resolve_matching_does_not_leak() {
        let err = store()
            .resolve_matching("TOKEN", "Twilio account SID", |v| v.starts_with("AC"))
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("TOKEN"));
        assert!(!msg.contains("abc123"));
    }
}
