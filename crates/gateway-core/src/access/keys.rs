//! Gateway key specifications and the key-file importer.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::ConfigError;

/// Directory holding the per-repository default key files.
pub(crate) const DEFAULT_KEY_DIR: &str = "/etc/cvmfs/keys";

/// A gateway key specification from the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeySpec {
    /// Key with the secret inline.
    PlainText {
        /// Key identifier.
        id: String,
        /// Shared secret.
        secret: String,
        /// Subpath on which the key is valid (V1 configurations only).
        #[serde(default)]
        repo_subpath: String,
    },

    /// Key loaded from an external key file.
    File {
        /// Path to the key file.
        file_name: PathBuf,
        /// Subpath on which the key is valid (V1 configurations only).
        #[serde(default)]
        repo_subpath: String,
    },
}

/// A key after import: identifier, secret, and the V1 subpath (empty for
/// V2 configurations, which carry the subpath on the repository entry).
#[derive(Debug, Clone)]
pub struct ImportedKey {
    /// Key identifier.
    pub id: String,
    /// Shared secret.
    pub secret: String,
    /// Subpath from the key spec (V1 only).
    pub repo_subpath: String,
}

/// Imports a key according to its specification.
///
/// # Errors
///
/// Returns [`ConfigError::KeyImportFailed`] when a key file is missing or
/// malformed.
pub fn import_key(spec: &KeySpec) -> Result<ImportedKey, ConfigError> {
    match spec {
        KeySpec::PlainText {
            id,
            secret,
            repo_subpath,
        } => Ok(ImportedKey {
            id: id.clone(),
            secret: secret.clone(),
            repo_subpath: repo_subpath.clone(),
        }),
        KeySpec::File {
            file_name,
            repo_subpath,
        } => {
            let (id, secret) = load_key_file(file_name)?;
            Ok(ImportedKey {
                id,
                secret,
                repo_subpath: repo_subpath.clone(),
            })
        },
    }
}

/// Loads a `(key_id, secret)` pair from a key file.
///
/// The format is two non-empty lines: the key identifier, then the secret.
///
/// # Errors
///
/// Returns [`ConfigError::KeyImportFailed`] on any read or format problem.
pub fn load_key_file(path: &Path) -> Result<(String, String), ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::KeyImportFailed {
        source_name: path.display().to_string(),
        detail: e.to_string(),
    })?;

    let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
    let id = lines.next();
    let secret = lines.next();
    let extra = lines.next();

    match (id, secret, extra) {
        (Some(id), Some(secret), None) => Ok((id.to_string(), secret.to_string())),
        _ => Err(ConfigError::KeyImportFailed {
            source_name: path.display().to_string(),
            detail: "expected exactly two lines: key id and secret".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_plain_text_import() {
        let spec: KeySpec = serde_json::from_str(
            r#"{"type": "plain_text", "id": "keyid1", "secret": "secret1", "repo_subpath": "/"}"#,
        )
        .unwrap();

        let key = import_key(&spec).unwrap();
        assert_eq!(key.id, "keyid1");
        assert_eq!(key.secret, "secret1");
        assert_eq!(key.repo_subpath, "/");
    }

    #[test]
    fn test_unknown_key_type_rejected() {
        let result: Result<KeySpec, _> =
            serde_json::from_str(r#"{"type": "carrier_pigeon", "id": "k"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_file_import() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "imported_key").unwrap();
        writeln!(file, "imported_secret").unwrap();

        let (id, secret) = load_key_file(file.path()).unwrap();
        assert_eq!(id, "imported_key");
        assert_eq!(secret, "imported_secret");
    }

    #[test]
    fn test_file_import_missing_file() {
        let err = load_key_file(Path::new("/nonexistent/key.gw")).unwrap_err();
        assert!(matches!(err, ConfigError::KeyImportFailed { .. }), "{err:?}");
    }

    #[test]
    fn test_file_import_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "only_one_line").unwrap();

        let err = load_key_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::KeyImportFailed { .. }), "{err:?}");
    }

    #[test]
    fn test_file_import_extra_lines_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id\nsecret\ntrailing garbage").unwrap();

        let err = load_key_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::KeyImportFailed { .. }), "{err:?}");
    }
}
