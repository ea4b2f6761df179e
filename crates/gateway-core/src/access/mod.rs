//! Repository access configuration.
//!
//! Maps each repository to the gateway keys allowed to publish into it and
//! the subpath each key may lease, plus the key-id → secret table used by
//! the HTTP adapter to verify request MACs. The configuration is loaded
//! from a JSON document (schema versions 1 and 2) and is immutable after
//! load.

mod keys;

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::path;

pub use keys::{import_key, load_key_file, ImportedKey, KeySpec};

/// Map from key id to the repository subpath the key is valid on.
pub type KeyPaths = HashMap<String, String>;

/// Key import hook, injectable so tests never touch `/etc/cvmfs`.
pub type KeyImportFn = dyn Fn(&KeySpec) -> Result<ImportedKey, ConfigError>;

/// Authorization failure from [`AccessConfig::check`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The repository has no access configuration.
    #[error("invalid repository: {repo}")]
    InvalidRepo {
        /// The unknown repository name.
        repo: String,
    },

    /// The key is not registered for this repository.
    #[error("key {key_id} is not registered for repository {repo}")]
    InvalidKey {
        /// The rejected key id.
        key_id: String,
        /// The repository the key was presented for.
        repo: String,
    },

    /// The requested lease path lies outside the key's allowed subpath.
    #[error("lease path {lease_path} is outside the key's allowed subpath")]
    InvalidPath {
        /// The rejected lease path.
        lease_path: String,
    },
}

/// Failure while loading the access configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read access configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document could not be decoded.
    #[error("could not decode access configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A key file was missing or malformed.
    #[error("could not import key from {source_name}: {detail}")]
    KeyImportFailed {
        /// The file or key spec the import was attempted from.
        source_name: String,
        /// What went wrong.
        detail: String,
    },

    /// A repository references a key id with no known secret.
    #[error("repository {repo} references unknown key {key_id}")]
    UnknownKeyReference {
        /// The unresolved key id.
        key_id: String,
        /// The referencing repository.
        repo: String,
    },

    /// The key imported to replace a V2 `"default"` entry is itself named
    /// `"default"`, which would make the replacement ambiguous.
    #[error("imported default key for repository {repo} is itself named \"default\"")]
    DefaultKeyCollision {
        /// The repository whose default key collided.
        repo: String,
    },
}

#[derive(Debug, Deserialize)]
struct RepositorySpecV1 {
    domain: String,
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KeyPathSpec {
    id: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct RepositorySpecV2 {
    domain: String,
    #[serde(default)]
    keys: Vec<KeyPathSpec>,
}

/// A V2 repository entry: either a full specification or a bare repository
/// name, the latter standing for the default key from
/// `/etc/cvmfs/keys/<repo>.gw`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RepoEntryV2 {
    Spec(RepositorySpecV2),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct RawDocumentV1 {
    #[serde(default)]
    keys: Vec<KeySpec>,
    #[serde(default)]
    repos: Vec<RepositorySpecV1>,
}

#[derive(Debug, Deserialize)]
struct RawDocumentV2 {
    #[serde(default)]
    keys: Vec<KeySpec>,
    #[serde(default)]
    repos: Vec<RepoEntryV2>,
}

/// The repository access configuration.
#[derive(Debug, Default)]
pub struct AccessConfig {
    repositories: HashMap<String, KeyPaths>,
    keys: HashMap<String, String>,
}

impl AccessConfig {
    /// Loads the configuration from a file, importing key files from disk.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on read, decode, or key import failure.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Loads the configuration from a reader, importing key files from
    /// disk.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on decode or key import failure.
    pub fn from_reader(reader: impl Read) -> Result<Self, ConfigError> {
        Self::from_reader_with_importer(reader, &import_key)
    }

    /// Loads the configuration with an injected key importer.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on decode or import failure.
    pub fn from_reader_with_importer(
        reader: impl Read,
        importer: &KeyImportFn,
    ) -> Result<Self, ConfigError> {
        let document: serde_json::Value = serde_json::from_reader(reader)?;
        let version = document
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1);

        let mut config = Self::default();
        if version == 1 {
            config.load_v1(&document, importer)?;
        } else {
            config.load_v2(&document, importer)?;
        }
        config.check_referenced_keys()?;

        Ok(config)
    }

    /// All repositories with their key → subpath maps.
    #[must_use]
    pub fn get_repos(&self) -> &HashMap<String, KeyPaths> {
        &self.repositories
    }

    /// The key → subpath map of one repository.
    #[must_use]
    pub fn get_repo(&self, repo_name: &str) -> Option<&KeyPaths> {
        self.repositories.get(repo_name)
    }

    /// The secret registered for a key id.
    #[must_use]
    pub fn get_secret(&self, key_id: &str) -> Option<&str> {
        self.keys.get(key_id).map(String::as_str)
    }

    /// Verifies that `key_id` may take a lease on `lease_path` (the
    /// `/`-prefixed subpath component) within `repo_name`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidRepo`], [`AuthError::InvalidKey`], or
    /// [`AuthError::InvalidPath`], in that order of precedence.
    pub fn check(&self, key_id: &str, lease_path: &str, repo_name: &str) -> Result<(), AuthError> {
        let keys = self
            .repositories
            .get(repo_name)
            .ok_or_else(|| AuthError::InvalidRepo {
                repo: repo_name.to_string(),
            })?;

        let allowed = keys.get(key_id).ok_or_else(|| AuthError::InvalidKey {
            key_id: key_id.to_string(),
            repo: repo_name.to_string(),
        })?;

        let overlapping = path::conflicting(lease_path, allowed);
        let is_subpath = lease_path.len() >= allowed.len();

        if !overlapping || !is_subpath {
            return Err(AuthError::InvalidPath {
                lease_path: lease_path.to_string(),
            });
        }

        Ok(())
    }

    fn load_v1(
        &mut self,
        document: &serde_json::Value,
        importer: &KeyImportFn,
    ) -> Result<(), ConfigError> {
        let document = RawDocumentV1::deserialize(document)?;

        // Key id -> subpath, kept aside until the repository specs bind
        // them. Keys never referenced by a repo keep their secret but drop
        // their subpath.
        let mut key_paths: HashMap<String, String> = HashMap::new();
        for spec in &document.keys {
            let key = importer(spec)?;
            key_paths.insert(key.id.clone(), key.repo_subpath);
            self.keys.insert(key.id, key.secret);
        }

        for repo in document.repos {
            let mut repo_keys = KeyPaths::new();
            for key_id in repo.keys {
                let subpath = key_paths.get(&key_id).cloned().unwrap_or_default();
                repo_keys.insert(key_id, subpath);
            }
            self.repositories.insert(repo.domain, repo_keys);
        }

        Ok(())
    }

    fn load_v2(
        &mut self,
        document: &serde_json::Value,
        importer: &KeyImportFn,
    ) -> Result<(), ConfigError> {
        let document = RawDocumentV2::deserialize(document)?;

        for entry in document.repos {
            match entry {
                RepoEntryV2::Spec(spec) => {
                    let repo_keys = spec
                        .keys
                        .into_iter()
                        .map(|k| (k.id, k.path))
                        .collect::<KeyPaths>();
                    self.repositories.insert(spec.domain, repo_keys);
                },
                RepoEntryV2::Name(name) => {
                    // Bare repository name: a sentinel pair resolved below
                    // from the repository's default key file.
                    let mut repo_keys = KeyPaths::new();
                    repo_keys.insert("default".to_string(), "default".to_string());
                    self.repositories.insert(name, repo_keys);
                },
            }
        }

        for spec in &document.keys {
            let key = importer(spec)?;
            self.keys.insert(key.id, key.secret);
        }

        // Replace "default" sentinels with the key imported from
        // /etc/cvmfs/keys/<repo>.gw, valid on the whole repository.
        for (repo_name, repo_keys) in &mut self.repositories {
            if repo_keys.remove("default").is_none() {
                continue;
            }

            let spec = KeySpec::File {
                file_name: PathBuf::from(format!("{}/{repo_name}.gw", keys::DEFAULT_KEY_DIR)),
                repo_subpath: String::new(),
            };
            let key = importer(&spec)?;

            if key.id == "default" {
                return Err(ConfigError::DefaultKeyCollision {
                    repo: repo_name.clone(),
                });
            }

            self.keys.entry(key.id.clone()).or_insert(key.secret);
            repo_keys.insert(key.id, "/".to_string());
        }

        Ok(())
    }

    /// Post-load invariant: every key id referenced by a repository has a
    /// secret.
    fn check_referenced_keys(&self) -> Result<(), ConfigError> {
        for (repo, repo_keys) in &self.repositories {
            for key_id in repo_keys.keys() {
                if !self.keys.contains_key(key_id) {
                    return Err(ConfigError::UnknownKeyReference {
                        key_id: key_id.clone(),
                        repo: repo.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Importer that resolves key files without touching the filesystem.
    fn test_importer(spec: &KeySpec) -> Result<ImportedKey, ConfigError> {
        match spec {
            KeySpec::PlainText { .. } => import_key(spec),
            KeySpec::File { file_name, .. } => Ok(ImportedKey {
                id: format!("imported_{}", file_name.file_stem().unwrap().to_str().unwrap()),
                secret: "imported_secret".to_string(),
                repo_subpath: String::new(),
            }),
        }
    }

    fn load(document: &str) -> AccessConfig {
        AccessConfig::from_reader_with_importer(document.as_bytes(), &test_importer).unwrap()
    }

    const V1_DOCUMENT: &str = r#"{
        "keys": [
            {"type": "plain_text", "id": "keyid1", "secret": "secret1", "repo_subpath": "/"},
            {"type": "plain_text", "id": "keyid2", "secret": "secret2", "repo_subpath": "/restricted"},
            {"type": "plain_text", "id": "unreferenced", "secret": "secret3", "repo_subpath": "/"}
        ],
        "repos": [
            {"domain": "test1.repo.org", "keys": ["keyid1"]},
            {"domain": "test2.repo.org", "keys": ["keyid1", "keyid2"]}
        ]
    }"#;

    const V2_DOCUMENT: &str = r#"{
        "version": 2,
        "keys": [
            {"type": "plain_text", "id": "keyid1", "secret": "secret1"}
        ],
        "repos": [
            {"domain": "test1.repo.org", "keys": [{"id": "keyid1", "path": "/"}]},
            "bare.repo.org"
        ]
    }"#;

    #[test]
    fn test_v1_load() {
        let config = load(V1_DOCUMENT);

        assert_eq!(config.get_repos().len(), 2);
        let repo = config.get_repo("test2.repo.org").unwrap();
        assert_eq!(repo.get("keyid1").unwrap(), "/");
        assert_eq!(repo.get("keyid2").unwrap(), "/restricted");
        assert_eq!(config.get_secret("keyid1"), Some("secret1"));
        // Unreferenced keys keep their secret.
        assert_eq!(config.get_secret("unreferenced"), Some("secret3"));
    }

    #[test]
    fn test_version_defaults_to_v1() {
        let config = load(r#"{"keys": [], "repos": []}"#);
        assert!(config.get_repos().is_empty());
    }

    #[test]
    fn test_v2_load_with_explicit_keys() {
        let config = load(V2_DOCUMENT);

        let repo = config.get_repo("test1.repo.org").unwrap();
        assert_eq!(repo.get("keyid1").unwrap(), "/");
    }

    #[test]
    fn test_v2_bare_repo_resolves_default_key() {
        let config = load(V2_DOCUMENT);

        let repo = config.get_repo("bare.repo.org").unwrap();
        assert!(!repo.contains_key("default"));
        assert_eq!(repo.get("imported_bare.repo.org").unwrap(), "/");
        assert_eq!(
            config.get_secret("imported_bare.repo.org"),
            Some("imported_secret")
        );
    }

    #[test]
    fn test_v2_default_key_collision_rejected() {
        let importer = |spec: &KeySpec| match spec {
            KeySpec::PlainText { .. } => import_key(spec),
            KeySpec::File { .. } => Ok(ImportedKey {
                id: "default".to_string(),
                secret: "s".to_string(),
                repo_subpath: String::new(),
            }),
        };
        let document = r#"{"version": 2, "repos": ["bare.repo.org"]}"#;

        let err = AccessConfig::from_reader_with_importer(document.as_bytes(), &importer)
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::DefaultKeyCollision { .. }),
            "{err:?}"
        );
    }

    #[test]
    fn test_unknown_key_reference_rejected() {
        let document = r#"{
            "version": 2,
            "repos": [{"domain": "r.org", "keys": [{"id": "ghost", "path": "/"}]}]
        }"#;

        let err = AccessConfig::from_reader_with_importer(document.as_bytes(), &test_importer)
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::UnknownKeyReference { .. }),
            "{err:?}"
        );
    }

    #[test]
    fn test_check_precedence() {
        let config = load(V1_DOCUMENT);

        assert!(matches!(
            config.check("keyid1", "/", "nope.repo.org"),
            Err(AuthError::InvalidRepo { .. })
        ));
        assert!(matches!(
            config.check("keyid2", "/", "test1.repo.org"),
            Err(AuthError::InvalidKey { .. })
        ));
        assert!(matches!(
            config.check("keyid2", "/other", "test2.repo.org"),
            Err(AuthError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_check_subpath_containment() {
        let config = load(V1_DOCUMENT);

        config.check("keyid1", "/", "test2.repo.org").unwrap();
        config
            .check("keyid1", "/some/path", "test2.repo.org")
            .unwrap();
        config
            .check("keyid2", "/restricted/deep", "test2.repo.org")
            .unwrap();

        // A prefix of the allowed subpath is not inside it.
        assert!(matches!(
            config.check("keyid2", "/", "test2.repo.org"),
            Err(AuthError::InvalidPath { .. })
        ));
        // Segment-aligned: /restricted does not admit /restrictedX.
        assert!(matches!(
            config.check("keyid2", "/restrictedX", "test2.repo.org"),
            Err(AuthError::InvalidPath { .. })
        ));
    }
}
