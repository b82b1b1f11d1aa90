//! Overlay artifact
//!
//! An additive compose file that only carries the resolved environment of the
//! target services. It lives in the agent's overlay directory, is created
//! exclusively (never over an existing file) and is removed when the
//! [`OverlayArtifact`] is dropped.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::secrets::{ScopedEnvironment, ServiceEnv};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Overlay already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Overlay path would replace the service definition: {0}")]
    WouldReplaceDefinition(PathBuf),

    #[error("Cannot read service definition {path}: {reason}")]
    Definition { path: PathBuf, reason: String },

    #[error("YAML error: {0}")]
    Yaml(String),
}

/// Service names declared in the user's compose file. Read-only.
pub fn declared_services(definition: &Path) -> Result<BTreeSet<String>, OverlayError> {
    let text = std::fs::read_to_string(definition).map_err(|e| OverlayError::Definition {
        path: definition.to_path_buf(),
        reason: e.to_string(),
    })?;
    let doc: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|e| OverlayError::Definition {
            path: definition.to_path_buf(),
            reason: e.to_string(),
        })?;

    let names = doc
        .get("services")
        .and_then(|s| s.as_mapping())
        .map(|services| {
            services
                .keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(names)
}

const OVERLAY_PREFIX: &str = "convoy-overlay-";
const OVERLAY_SUFFIX: &str = ".yml";

/// `convoy-overlay-<job_id>.yml` inside `dir`.
pub fn overlay_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("{}{}{}", OVERLAY_PREFIX, job_id, OVERLAY_SUFFIX))
}

/// Remove overlays left behind by a process that died mid-job. Other files
/// in `dir` are untouched. Returns how many were removed.
pub fn sweep_leftovers(dir: &Path) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("[executor] Cannot scan overlay dir {}: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.starts_with(OVERLAY_PREFIX) && name.ends_with(OVERLAY_SUFFIX)) {
            continue;
        }
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                warn!("[executor] Removed stale overlay {}", entry.path().display());
                removed += 1;
            }
            Err(e) => warn!(
                "[executor] Failed to remove stale overlay {}: {}",
                entry.path().display(),
                e
            ),
        }
    }
    removed
}

/// Compose interpolates `$VAR` and collapses `$$`; the value must reach the
/// container verbatim.
fn escape_interpolation(value: &str) -> Zeroizing<String> {
    Zeroizing::new(value.replace('$', "$$"))
}

/// Environment of one service, serialized as an ordered map.
struct EnvironmentMap<'a>(&'a ServiceEnv);

impl Serialize for EnvironmentMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in self.0 {
            let escaped = escape_interpolation(value.expose());
            map.serialize_entry(key, escaped.as_str())?;
        }
        map.end()
    }
}

#[derive(serde::Serialize)]
struct OverlayService<'a> {
    environment: EnvironmentMap<'a>,
}

#[derive(serde::Serialize)]
struct OverlayDocument<'a> {
    services: std::collections::BTreeMap<&'a str, OverlayService<'a>>,
}

/// Render the overlay for `targets`. Targets without a resolved environment
/// are skipped.
fn render(env: &ScopedEnvironment, targets: &[String]) -> Result<Zeroizing<String>, OverlayError> {
    let services = targets
        .iter()
        .filter_map(|name| {
            env.service(name).map(|vars| {
                (
                    name.as_str(),
                    OverlayService {
                        environment: EnvironmentMap(vars),
                    },
                )
            })
        })
        .collect();
    let text = serde_yaml::to_string(&OverlayDocument { services })
        .map_err(|e| OverlayError::Yaml(e.to_string()))?;
    Ok(Zeroizing::new(text))
}

/// The overlay file of one job.
#[derive(Debug)]
pub struct OverlayArtifact {
    path: PathBuf,
    removed: bool,
}

impl OverlayArtifact {
    /// Write the overlay for `job_id`, refusing to touch an existing file or
    /// the user's own definition.
    pub fn write(
        dir: &Path,
        job_id: &str,
        definition: &Path,
        env: &ScopedEnvironment,
        targets: &[String],
    ) -> Result<Self, OverlayError> {
        std::fs::create_dir_all(dir)?;
        let path = overlay_path(dir, job_id);

        if same_file(&path, definition) {
            return Err(OverlayError::WouldReplaceDefinition(path));
        }

        let text = render(env, targets)?;

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = match options.open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(OverlayError::AlreadyExists(path));
            }
            Err(e) => return Err(e.into()),
        };

        // From here on the file is ours; Drop removes it on any failure.
        let artifact = Self {
            path,
            removed: false,
        };
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        debug!("[executor] Overlay written: {}", artifact.path.display());
        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Idempotent; a missing file counts as removed.
    pub fn remove(&mut self) -> std::io::Result<()> {
        if self.removed {
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.removed = true;
        debug!("[executor] Overlay removed: {}", self.path.display());
        Ok(())
    }
}

impl Drop for OverlayArtifact {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!(
                "[executor] Failed to remove overlay {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{resolve, Scope, SecretEntry};

    const COMPOSE: &str = "services:\n  backend:\n    image: app\n  worker:\n    image: app\n";

    fn setup() -> (tempfile::TempDir, PathBuf, ScopedEnvironment) {
        let dir = tempfile::tempdir().unwrap();
        let definition = dir.path().join("docker-compose.yml");
        std::fs::write(&definition, COMPOSE).unwrap();
        let declared = declared_services(&definition).unwrap();
        let env = resolve(
            &[
                SecretEntry::new("PORT", "8080", Scope::service("backend")),
                SecretEntry::new("DB_URL", "postgres://x", Scope::Global),
            ],
            &declared,
        );
        (dir, definition, env)
    }

    #[test]
    fn test_declared_services() {
        let (_dir, definition, _) = setup();
        let names = declared_services(&definition).unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["backend".to_string(), "worker".to_string()]
        );
    }

    #[test]
    fn test_overlay_contains_only_targets() {
        let (dir, definition, env) = setup();
        let overlay_dir = dir.path().join("overlays");

        let artifact = OverlayArtifact::write(
            &overlay_dir,
            "job_1",
            &definition,
            &env,
            &["backend".to_string()],
        )
        .unwrap();

        let text = std::fs::read_to_string(artifact.path()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let backend = &doc["services"]["backend"]["environment"];
        assert_eq!(backend["PORT"].as_str(), Some("8080"));
        assert_eq!(backend["DB_URL"].as_str(), Some("postgres://x"));
        assert!(doc["services"].get("worker").is_none());

        // User's definition untouched.
        assert_eq!(std::fs::read_to_string(&definition).unwrap(), COMPOSE);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(artifact.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_dollar_signs_survive_interpolation() {
        let (dir, definition, _) = setup();
        let declared = declared_services(&definition).unwrap();
        let env = resolve(
            &[
                SecretEntry::new("PASSWORD", "p$ss", Scope::Global),
                SecretEntry::new("TEMPLATE", "${HOME}$$", Scope::service("backend")),
            ],
            &declared,
        );

        let text = render(&env, &["backend".to_string()]).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let backend = &doc["services"]["backend"]["environment"];
        assert_eq!(backend["PASSWORD"].as_str(), Some("p$$ss"));
        assert_eq!(backend["TEMPLATE"].as_str(), Some("$${HOME}$$$$"));

        // Artifact on disk carries the same escaping.
        let artifact = OverlayArtifact::write(
            dir.path(),
            "job_dollar",
            &definition,
            &env,
            &["backend".to_string()],
        )
        .unwrap();
        let on_disk = std::fs::read_to_string(artifact.path()).unwrap();
        assert!(on_disk.contains("p$$ss"));
    }

    #[test]
    fn test_drop_removes_overlay() {
        let (dir, definition, env) = setup();
        let path = overlay_path(dir.path(), "job_2");
        {
            let _artifact = OverlayArtifact::write(
                dir.path(),
                "job_2",
                &definition,
                &env,
                &["backend".to_string()],
            )
            .unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_existing_file_is_never_overwritten() {
        let (dir, definition, env) = setup();
        let path = overlay_path(dir.path(), "job_3");
        std::fs::write(&path, "keep me").unwrap();

        let err = OverlayArtifact::write(
            dir.path(),
            "job_3",
            &definition,
            &env,
            &["backend".to_string()],
        )
        .unwrap_err();
        assert!(matches!(err, OverlayError::AlreadyExists(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[test]
    fn test_sweep_removes_only_stale_overlays() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(overlay_path(dir.path(), "job_a"), "PASSWORD: x").unwrap();
        std::fs::write(overlay_path(dir.path(), "job_b"), "PASSWORD: y").unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), COMPOSE).unwrap();
        std::fs::write(dir.path().join("convoy-overlay-notes.txt"), "keep").unwrap();

        assert_eq!(sweep_leftovers(dir.path()), 2);
        assert!(!overlay_path(dir.path(), "job_a").exists());
        assert!(!overlay_path(dir.path(), "job_b").exists());
        assert!(dir.path().join("docker-compose.yml").exists());
        assert!(dir.path().join("convoy-overlay-notes.txt").exists());

        assert_eq!(sweep_leftovers(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (dir, definition, env) = setup();
        let mut artifact = OverlayArtifact::write(
            dir.path(),
            "job_4",
            &definition,
            &env,
            &["backend".to_string()],
        )
        .unwrap();
        artifact.remove().unwrap();
        artifact.remove().unwrap();
        assert!(!artifact.path().exists());
    }
}
