//! Local cache of survey definition bundles.
//!
//! One JSON file per version plus an `active` marker. Replacement is
//! atomic: the bundle is written to a temp file and renamed into place
//! before the in-memory snapshot is swapped, so readers never observe a
//! torn write. Older versions stay on disk so a session interrupted by a
//! definition update can resume against the version it started with.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use super::{DefinitionBundle, DefinitionError, SurveyDefinition};

const ACTIVE_MARKER: &str = "active";

pub struct DefinitionStore {
    dir: PathBuf,
    active: RwLock<Option<Arc<SurveyDefinition>>>,
}

impl DefinitionStore {
    /// Open the store, loading the active bundle if one is cached.
    pub fn open(dir: &Path) -> Result<Self, DefinitionError> {
        fs::create_dir_all(dir)?;

        let store = Self {
            dir: dir.to_path_buf(),
            active: RwLock::new(None),
        };

        match store.read_active_version()? {
            Some(version) => match store.load_version(version) {
                Ok(def) => {
                    info!(version, checksum = %def.checksum, "Loaded cached survey definition");
                    *store.active.write().unwrap_or_else(|e| e.into_inner()) = Some(def);
                }
                Err(e) => {
                    // A corrupt cache is not fatal: the next definition pull
                    // repopulates it.
                    warn!(version, error = %e, "Cached survey definition failed to load");
                }
            },
            None => info!("No cached survey definition yet"),
        }

        Ok(store)
    }

    /// Current active definition, if any. Cheap snapshot; callers pin the
    /// `Arc` for the lifetime of a session.
    pub fn current(&self) -> Option<Arc<SurveyDefinition>> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Checksum of the active definition, used by the version check.
    pub fn current_checksum(&self) -> Option<String> {
        self.current().map(|d| d.checksum.clone())
    }

    /// Atomically replace the active definition with a freshly downloaded
    /// bundle. Verifies the checksum before anything is persisted.
    pub fn replace(&self, bundle: DefinitionBundle) -> Result<Arc<SurveyDefinition>, DefinitionError> {
        let version = bundle.survey.version;
        let serialized = serde_json::to_vec_pretty(&bundle)?;

        // Checksum verification happens inside from_bundle.
        let definition = Arc::new(SurveyDefinition::from_bundle(bundle)?);

        let final_path = self.version_path(version);
        let tmp_path = final_path.with_extension("json.tmp");
        fs::write(&tmp_path, &serialized)?;
        fs::rename(&tmp_path, &final_path)?;

        let marker_tmp = self.dir.join(format!("{ACTIVE_MARKER}.tmp"));
        fs::write(&marker_tmp, version.to_string())?;
        fs::rename(&marker_tmp, self.dir.join(ACTIVE_MARKER))?;

        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(definition.clone());

        info!(version, checksum = %definition.checksum, "Survey definition replaced");
        Ok(definition)
    }

    /// Load a specific cached version, used when resuming a session that
    /// started before the active definition changed.
    pub fn load_version(&self, version: u32) -> Result<Arc<SurveyDefinition>, DefinitionError> {
        if let Some(active) = self.current() {
            if active.version() == version {
                return Ok(active);
            }
        }

        let path = self.version_path(version);
        if !path.exists() {
            return Err(DefinitionError::VersionNotCached(version));
        }
        let bytes = fs::read(&path)?;
        let bundle: DefinitionBundle = serde_json::from_slice(&bytes)?;
        Ok(Arc::new(SurveyDefinition::from_bundle(bundle)?))
    }

    fn version_path(&self, version: u32) -> PathBuf {
        self.dir.join(format!("survey-v{version}.json"))
    }

    fn read_active_version(&self) -> Result<Option<u32>, DefinitionError> {
        let marker = self.dir.join(ACTIVE_MARKER);
        if !marker.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&marker)?;
        match text.trim().parse::<u32>() {
            Ok(v) => Ok(Some(v)),
            Err(_) => {
                warn!("Active definition marker is unreadable, ignoring");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::testutil::sample_bundle;
    use tempfile::TempDir;

    #[test]
    fn test_replace_and_reload() {
        let dir = TempDir::new().unwrap();

        let store = DefinitionStore::open(dir.path()).unwrap();
        assert!(store.current().is_none());

        let bundle = sample_bundle();
        let checksum = bundle.metadata.checksum.clone();
        store.replace(bundle).unwrap();
        assert_eq!(store.current_checksum().as_deref(), Some(checksum.as_str()));

        // A fresh store over the same directory loads the persisted bundle.
        let reopened = DefinitionStore::open(dir.path()).unwrap();
        let def = reopened.current().expect("definition should be cached");
        assert_eq!(def.checksum, checksum);
        assert_eq!(def.version(), 3);
    }

    #[test]
    fn test_replace_rejects_corrupt_bundle() {
        let dir = TempDir::new().unwrap();
        let store = DefinitionStore::open(dir.path()).unwrap();

        let mut bundle = sample_bundle();
        bundle.metadata.checksum = "0".repeat(64);
        assert!(store.replace(bundle).is_err());

        // Nothing was activated or persisted.
        assert!(store.current().is_none());
        assert!(DefinitionStore::open(dir.path()).unwrap().current().is_none());
    }

    #[test]
    fn test_old_version_stays_loadable_after_replace() {
        let dir = TempDir::new().unwrap();
        let store = DefinitionStore::open(dir.path()).unwrap();

        let v3 = sample_bundle();
        store.replace(v3).unwrap();

        let mut v4 = sample_bundle();
        v4.survey.version = 4;
        v4.metadata.checksum = v4.content_checksum().unwrap();
        store.replace(v4).unwrap();

        assert_eq!(store.current().unwrap().version(), 4);
        // The session that started on v3 can still resume against it.
        assert_eq!(store.load_version(3).unwrap().version(), 3);
    }
}
