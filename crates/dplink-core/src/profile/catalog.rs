// ── Profile catalog ──
//
// The full library of known profiles, loaded once and read-only afterwards.
// Catalog order (sorted by file name) is significant: it breaks ties in
// detection.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use tracing::{debug, info};

use super::model::DeviceProfile;
use super::schema::parse_profile;
use crate::error::CoreError;

static GLOBAL: OnceLock<ProfileCatalog> = OnceLock::new();

/// An immutable, ordered set of profiles.
#[derive(Debug, Clone, Default)]
pub struct ProfileCatalog {
    profiles: Vec<Arc<DeviceProfile>>,
}

impl ProfileCatalog {
    /// Build from already-parsed profiles, keeping their order.
    pub fn from_profiles(profiles: Vec<DeviceProfile>) -> Result<Self, CoreError> {
        let mut seen = HashSet::new();
        for profile in &profiles {
            if !seen.insert(profile.config_id.as_str()) {
                return Err(CoreError::config(
                    &profile.config_id,
                    "config id used by more than one profile",
                ));
            }
        }
        Ok(Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
        })
    }

    /// Parse `(config_id, yaml)` pairs, keeping their order.
    pub fn from_sources<I, K, V>(sources: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let profiles = sources
            .into_iter()
            .map(|(id, text)| parse_profile(id.as_ref(), text.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_profiles(profiles)
    }

    /// Load every `*.yaml` / `*.yml` file in `dir`, sorted by file name.
    ///
    /// Any unreadable or malformed file fails the whole load.
    pub fn load_dir(dir: &Path) -> Result<Self, CoreError> {
        let source = dir.display().to_string();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CoreError::config(&source, format!("cannot read directory: {e}")))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| CoreError::config(&source, format!("cannot list directory: {e}")))?
                .path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
            if is_yaml && path.is_file() {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut profiles = Vec::with_capacity(files.len());
        for path in files {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    CoreError::config(path.display().to_string(), "file name is not valid UTF-8")
                })?
                .to_owned();
            let text = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::config(&stem, format!("cannot read file: {e}")))?;
            debug!(config = %stem, "parsing profile");
            profiles.push(parse_profile(&stem, &text)?);
        }

        info!(dir = %source, count = profiles.len(), "loaded profile catalog");
        Self::from_profiles(profiles)
    }

    pub fn profiles(&self) -> &[Arc<DeviceProfile>] {
        &self.profiles
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceProfile>> {
        self.profiles.iter()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn by_config(&self, config_id: &str) -> Option<&Arc<DeviceProfile>> {
        self.profiles.iter().find(|p| p.config_id == config_id)
    }

    /// Profiles listing `product_id`, in catalog order.
    pub fn by_product<'a>(
        &'a self,
        product_id: &'a str,
    ) -> impl Iterator<Item = &'a Arc<DeviceProfile>> + 'a {
        self.profiles
            .iter()
            .filter(move |p| p.matches_product(product_id))
    }

    /// The profile standing in for a pre-detection device type.
    pub fn by_legacy_type(&self, legacy_type: &str) -> Option<&Arc<DeviceProfile>> {
        self.profiles
            .iter()
            .find(|p| p.legacy_type.as_deref() == Some(legacy_type))
    }
}

// ── Process-wide catalog ────────────────────────────────────────────

/// Install `catalog` as the process-wide catalog.
///
/// Fails if a catalog is already installed; the first one stays.
pub fn init(catalog: ProfileCatalog) -> Result<&'static ProfileCatalog, CoreError> {
    let mut installed = false;
    let global = GLOBAL.get_or_init(|| {
        installed = true;
        catalog
    });
    if installed {
        Ok(global)
    } else {
        Err(CoreError::Internal(
            "profile catalog already initialized".into(),
        ))
    }
}

/// The process-wide catalog, if [`init`] has run.
pub fn global() -> Option<&'static ProfileCatalog> {
    GLOBAL.get()
}

/// Load `dir` and install it as the process-wide catalog.
pub fn load_catalog(dir: &Path) -> Result<&'static ProfileCatalog, CoreError> {
    init(ProfileCatalog::load_dir(dir)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SWITCH: &str = "
name: Simple switch
legacy_type: generic_switch
products:
  - id: abc123
primary_entity:
  entity: switch
  dps:
    - {id: 1, name: switch, type: boolean}
";

    const DIMMER: &str = "
name: Dimmer
primary_entity:
  entity: light
  dps:
    - {id: 1, name: switch, type: boolean}
    - {id: 2, name: brightness, type: integer}
";

    #[test]
    fn load_dir_sorts_by_file_name_and_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_switch.yaml"), SWITCH).unwrap();
        std::fs::write(dir.path().join("a_dimmer.yml"), DIMMER).unwrap();
        std::fs::write(dir.path().join("README.md"), "# not a profile").unwrap();

        let catalog = ProfileCatalog::load_dir(dir.path()).unwrap();
        let ids: Vec<&str> = catalog.iter().map(|p| p.config_id.as_str()).collect();
        assert_eq!(ids, ["a_dimmer", "b_switch"]);
        assert_eq!(
            catalog.by_legacy_type("generic_switch").unwrap().config_id,
            "b_switch"
        );
        assert_eq!(catalog.by_product("abc123").count(), 1);
    }

    #[test]
    fn one_broken_file_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.yaml"), SWITCH).unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "name: Bad\nprimary_entity: {}\n").unwrap();

        let err = ProfileCatalog::load_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Configuration { ref source_name, .. } if source_name == "bad"
        ));
    }

    #[test]
    fn duplicate_config_ids_are_rejected() {
        let err = ProfileCatalog::from_sources([("x", SWITCH), ("x", DIMMER)]).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }

    #[test]
    fn missing_directory_is_a_configuration_error() {
        let err = ProfileCatalog::load_dir(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, CoreError::Configuration { .. }));
    }
}
