use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::boxcar::Boxcar;
use crate::error::DrifterError;
use crate::paths;

/// Tool-level settings: collaborator binaries and the arena layout.
///
/// The arena is the per-user directory holding everything drifter owns:
/// `<arena>/cache/boxcars/` for archives and unpacked templates,
/// `<arena>/vms/` for instance trees, and the shared bootstrap keypair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AppConfig {
    pub vmrun_binary_path: PathBuf,
    pub vdisk_manager_binary_path: PathBuf,
    pub arena_dir: String,
    pub lease_file_path: PathBuf,
    pub guest_user: String,
    /// Empty means `<arena>/bootstrap-insecure`.
    pub bootstrap_key_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            vmrun_binary_path: PathBuf::from(
                "/Applications/VMware Fusion.app/Contents/Library/vmrun",
            ),
            vdisk_manager_binary_path: PathBuf::from(
                "/Applications/VMware Fusion.app/Contents/Library/vmware-vdiskmanager",
            ),
            arena_dir: "~/.drifter.d".into(),
            lease_file_path: PathBuf::from("/var/db/vmware/vmnet-dhcpd-vmnet8.leases"),
            guest_user: "drifter".into(),
            bootstrap_key_path: String::new(),
        }
    }
}

impl AppConfig {
    pub fn arena(&self) -> PathBuf {
        paths::expand_home(&self.arena_dir)
    }

    pub fn vms_dir(&self) -> PathBuf {
        paths::vms_dir(&self.arena())
    }

    pub fn boxcars_dir(&self) -> PathBuf {
        paths::boxcars_dir(&self.arena())
    }

    /// Location of the shared low-trust bootstrap keypair.
    pub fn bootstrap_key(&self) -> PathBuf {
        if self.bootstrap_key_path.is_empty() {
            paths::bootstrap_key_path(&self.arena())
        } else {
            paths::expand_home(&self.bootstrap_key_path)
        }
    }
}

/// The operator-authored config document: tool settings, the boxcar to
/// clone from, and the instance name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LocalConfig {
    pub app_config: AppConfig,
    pub boxcar: Boxcar,
    pub name: String,
}

impl LocalConfig {
    /// Instance name, required by every per-instance operation.
    pub fn require_instance(&self) -> Result<&str, DrifterError> {
        if self.name.is_empty() {
            return Err(DrifterError::Validation {
                message: "config must set Name to address an instance".into(),
            });
        }
        Ok(&self.name)
    }

    /// Boxcar reference, required by fetch and provisioning.
    pub fn require_boxcar(&self) -> Result<&Boxcar, DrifterError> {
        if self.boxcar.name.is_empty() {
            return Err(DrifterError::Validation {
                message: "config must set a Boxcar section to fetch or provision".into(),
            });
        }
        Ok(&self.boxcar)
    }
}

/// First existing file of: the explicit path, `./.drifter`, `~/.drifter`.
pub fn find_config_file(explicit: &Path) -> Option<PathBuf> {
    let mut candidates = vec![explicit.to_path_buf(), PathBuf::from(".drifter")];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".drifter"));
    }
    candidates.into_iter().find(|p| p.exists())
}

pub fn load(path: &Path) -> Result<LocalConfig, DrifterError> {
    let contents = std::fs::read_to_string(path).map_err(|source| DrifterError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: LocalConfig =
        serde_json::from_str(&contents).map_err(|e| DrifterError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    validate(&config)?;
    Ok(config)
}

/// Load via the search order; a missing file is fatal.
pub fn load_discovered(explicit: &Path) -> Result<LocalConfig, DrifterError> {
    let path = find_config_file(explicit).ok_or(DrifterError::ConfigMissing)?;
    load(&path)
}

/// Load via the search order, falling back to defaults when no file
/// exists. Used by operations that only need tool paths.
pub fn load_or_default(explicit: &Path) -> Result<LocalConfig, DrifterError> {
    match find_config_file(explicit) {
        Some(path) => load(&path),
        None => Ok(LocalConfig::default()),
    }
}

fn validate(config: &LocalConfig) -> Result<(), DrifterError> {
    if !config.name.is_empty() {
        validate_name(&config.name)?;
    }
    // An all-empty Boxcar section is allowed; a partially filled one must
    // be complete and well formed.
    let bxc = &config.boxcar;
    if !bxc.name.is_empty() || !bxc.url.is_empty() || !bxc.sha256.is_empty() {
        bxc.validate()?;
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), DrifterError> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(DrifterError::Validation {
            message: format!("Name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Build a LocalConfig rooted in a throwaway arena for tests.
    pub fn test_config(arena: &Path) -> LocalConfig {
        LocalConfig {
            app_config: AppConfig {
                arena_dir: arena.display().to_string(),
                ..AppConfig::default()
            },
            boxcar: Boxcar {
                name: "demo".into(),
                url: "file:///tmp/demo.tgz".into(),
                version: "1".into(),
                sha256: "a".repeat(64),
                bootstrap_cmd_lines: vec!["touch /tmp/ok".into()],
            },
            name: "test-vm".into(),
        }
    }

    #[test]
    fn full_document_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".drifter");
        std::fs::write(
            &path,
            format!(
                r#"{{
                    "AppConfig": {{ "ArenaDir": "/tmp/arena", "GuestUser": "ops" }},
                    "Boxcar": {{
                        "Name": "demo",
                        "Url": "https://example.com/demo.tgz",
                        "Version": "2",
                        "Sha256": "{}",
                        "BootstrapCmdLines": ["touch /tmp/ok"]
                    }},
                    "Name": "dev"
                }}"#,
                "b".repeat(64)
            ),
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.name, "dev");
        assert_eq!(config.app_config.guest_user, "ops");
        assert_eq!(config.app_config.arena(), PathBuf::from("/tmp/arena"));
        assert_eq!(config.boxcar.version, "2");
        // Unset fields keep their defaults
        assert!(
            config
                .app_config
                .vmrun_binary_path
                .to_string_lossy()
                .contains("vmrun")
        );
    }

    #[test]
    fn minimal_document_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".drifter");
        std::fs::write(&path, "{}").unwrap();

        let config = load(&path).unwrap();
        assert!(config.name.is_empty());
        assert_eq!(config.app_config.guest_user, "drifter");
        assert!(config.require_instance().is_err());
        assert!(config.require_boxcar().is_err());
    }

    #[test]
    fn partial_boxcar_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".drifter");
        std::fs::write(&path, r#"{ "Boxcar": { "Name": "demo" } }"#).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn bad_instance_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".drifter");
        std::fs::write(&path, r#"{ "Name": "../etc" }"#).unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn valid_names() {
        for name in ["myvm", "test-vm", "vm.dev", "VM_01", "a"] {
            validate_name(name).unwrap();
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", "-bad", ".bad", "_bad", "a/b", "hello world"] {
            assert!(
                validate_name(name).is_err(),
                "expected name '{name}' to be rejected"
            );
        }
    }

    #[test]
    fn explicit_config_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("custom.drifter");
        std::fs::write(&explicit, "{}").unwrap();
        assert_eq!(find_config_file(&explicit), Some(explicit.clone()));
    }

    #[test]
    fn bootstrap_key_defaults_into_arena() {
        let config = test_config(Path::new("/tmp/arena"));
        assert_eq!(
            config.app_config.bootstrap_key(),
            PathBuf::from("/tmp/arena/bootstrap-insecure")
        );
    }

    #[test]
    fn bootstrap_key_honors_explicit_path() {
        let mut config = test_config(Path::new("/tmp/arena"));
        config.app_config.bootstrap_key_path = "/keys/shared".into();
        assert_eq!(
            config.app_config.bootstrap_key(),
            PathBuf::from("/keys/shared")
        );
    }
}
