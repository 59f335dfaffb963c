use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::DrifterError;
use crate::hypervisor::Vmrun;
use crate::paths;

/// Durable per-instance record, committed only when provisioning fully
/// succeeds. An absent timestamp means the instance has never completed
/// bootstrap; an empty address means it was never resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Metadata {
    pub time_bootstrapped: Option<DateTime<Utc>>,
    pub ip_addr: String,
}

impl Metadata {
    pub fn is_bootstrapped(&self) -> bool {
        self.time_bootstrapped.is_some()
    }
}

/// A named VM instance and the paths derived from its name. The metadata
/// file lives inside the instance's own tree, so deleting the tree fully
/// deprovisions it.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub vm_path: PathBuf,
    pub vmx_file: PathBuf,
    pub metadata_file: PathBuf,
    pub key_path: PathBuf,
    pub metadata: Metadata,
}

impl Instance {
    /// Derive paths for `name` without touching the filesystem.
    pub fn open(app: &AppConfig, name: &str) -> Instance {
        let vm_path = paths::vm_path(&app.arena(), name);
        let vmx_file = vm_path.join(format!("{name}.vmx"));
        let metadata_file = vm_path.join("drifter").join("instance.json");
        let key_path = vm_path.join("id_drifter");
        Instance {
            name: name.to_string(),
            vm_path,
            vmx_file,
            metadata_file,
            key_path,
            metadata: Metadata::default(),
        }
    }

    /// Load the committed record; `NotFound` when the instance was never
    /// committed, so callers can branch into provisioning.
    pub fn load(app: &AppConfig, name: &str) -> Result<Instance, DrifterError> {
        let mut vm = Self::open(app, name);
        let data = match std::fs::read_to_string(&vm.metadata_file) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DrifterError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(e) => {
                return Err(DrifterError::Io {
                    context: format!("reading {}", vm.metadata_file.display()),
                    source: e,
                });
            }
        };
        vm.metadata = serde_json::from_str(&data).map_err(|e| DrifterError::ConfigParse {
            path: vm.metadata_file.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(vm)
    }

    pub fn pub_key_path(&self) -> PathBuf {
        self.key_path.with_extension("pub")
    }

    /// Persist the metadata record. This is the single commit point that
    /// turns a provisioned instance into a usable one.
    pub fn write_metadata(&self) -> Result<(), DrifterError> {
        if let Some(dir) = self.metadata_file.parent() {
            std::fs::create_dir_all(dir).map_err(|e| DrifterError::Io {
                context: format!("creating {}", dir.display()),
                source: e,
            })?;
        }
        let data = serde_json::to_string_pretty(&self.metadata).expect("metadata serializes");
        std::fs::write(&self.metadata_file, data).map_err(|e| DrifterError::Io {
            context: format!("writing {}", self.metadata_file.display()),
            source: e,
        })
    }
}

/// Permanently remove an instance: force-stop it if the hypervisor still
/// lists its descriptor, then delete the whole tree. Refuses to leave a
/// running process with deleted backing storage.
pub async fn remove(vmrun: &Vmrun, vm: &Instance) -> Result<(), DrifterError> {
    if vmrun.is_running(&vm.vmx_file).await? {
        tracing::info!(instance = %vm.name, "stopping before removal");
        vmrun.stop(&vm.vmx_file, true).await?;
    }
    std::fs::remove_dir_all(&vm.vm_path).map_err(|e| DrifterError::Io {
        context: format!(
            "removing {} — partial data may remain",
            vm.vm_path.display()
        ),
        source: e,
    })?;
    println!("Removed '{}'.", vm.name);
    Ok(())
}
