//! The provisioning pipeline: a forward-only state machine that turns a
//! boxcar reference into a committed, bootstrapped instance.
//!
//! Stages run in a fixed total order with no backward transitions. Each
//! stage is gated by an idempotency check, so re-invoking the whole
//! pipeline after a failure at any point is safe: completed work is
//! skipped (cache hit, unpack marker) and partial work is redone from a
//! clean directory. Nothing is committed until the final stage, and a
//! failed run leaves the instance directory in place for inspection.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::boxcar;
use crate::config::LocalConfig;
use crate::error::DrifterError;
use crate::hypervisor::Vmrun;
use crate::instance::Instance;
use crate::process;
use crate::resolver;
use crate::ssh;
use crate::store;

/// Provisioning stages in strict forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Ensure the boxcar archive is cached and digest-verified.
    Fetch,
    /// Refuse to touch a committed instance; purge a leftover partial clone.
    Guard,
    /// Extract the archive into the shared template cache, marker-gated.
    Unpack,
    /// Materialize a full clone of the template descriptor.
    Clone,
    /// Mint the instance's own login keypair.
    KeyGen,
    /// Power on and discover the guest address.
    Boot,
    /// Prove connectivity with the shared bootstrap key, then install the
    /// instance key into the guest.
    Trust,
    /// Run the boxcar's declared command lines once, sentinel-checked.
    Bootstrap,
    /// Persist address + timestamp; the instance becomes usable.
    Commit,
}

impl Stage {
    pub const ORDER: [Stage; 9] = [
        Stage::Fetch,
        Stage::Guard,
        Stage::Unpack,
        Stage::Clone,
        Stage::KeyGen,
        Stage::Boot,
        Stage::Trust,
        Stage::Bootstrap,
        Stage::Commit,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Guard => "guard",
            Stage::Unpack => "unpack",
            Stage::Clone => "clone",
            Stage::KeyGen => "keygen",
            Stage::Boot => "boot",
            Stage::Trust => "trust",
            Stage::Bootstrap => "bootstrap",
            Stage::Commit => "commit",
        };
        f.write_str(name)
    }
}

pub struct Pipeline<'a> {
    config: &'a LocalConfig,
    vmrun: Vmrun,
    deadline: Option<Instant>,
    vm: Instance,
    archive: Option<PathBuf>,
    ip_addr: Option<String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a LocalConfig, deadline: Option<Instant>) -> Result<Self, DrifterError> {
        let name = config.require_instance()?;
        config.require_boxcar()?;
        let vm = Instance::open(&config.app_config, name);
        Ok(Self {
            config,
            vmrun: Vmrun::new(&config.app_config.vmrun_binary_path),
            deadline,
            vm,
            archive: None,
            ip_addr: None,
        })
    }

    /// Drive all stages in order. The first failure aborts the run.
    pub async fn run(mut self) -> Result<Instance, DrifterError> {
        for stage in Stage::ORDER {
            tracing::info!(stage = %stage, instance = %self.vm.name, "provisioning");
            if let Err(e) = self.step(stage).await {
                tracing::error!(stage = %stage, instance = %self.vm.name, "provisioning failed");
                return Err(e);
            }
        }
        println!(
            "Instance '{}' running on {}",
            self.vm.name, self.vm.metadata.ip_addr
        );
        Ok(self.vm)
    }

    async fn step(&mut self, stage: Stage) -> Result<(), DrifterError> {
        match stage {
            Stage::Fetch => {
                let archive =
                    store::fetch(&self.config.boxcar, &self.config.app_config.boxcars_dir())
                        .await?;
                self.archive = Some(archive);
                Ok(())
            }
            Stage::Guard => self.guard(),
            Stage::Unpack => self.unpack().await,
            Stage::Clone => self.clone_template().await,
            Stage::KeyGen => self.key_gen(),
            Stage::Boot => self.boot().await,
            Stage::Trust => self.trust().await,
            Stage::Bootstrap => self.bootstrap().await,
            Stage::Commit => self.commit(),
        }
    }

    /// A committed record means the instance is live data; never overwrite
    /// it. A descriptor without a record is a leftover partial clone:
    /// crash recovery is full redo, so the whole tree is purged.
    fn guard(&self) -> Result<(), DrifterError> {
        if self.vm.metadata_file.exists() {
            return Err(DrifterError::InstanceExists {
                path: self.vm.metadata_file.clone(),
            });
        }
        if self.vm.vmx_file.exists() {
            tracing::warn!(path = %self.vm.vm_path.display(), "purging partial clone");
            std::fs::remove_dir_all(&self.vm.vm_path).map_err(|e| DrifterError::Io {
                context: format!("removing {}", self.vm.vm_path.display()),
                source: e,
            })?;
        }
        std::fs::create_dir_all(self.config.app_config.vms_dir()).map_err(|e| {
            DrifterError::Io {
                context: format!("creating {}", self.config.app_config.vms_dir().display()),
                source: e,
            }
        })?;
        Ok(())
    }

    fn template_dir(&self) -> PathBuf {
        self.config
            .app_config
            .boxcars_dir()
            .join(format!("{}.vmwarevm", self.config.boxcar.name))
    }

    fn template_vmx(&self) -> PathBuf {
        self.template_dir()
            .join(format!("{}.vmx", self.config.boxcar.name))
    }

    async fn unpack(&self) -> Result<(), DrifterError> {
        let boxcars_dir = self.config.app_config.boxcars_dir();
        let marker = self.template_dir().join(".unpacked");
        let archive = self.archive.as_ref().expect("fetch ran first");

        if !marker.exists() {
            let lock_path = boxcars_dir.join(format!(".{}.unpack.lock", self.config.boxcar.name));
            let _lock = UnpackLock::acquire(&lock_path, self.deadline).await?;
            // Re-check under the lock: a concurrent run may have finished.
            if !marker.exists() {
                println!("Unpacking boxcar {}", archive.display());
                let args: Vec<&std::ffi::OsStr> = vec![
                    std::ffi::OsStr::new("xzf"),
                    archive.as_os_str(),
                    std::ffi::OsStr::new("-C"),
                    boxcars_dir.as_os_str(),
                ];
                process::run_checked("tar", &args).await?;
                std::fs::write(&marker, b"").map_err(|e| DrifterError::Io {
                    context: format!("writing unpack marker {}", marker.display()),
                    source: e,
                })?;
            }
        }

        let template_vmx = self.template_vmx();
        if !template_vmx.exists() {
            return Err(DrifterError::InvalidBoxcar { path: template_vmx });
        }
        Ok(())
    }

    async fn clone_template(&self) -> Result<(), DrifterError> {
        println!("Cloning {} from {}", self.vm.name, self.config.boxcar.name);
        self.vmrun
            .clone_vm(&self.template_vmx(), &self.vm.vmx_file, &self.vm.name)
            .await
    }

    /// Fresh keypair per instance, never reused across instances. This is
    /// the long-term credential, distinct from the shared bootstrap key.
    fn key_gen(&self) -> Result<(), DrifterError> {
        ssh::generate_keypair(&self.vm.key_path, &format!("drifter-{}", self.vm.name))
    }

    async fn boot(&mut self) -> Result<(), DrifterError> {
        println!("Starting {}", self.vm.vmx_file.display());
        self.vmrun.start(&self.vm.vmx_file).await?;

        let ip_addr = self.resolve_addr().await?;
        if !resolver::wait_for_reachable(&ip_addr, resolver::LOGIN_PORT, self.deadline).await {
            // The listener never showed; the tools answer is authoritative.
            tracing::warn!(ip_addr = %ip_addr, "login port unreachable, re-querying guest tools");
            let fresh = self.vmrun.guest_ip(&self.vm.vmx_file).await?;
            self.ip_addr = Some(fresh);
            return Ok(());
        }
        self.ip_addr = Some(ip_addr);
        Ok(())
    }

    /// Tools query first; when the tool itself gives up, fall back to
    /// scanning the host's lease file for the descriptor's hardware
    /// address.
    async fn resolve_addr(&self) -> Result<String, DrifterError> {
        match self.vmrun.guest_ip(&self.vm.vmx_file).await {
            Ok(ip_addr) => Ok(ip_addr),
            Err(err) => {
                tracing::warn!(%err, "guest tools query failed, scanning lease file");
                let mac_addr = resolver::mac_addr_from_vmx(&self.vm.vmx_file)?;
                resolver::ip_from_lease_file(
                    &self.config.app_config.lease_file_path,
                    &mac_addr,
                    self.deadline,
                )
                .await
            }
        }
    }

    async fn trust(&self) -> Result<(), DrifterError> {
        let bootstrap_key = self.config.app_config.bootstrap_key();
        ssh::ensure_bootstrap_key(&bootstrap_key)?;

        let ip_addr = self.ip_addr.as_deref().expect("boot ran first");
        let user = &self.config.app_config.guest_user;
        ssh::check_login(&bootstrap_key, user, ip_addr).await?;
        ssh::install_authorized_key(&bootstrap_key, &self.vm.pub_key_path(), user, ip_addr).await
    }

    async fn bootstrap(&self) -> Result<(), DrifterError> {
        let ip_addr = self.ip_addr.as_deref().expect("boot ran first");
        let host_user = std::env::var("LOGNAME")
            .or_else(|_| std::env::var("USER"))
            .unwrap_or_default();
        let script = self.config.boxcar.bootstrap_script(&host_user);

        println!("Bootstrapping guest on {ip_addr}");
        let out = ssh::run_script(
            &self.vm.key_path,
            &self.config.app_config.guest_user,
            ip_addr,
            &script,
        )
        .await?;

        let text = out.text();
        if !boxcar::bootstrap_succeeded(out.status.success(), &text) {
            tracing::error!(
                status = out.exit_code(),
                output = %text.trim(),
                "bootstrap output did not confirm success"
            );
            let reason = if out.status.success() {
                "output did not end with the expected confirmation line".to_string()
            } else {
                format!("remote session exited with status {}", out.exit_code())
            };
            return Err(DrifterError::BootstrapFailed {
                addr: ip_addr.to_string(),
                reason,
            });
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DrifterError> {
        self.vm.metadata.ip_addr = self.ip_addr.clone().expect("boot ran first");
        self.vm.metadata.time_bootstrapped = Some(chrono::Utc::now());
        self.vm.write_metadata()
    }
}

/// Scoped advisory lock around the unpack-and-mark step. Exactly one run
/// extracts a given template; others wait for the lock to clear and then
/// see the marker. The guard removes the lock file on all exit paths.
struct UnpackLock {
    path: PathBuf,
}

impl UnpackLock {
    async fn acquire(path: &Path, deadline: Option<Instant>) -> Result<UnpackLock, DrifterError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DrifterError::Io {
                context: format!("creating {}", parent.display()),
                source: e,
            })?;
        }
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(UnpackLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(DrifterError::Validation {
                            message: format!(
                                "timed out waiting for unpack lock {}",
                                path.display()
                            ),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => {
                    return Err(DrifterError::Io {
                        context: format!("creating lock file {}", path.display()),
                        source: e,
                    });
                }
            }
        }
    }
}

impl Drop for UnpackLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn stages_run_in_declared_order() {
        assert_eq!(Stage::ORDER.first(), Some(&Stage::Fetch));
        assert_eq!(Stage::ORDER.last(), Some(&Stage::Commit));
        let boot_at = Stage::ORDER.iter().position(|s| *s == Stage::Boot).unwrap();
        let trust_at = Stage::ORDER.iter().position(|s| *s == Stage::Trust).unwrap();
        assert!(boot_at < trust_at);
    }

    #[test]
    fn guard_rejects_committed_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let pipeline = Pipeline::new(&config, None).unwrap();

        std::fs::create_dir_all(pipeline.vm.metadata_file.parent().unwrap()).unwrap();
        std::fs::write(&pipeline.vm.metadata_file, "{}").unwrap();

        let err = pipeline.guard().unwrap_err();
        assert!(matches!(err, DrifterError::InstanceExists { .. }));
        // Protecting existing data: nothing was deleted.
        assert!(pipeline.vm.metadata_file.exists());
    }

    #[test]
    fn guard_purges_partial_clone() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let pipeline = Pipeline::new(&config, None).unwrap();

        // Descriptor without a committed record: a crashed earlier run.
        std::fs::create_dir_all(&pipeline.vm.vm_path).unwrap();
        std::fs::write(&pipeline.vm.vmx_file, "config.version = \"8\"\n").unwrap();

        pipeline.guard().unwrap();
        assert!(!pipeline.vm.vm_path.exists(), "partial clone must be purged");
    }

    #[test]
    fn guard_on_clean_slate_creates_vms_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let pipeline = Pipeline::new(&config, None).unwrap();

        pipeline.guard().unwrap();
        assert!(config.app_config.vms_dir().exists());
    }

    #[tokio::test]
    async fn unpack_lock_is_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".demo.unpack.lock");

        {
            let _lock = UnpackLock::acquire(&lock_path, None).await.unwrap();
            assert!(lock_path.exists());

            // A second acquisition with an expired deadline gives up.
            let past = Some(Instant::now() - Duration::from_secs(1));
            assert!(UnpackLock::acquire(&lock_path, past).await.is_err());
        }
        assert!(!lock_path.exists(), "lock must be released on drop");

        // Free again after release.
        let _lock = UnpackLock::acquire(&lock_path, None).await.unwrap();
    }

    #[tokio::test]
    async fn unpack_requires_template_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut pipeline = Pipeline::new(&config, None).unwrap();

        // Fake a fetched archive and a completed unpack with no descriptor.
        let boxcars_dir = config.app_config.boxcars_dir();
        let template_dir = boxcars_dir.join("demo.vmwarevm");
        std::fs::create_dir_all(&template_dir).unwrap();
        std::fs::write(template_dir.join(".unpacked"), b"").unwrap();
        pipeline.archive = Some(boxcars_dir.join("demo.tgz"));

        let err = pipeline.unpack().await.unwrap_err();
        assert!(matches!(err, DrifterError::InvalidBoxcar { .. }));
    }

    #[tokio::test]
    async fn unpack_marker_skips_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let mut pipeline = Pipeline::new(&config, None).unwrap();

        // Marker + descriptor present: unpack must succeed without ever
        // invoking tar (the archive path does not even exist).
        let template_dir = config.app_config.boxcars_dir().join("demo.vmwarevm");
        std::fs::create_dir_all(&template_dir).unwrap();
        std::fs::write(template_dir.join(".unpacked"), b"").unwrap();
        std::fs::write(template_dir.join("demo.vmx"), "config.version = \"8\"\n").unwrap();
        pipeline.archive = Some(config.app_config.boxcars_dir().join("absent.tgz"));

        pipeline.unpack().await.unwrap();
    }
}
