//! Packaging a VM directory into a distributable boxcar archive.
//!
//! Compression overlaps local I/O with a producer/consumer pair: a `tar`
//! child streams the tree to its stdout, a `pigz` child compresses stdin
//! into the output file, and one pump task moves bytes between them
//! through the bounded pipe. Both children are joined synchronously and
//! the first error wins.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::config::AppConfig;
use crate::error::DrifterError;
use crate::hypervisor::Vmrun;
use crate::process;

pub async fn make_boxcar(app: &AppConfig, dir: &Path) -> Result<PathBuf, DrifterError> {
    if !dir.is_dir() {
        return Err(DrifterError::Validation {
            message: format!(
                "make-boxcar requires a path to an existing vmwarevm directory: {}",
                dir.display()
            ),
        });
    }
    let root_vmdk = dir.join("root.vmdk");
    if !root_vmdk.exists() {
        return Err(DrifterError::Validation {
            message: format!(
                "vmwarevm directory must have a root.vmdk: {}",
                root_vmdk.display()
            ),
        });
    }

    // Power-cycle once so the hypervisor settles descriptor state before
    // the tree is archived.
    let vmrun = Vmrun::new(&app.vmrun_binary_path);
    vmrun.start(dir).await?;
    vmrun.stop(dir, true).await?;

    prune(dir)?;
    shrink(app, &root_vmdk).await?;
    compress(dir).await
}

/// Drop host-side litter that has no business inside a template image.
fn prune(dir: &Path) -> Result<(), DrifterError> {
    let caches = dir.join("caches");
    if caches.exists() {
        std::fs::remove_dir_all(&caches).map_err(|e| DrifterError::Io {
            context: format!("removing {}", caches.display()),
            source: e,
        })?;
    }

    let entries = std::fs::read_dir(dir).map_err(|e| DrifterError::Io {
        context: format!("reading {}", dir.display()),
        source: e,
    })?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if matches!(ext, Some("log") | Some("lck")) {
            remove_any(&path)?;
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<(), DrifterError> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| DrifterError::Io {
        context: format!("removing {}", path.display()),
        source: e,
    })
}

/// Defragment and shrink the root disk with the vdisk manager tool.
async fn shrink(app: &AppConfig, root_vmdk: &Path) -> Result<(), DrifterError> {
    println!("Shrinking {}", root_vmdk.display());
    let defrag: Vec<&std::ffi::OsStr> =
        vec![std::ffi::OsStr::new("-d"), root_vmdk.as_os_str()];
    process::run_checked(&app.vdisk_manager_binary_path, &defrag).await?;
    let shrink: Vec<&std::ffi::OsStr> =
        vec![std::ffi::OsStr::new("-k"), root_vmdk.as_os_str()];
    process::run_checked(&app.vdisk_manager_binary_path, &shrink).await?;
    Ok(())
}

/// Output path for a packaged directory: `<dir>.tgz` next to it.
pub fn output_path(dir: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tgz", dir.display()))
}

async fn compress(dir: &Path) -> Result<PathBuf, DrifterError> {
    let parent = dir.parent().unwrap_or(Path::new("."));
    let base = dir.file_name().ok_or_else(|| DrifterError::Validation {
        message: format!("cannot derive archive name from {}", dir.display()),
    })?;
    let out_path = output_path(dir);
    let out_file = std::fs::File::create(&out_path).map_err(|e| DrifterError::Io {
        context: format!("creating {}", out_path.display()),
        source: e,
    })?;

    println!("Compressing {}", dir.display());

    let mut tar = tokio::process::Command::new("tar")
        .arg("cf")
        .arg("-")
        .arg("-C")
        .arg(parent)
        .arg(base)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| DrifterError::Io {
            context: "spawning tar".into(),
            source: e,
        })?;

    let mut pigz = tokio::process::Command::new("pigz")
        .stdin(Stdio::piped())
        .stdout(Stdio::from(out_file))
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| DrifterError::Io {
            context: "spawning pigz".into(),
            source: e,
        })?;

    let mut tar_out = tar.stdout.take().expect("stdout is piped");
    let mut pigz_in = pigz.stdin.take().expect("stdin is piped");

    let pump = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut tar_out, &mut pigz_in).await;
        // Dropping the handle closes the pipe so the compressor sees EOF.
        drop(pigz_in);
        copied
    });

    let pump_result = pump.await.map_err(|e| DrifterError::Validation {
        message: format!("archive stream task failed: {e}"),
    })?;
    let tar_status = tar.wait().await.map_err(|e| DrifterError::Io {
        context: "waiting for tar".into(),
        source: e,
    })?;
    let pigz_status = pigz.wait().await.map_err(|e| DrifterError::Io {
        context: "waiting for pigz".into(),
        source: e,
    })?;

    pump_result.map_err(|e| DrifterError::Io {
        context: "streaming archive data".into(),
        source: e,
    })?;
    if !tar_status.success() {
        return Err(DrifterError::CommandFailed {
            command: "tar".into(),
            status: tar_status.code().unwrap_or(-1),
            output: String::new(),
        });
    }
    if !pigz_status.success() {
        return Err(DrifterError::CommandFailed {
            command: "pigz".into(),
            status: pigz_status.code().unwrap_or(-1),
            output: String::new(),
        });
    }

    println!("Created {}", out_path.display());
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_appends_tgz_to_full_name() {
        assert_eq!(
            output_path(Path::new("/vms/dev.vmwarevm")),
            PathBuf::from("/vms/dev.vmwarevm.tgz")
        );
    }

    #[test]
    fn prune_drops_logs_locks_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("caches")).unwrap();
        std::fs::write(root.join("vmware.log"), b"x").unwrap();
        std::fs::create_dir(root.join("root.vmdk.lck")).unwrap();
        std::fs::write(root.join("root.vmdk"), b"disk").unwrap();

        prune(root).unwrap();

        assert!(!root.join("caches").exists());
        assert!(!root.join("vmware.log").exists());
        assert!(!root.join("root.vmdk.lck").exists());
        assert!(root.join("root.vmdk").exists());
    }

    #[test]
    fn missing_directory_is_rejected() {
        let err = futures_util::future::FutureExt::now_or_never(make_boxcar(
            &AppConfig::default(),
            Path::new("/nonexistent/dir.vmwarevm"),
        ))
        .expect("validation happens before any await")
        .unwrap_err();
        assert!(matches!(err, DrifterError::Validation { .. }));
    }
}
