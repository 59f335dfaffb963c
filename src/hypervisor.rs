use std::ffi::OsStr;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::DrifterError;
use crate::process;

/// Host type passed to the control program's query subcommands.
const HOST_TYPE: &str = "fusion";

/// Thin wrapper over the hypervisor control program. The contract is the
/// tool's command-line surface; nothing here knows about VM internals.
pub struct Vmrun {
    binary: PathBuf,
}

impl Vmrun {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Descriptor paths of all currently running VMs.
    pub async fn list(&self) -> Result<Vec<PathBuf>, DrifterError> {
        let out = process::run_checked(&self.binary, &["-T", HOST_TYPE, "list"]).await?;
        Ok(parse_list(&out.text()))
    }

    pub async fn start(&self, vmx: &Path) -> Result<(), DrifterError> {
        let args: Vec<&OsStr> = vec![OsStr::new("start"), vmx.as_os_str(), OsStr::new("nogui")];
        process::run_checked(&self.binary, &args).await?;
        Ok(())
    }

    pub async fn stop(&self, vmx: &Path, hard: bool) -> Result<(), DrifterError> {
        let mut args: Vec<&OsStr> = vec![OsStr::new("stop"), vmx.as_os_str()];
        if hard {
            args.push(OsStr::new("hard"));
        }
        process::run_checked(&self.binary, &args).await?;
        Ok(())
    }

    /// Materialize a full (non-linked) copy of a template descriptor.
    /// Full clones trade disk space for independence from the shared
    /// template surviving on disk.
    pub async fn clone_vm(
        &self,
        template_vmx: &Path,
        vmx: &Path,
        name: &str,
    ) -> Result<(), DrifterError> {
        let clone_name = format!("-cloneName={name}");
        let args: Vec<&OsStr> = vec![
            OsStr::new("-T"),
            OsStr::new(HOST_TYPE),
            OsStr::new("clone"),
            template_vmx.as_os_str(),
            vmx.as_os_str(),
            OsStr::new("full"),
            OsStr::new(&clone_name),
        ];
        process::run_checked(&self.binary, &args).await?;
        Ok(())
    }

    /// Ask the guest tools for the VM's address. Blocks until the guest
    /// reports one or the tool itself gives up; authoritative on success.
    pub async fn guest_ip(&self, vmx: &Path) -> Result<String, DrifterError> {
        let args: Vec<&OsStr> = vec![
            OsStr::new("-T"),
            OsStr::new(HOST_TYPE),
            OsStr::new("getGuestIPAddress"),
            vmx.as_os_str(),
            OsStr::new("-wait"),
        ];
        let out = process::run_checked(&self.binary, &args).await?;
        let text = out.text();
        parse_guest_ip(&text).ok_or_else(|| DrifterError::Validation {
            message: format!("guest tools query returned no address: '{}'", text.trim()),
        })
    }

    /// Whether the hypervisor currently lists this descriptor as running.
    pub async fn is_running(&self, vmx: &Path) -> Result<bool, DrifterError> {
        let canonical = vmx.canonicalize().unwrap_or_else(|_| vmx.to_path_buf());
        for path in self.list().await? {
            if path == vmx || path == canonical {
                return Ok(true);
            }
            if path
                .canonicalize()
                .map(|p| p == canonical)
                .unwrap_or(false)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Suspend interactively, handing the terminal to the control program.
    /// Only returns on failure.
    pub fn suspend_interactive(&self, vmx: &Path) -> DrifterError {
        let args: Vec<&OsStr> = vec![OsStr::new("suspend"), vmx.as_os_str()];
        process::exec_replace(&self.binary, &args)
    }
}

fn parse_list(text: &str) -> Vec<PathBuf> {
    text.lines()
        .map(str::trim)
        .filter(|l| l.ends_with(".vmx"))
        .map(PathBuf::from)
        .collect()
}

/// The tools query prints the address on its own line; scan from the end
/// so trailing diagnostics don't confuse the parse.
fn parse_guest_ip(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .filter_map(|l| l.trim().parse::<IpAddr>().ok())
        .next()
        .map(|a| a.to_string())
}
