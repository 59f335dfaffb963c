use std::path::{Path, PathBuf};

/// Default arena directory: `~/.drifter.d`
pub fn default_arena() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".drifter.d")
}

/// Per-instance VM trees live under `<arena>/vms/`.
pub fn vms_dir(arena: &Path) -> PathBuf {
    arena.join("vms")
}

/// Cached boxcar archives and unpacked templates live under
/// `<arena>/cache/boxcars/`.
pub fn boxcars_dir(arena: &Path) -> PathBuf {
    arena.join("cache").join("boxcars")
}

/// Directory tree of a named instance: `<arena>/vms/<name>.vmwarevm/`
pub fn vm_path(arena: &Path, name: &str) -> PathBuf {
    vms_dir(arena).join(format!("{name}.vmwarevm"))
}

/// Default location of the shared bootstrap keypair.
pub fn bootstrap_key_path(arena: &Path) -> PathBuf {
    arena.join("bootstrap-insecure")
}

/// Expand a leading `~` or `$HOME` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    if raw == "~" || raw == "$HOME" {
        home()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home().join(rest)
    } else if let Some(rest) = raw.strip_prefix("$HOME/") {
        home().join(rest)
    } else {
        PathBuf::from(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_path_appends_bundle_suffix() {
        let p = vm_path(Path::new("/arena"), "dev");
        assert_eq!(p, PathBuf::from("/arena/vms/dev.vmwarevm"));
    }

    #[test]
    fn boxcars_dir_nests_under_cache() {
        let p = boxcars_dir(Path::new("/arena"));
        assert_eq!(p, PathBuf::from("/arena/cache/boxcars"));
    }

    #[test]
    fn expand_home_tilde_prefix() {
        let p = expand_home("~/.drifter.d");
        assert!(p.is_absolute() || p.starts_with("/tmp"));
        assert!(p.ends_with(".drifter.d"));
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/var/lib/x"), PathBuf::from("/var/lib/x"));
        assert_eq!(expand_home("relative/x"), PathBuf::from("relative/x"));
    }

    #[test]
    fn expand_home_dollar_home_prefix() {
        let p = expand_home("$HOME/.drifter.d");
        assert!(p.ends_with(".drifter.d"));
        assert!(!p.starts_with("$HOME"));
    }
}
