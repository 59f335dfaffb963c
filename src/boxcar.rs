use serde::{Deserialize, Serialize};

use crate::error::DrifterError;

/// Marker string whose presence on the last non-blank output line is the
/// authoritative success signal for a bootstrap run.
pub const BOOTSTRAP_SENTINEL: &str = "drifter-bootstrap-ok";

/// An immutable, versioned template image descriptor. Authored alongside
/// the archive it names; the digest is mandatory and is verified against
/// the retrieved bytes, while `name` and `version` are opaque labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Boxcar {
    pub name: String,
    pub url: String,
    pub version: String,
    pub sha256: String,
    pub bootstrap_cmd_lines: Vec<String>,
}

impl Boxcar {
    pub fn validate(&self) -> Result<(), DrifterError> {
        if self.name.is_empty() {
            return Err(DrifterError::Validation {
                message: "boxcar Name must not be empty".into(),
            });
        }
        if !is_supported_url(&self.url) {
            return Err(DrifterError::Validation {
                message: format!(
                    "boxcar Url must be a file://, http:// or https:// locator (got '{}')",
                    self.url
                ),
            });
        }
        if !is_sha256_hex(&self.sha256) {
            return Err(DrifterError::Validation {
                message: format!(
                    "boxcar Sha256 must be 64 lowercase hex characters (got '{}')",
                    self.sha256
                ),
            });
        }
        Ok(())
    }

    /// Assemble the one-shot script executed inside a freshly cloned guest:
    /// a fixed preamble, the declared command lines, and the sentinel echo.
    pub fn bootstrap_script(&self, host_user: &str) -> String {
        let mut lines = vec![
            format!("export DRIFTER_HOST_USER={host_user}"),
            "export DRIFTER_CMD=bootstrap".to_string(),
            "cd /tmp".to_string(),
        ];
        lines.extend(self.bootstrap_cmd_lines.iter().cloned());
        lines.push(format!("echo {BOOTSTRAP_SENTINEL}"));
        lines.join("\n")
    }
}

/// Bootstrap success requires a clean exit AND the sentinel on the last
/// non-blank output line; a zero exit alone proves nothing.
pub fn bootstrap_succeeded(exit_ok: bool, output: &str) -> bool {
    if !exit_ok {
        return false;
    }
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        == Some(BOOTSTRAP_SENTINEL)
}

fn is_supported_url(url: &str) -> bool {
    url.starts_with("file://") || url.starts_with("http://") || url.starts_with("https://")
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_boxcar() -> Boxcar {
        Boxcar {
            name: "demo".into(),
            url: "file:///tmp/demo.tgz".into(),
            version: "1".into(),
            sha256: "a".repeat(64),
            bootstrap_cmd_lines: vec!["touch /tmp/ok".into()],
        }
    }

    #[test]
    fn script_places_preamble_first_and_sentinel_last() {
        let script = demo_boxcar().bootstrap_script("alice");
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "export DRIFTER_HOST_USER=alice");
        assert_eq!(lines[1], "export DRIFTER_CMD=bootstrap");
        assert_eq!(lines[2], "cd /tmp");
        assert_eq!(lines[3], "touch /tmp/ok");
        assert_eq!(*lines.last().unwrap(), "echo drifter-bootstrap-ok");
    }

    #[test]
    fn clean_exit_with_sentinel_succeeds() {
        assert!(bootstrap_succeeded(
            true,
            "setting up\ndrifter-bootstrap-ok\n"
        ));
    }

    #[test]
    fn clean_exit_without_sentinel_fails() {
        assert!(!bootstrap_succeeded(true, "setting up\nall done\n"));
    }

    #[test]
    fn nonzero_exit_with_sentinel_still_fails() {
        assert!(!bootstrap_succeeded(false, "drifter-bootstrap-ok\n"));
    }

    #[test]
    fn trailing_blank_lines_are_skipped() {
        assert!(bootstrap_succeeded(true, "drifter-bootstrap-ok\n\n  \n"));
    }

    #[test]
    fn empty_output_fails() {
        assert!(!bootstrap_succeeded(true, ""));
    }

    #[test]
    fn validate_accepts_demo() {
        demo_boxcar().validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_digests() {
        let upper = "A".repeat(64);
        let non_hex = "g".repeat(64);
        for sha in ["", "abc", upper.as_str(), non_hex.as_str()] {
            let mut bxc = demo_boxcar();
            bxc.sha256 = sha.to_string();
            assert!(bxc.validate().is_err(), "expected '{sha}' to be rejected");
        }
    }

    #[test]
    fn validate_rejects_unknown_scheme() {
        let mut bxc = demo_boxcar();
        bxc.url = "ftp://example.com/demo.tgz".into();
        assert!(bxc.validate().is_err());
    }

    #[test]
    fn descriptor_fields_round_trip_pascal_case() {
        let json = r#"{
            "Name": "demo",
            "Url": "https://example.com/demo.tgz",
            "Version": "3",
            "Sha256": "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            "BootstrapCmdLines": ["apt-get update", "touch /tmp/ok"]
        }"#;
        let bxc: Boxcar = serde_json::from_str(json).unwrap();
        assert_eq!(bxc.name, "demo");
        assert_eq!(bxc.bootstrap_cmd_lines.len(), 2);

        let back = serde_json::to_string(&bxc).unwrap();
        assert!(back.contains("\"Sha256\""));
        assert!(back.contains("\"BootstrapCmdLines\""));
    }
}
