use std::path::PathBuf;

use crate::options::CliPath;
use crate::{DriverError, Result};

/// Directory under the user's home holding the pinned bundled binary.
const BUNDLED_DIR: &str = ".claude-driver/bin";

/// Common install locations probed (after PATH) in `Global` mode, relative
/// to the home directory unless absolute.
const GLOBAL_FALLBACKS: &[&str] = &[
    ".claude/local/claude",
    ".local/bin/claude",
    ".npm-global/bin/claude",
    "/usr/local/bin/claude",
    "/opt/homebrew/bin/claude",
    "/usr/local/share/npm-global/bin/claude",
];

/// Resolve the `claude` executable per the configured mode.
///
/// `Bundled` only checks the pinned location; installing or upgrading the
/// binary is the installer's job, so a miss reports guidance instead of
/// downloading anything.
pub fn resolve(mode: &CliPath) -> Result<PathBuf> {
    match mode {
        CliPath::Explicit(path) => {
            if path.is_file() {
                Ok(path.clone())
            } else {
                Err(DriverError::CliNotFound {
                    guidance: format!(
                        "no executable at {}; check the cli_path option",
                        path.display()
                    ),
                })
            }
        }
        CliPath::Global => {
            if let Ok(found) = which::which("claude") {
                return Ok(found);
            }
            for candidate in GLOBAL_FALLBACKS {
                let path = if candidate.starts_with('/') {
                    PathBuf::from(candidate)
                } else {
                    match home::home_dir() {
                        Some(home) => home.join(candidate),
                        None => continue,
                    }
                };
                if path.is_file() {
                    return Ok(path);
                }
            }
            Err(DriverError::CliNotFound {
                guidance: "claude is not on PATH or in any known install location; \
                           install it with `npm install -g @anthropic-ai/claude-code`"
                    .into(),
            })
        }
        CliPath::Bundled => {
            let home = home::home_dir().ok_or_else(|| DriverError::CliNotFound {
                guidance: "cannot locate the home directory for the bundled binary; \
                           set the HOME environment variable or use an explicit cli_path"
                    .into(),
            })?;
            let path = home.join(BUNDLED_DIR).join("claude");
            if path.is_file() {
                Ok(path)
            } else {
                Err(DriverError::CliNotFound {
                    guidance: format!(
                        "no bundled binary at {}; run the installer, or use \
                         cli_path Global / an explicit path",
                        path.display()
                    ),
                })
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_path_is_used_verbatim() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        let path = file.path().to_owned();
        let resolved = resolve(&CliPath::Explicit(path.clone())).unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn explicit_missing_path_reports_guidance() {
        let err = resolve(&CliPath::Explicit("/nonexistent/claude".into())).unwrap_err();
        let DriverError::CliNotFound { guidance } = err else {
            panic!("expected CliNotFound");
        };
        assert!(guidance.contains("/nonexistent/claude"));
    }

    #[test]
    fn explicit_directory_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = resolve(&CliPath::Explicit(dir.path().to_owned()));
        assert!(err.is_err());
    }
}
