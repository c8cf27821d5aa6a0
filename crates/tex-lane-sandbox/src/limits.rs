//! Per-process resource limits applied between fork and exec.

use serde::{Deserialize, Serialize};
use std::process::Command;

/// Hard limits for a sandboxed process. `None` leaves the inherited limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time in seconds
    #[serde(default)]
    pub cpu_seconds: Option<u64>,

    /// Address space in bytes
    #[serde(default)]
    pub address_space_bytes: Option<u64>,

    /// Largest file the process may write, in bytes
    #[serde(default)]
    pub file_size_bytes: Option<u64>,

    /// Open file descriptors
    #[serde(default)]
    pub open_files: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.cpu_seconds.is_none()
            && self.address_space_bytes.is_none()
            && self.file_size_bytes.is_none()
            && self.open_files.is_none()
    }

    /// Registers the limits on `command` so they apply in the child only.
    #[cfg(unix)]
    pub(crate) fn install(&self, command: &mut Command) {
        use std::os::unix::process::CommandExt;

        if self.is_empty() {
            return;
        }
        let limits = *self;
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe,
        // and touches no memory shared with the parent.
        unsafe {
            command.pre_exec(move || limits.apply());
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn install(&self, _command: &mut Command) {}

    #[cfg(unix)]
    fn apply(&self) -> std::io::Result<()> {
        macro_rules! set_limit {
            ($resource:expr, $value:expr) => {
                if let Some(value) = $value {
                    let rlim = libc::rlimit {
                        rlim_cur: value as libc::rlim_t,
                        rlim_max: value as libc::rlim_t,
                    };
                    // SAFETY: rlim is a valid, initialised rlimit.
                    if unsafe { libc::setrlimit($resource, &rlim) } != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
            };
        }

        set_limit!(libc::RLIMIT_CPU, self.cpu_seconds);
        set_limit!(libc::RLIMIT_AS, self.address_space_bytes);
        set_limit!(libc::RLIMIT_FSIZE, self.file_size_bytes);
        set_limit!(libc::RLIMIT_NOFILE, self.open_files);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        assert!(ResourceLimits::default().is_empty());
        let limits = ResourceLimits {
            cpu_seconds: Some(60),
            ..Default::default()
        };
        assert!(!limits.is_empty());
    }

    #[test]
    fn test_deserialize_partial() {
        let limits: ResourceLimits = serde_json::from_str(r#"{"cpu_seconds": 30}"#).unwrap();
        assert_eq!(limits.cpu_seconds, Some(30));
        assert_eq!(limits.open_files, None);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_size_limit_applies_in_child() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("big");
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(format!(
            "trap '' XFSZ; head -c 65536 /dev/zero > {}",
            target.display()
        ));
        ResourceLimits {
            file_size_bytes: Some(1024),
            ..Default::default()
        }
        .install(&mut command);

        let status = command.status().unwrap();
        assert!(!status.success());
        assert!(std::fs::metadata(&target).unwrap().len() <= 1024);
    }
}
