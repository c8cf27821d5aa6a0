//! bubblewrap command-line construction.

use std::path::{Path, PathBuf};

use crate::profile::SandboxProfile;

/// Unprivileged identity used inside the sandbox when none is configured.
pub const NOBODY: u32 = 65534;

/// Inputs to the wrapper command line.
#[derive(Debug, Clone)]
pub struct WrapSpec<'a> {
    pub profile: &'a SandboxProfile,
    pub binary: &'a Path,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub allow_read: &'a [PathBuf],
    pub allow_write: &'a [PathBuf],
    pub network: bool,
    pub uid: u32,
    pub gid: u32,
}

fn push_path(argv: &mut Vec<String>, flag: &str, path: &Path) {
    let p = path.display().to_string();
    argv.push(flag.to_string());
    argv.push(p.clone());
    argv.push(p);
}

/// Builds the argument vector for `bwrap` (without the `bwrap` binary itself).
///
/// Profile mounts use `--ro-bind-try` since not every host has every
/// library directory; the invocation's own paths use the strict forms so a
/// missing work directory fails setup instead of silently running without it.
pub fn wrap_args(spec: &WrapSpec<'_>) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "--unshare-all".to_string(),
        "--die-with-parent".to_string(),
        "--new-session".to_string(),
    ];
    if spec.network {
        argv.push("--share-net".to_string());
    }
    argv.extend([
        "--uid".to_string(),
        spec.uid.to_string(),
        "--gid".to_string(),
        spec.gid.to_string(),
        "--proc".to_string(),
        "/proc".to_string(),
        "--dev".to_string(),
        "/dev".to_string(),
        "--tmpfs".to_string(),
        "/tmp".to_string(),
    ]);

    for mount in spec.profile.mounts() {
        push_path(&mut argv, "--ro-bind-try", mount);
    }
    for path in spec.allow_read {
        push_path(&mut argv, "--ro-bind", path);
    }
    for path in spec.allow_write {
        push_path(&mut argv, "--bind", path);
    }

    argv.push("--chdir".to_string());
    argv.push(spec.cwd.display().to_string());
    argv.push("--".to_string());
    argv.push(spec.binary.display().to_string());
    argv.extend(spec.args.iter().cloned());
    argv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileSet;

    fn spec_for<'a>(
        profile: &'a SandboxProfile,
        args: &'a [String],
        read: &'a [PathBuf],
        write: &'a [PathBuf],
        network: bool,
    ) -> WrapSpec<'a> {
        WrapSpec {
            profile,
            binary: Path::new("/usr/local/texlive/2024/bin/x86_64-linux/pdflatex"),
            args,
            cwd: Path::new("/work/main"),
            allow_read: read,
            allow_write: write,
            network,
            uid: NOBODY,
            gid: NOBODY,
        }
    }

    #[test]
    fn test_wrap_args_layout() {
        let set = ProfileSet::default();
        let args = vec!["main.tex".to_string()];
        let write = vec![PathBuf::from("/work/main")];
        let argv = wrap_args(&spec_for(&set.toolchain, &args, &[], &write, false));

        assert_eq!(argv[0], "--unshare-all");
        assert!(!argv.contains(&"--share-net".to_string()));
        let sep = argv.iter().position(|a| a == "--").unwrap();
        assert_eq!(
            &argv[sep + 1..],
            &[
                "/usr/local/texlive/2024/bin/x86_64-linux/pdflatex".to_string(),
                "main.tex".to_string()
            ]
        );
        let chdir = argv.iter().position(|a| a == "--chdir").unwrap();
        assert_eq!(argv[chdir + 1], "/work/main");
        let bind = argv.iter().position(|a| a == "--bind").unwrap();
        assert_eq!(argv[bind + 1], "/work/main");
        assert_eq!(argv[bind + 2], "/work/main");
    }

    #[test]
    fn test_network_only_when_granted() {
        let set = ProfileSet::default();
        let argv = wrap_args(&spec_for(&set.postprocess, &[], &[], &[], true));
        assert!(argv.contains(&"--share-net".to_string()));
    }

    #[test]
    fn test_profile_mounts_are_try_binds() {
        let set = ProfileSet::default();
        let argv = wrap_args(&spec_for(&set.postprocess, &[], &[], &[], false));
        let fonts = argv.iter().position(|a| a == "/usr/share/fonts").unwrap();
        assert_eq!(argv[fonts - 1], "--ro-bind-try");
    }

    #[test]
    fn test_drops_to_unprivileged_ids() {
        let set = ProfileSet::default();
        let argv = wrap_args(&spec_for(&set.toolchain, &[], &[], &[], false));
        let uid = argv.iter().position(|a| a == "--uid").unwrap();
        assert_eq!(argv[uid + 1], "65534");
    }
}
