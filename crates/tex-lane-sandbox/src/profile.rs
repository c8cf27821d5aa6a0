//! Allow-list profiles, selected by the installation root of the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::SandboxError;

/// Which allow-list a binary runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Binaries shipped inside the TeX distribution
    Toolchain,
    /// General utilities such as ps2pdf and PDF combiners
    PostProcess,
}

/// One allow-list profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxProfile {
    pub kind: ProfileKind,

    /// Installation roots that select this profile
    pub prefixes: Vec<PathBuf>,

    /// Directories mounted read-only besides the prefixes and the invocation's own allow-list
    #[serde(default)]
    pub read_only: Vec<PathBuf>,
}

/// Shared libraries every dynamically linked binary needs.
const SYSTEM_LIBS: &[&str] = &[
    "/lib",
    "/lib64",
    "/usr/lib",
    "/usr/lib64",
    "/etc/ld.so.cache",
];

/// Font and color-profile data used by ghostscript and friends.
const POSTPROCESS_DATA: &[&str] = &[
    "/usr/share/fonts",
    "/usr/share/ghostscript",
    "/usr/share/color",
    "/usr/share/poppler",
    "/etc/fonts",
    "/etc/ghostscript",
    "/var/cache/fontconfig",
];

fn paths(items: &[&str]) -> Vec<PathBuf> {
    items.iter().map(PathBuf::from).collect()
}

impl SandboxProfile {
    /// Narrow profile: the TeX tree plus shared libraries.
    pub fn toolchain(prefixes: Vec<PathBuf>) -> Self {
        Self {
            kind: ProfileKind::Toolchain,
            prefixes,
            read_only: paths(SYSTEM_LIBS),
        }
    }

    /// Wide profile: shared libraries plus font and color data.
    pub fn postprocess(prefixes: Vec<PathBuf>) -> Self {
        let mut read_only = paths(SYSTEM_LIBS);
        read_only.extend(paths(POSTPROCESS_DATA));
        Self {
            kind: ProfileKind::PostProcess,
            prefixes,
            read_only,
        }
    }

    /// True when `binary` lives under one of this profile's prefixes.
    pub fn contains(&self, binary: &Path) -> bool {
        self.prefixes.iter().any(|prefix| binary.starts_with(prefix))
    }

    /// Everything mounted read-only for this profile.
    pub fn mounts(&self) -> impl Iterator<Item = &PathBuf> {
        self.prefixes.iter().chain(self.read_only.iter())
    }
}

/// The two profiles, checked toolchain first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSet {
    pub toolchain: SandboxProfile,
    pub postprocess: SandboxProfile,
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self {
            toolchain: SandboxProfile::toolchain(paths(&[
                "/usr/local/texlive",
                "/opt/texlive",
                "/usr/share/texlive",
            ])),
            postprocess: SandboxProfile::postprocess(paths(&["/usr/bin", "/bin", "/usr/local/bin"])),
        }
    }
}

impl ProfileSet {
    /// Picks the profile for a resolved binary.
    ///
    /// Every candidate path (typically the `PATH` hit and its canonical
    /// target) is tried against the toolchain profile before the
    /// post-processing profile.
    pub fn select(&self, candidates: &[PathBuf]) -> Result<&SandboxProfile, SandboxError> {
        for profile in [&self.toolchain, &self.postprocess] {
            if candidates.iter().any(|c| profile.contains(c)) {
                return Ok(profile);
            }
        }
        Err(SandboxError::UnknownBinaryLocation {
            binary: candidates
                .first()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        })
    }

    pub fn get(&self, kind: ProfileKind) -> &SandboxProfile {
        match kind {
            ProfileKind::Toolchain => &self.toolchain,
            ProfileKind::PostProcess => &self.postprocess,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_toolchain() {
        let set = ProfileSet::default();
        let bin = PathBuf::from("/usr/local/texlive/2024/bin/x86_64-linux/pdflatex");
        assert_eq!(set.select(&[bin]).unwrap().kind, ProfileKind::Toolchain);
    }

    #[test]
    fn test_select_postprocess() {
        let set = ProfileSet::default();
        let bin = PathBuf::from("/usr/bin/ps2pdf");
        assert_eq!(set.select(&[bin]).unwrap().kind, ProfileKind::PostProcess);
    }

    #[test]
    fn test_canonical_target_can_select_toolchain() {
        let set = ProfileSet::default();
        let candidates = vec![
            PathBuf::from("/usr/bin/pdflatex"),
            PathBuf::from("/usr/share/texlive/bin/pdftex"),
        ];
        assert_eq!(set.select(&candidates).unwrap().kind, ProfileKind::Toolchain);
    }

    #[test]
    fn test_unknown_location() {
        let set = ProfileSet::default();
        let err = set.select(&[PathBuf::from("/home/user/evil")]).unwrap_err();
        assert!(matches!(err, SandboxError::UnknownBinaryLocation { ref binary } if binary == "/home/user/evil"));
    }

    #[test]
    fn test_prefix_is_component_wise() {
        let set = ProfileSet::default();
        // "/usr/binx" must not match the "/usr/bin" prefix.
        assert!(set.select(&[PathBuf::from("/usr/binx/tool")]).is_err());
    }

    #[test]
    fn test_postprocess_is_wider() {
        let set = ProfileSet::default();
        assert!(set.postprocess.read_only.len() > set.toolchain.read_only.len());
        assert!(set
            .postprocess
            .mounts()
            .any(|p| p == Path::new("/usr/share/fonts")));
        assert!(!set.toolchain.mounts().any(|p| p == Path::new("/usr/share/fonts")));
    }
}
