//! Device identifier resolution and candidate enumeration.

use std::fmt;
use std::path::PathBuf;

/// A concrete capture device the backend can open.
///
/// Ordering puts indexed devices (numerically) before opaque paths so scan
/// results are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceTarget {
    /// Platform device index (`/dev/videoN` node on Linux).
    Index(u32),
    /// Any other device path, e.g. a udev alias; passed through untouched.
    Path(PathBuf),
}

impl DeviceTarget {
    /// Resolve a configured identifier.
    ///
    /// Numeric strings map to an index, `/dev/videoN` extracts `N`, and
    /// anything else passes through as a path for the backend to judge.
    pub fn resolve(identifier: &str) -> Self {
        if let Ok(index) = identifier.parse::<u32>() {
            return Self::Index(index);
        }
        if let Some(rest) = identifier.strip_prefix("/dev/video") {
            if let Ok(index) = rest.parse::<u32>() {
                return Self::Index(index);
            }
        }
        Self::Path(PathBuf::from(identifier))
    }

    /// Canonical identifier used as the registry key. Indices use the
    /// device-node form so a configured `"0"` and `"/dev/video0"` collide
    /// as they should.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "/dev/video{index}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Enumerate capture-device candidates in deterministic order.
///
/// On POSIX this globs `/dev/video*`; elsewhere it probes indices 0-9 and
/// leaves the backend to reject the ones that do not exist.
pub fn scan_video_devices() -> Vec<DeviceTarget> {
    #[cfg(unix)]
    {
        let mut targets: Vec<DeviceTarget> = glob::glob("/dev/video*")
            .map(|paths| {
                paths
                    .flatten()
                    .map(|path| DeviceTarget::resolve(&path.to_string_lossy()))
                    .collect()
            })
            .unwrap_or_default();
        targets.sort();
        targets
    }

    #[cfg(not(unix))]
    {
        (0..10).map(DeviceTarget::Index).collect()
    }
}
