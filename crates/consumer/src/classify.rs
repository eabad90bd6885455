use std::path::Path;

/// Extensions the consumer will process.
#[derive(Debug, Clone)]
pub struct AllowList {
    extensions: Vec<String>,
}

impl AllowList {
    /// Entries carry their leading dot (`".txt"`).  Matching is exact and
    /// case-sensitive.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        match suffix(path) {
            Some(ext) => self.extensions.iter().any(|e| *e == ext),
            None => false,
        }
    }
}

/// The final component's extension with its dot, `".txt"` for `a.txt`.
/// Dot files and extensionless names have none.
pub fn suffix(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
}

/// Simulated processing cost of one event, in tier tokens.
pub const DEFAULT_PROCESSING_TOKEN: u64 = 1;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Coarse size bucket used to model processing cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeTier {
    /// Under 1 KiB.
    Kilobyte,
    /// 1 KiB up to 1 MiB.
    Megabyte,
    /// 1 MiB up to 1 GiB.
    Gigabyte,
    /// 1 GiB and larger.
    Terabyte,
}

impl SizeTier {
    pub fn for_size(bytes: u64) -> Self {
        match bytes {
            0..KIB => Self::Kilobyte,
            KIB..MIB => Self::Megabyte,
            MIB..GIB => Self::Gigabyte,
            _ => Self::Terabyte,
        }
    }

    pub fn token(self) -> u64 {
        match self {
            Self::Kilobyte => 2,
            Self::Megabyte => 3,
            Self::Gigabyte => 4,
            Self::Terabyte => 5,
        }
    }
}
