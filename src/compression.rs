//! Compression levels for backup archives
//!
//! The `compression_level` setting picks one of four levels, mapped onto the
//! zip container's store and deflate methods:
//!
//! | setting | level | zip method |
//! |---|---|---|
//! | 0 | `None` | Stored |
//! | 1 | `Fast` | Deflated, strength 1 |
//! | 2 | `Normal` | Deflated, strength 6 |
//! | 3 | `Maximum` | Deflated, strength 9 |
//!
//! ## Examples
//!
//! ```rust
//! use backupper::compression::CompressionLevel;
//!
//! let level = CompressionLevel::from_index(3).unwrap();
//! assert_eq!(level, CompressionLevel::Maximum);
//! assert_eq!(level.to_string(), "maximum");
//! ```

use std::fmt;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

/// Entries at least this large need the zip64 extension
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Compression level applied to every archive entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionLevel {
    /// Store entries uncompressed
    None,
    /// Fastest deflate
    Fast,
    /// Balanced deflate (default)
    #[default]
    Normal,
    /// Strongest deflate
    Maximum,
}

impl CompressionLevel {
    /// Map the numeric setting value (0-3) to a level
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(CompressionLevel::None),
            1 => Some(CompressionLevel::Fast),
            2 => Some(CompressionLevel::Normal),
            3 => Some(CompressionLevel::Maximum),
            _ => None,
        }
    }

    /// Numeric setting value
    pub fn index(self) -> i64 {
        match self {
            CompressionLevel::None => 0,
            CompressionLevel::Fast => 1,
            CompressionLevel::Normal => 2,
            CompressionLevel::Maximum => 3,
        }
    }

    /// Zip method used for this level
    pub fn method(self) -> CompressionMethod {
        match self {
            CompressionLevel::None => CompressionMethod::Stored,
            _ => CompressionMethod::Deflated,
        }
    }

    /// Entry options for a file of `size` bytes
    pub fn file_options(self, size: u64) -> SimpleFileOptions {
        let options = SimpleFileOptions::default()
            .compression_method(self.method())
            .unix_permissions(0o644)
            .large_file(size >= ZIP64_THRESHOLD);

        match self {
            CompressionLevel::None => options,
            CompressionLevel::Fast => options.compression_level(Some(1)),
            CompressionLevel::Normal => options.compression_level(Some(6)),
            CompressionLevel::Maximum => options.compression_level(Some(9)),
        }
    }

    /// Options for the manifest entry
    pub fn manifest_options(self) -> SimpleFileOptions {
        self.file_options(0)
    }
}

impl fmt::Display for CompressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionLevel::None => "none",
            CompressionLevel::Fast => "fast",
            CompressionLevel::Normal => "normal",
            CompressionLevel::Maximum => "maximum",
        };
        f.write_str(name)
    }
}
