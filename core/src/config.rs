use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Encoding variants the compiler can be configured with.
///
/// Both switches change the byte layout of compiled functions, so the format
/// a module was produced with has to travel with it (see the container header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BytecodeFormat {
    /// Prelude names are fixed 2-byte ids instead of varints.
    pub persistent_code: bool,
    /// Name lookups carry a trailing inline-cache byte.
    pub map_lookup_cache: bool,
}

impl Default for BytecodeFormat {
    fn default() -> Self {
        Self {
            persistent_code: true,
            map_lookup_cache: false,
        }
    }
}

impl BytecodeFormat {
    const PERSISTENT_CODE: u32 = 1 << 0;
    const MAP_LOOKUP_CACHE: u32 = 1 << 1;

    pub fn from_toml_str(src: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Doc {
            #[serde(default)]
            format: BytecodeFormat,
        }
        let doc: Doc = toml::from_str(src).context("invalid bytecode format config")?;
        Ok(doc.format)
    }

    pub fn load_toml(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&src)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        let mut bits = 0;
        if self.persistent_code {
            bits |= Self::PERSISTENT_CODE;
        }
        if self.map_lookup_cache {
            bits |= Self::MAP_LOOKUP_CACHE;
        }
        bits
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            persistent_code: bits & Self::PERSISTENT_CODE != 0,
            map_lookup_cache: bits & Self::MAP_LOOKUP_CACHE != 0,
        }
    }
}
