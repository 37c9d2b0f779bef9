use serde::{Deserialize, Serialize};
use std::fmt;

/// CPU architectures a sandbox binary and base image exist for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// Derive the architecture from a reported ABI string. Anything that is
    /// not x86_64 is treated as 64-bit ARM.
    pub fn from_abi(abi: &str) -> Self {
        if abi.contains("x86_64") {
            Arch::X86_64
        } else {
            Arch::Aarch64
        }
    }

    pub fn detect() -> Self {
        Self::from_abi(&device_abi(None))
    }

    /// Token used in release asset names and mirror URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// File name of the bundled copy of the sandbox binary.
    pub fn bundled_asset_name(&self) -> &'static str {
        match self {
            Arch::X86_64 => "proot-x86_64",
            Arch::Aarch64 => "proot-arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device's primary ABI string, e.g. `arm64-v8a` or `x86_64`.
pub fn device_abi(configured: Option<&str>) -> String {
    if let Some(abi) = configured {
        return abi.to_string();
    }
    match std::env::consts::ARCH {
        "x86_64" => "x86_64".to_string(),
        "aarch64" => "arm64-v8a".to_string(),
        "arm" => "armeabi-v7a".to_string(),
        "x86" => "x86".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_mapping() {
        assert_eq!(Arch::from_abi("x86_64"), Arch::X86_64);
        assert_eq!(Arch::from_abi("arm64-v8a"), Arch::Aarch64);
        assert_eq!(Arch::from_abi("armeabi-v7a"), Arch::Aarch64);
    }

    #[test]
    fn test_configured_abi_wins() {
        assert_eq!(device_abi(Some("x86_64")), "x86_64");
        assert_eq!(Arch::from_abi(&device_abi(Some("arm64-v8a"))), Arch::Aarch64);
    }

    #[test]
    fn test_asset_names() {
        assert_eq!(Arch::X86_64.bundled_asset_name(), "proot-x86_64");
        assert_eq!(Arch::Aarch64.bundled_asset_name(), "proot-arm64");
        assert_eq!(Arch::Aarch64.to_string(), "aarch64");
    }
}
