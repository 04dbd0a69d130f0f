//! Startup configuration
//!
//! Resolves the `ProbeConfig` written into the eBPF object: socket field
//! offsets (defaults plus an optional JSON override file) and the feature
//! bits of the running kernel.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use probe_common::{
    config::{KernelFeatures, ProbeConfig, SockOffsets},
    constants::OFFSET_UNKNOWN,
};
use serde::Deserialize;
use std::path::Path;

/// Where the running kernel reports its release string
pub const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Kernel version as reported by `uname -r`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelRelease {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelRelease {
    /// Parse a release string such as `5.15.0-91-generic` or `6.1.55+`
    pub fn parse(release: &str) -> Result<Self> {
        let release = release.trim();
        let numeric: Vec<u32> = release
            .split(|c: char| !c.is_ascii_digit())
            .take(3)
            .map_while(|part| part.parse().ok())
            .collect();

        match numeric.as_slice() {
            [major, minor, rest @ ..] => Ok(Self {
                major: *major,
                minor: *minor,
                patch: rest.first().copied().unwrap_or(0),
            }),
            _ => bail!("Unrecognised kernel release: {:?}", release),
        }
    }

    /// Read the release of the running kernel
    pub fn detect() -> Result<Self> {
        let release = std::fs::read_to_string(OSRELEASE_PATH)
            .with_context(|| format!("Failed to read {}", OSRELEASE_PATH))?;
        Self::parse(&release)
    }

    pub fn features(&self) -> KernelFeatures {
        KernelFeatures::for_version(self.major, self.minor)
    }
}

impl std::fmt::Display for KernelRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Offsets file contents; every field is optional and overrides the default
///
/// ```json
/// { "sk_protocol": 513, "srtt_us": 1656, "mdev_us": 1660, "ns_inum": 184 }
/// ```
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OffsetsFile {
    pub skc_daddr: Option<u16>,
    pub skc_rcv_saddr: Option<u16>,
    pub skc_dport: Option<u16>,
    pub skc_num: Option<u16>,
    pub skc_family: Option<u16>,
    pub skc_state: Option<u16>,
    pub skc_net: Option<u16>,
    pub skc_v6_daddr: Option<u16>,
    pub skc_v6_rcv_saddr: Option<u16>,
    pub sk_protocol: Option<u16>,
    pub srtt_us: Option<u16>,
    pub mdev_us: Option<u16>,
    pub ns_inum: Option<u16>,
}

impl OffsetsFile {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid offsets file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read offsets file: {:?}", path))?;
        Self::from_json(&json).with_context(|| format!("While parsing {:?}", path))
    }

    /// Overlay the fields present in the file onto `base`
    pub fn apply(&self, base: SockOffsets) -> SockOffsets {
        SockOffsets {
            skc_daddr: self.skc_daddr.unwrap_or(base.skc_daddr),
            skc_rcv_saddr: self.skc_rcv_saddr.unwrap_or(base.skc_rcv_saddr),
            skc_dport: self.skc_dport.unwrap_or(base.skc_dport),
            skc_num: self.skc_num.unwrap_or(base.skc_num),
            skc_family: self.skc_family.unwrap_or(base.skc_family),
            skc_state: self.skc_state.unwrap_or(base.skc_state),
            skc_net: self.skc_net.unwrap_or(base.skc_net),
            skc_v6_daddr: self.skc_v6_daddr.unwrap_or(base.skc_v6_daddr),
            skc_v6_rcv_saddr: self.skc_v6_rcv_saddr.unwrap_or(base.skc_v6_rcv_saddr),
            sk_protocol: self.sk_protocol.unwrap_or(base.sk_protocol),
            srtt_us: self.srtt_us.unwrap_or(base.srtt_us),
            mdev_us: self.mdev_us.unwrap_or(base.mdev_us),
            ns_inum: self.ns_inum.unwrap_or(base.ns_inum),
            _padding: 0,
        }
    }
}

/// Names of offsets still unset, for a startup warning
pub fn missing_offsets(offsets: &SockOffsets) -> Vec<&'static str> {
    [
        ("sk_protocol", offsets.sk_protocol),
        ("srtt_us", offsets.srtt_us),
        ("mdev_us", offsets.mdev_us),
        ("ns_inum", offsets.ns_inum),
    ]
    .into_iter()
    .filter(|(_, offset)| *offset == OFFSET_UNKNOWN)
    .map(|(name, _)| name)
    .collect()
}

/// Build the configuration pushed into the eBPF object
///
/// # Arguments
///
/// * `offsets_path` - Optional JSON offsets file
/// * `kernel_release` - Release string overriding the running kernel's
pub fn resolve_probe_config(
    offsets_path: Option<&Path>,
    kernel_release: Option<&str>,
) -> Result<ProbeConfig> {
    let release = match kernel_release {
        Some(release) => KernelRelease::parse(release)?,
        None => KernelRelease::detect()?,
    };
    let features = release.features();
    info!(
        "Kernel {}: retransmit segment arg = {}, sk_protocol bitfield = {}",
        release,
        features.retransmit_segs_arg(),
        features.sk_protocol_bitfield()
    );

    let offsets = match offsets_path {
        Some(path) => {
            info!("Loading socket offsets from {:?}", path);
            OffsetsFile::load(path)?.apply(SockOffsets::DEFAULT)
        }
        None => SockOffsets::DEFAULT,
    };

    let missing = missing_offsets(&offsets);
    if !missing.is_empty() {
        warn!(
            "Offsets not configured, these fields will read as zero: {}",
            missing.join(", ")
        );
    }

    Ok(ProbeConfig { offsets, features })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        let release = KernelRelease::parse("5.15.0-91-generic\n").unwrap();
        assert_eq!(release, KernelRelease { major: 5, minor: 15, patch: 0 });

        let release = KernelRelease::parse("6.1.55+").unwrap();
        assert_eq!(release, KernelRelease { major: 6, minor: 1, patch: 55 });

        let release = KernelRelease::parse("4.19").unwrap();
        assert_eq!(release.patch, 0);
    }

    #[test]
    fn test_parse_release_rejects_garbage() {
        assert!(KernelRelease::parse("").is_err());
        assert!(KernelRelease::parse("linux").is_err());
        assert!(KernelRelease::parse("5").is_err());
    }

    #[test]
    fn test_release_features() {
        let old = KernelRelease::parse("4.4.0").unwrap().features();
        assert!(!old.retransmit_segs_arg());
        assert!(old.sk_protocol_bitfield());

        let new = KernelRelease::parse("5.10.0").unwrap().features();
        assert!(new.retransmit_segs_arg());
        assert!(new.sk_protocol_bitfield());

        let newest = KernelRelease::parse("6.8.0").unwrap().features();
        assert!(newest.retransmit_segs_arg());
        assert!(!newest.sk_protocol_bitfield());
    }

    #[test]
    fn test_offsets_overlay() {
        let file = OffsetsFile::from_json(r#"{ "srtt_us": 1656, "skc_net": 40 }"#).unwrap();
        let offsets = file.apply(SockOffsets::DEFAULT);

        assert_eq!(offsets.srtt_us, 1656);
        assert_eq!(offsets.skc_net, 40);
        assert_eq!(offsets.skc_family, SockOffsets::DEFAULT.skc_family);
        assert_eq!(offsets.mdev_us, OFFSET_UNKNOWN);
        assert_eq!(missing_offsets(&offsets), vec!["sk_protocol", "mdev_us", "ns_inum"]);
    }

    #[test]
    fn test_offsets_file_rejects_unknown_fields() {
        assert!(OffsetsFile::from_json(r#"{ "srtt": 1 }"#).is_err());
        assert!(OffsetsFile::from_json(r#"{ "srtt_us": 70000 }"#).is_err());
    }

    #[test]
    fn test_resolve_with_override() {
        let config = resolve_probe_config(None, Some("5.4.0")).unwrap();
        assert_eq!(config.offsets, SockOffsets::DEFAULT);
        assert_eq!(config.features, KernelFeatures::for_version(5, 4));
    }
}
