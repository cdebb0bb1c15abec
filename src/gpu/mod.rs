//! GPU model detection and driver version policy.

mod fallback;
pub mod version;

pub use fallback::{fallback_rule, FallbackRule, FALLBACK_RULES};

use crate::process::{Cmd, ProcessRunner};
use anyhow::Result;
use std::fmt;
use tracing::{debug, info};

/// Vendor name as it appears in PCI listings.
const VENDOR: &str = "nvidia";

/// Accelerator model attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuModel {
    K80,
    P4,
    P100,
    V100,
    T4,
    A100,
    L4,
    H100,
    /// A vendor device that matched no known model.
    Other,
    /// No vendor device at all.
    None,
}

impl GpuModel {
    /// Known models, matched by token against the device description.
    const KNOWN: [GpuModel; 8] = [
        GpuModel::K80,
        GpuModel::P4,
        GpuModel::P100,
        GpuModel::V100,
        GpuModel::T4,
        GpuModel::A100,
        GpuModel::L4,
        GpuModel::H100,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GpuModel::K80 => "K80",
            GpuModel::P4 => "P4",
            GpuModel::P100 => "P100",
            GpuModel::V100 => "V100",
            GpuModel::T4 => "T4",
            GpuModel::A100 => "A100",
            GpuModel::L4 => "L4",
            GpuModel::H100 => "H100",
            GpuModel::Other => "Other",
            GpuModel::None => "None",
        }
    }

    /// Turing and newer can run the open kernel module flavour.
    pub fn supports_open_kernel_modules(&self) -> bool {
        matches!(
            self,
            GpuModel::T4 | GpuModel::A100 | GpuModel::L4 | GpuModel::H100
        )
    }

    pub fn is_present(&self) -> bool {
        *self != GpuModel::None
    }

    /// Classify a PCI device listing (`lspci` output).
    ///
    /// Only lines naming the vendor are considered. The first line that
    /// contains a known model token wins; vendor lines with no known token
    /// yield [`GpuModel::Other`].
    pub fn from_pci_listing(listing: &str) -> GpuModel {
        let mut found_vendor = false;
        for line in listing.lines() {
            if !line.to_ascii_lowercase().contains(VENDOR) {
                continue;
            }
            found_vendor = true;
            let tokens: Vec<&str> = line
                .split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|t| !t.is_empty())
                .collect();
            if let Some(model) = GpuModel::KNOWN
                .iter()
                .find(|m| tokens.iter().any(|t| t.eq_ignore_ascii_case(m.as_str())))
            {
                return *model;
            }
        }
        if found_vendor {
            GpuModel::Other
        } else {
            GpuModel::None
        }
    }
}

impl fmt::Display for GpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run `lspci` and classify the attached accelerator.
pub fn detect(runner: &dyn ProcessRunner) -> Result<GpuModel> {
    let listing = Cmd::new("lspci")
        .error_msg("lspci failed. Install: pciutils")
        .run(runner)?;
    let model = GpuModel::from_pci_listing(&listing.stdout);
    debug!("PCI listing:\n{}", listing.stdout);
    info!("Detected GPU model: {}", model);
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeRunner;
    use crate::process::CmdResult;

    const T4_LISTING: &str = "\
00:00.0 Host bridge: Intel Corporation 440FX - 82441FX PMC [Natoma] (rev 02)
00:04.0 3D controller: NVIDIA Corporation TU104GL [Tesla T4] (rev a1)
";

    #[test]
    fn test_detects_known_models() {
        let cases = [
            ("3D controller: NVIDIA Corporation GK210GL [Tesla K80] (rev a1)", GpuModel::K80),
            ("3D controller: NVIDIA Corporation GP104GL [Tesla P4] (rev a1)", GpuModel::P4),
            ("3D controller: NVIDIA Corporation GP100GL [Tesla P100 PCIe 16GB] (rev a1)", GpuModel::P100),
            ("3D controller: NVIDIA Corporation GV100GL [Tesla V100 SXM2 16GB] (rev a1)", GpuModel::V100),
            ("3D controller: NVIDIA Corporation GA100 [A100 SXM4 40GB] (rev a1)", GpuModel::A100),
            ("3D controller: NVIDIA Corporation AD104GL [L4] (rev a1)", GpuModel::L4),
            ("3D controller: NVIDIA Corporation GH100 [H100 PCIe] (rev a1)", GpuModel::H100),
        ];
        for (line, expected) in cases {
            assert_eq!(GpuModel::from_pci_listing(line), expected, "{}", line);
        }
        assert_eq!(GpuModel::from_pci_listing(T4_LISTING), GpuModel::T4);
    }

    #[test]
    fn test_model_tokens_must_match_whole() {
        // "P40" must not be read as P4, and "T4" in a non-vendor line is ignored.
        let listing = "\
00:03.0 Ethernet controller: Red Hat, Inc. Virtio T4 network device
00:04.0 3D controller: NVIDIA Corporation GP102GL [Tesla P40] (rev a1)
";
        assert_eq!(GpuModel::from_pci_listing(listing), GpuModel::Other);
    }

    #[test]
    fn test_no_vendor_device() {
        let listing = "00:00.0 Host bridge: Intel Corporation 440FX (rev 02)\n";
        assert_eq!(GpuModel::from_pci_listing(listing), GpuModel::None);
        assert_eq!(GpuModel::from_pci_listing(""), GpuModel::None);
        assert!(!GpuModel::None.is_present());
    }

    #[test]
    fn test_open_kernel_module_support() {
        assert!(GpuModel::T4.supports_open_kernel_modules());
        assert!(GpuModel::H100.supports_open_kernel_modules());
        assert!(!GpuModel::K80.supports_open_kernel_modules());
        assert!(!GpuModel::V100.supports_open_kernel_modules());
        assert!(!GpuModel::Other.supports_open_kernel_modules());
        assert!(!GpuModel::None.supports_open_kernel_modules());
    }

    #[test]
    fn test_detect_runs_lspci() -> Result<()> {
        let runner = FakeRunner::with_handler(|_| CmdResult::ok(T4_LISTING));
        assert_eq!(detect(&runner)?, GpuModel::T4);
        assert_eq!(runner.calls(), vec!["lspci"]);
        Ok(())
    }
}
