//! Static driver compatibility table.

use super::GpuModel;

/// Supported driver major-version window for one GPU model.
///
/// When a resolved driver's major version lies outside `[min_major,
/// max_major]` the driver is replaced by the newest release of the
/// `replacement` family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackRule {
    pub model: GpuModel,
    pub min_major: u32,
    pub max_major: u32,
    /// Driver family alias, e.g. `R470`.
    pub replacement: &'static str,
}

impl FallbackRule {
    pub fn allows(&self, major: u32) -> bool {
        (self.min_major..=self.max_major).contains(&major)
    }
}

pub const FALLBACK_RULES: &[FallbackRule] = &[
    // K80 support ends with the R470 branch.
    FallbackRule {
        model: GpuModel::K80,
        min_major: 0,
        max_major: 470,
        replacement: "R470",
    },
    FallbackRule {
        model: GpuModel::L4,
        min_major: 525,
        max_major: u32::MAX,
        replacement: "R525",
    },
    FallbackRule {
        model: GpuModel::H100,
        min_major: 525,
        max_major: u32::MAX,
        replacement: "R525",
    },
];

pub fn fallback_rule(model: GpuModel) -> Option<&'static FallbackRule> {
    FALLBACK_RULES.iter().find(|rule| rule.model == model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_are_inclusive() {
        let k80 = fallback_rule(GpuModel::K80).unwrap();
        assert!(k80.allows(0));
        assert!(k80.allows(470));
        assert!(!k80.allows(471));

        let h100 = fallback_rule(GpuModel::H100).unwrap();
        assert!(!h100.allows(524));
        assert!(h100.allows(525));
        assert!(h100.allows(u32::MAX));
    }

    #[test]
    fn test_unlisted_models_have_no_rule() {
        assert!(fallback_rule(GpuModel::T4).is_none());
        assert!(fallback_rule(GpuModel::Other).is_none());
    }
}
