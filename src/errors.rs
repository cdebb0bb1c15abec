//! Distinguished error conditions.
//!
//! Most failures are plain `anyhow` errors with context attached. The few the
//! pipeline has to branch on are variants of [`InstallError`]; they are carried
//! inside `anyhow::Error` and recovered by walking the cause chain.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum InstallError {
    /// A GPU kernel module (or its signing key) could not be loaded.
    ///
    /// This is the only condition that triggers the legacy link retry.
    #[error("failed to load GPU driver module {module}")]
    DriverLoad {
        module: String,
        #[source]
        source: BoxError,
    },

    /// The requested artifact does not exist at the download location.
    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    /// Invalid flag combination or unsupported host, detected before any side effect.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl InstallError {
    pub fn driver_load(module: impl Into<String>, source: anyhow::Error) -> Self {
        Self::DriverLoad {
            module: module.into(),
            source: source.into(),
        }
    }
}

fn find(err: &anyhow::Error) -> impl Iterator<Item = &InstallError> {
    err.chain().filter_map(|cause| cause.downcast_ref::<InstallError>())
}

/// Whether `err` was caused by a module load failure.
pub fn is_driver_load(err: &anyhow::Error) -> bool {
    find(err).any(|e| matches!(e, InstallError::DriverLoad { .. }))
}

/// Whether `err` was caused by a missing artifact.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    find(err).any(|e| matches!(e, InstallError::ArtifactNotFound(_)))
}

/// Whether `err` is a rejected flag combination or unsupported host.
pub fn is_config(err: &anyhow::Error) -> bool {
    find(err).any(|e| matches!(e, InstallError::Config(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_driver_load_survives_context() {
        let err: anyhow::Result<()> = Err(InstallError::driver_load(
            "nvidia",
            anyhow::anyhow!("insmod failed"),
        )
        .into());
        let err = err.context("loading GPU drivers").unwrap_err();
        assert!(is_driver_load(&err));
        assert!(!is_not_found(&err));
    }

    #[test]
    fn test_not_found_detected() {
        let err = anyhow::Error::new(InstallError::ArtifactNotFound("x".into()))
            .context("downloading signature");
        assert!(is_not_found(&err));
        assert!(!is_driver_load(&err));
    }

    #[test]
    fn test_plain_error_is_neither() {
        let err = anyhow::anyhow!("mount failed");
        assert!(!is_driver_load(&err));
        assert!(!is_not_found(&err));
        assert!(!is_config(&err));
    }

    #[test]
    fn test_config_detected() {
        let err = anyhow::Error::new(InstallError::Config("bad flags".into()));
        assert!(is_config(&err));
    }
}
