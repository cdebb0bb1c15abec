//! Installs GPU kernel drivers on container-optimized Linux hosts.
//!
//! The host root filesystem is read-only and ships no compiler, so an install
//! downloads a cross toolchain and the vendor installer, turns the vendor's
//! precompiled objects into kernel modules, signs them with detached
//! signatures, and loads them. Everything written lands in a host-persisted
//! directory overlaid onto the system paths.
//!
//! # Architecture
//!
//! ```text
//! installer (pipeline, legacy retry)
//!     │
//!     ├── gpu        detection, version resolution, fallback table
//!     ├── download   ArtifactDownloader trait, GCS implementation
//!     ├── cache      install record in the host dir
//!     ├── toolchain  cross toolchain, kernel headers, build env
//!     ├── layout     bind/overlay mounts, ld caches
//!     ├── linker     modern (ld.lld) and legacy (vendor installer) linking
//!     ├── signing    detached signature append
//!     └── modules    keyring and insmod
//! ```
//!
//! Side effects go through three seams so the pipeline runs under test:
//! [`process::ProcessRunner`], [`layout::Mounter`] and
//! [`download::ArtifactDownloader`].

pub mod archive;
pub mod cache;
pub mod download;
pub mod errors;
pub mod gpu;
pub mod host;
pub mod installer;
pub mod layout;
pub mod linker;
pub mod list;
pub mod lock;
pub mod logging;
pub mod modules;
pub mod paths;
pub mod preflight;
pub mod process;
pub mod signing;
pub mod toolchain;

pub use errors::InstallError;
pub use installer::{InstallOptions, InstallOutcome, Installer};
pub use paths::InstallPaths;
