//! Kernel module signatures.
//!
//! Modules are signed ahead of time; the installer only receives detached
//! PKCS#7 signatures and appends them in the trailer format the kernel
//! verifies at load time:
//!
//! ```text
//! [module][PKCS#7 signature][12-byte descriptor]["~Module signature appended~\n"]
//! ```
//!
//! Descriptor byte 2 is the key id type (`PKEY_ID_PKCS7`), bytes 8..12 the
//! big-endian signature length. All other descriptor bytes are zero.

mod workspace;

pub use workspace::{sign_modules, SigningWorkspace};

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const PKEY_ID_PKCS7: u8 = 2;
pub const MAGIC: &[u8] = b"~Module signature appended~\n";

fn descriptor(sig_len: u32) -> [u8; 12] {
    let mut desc = [0u8; 12];
    desc[2] = PKEY_ID_PKCS7;
    desc[8..12].copy_from_slice(&sig_len.to_be_bytes());
    desc
}

/// Write `module` followed by the signature trailer to `out`.
///
/// The result is staged in a temp file next to `out` and renamed over it,
/// so `out` may be `module` itself and a failure leaves `out` untouched.
pub fn append_signature(out: &Path, module: &Path, signature: &Path) -> Result<()> {
    let dir = match out.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;

    let mut module_file = File::open(module)
        .with_context(|| format!("Failed to open {}", module.display()))?;
    io::copy(&mut module_file, &mut tmp)
        .with_context(|| format!("Failed to copy {}", module.display()))?;

    let mut sig_file = File::open(signature)
        .with_context(|| format!("Failed to open {}", signature.display()))?;
    let sig_len = io::copy(&mut sig_file, &mut tmp)
        .with_context(|| format!("Failed to copy {}", signature.display()))?;
    let sig_len = u32::try_from(sig_len)
        .with_context(|| format!("Signature {} is too large", signature.display()))?;

    tmp.write_all(&descriptor(sig_len))
        .with_context(|| format!("Failed to write signature descriptor for {}", out.display()))?;
    tmp.write_all(MAGIC)
        .with_context(|| format!("Failed to write signature marker for {}", out.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync signed module for {}", out.display()))?;

    tmp.persist(out)
        .with_context(|| format!("Failed to move signed module to {}", out.display()))?;
    Ok(())
}

/// Whether `module` already ends with a signature trailer.
pub fn is_signed(module: &Path) -> Result<bool> {
    let mut file = File::open(module)
        .with_context(|| format!("Failed to open {}", module.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", module.display()))?
        .len();
    let magic_len = MAGIC.len() as u64;
    if len < magic_len {
        return Ok(false);
    }
    let mut tail = vec![0u8; MAGIC.len()];
    file.seek(SeekFrom::Start(len - magic_len))
        .and_then(|_| file.read_exact(&mut tail))
        .with_context(|| format!("Failed to read {}", module.display()))?;
    Ok(tail == MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02X}", b)).collect()
    }

    #[test]
    fn test_trailer_is_bit_exact() -> Result<()> {
        let tmp = TempDir::new()?;
        let module = tmp.path().join("module");
        let sig = tmp.path().join("sig");
        let out = tmp.path().join("out");
        fs::write(&module, "module")?;
        fs::write(&sig, "signature")?;

        append_signature(&out, &module, &sig)?;

        let signed = fs::read(&out)?;
        let expected = format!(
            "{}{}{}{}",
            "6D6F64756C65",
            "7369676E6174757265",
            "000002000000000000000009",
            hex(b"~Module signature appended~\n")
        );
        assert_eq!(hex(&signed), expected);
        assert_eq!(MAGIC.len(), 28);
        Ok(())
    }

    #[test]
    fn test_sign_in_place() -> Result<()> {
        let tmp = TempDir::new()?;
        let module = tmp.path().join("nvidia.ko");
        let sig = tmp.path().join("nvidia.ko.sig");
        fs::write(&module, b"\x7fELF")?;
        fs::write(&sig, vec![0xAB; 300])?;

        append_signature(&module, &module, &sig)?;

        let signed = fs::read(&module)?;
        assert_eq!(signed.len(), 4 + 300 + 12 + 28);
        assert!(signed.starts_with(b"\x7fELF"));
        assert!(signed.ends_with(MAGIC));
        let desc = &signed[4 + 300..4 + 300 + 12];
        assert_eq!(&desc[8..12], &300u32.to_be_bytes());
        // No temp files left behind.
        assert_eq!(fs::read_dir(tmp.path())?.count(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_signature_leaves_output_untouched() -> Result<()> {
        let tmp = TempDir::new()?;
        let module = tmp.path().join("nvidia.ko");
        fs::write(&module, b"original")?;

        let err = append_signature(&module, &module, &tmp.path().join("absent.sig")).unwrap_err();
        assert!(err.to_string().contains("absent.sig"));
        assert_eq!(fs::read(&module)?, b"original");
        assert_eq!(fs::read_dir(tmp.path())?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_is_signed() -> Result<()> {
        let tmp = TempDir::new()?;
        let module = tmp.path().join("nvidia.ko");
        let sig = tmp.path().join("nvidia.ko.sig");
        fs::write(&module, b"\x7fELF")?;
        fs::write(&sig, b"sig")?;
        assert!(!is_signed(&module)?);
        append_signature(&module, &module, &sig)?;
        assert!(is_signed(&module)?);
        Ok(())
    }
}
