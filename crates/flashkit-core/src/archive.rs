//! Archive sniffing and extraction.
//!
//! The kind is decided from file content, never from the extension:
//! ZIP signature first, then the tar family.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::{debug, info};

use crate::error::{FlashError, Result};

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";
const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveKind::Zip => write!(f, "zip"),
            ArchiveKind::TarGz => write!(f, "tar.gz"),
            ArchiveKind::Tar => write!(f, "tar"),
        }
    }
}

/// Classify the leading bytes of a file.
pub fn sniff_bytes(head: &[u8]) -> Option<ArchiveKind> {
    if head.starts_with(ZIP_LOCAL_HEADER) || head.starts_with(ZIP_EMPTY_ARCHIVE) {
        return Some(ArchiveKind::Zip);
    }
    if head.starts_with(GZIP_MAGIC) {
        return Some(ArchiveKind::TarGz);
    }
    if head.len() >= USTAR_OFFSET + USTAR_MAGIC.len()
        && &head[USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()] == USTAR_MAGIC
    {
        return Some(ArchiveKind::Tar);
    }
    None
}

pub fn sniff(path: &Path) -> Result<Option<ArchiveKind>> {
    let mut file = File::open(path)?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.by_ref().take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok(sniff_bytes(&head))
}

/// Extract `archive` into `dest`, creating it if needed.
///
/// Unrecognized or corrupt archives fail with [`FlashError::ExtractionFailed`].
pub fn extract(archive: &Path, dest: &Path) -> Result<ArchiveKind> {
    let kind = sniff(archive)?.ok_or_else(|| {
        FlashError::ExtractionFailed(format!(
            "{}: not a zip or tar archive",
            archive.display()
        ))
    })?;
    std::fs::create_dir_all(dest)?;
    info!(archive = %archive.display(), kind = %kind, dest = %dest.display(), "Extracting");

    let corrupt = |e: &dyn fmt::Display| {
        FlashError::ExtractionFailed(format!("{} ({}): {}", archive.display(), kind, e))
    };

    match kind {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(|e| corrupt(&e))?;
            debug!(entries = zip.len(), "Zip opened");
            zip.extract(dest).map_err(|e| corrupt(&e))?;
        }
        ArchiveKind::TarGz => {
            let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
            tar.unpack(dest).map_err(|e| corrupt(&e))?;
        }
        ArchiveKind::Tar => {
            let mut tar = tar::Archive::new(File::open(archive)?);
            tar.unpack(dest).map_err(|e| corrupt(&e))?;
        }
    }
    Ok(kind)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_sniff_bytes() {
        assert_eq!(sniff_bytes(b"PK\x03\x04rest"), Some(ArchiveKind::Zip));
        assert_eq!(sniff_bytes(&[0x1f, 0x8b, 0x08, 0x00]), Some(ArchiveKind::TarGz));

        let mut tar_head = vec![0u8; 512];
        tar_head[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniff_bytes(&tar_head), Some(ArchiveKind::Tar));

        assert_eq!(sniff_bytes(b"ANDROID!"), None);
        assert_eq!(sniff_bytes(&[]), None);
    }

    #[test]
    fn test_extract_zip_ignores_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("firmware.bin");
        write_zip(&archive, &[("images/boot.img", b"boot"), ("readme.txt", b"hi")]);

        let out = dir.path().join("out");
        assert_eq!(extract(&archive, &out).unwrap(), ArchiveKind::Zip);
        assert_eq!(std::fs::read(out.join("images/boot.img")).unwrap(), b"boot");
    }

    #[test]
    fn test_extract_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fw.tgz");
        write_tar_gz(&archive, &[("system.img", b"sys"), ("sub/vendor.img", b"ven")]);

        let out = dir.path().join("out");
        assert_eq!(extract(&archive, &out).unwrap(), ArchiveKind::TarGz);
        assert_eq!(std::fs::read(out.join("sub/vendor.img")).unwrap(), b"ven");
    }

    #[test]
    fn test_unknown_format_is_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fw.zip");
        std::fs::write(&archive, b"<html>mirror error page</html>").unwrap();
        let err = extract(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, FlashError::ExtractionFailed(_)));
    }

    #[test]
    fn test_corrupt_gzip_is_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fw.tar.gz");
        std::fs::write(&archive, [0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad]).unwrap();
        let err = extract(&archive, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, FlashError::ExtractionFailed(_)));
    }
}
