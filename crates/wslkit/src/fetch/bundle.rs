//! App-package bundle extraction.
//!
//! Store-style distribution packages (`.appx`, `.appxbundle`, `.msix`,
//! `.msixbundle`) are zip containers. The root filesystem is the
//! `install.tar.gz` (or `install.tar`) entry, either at the package root or
//! inside a nested per-architecture package.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::{Error, Result};

/// Entry names that hold the root filesystem, in preference order.
const ROOTFS_ENTRIES: [&str; 2] = ["install.tar.gz", "install.tar"];

/// Extensions of nested packages inside a bundle.
const PACKAGE_EXTENSIONS: [&str; 2] = [".appx", ".msix"];

/// Bundle extensions recognised by [`is_bundle`].
const BUNDLE_EXTENSIONS: [&str; 4] = [".appx", ".appxbundle", ".msix", ".msixbundle"];

/// Whether a path or URL names a bundle by extension.
pub fn is_bundle(source: &str) -> bool {
    let lower = source.to_ascii_lowercase();
    let lower = lower.split(['?', '#']).next().unwrap_or_default();
    BUNDLE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Extract the root filesystem from a bundle into `dest_dir`.
///
/// Returns the path of the extracted rootfs archive.
pub fn extract_rootfs(bundle: &Path, dest_dir: &Path) -> Result<PathBuf> {
    extract_inner(bundle, dest_dir, 0)
}

fn extract_inner(bundle: &Path, dest_dir: &Path, depth: usize) -> Result<PathBuf> {
    let mut archive = open(bundle)?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();

    if let Some(entry) = find_rootfs_entry(&names) {
        let out = dest_dir.join(entry.rsplit('/').next().unwrap_or(entry));
        copy_entry(&mut archive, entry, &out, bundle)?;
        log::info!("extracted {} from {}", entry, bundle.display());
        return Ok(out);
    }

    if depth > 0 {
        return Err(extraction(bundle, "no install.tar.gz in package"));
    }

    let nested = select_package(&names)
        .ok_or_else(|| extraction(bundle, "no rootfs and no nested package found"))?;
    let nested_path = dest_dir.join(format!("nested-{}", sanitize(nested)));
    copy_entry(&mut archive, nested, &nested_path, bundle)?;
    log::debug!("opening nested package {}", nested);

    let result = extract_inner(&nested_path, dest_dir, depth + 1);
    if let Err(e) = std::fs::remove_file(&nested_path) {
        log::warn!("could not remove {}: {}", nested_path.display(), e);
    }
    result
}

fn open(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    ZipArchive::new(BufReader::new(file)).map_err(|e| extraction(path, e.to_string()))
}

fn find_rootfs_entry(names: &[String]) -> Option<&str> {
    ROOTFS_ENTRIES.iter().find_map(|wanted| {
        names
            .iter()
            .find(|name| name.eq_ignore_ascii_case(wanted))
            .map(String::as_str)
    })
}

/// Pick the nested package: x64 first, then anything not ARM, then the first.
fn select_package(names: &[String]) -> Option<&str> {
    let packages: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|name| {
            let lower = name.to_ascii_lowercase();
            PACKAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
        })
        .collect();

    packages
        .iter()
        .find(|name| name.to_ascii_lowercase().contains("x64"))
        .or_else(|| {
            packages
                .iter()
                .find(|name| !name.to_ascii_lowercase().contains("arm"))
        })
        .or_else(|| packages.first())
        .copied()
}

fn copy_entry(
    archive: &mut ZipArchive<BufReader<File>>,
    name: &str,
    out: &Path,
    bundle: &Path,
) -> Result<()> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| extraction(bundle, e.to_string()))?;
    let mut file = File::create(out).map_err(|e| Error::io(out, e))?;
    io::copy(&mut entry, &mut file).map_err(|e| Error::io(out, e))?;
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extraction(path: &Path, message: impl Into<String>) -> Error {
    Error::Extraction {
        path: path.to_path_buf(),
        message: message.into(),
    }
}
