//! Tar/gzip archive building and path-safe extraction.
//!
//! Extraction filters every entry through a resolved-path check against the
//! target directory: absolute paths, parent-directory traversal, and links
//! pointing outside the target are rejected. Benign entries still extract
//! when hostile ones are skipped. Stored modes and mtimes are not honored.

use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use tar::{Archive, Builder, EntryType, HeaderMode};

/// Build a gzipped tar of `src_dir` with portable (deterministic) headers.
pub fn create_archive(src_dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.mode(HeaderMode::Deterministic);
    builder.follow_symlinks(false);
    builder
        .append_dir_all("", src_dir)
        .with_context(|| format!("archiving {}", src_dir.display()))?;
    let encoder = builder.into_inner().context("finishing tar stream")?;
    encoder.finish().context("finishing gzip stream")
}

/// What one extraction pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractReport {
    pub extracted: usize,
    pub rejected: usize,
}

/// Lexically normalize a path that must stay below an (already canonical)
/// base. Returns `None` when a component would escape.
fn resolve_under(base: &Path, relative: &Path) -> Option<PathBuf> {
    let mut resolved = base.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    // Belt and braces: the resolved path must sit under the base prefix.
    resolved.starts_with(base).then_some(resolved)
}

/// Resolve a link target relative to the entry's parent directory, keeping it
/// inside the extraction root.
fn resolve_link_target(base: &Path, entry_dest: &Path, target: &Path) -> Option<PathBuf> {
    if target.is_absolute() {
        return None;
    }
    let parent = entry_dest.parent()?;
    let rel_parent = parent.strip_prefix(base).ok()?;
    resolve_under(base, &rel_parent.join(target))
}

/// Extract a gzipped tar into `dst_dir` under the traversal filter.
pub fn extract_archive(bytes: &[u8], dst_dir: &Path) -> Result<ExtractReport> {
    fs::create_dir_all(dst_dir)
        .with_context(|| format!("creating {}", dst_dir.display()))?;
    let base = dst_dir
        .canonicalize()
        .context("resolving extraction target")?;

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut report = ExtractReport::default();

    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let raw_path = entry.path().context("reading entry path")?.into_owned();

        let Some(dest) = resolve_under(&base, &raw_path) else {
            warn!("skipping archive entry outside target: {}", raw_path.display());
            report.rejected += 1;
            continue;
        };
        if dest == base {
            continue;
        }

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest)
                    .with_context(|| format!("creating {}", dest.display()))?;
                report.extracted += 1;
            }
            EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                // Fresh file with default permissions; stored mode ignored.
                let mut file = fs::File::create(&dest)
                    .with_context(|| format!("creating {}", dest.display()))?;
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).context("reading entry body")?;
                file.write_all(&contents)
                    .with_context(|| format!("writing {}", dest.display()))?;
                report.extracted += 1;
            }
            EntryType::Symlink | EntryType::Link => {
                let Some(target) = entry.link_name().context("reading link target")? else {
                    report.rejected += 1;
                    continue;
                };
                let Some(resolved) = resolve_link_target(&base, &dest, &target) else {
                    warn!(
                        "skipping link '{}' with target outside extraction root",
                        raw_path.display()
                    );
                    report.rejected += 1;
                    continue;
                };
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let linked = if entry.header().entry_type() == EntryType::Link {
                    fs::hard_link(&resolved, &dest).is_ok()
                } else {
                    #[cfg(unix)]
                    {
                        std::os::unix::fs::symlink(&target, &dest).is_ok()
                    }
                    #[cfg(not(unix))]
                    {
                        false
                    }
                };
                if linked {
                    report.extracted += 1;
                } else {
                    report.rejected += 1;
                }
            }
            other => {
                warn!(
                    "skipping unsupported archive entry type {:?}: {}",
                    other,
                    raw_path.display()
                );
                report.rejected += 1;
            }
        }
    }
    Ok(report)
}
