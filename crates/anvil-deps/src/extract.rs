use crate::error::{DepsError, Result};
use crate::paths::EXTRACT_FORMAT_VERSION;
use crate::util;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// Options affecting how an archive is unpacked.
///
/// The option set is part of the extraction cache key and of the flag
/// descriptor, so changing it forces a fresh extraction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Drop the archive's single top-level directory component, flattening
    /// its contents directly into the target.
    pub strip_root: bool,
}

impl ExtractOptions {
    pub(crate) fn descriptor_string(&self) -> String {
        if self.strip_root {
            "strip-root".to_string()
        } else {
            String::new()
        }
    }
}

const ZSTD_MAGIC: u32 = 0xFD2F_B528;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
    /// Zstd framing wraps a ZIP for this artifact family, not a tar stream.
    ZstdZip,
}

/// Unpack `archive` into `target_dir`, guarded by `flag_file`.
///
/// The caller must hold the stripe lock for `target_dir`. If the flag file
/// matches the freshly recomputed descriptor the directory is reused as-is
/// (mtimes refreshed, nothing re-extracted). Returns the number of entries
/// that were processed, `0` for a cache hit.
pub(crate) fn extract_locked(
    archive: &Path,
    target_dir: &Path,
    flag_file: &Path,
    options: ExtractOptions,
) -> Result<usize> {
    let expected = flag_descriptor(archive, options, target_dir)?;
    if is_up_to_date(target_dir, flag_file, &expected) {
        util::touch_best_effort(target_dir);
        util::touch_best_effort(flag_file);
        tracing::debug!(
            target = "anvil.deps",
            archive = %archive.display(),
            dir = %target_dir.display(),
            "extraction cache hit"
        );
        return Ok(0);
    }

    if target_dir.exists() {
        clear_dir_contents(target_dir)?;
    } else {
        fs::create_dir_all(target_dir)?;
    }
    if fs::read_dir(target_dir)?.next().is_some() {
        // Somebody outside the lock repopulated the directory mid-wipe.
        return Err(DepsError::TargetDirNotEmpty {
            path: target_dir.to_path_buf(),
        });
    }

    let entries = extract_entries(archive, target_dir, options)?;

    let descriptor = flag_descriptor(archive, options, target_dir)?;
    util::atomic_write(flag_file, descriptor.as_bytes())?;
    let on_disk = fs::read(flag_file)?;
    if on_disk != descriptor.as_bytes() {
        return Err(DepsError::FlagSelfCheckMismatch {
            path: flag_file.to_path_buf(),
        });
    }

    tracing::debug!(
        target = "anvil.deps",
        archive = %archive.display(),
        dir = %target_dir.display(),
        entries,
        "extracted archive"
    );
    Ok(entries)
}

fn is_up_to_date(target_dir: &Path, flag_file: &Path, expected: &str) -> bool {
    if !target_dir.is_dir() {
        return false;
    }
    match fs::read(flag_file) {
        Ok(bytes) => bytes == expected.as_bytes(),
        Err(_) => false,
    }
}

/// The conditions under which `target_dir` was produced, newline-joined.
///
/// The top-level entry count is re-derived from the live directory listing,
/// so external tampering with the directory invalidates the flag.
fn flag_descriptor(archive: &Path, options: ExtractOptions, target_dir: &Path) -> Result<String> {
    let canonical = fs::canonicalize(archive)?;
    let count = match fs::read_dir(target_dir) {
        Ok(entries) => entries.count(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err.into()),
    };
    Ok(format!(
        "{EXTRACT_FORMAT_VERSION}\n{}\n{count}\n{}",
        canonical.display(),
        options.descriptor_string()
    ))
}

fn clear_dir_contents(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn sniff_format(path: &Path) -> Result<ArchiveFormat> {
    let mut file = fs::File::open(path)?;
    let mut magic = [0u8; 4];
    if let Err(err) = file.read_exact(&mut magic) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            let len = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
            return Err(DepsError::ArchiveTooSmall {
                path: path.to_path_buf(),
                len,
            });
        }
        return Err(err.into());
    }

    let word = u32::from_le_bytes(magic);
    if word == ZSTD_MAGIC {
        return Ok(ArchiveFormat::ZstdZip);
    }
    match [magic[0], magic[1]] {
        [0x50, 0x4B] => Ok(ArchiveFormat::Zip),
        [0x1F, 0x8B] => Ok(ArchiveFormat::TarGz),
        [0x42, 0x5A] => Ok(ArchiveFormat::TarBz2),
        _ => Err(DepsError::UnknownArchiveFormat {
            path: path.to_path_buf(),
            magic: word,
        }),
    }
}

fn extract_entries(archive: &Path, target_dir: &Path, options: ExtractOptions) -> Result<usize> {
    match sniff_format(archive)? {
        ArchiveFormat::Zip => walk_entries(Box::new(ZipReader::open(archive)?), target_dir, options),
        ArchiveFormat::TarGz => {
            let file = fs::File::open(archive)?;
            let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
            walk_entries(Box::new(TarReader::new(decoder)), target_dir, options)
        }
        ArchiveFormat::TarBz2 => {
            let file = fs::File::open(archive)?;
            let decoder = bzip2::read::BzDecoder::new(BufReader::new(file));
            walk_entries(Box::new(TarReader::new(decoder)), target_dir, options)
        }
        ArchiveFormat::ZstdZip => {
            let scratch_dir = target_dir.parent().unwrap_or_else(|| Path::new("."));
            let scratch = tempfile::Builder::new()
                .prefix("anvil-deps-zstd-")
                .suffix(".zip")
                .tempfile_in(scratch_dir)?;

            let mut decoder = zstd::Decoder::new(fs::File::open(archive)?)?;
            io::copy(&mut decoder, &mut scratch.as_file())?;
            scratch.as_file().sync_all()?;

            // `scratch` is dropped (and deleted) whether or not the walk fails.
            walk_entries(Box::new(ZipReader::open(scratch.path())?), target_dir, options)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
    Symlink,
}

struct EntryMeta {
    name: String,
    kind: EntryKind,
    unix_mode: Option<u32>,
    link_target: Option<String>,
}

/// Uniform streaming view over the three supported archive layouts. Each
/// reader yields entries in archive order; entry bodies are only readable
/// during the visit.
trait ArchiveReader {
    fn for_each_entry(
        self: Box<Self>,
        visit: &mut dyn FnMut(EntryMeta, &mut dyn Read) -> Result<()>,
    ) -> Result<()>;
}

struct ZipReader {
    archive: zip::ZipArchive<fs::File>,
}

impl ZipReader {
    fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        let archive = zip::ZipArchive::new(file).map_err(zip_error)?;
        Ok(Self { archive })
    }
}

impl ArchiveReader for ZipReader {
    fn for_each_entry(
        mut self: Box<Self>,
        visit: &mut dyn FnMut(EntryMeta, &mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        for index in 0..self.archive.len() {
            let mut entry = self.archive.by_index(index).map_err(zip_error)?;
            let name = entry.name().to_string();
            let unix_mode = entry.unix_mode();
            let is_symlink = unix_mode.is_some_and(|mode| mode & 0o170000 == 0o120000);
            let kind = if entry.is_dir() {
                EntryKind::Dir
            } else if is_symlink {
                EntryKind::Symlink
            } else {
                EntryKind::File
            };
            // ZIP stores the link target as the entry body.
            let link_target = if is_symlink {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                Some(String::from_utf8_lossy(&buf).into_owned())
            } else {
                None
            };

            visit(
                EntryMeta {
                    name,
                    kind,
                    unix_mode,
                    link_target,
                },
                &mut entry,
            )?;
        }
        Ok(())
    }
}

fn zip_error(err: zip::result::ZipError) -> DepsError {
    DepsError::Io(io::Error::other(err))
}

struct TarReader<R: Read> {
    archive: tar::Archive<R>,
}

impl<R: Read> TarReader<R> {
    fn new(reader: R) -> Self {
        Self {
            archive: tar::Archive::new(reader),
        }
    }
}

impl<R: Read> ArchiveReader for TarReader<R> {
    fn for_each_entry(
        mut self: Box<Self>,
        visit: &mut dyn FnMut(EntryMeta, &mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        use tar::EntryType;

        for entry in self.archive.entries()? {
            let mut entry = entry?;
            let kind = match entry.header().entry_type() {
                EntryType::Directory => EntryKind::Dir,
                EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                    EntryKind::File
                }
                EntryType::Symlink => EntryKind::Symlink,
                // Metadata pseudo-entries; the tar crate already folded their
                // contents into the following real entry.
                EntryType::XHeader
                | EntryType::XGlobalHeader
                | EntryType::GNULongName
                | EntryType::GNULongLink => continue,
                _ => {
                    let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
                    return Err(DepsError::UnsupportedEntryType { name });
                }
            };

            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let unix_mode = entry.header().mode().ok();
            let link_target = entry
                .link_name_bytes()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

            visit(
                EntryMeta {
                    name,
                    kind,
                    unix_mode,
                    link_target,
                },
                &mut entry,
            )?;
        }
        Ok(())
    }
}

fn walk_entries(
    reader: Box<dyn ArchiveReader>,
    target_dir: &Path,
    options: ExtractOptions,
) -> Result<usize> {
    let mut walk = EntryWalk {
        target_dir,
        strip_root: options.strip_root,
        root: None,
        created_dirs: HashSet::new(),
        entries: 0,
    };
    reader.for_each_entry(&mut |meta, data| walk.accept(meta, data))?;
    Ok(walk.entries)
}

struct EntryWalk<'a> {
    target_dir: &'a Path,
    strip_root: bool,
    /// Top-level component captured from the first entry when stripping.
    root: Option<String>,
    created_dirs: HashSet<PathBuf>,
    entries: usize,
}

impl EntryWalk<'_> {
    fn accept(&mut self, meta: EntryMeta, data: &mut dyn Read) -> Result<()> {
        let name = normalize_entry_name(&meta.name)?;
        let Some(rel) = self.strip(&name, meta.kind)? else {
            return Ok(());
        };
        let out_path = self.join_target(&rel);
        self.entries += 1;

        match meta.kind {
            EntryKind::Dir => self.create_dir_memoized(&out_path)?,
            EntryKind::File => {
                if let Some(parent) = out_path.parent() {
                    self.create_dir_memoized(parent)?;
                }
                let mut out = fs::File::create(&out_path)?;
                io::copy(data, &mut out)?;
                drop(out);

                #[cfg(unix)]
                if meta.unix_mode.is_some_and(|mode| mode & 0o111 != 0) {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&out_path, fs::Permissions::from_mode(0o755))?;
                }
            }
            EntryKind::Symlink => {
                self.place_symlink(&rel, meta.link_target.as_deref(), &out_path)?;
            }
        }
        Ok(())
    }

    /// Apply strip-root, returning the relative output path or `None` when
    /// the entry is the stripped root directory itself.
    fn strip(&mut self, name: &str, kind: EntryKind) -> Result<Option<String>> {
        if !self.strip_root {
            return Ok(Some(name.to_string()));
        }

        let top = name.split('/').next().unwrap_or(name);
        if self.root.is_none() {
            if kind != EntryKind::Dir {
                return Err(DepsError::StripRootNonDirectory {
                    name: name.to_string(),
                });
            }
            self.root = Some(top.to_string());
        }

        let root = self.root.as_deref().expect("captured above");
        if top != root {
            return Err(DepsError::StripRootMismatch {
                name: name.to_string(),
                root: root.to_string(),
            });
        }

        if name.len() == root.len() {
            Ok(None)
        } else {
            Ok(Some(name[root.len() + 1..].to_string()))
        }
    }

    fn join_target(&self, rel: &str) -> PathBuf {
        let mut path = self.target_dir.to_path_buf();
        for segment in rel.split('/') {
            if segment == "." {
                continue;
            }
            path.push(segment);
        }
        path
    }

    fn create_dir_memoized(&mut self, path: &Path) -> Result<()> {
        if self.created_dirs.contains(path) {
            return Ok(());
        }
        fs::create_dir_all(path)?;
        let mut current = path;
        while current.starts_with(self.target_dir) && current != self.target_dir {
            if !self.created_dirs.insert(current.to_path_buf()) {
                break;
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Ok(())
    }

    fn place_symlink(
        &mut self,
        rel: &str,
        link_target: Option<&str>,
        out_path: &Path,
    ) -> Result<()> {
        let Some(link_target) = link_target.filter(|target| !target.is_empty()) else {
            tracing::warn!(
                target = "anvil.deps",
                entry = rel,
                "skipping symlink entry without a target"
            );
            return Ok(());
        };
        let Some(resolved) = resolve_link_target(self.target_dir, rel, link_target) else {
            tracing::warn!(
                target = "anvil.deps",
                entry = rel,
                link_target,
                "skipping symlink escaping the extraction root"
            );
            return Ok(());
        };

        if let Some(parent) = out_path.parent() {
            self.create_dir_memoized(parent)?;
        }
        materialize_link(rel, link_target, &resolved, out_path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn materialize_link(
    _rel: &str,
    link_target: &str,
    _resolved: &Path,
    out_path: &Path,
) -> io::Result<()> {
    std::os::unix::fs::symlink(Path::new(link_target), out_path)
}

#[cfg(not(unix))]
fn materialize_link(rel: &str, _link_target: &str, resolved: &Path, out_path: &Path) -> io::Result<()> {
    // Symlink creation needs elevated privileges on some platforms; substitute
    // a copy of the already-extracted target file when possible.
    if resolved.is_file() {
        fs::copy(resolved, out_path)?;
    } else {
        tracing::warn!(
            target = "anvil.deps",
            entry = rel,
            "skipping symlink entry; resolved target is not an extracted file"
        );
    }
    Ok(())
}

fn normalize_entry_name(raw: &str) -> Result<String> {
    if raw.contains('\\') {
        return Err(DepsError::UnsafeEntryName {
            name: raw.to_string(),
            reason: "contains a backslash",
        });
    }
    let name = raw.trim_matches('/');
    if name.is_empty() {
        return Err(DepsError::UnsafeEntryName {
            name: raw.to_string(),
            reason: "blank name",
        });
    }
    if name.contains("//") {
        return Err(DepsError::UnsafeEntryName {
            name: raw.to_string(),
            reason: "doubled path separator",
        });
    }
    if name.split('/').any(|segment| segment == "..") {
        return Err(DepsError::UnsafeEntryName {
            name: raw.to_string(),
            reason: "path traversal segment",
        });
    }
    Ok(name.to_string())
}

/// Resolve a link target lexically, relative to the entry's own directory.
///
/// Returns `None` when the resolved path is absolute, escapes the extraction
/// root, or is the root itself.
fn resolve_link_target(target_dir: &Path, entry_rel: &str, link_target: &str) -> Option<PathBuf> {
    if link_target.contains('\\') || link_target.starts_with('/') {
        return None;
    }

    let mut stack: Vec<&str> = entry_rel.split('/').collect();
    stack.pop();
    for segment in link_target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop()?;
            }
            segment => stack.push(segment),
        }
    }
    if stack.is_empty() {
        return None;
    }

    let mut resolved = target_dir.to_path_buf();
    for segment in stack {
        resolved.push(segment);
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths;
    use std::io::Write;

    enum Fixture<'a> {
        Dir(&'a str),
        File {
            name: &'a str,
            body: &'a [u8],
            mode: u32,
        },
        Symlink {
            name: &'a str,
            target: &'a str,
        },
    }

    fn set_raw_name(header: &mut tar::Header, name: &str) {
        let gnu = header.as_gnu_mut().expect("gnu header");
        gnu.name = [0u8; 100];
        let bytes = name.as_bytes();
        gnu.name[..bytes.len()].copy_from_slice(bytes);
    }

    fn build_tar<W: Write>(writer: W, entries: &[Fixture]) -> io::Result<W> {
        let mut builder = tar::Builder::new(writer);
        for entry in entries {
            match entry {
                Fixture::Dir(name) => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, *name, io::empty())?;
                }
                Fixture::File { name, body, mode } => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(body.len() as u64);
                    header.set_mode(*mode);
                    if name.contains("..") {
                        // Newer `tar` refuses to `set_path` a `..` segment, so
                        // write the raw name bytes into the GNU header to forge
                        // the malicious archive this test needs.
                        set_raw_name(&mut header, name);
                        header.set_cksum();
                        builder.append(&header, *body)?;
                    } else {
                        header.set_cksum();
                        builder.append_data(&mut header, *name, *body)?;
                    }
                }
                Fixture::Symlink { name, target } => {
                    let mut header = tar::Header::new_gnu();
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_cksum();
                    builder.append_link(&mut header, *name, *target)?;
                }
            }
        }
        builder.into_inner()
    }

    fn write_tar_gz(path: &Path, entries: &[Fixture]) -> Result<()> {
        let file = fs::File::create(path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let encoder = build_tar(encoder, entries)?;
        encoder.finish()?;
        Ok(())
    }

    fn write_tar_bz2(path: &Path, entries: &[Fixture]) -> Result<()> {
        let file = fs::File::create(path)?;
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::best());
        let encoder = build_tar(encoder, entries)?;
        encoder.finish()?;
        Ok(())
    }

    fn build_zip<W: Write + io::Seek>(writer: W, entries: &[Fixture]) -> W {
        let mut zip = zip::ZipWriter::new(writer);
        for entry in entries {
            let options = zip::write::SimpleFileOptions::default();
            match entry {
                Fixture::Dir(name) => {
                    zip.add_directory(*name, options).expect("zip dir");
                }
                Fixture::File { name, body, mode } => {
                    zip.start_file(*name, options.unix_permissions(*mode))
                        .expect("zip file");
                    zip.write_all(body).expect("zip body");
                }
                Fixture::Symlink { name, target } => {
                    zip.add_symlink(*name, *target, options).expect("zip link");
                }
            }
        }
        zip.finish().expect("zip finish")
    }

    fn write_zip(path: &Path, entries: &[Fixture]) -> Result<()> {
        let file = fs::File::create(path)?;
        build_zip(file, entries);
        Ok(())
    }

    fn write_zstd_zip(path: &Path, entries: &[Fixture]) -> Result<()> {
        let cursor = build_zip(io::Cursor::new(Vec::new()), entries);
        let file = fs::File::create(path)?;
        zstd::stream::copy_encode(&cursor.into_inner()[..], file, 3)?;
        Ok(())
    }

    fn sample_entries() -> Vec<Fixture<'static>> {
        vec![
            Fixture::Dir("root"),
            Fixture::Dir("root/bin"),
            Fixture::File {
                name: "root/bin/tool",
                body: b"#!/bin/sh\nexit 0\n",
                mode: 0o755,
            },
            Fixture::File {
                name: "root/readme.txt",
                body: b"hello",
                mode: 0o644,
            },
            Fixture::Symlink {
                name: "root/link",
                target: "bin/tool",
            },
        ]
    }

    fn extract_into(tmp: &Path, archive: &Path, options: ExtractOptions) -> Result<(PathBuf, usize)> {
        let dir = paths::target_dir_for(tmp, archive, options)?;
        let flag = paths::flag_file_for(&dir);
        let entries = extract_locked(archive, &dir, &flag, options)?;
        Ok((dir, entries))
    }

    fn assert_sample_layout(dir: &Path) {
        assert_eq!(
            fs::read(dir.join("root/bin/tool")).unwrap(),
            b"#!/bin/sh\nexit 0\n"
        );
        assert_eq!(fs::read(dir.join("root/readme.txt")).unwrap(), b"hello");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.join("root/bin/tool")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755, "exec bit must be preserved");
            let plain = fs::metadata(dir.join("root/readme.txt")).unwrap().permissions().mode();
            assert_eq!(plain & 0o111, 0, "readme must not be executable");

            assert_eq!(
                fs::read_link(dir.join("root/link")).unwrap(),
                PathBuf::from("bin/tool")
            );
            assert_eq!(fs::read(dir.join("root/link")).unwrap(), b"#!/bin/sh\nexit 0\n");
        }
    }

    #[test]
    fn tar_gz_round_trip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.tar.gz");
        write_tar_gz(&archive, &sample_entries())?;

        let (dir, entries) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert!(entries > 0);
        assert_sample_layout(&dir);
        assert!(paths::flag_file_for(&dir).is_file());
        Ok(())
    }

    #[test]
    fn tar_bz2_round_trip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.tar.bz2");
        write_tar_bz2(&archive, &sample_entries())?;

        let (dir, _) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert_sample_layout(&dir);
        Ok(())
    }

    #[test]
    fn zip_round_trip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.zip");
        write_zip(&archive, &sample_entries())?;

        let (dir, _) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert_sample_layout(&dir);
        Ok(())
    }

    #[test]
    fn zstd_archives_contain_a_zip_stream() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.zip.zst");
        write_zstd_zip(&archive, &sample_entries())?;

        let (dir, _) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert_sample_layout(&dir);

        // The decompressed scratch file must be gone.
        for entry in fs::read_dir(tmp.path())? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            assert!(
                !name.starts_with("anvil-deps-zstd-"),
                "left behind scratch file {name:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn strip_root_removes_exactly_one_leading_segment() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.tar.gz");
        write_tar_gz(&archive, &sample_entries())?;

        let options = ExtractOptions { strip_root: true };
        let (dir, _) = extract_into(tmp.path(), &archive, options)?;

        assert_eq!(fs::read(dir.join("bin/tool"))?, b"#!/bin/sh\nexit 0\n");
        assert_eq!(fs::read(dir.join("readme.txt"))?, b"hello");
        assert!(!dir.join("root").exists());
        Ok(())
    }

    #[test]
    fn strip_root_requires_a_leading_directory_entry() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("flat.tar.gz");
        write_tar_gz(
            &archive,
            &[Fixture::File {
                name: "loose.txt",
                body: b"data",
                mode: 0o644,
            }],
        )?;

        let err = extract_into(tmp.path(), &archive, ExtractOptions { strip_root: true })
            .unwrap_err();
        assert!(matches!(err, DepsError::StripRootNonDirectory { .. }));
        Ok(())
    }

    #[test]
    fn traversal_entries_abort_extraction() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("evil.tar.gz");
        write_tar_gz(
            &archive,
            &[
                Fixture::Dir("a"),
                Fixture::File {
                    name: "a/../../evil.txt",
                    body: b"pwned",
                    mode: 0o644,
                },
            ],
        )?;

        let err = extract_into(tmp.path(), &archive, ExtractOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            DepsError::UnsafeEntryName {
                reason: "path traversal segment",
                ..
            }
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);

        // Nothing may land outside the target directory.
        assert!(!tmp.path().join("evil.txt").exists());
        assert!(!tmp.path().parent().unwrap().join("evil.txt").exists());
        Ok(())
    }

    #[test]
    fn escaping_symlinks_are_skipped_not_fatal() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("links.tar.gz");
        write_tar_gz(
            &archive,
            &[
                Fixture::Dir("root"),
                Fixture::File {
                    name: "root/ok.txt",
                    body: b"fine",
                    mode: 0o644,
                },
                Fixture::Symlink {
                    name: "root/escape",
                    target: "../../outside",
                },
                Fixture::Symlink {
                    name: "root/to-root",
                    target: "..",
                },
            ],
        )?;

        let (dir, _) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert_eq!(fs::read(dir.join("root/ok.txt"))?, b"fine");
        assert!(fs::symlink_metadata(dir.join("root/escape")).is_err());
        assert!(fs::symlink_metadata(dir.join("root/to-root")).is_err());
        Ok(())
    }

    #[test]
    fn second_extraction_is_a_cache_hit() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.tar.gz");
        write_tar_gz(&archive, &sample_entries())?;

        let (dir, first) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert!(first > 0);

        let (_, second) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert_eq!(second, 0, "matching flag must skip re-extraction");

        // Corrupting the flag forces a fresh extraction.
        fs::write(paths::flag_file_for(&dir), b"stale")?;
        let (_, third) = extract_into(tmp.path(), &archive, ExtractOptions::default())?;
        assert!(third > 0);
        Ok(())
    }

    #[test]
    fn option_change_invalidates_an_explicit_target() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.tar.gz");
        write_tar_gz(&archive, &sample_entries())?;

        let target = tmp.path().join("out");
        let flag = paths::flag_file_for_explicit_target(tmp.path(), &target);

        let first = extract_locked(&archive, &target, &flag, ExtractOptions::default())?;
        assert!(first > 0);
        assert!(target.join("root/readme.txt").is_file());
        let flag_before = fs::read(&flag)?;

        let second = extract_locked(
            &archive,
            &target,
            &flag,
            ExtractOptions { strip_root: true },
        )?;
        assert!(second > 0, "option change must force re-extraction");
        assert!(target.join("readme.txt").is_file());
        assert!(!target.join("root").exists());
        assert_ne!(fs::read(&flag)?, flag_before);
        Ok(())
    }

    #[test]
    fn leftover_content_is_wiped_before_extraction() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let archive = tmp.path().join("dist.tar.gz");
        write_tar_gz(&archive, &sample_entries())?;

        let target = tmp.path().join("out");
        fs::create_dir_all(target.join("junk-dir"))?;
        fs::write(target.join("junk.txt"), b"junk")?;

        let flag = paths::flag_file_for_explicit_target(tmp.path(), &target);
        extract_locked(&archive, &target, &flag, ExtractOptions::default())?;

        assert!(!target.join("junk.txt").exists());
        assert!(!target.join("junk-dir").exists());
        assert!(target.join("root/readme.txt").is_file());
        Ok(())
    }

    #[test]
    fn unknown_and_undersized_archives_are_rejected() -> Result<()> {
        let tmp = tempfile::tempdir()?;

        let unknown = tmp.path().join("mystery.bin");
        fs::write(&unknown, b"\x00\x01\x02\x03garbage")?;
        let err = extract_into(tmp.path(), &unknown, ExtractOptions::default()).unwrap_err();
        assert!(matches!(err, DepsError::UnknownArchiveFormat { .. }));

        let tiny = tmp.path().join("tiny.bin");
        fs::write(&tiny, b"PK")?;
        let err = extract_into(tmp.path(), &tiny, ExtractOptions::default()).unwrap_err();
        assert!(matches!(err, DepsError::ArchiveTooSmall { len: 2, .. }));
        Ok(())
    }

    #[test]
    fn entry_name_normalization_rejects_unsafe_shapes() {
        assert!(normalize_entry_name("a/b.txt").is_ok());
        assert_eq!(normalize_entry_name("root/").unwrap(), "root");
        assert_eq!(normalize_entry_name("/abs/path").unwrap(), "abs/path");

        assert!(normalize_entry_name("").is_err());
        assert!(normalize_entry_name("///").is_err());
        assert!(normalize_entry_name("a//b").is_err());
        assert!(normalize_entry_name("a\\b").is_err());
        assert!(normalize_entry_name("a/../b").is_err());
        assert!(normalize_entry_name("..").is_err());
    }

    #[test]
    fn link_resolution_is_contained() {
        let root = Path::new("/cache/dist.d");
        assert_eq!(
            resolve_link_target(root, "root/link", "bin/tool"),
            Some(root.join("root/bin/tool"))
        );
        assert_eq!(
            resolve_link_target(root, "root/nested/link", "../sibling"),
            Some(root.join("root/sibling"))
        );
        // Escapes and the root itself are rejected.
        assert_eq!(resolve_link_target(root, "root/link", "../../outside"), None);
        assert_eq!(resolve_link_target(root, "root/link", ".."), None);
        assert_eq!(resolve_link_target(root, "root/link", "/etc/passwd"), None);
        assert_eq!(resolve_link_target(root, "link", ".."), None);
    }
}
