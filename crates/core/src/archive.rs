use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::Result;
use crate::model::{CompressionType, StepOutput};
use crate::progress::{ArchiveProgress, ProgressMeter};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionParams {
    pub compression: CompressionType,
    /// zstd level; ignored by the other backends.
    pub level: i32,
}

/// What goes into an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    /// `src_dir/src_name` recursively; entry names start with `src_name`.
    Tree { src_dir: PathBuf, src_name: String },
    /// Only the regular files directly inside `dir` whose names match `pattern`.
    CurrentDir { dir: PathBuf, pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Unlink existing directory hierarchies before extracting a directory of the same name.
    pub clear_destination: bool,
    /// Keep files under the archived roots that the archive does not contain.
    pub merge: bool,
}

/// Streaming archiver. Failures never panic or return `Err`; they come back as
/// `success = false` with the captured diagnostics.
pub trait ArchiveCodec: Send + Sync {
    fn compress(
        &self,
        source: &ArchiveSource,
        dst: &Path,
        exclusions: &[String],
        follow_symlinks: bool,
        params: CompressionParams,
        on_progress: &dyn Fn(ArchiveProgress),
    ) -> StepOutput;

    fn decompress(
        &self,
        src: &Path,
        dst_dir: &Path,
        exclusions: &[String],
        options: ExtractOptions,
        params: CompressionParams,
        on_progress: &dyn Fn(ArchiveProgress),
    ) -> StepOutput;

    /// Reads the whole archive without extracting anything.
    fn test(&self, src: &Path, params: CompressionParams) -> StepOutput;
}

/// Tar-style exclusion patterns compiled into one glob set.
///
/// A pattern is unanchored: `pkg/cache` matches that path at any depth, and
/// everything below it.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    set: GlobSet,
}

impl ExclusionSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let p = pattern
                .trim()
                .trim_start_matches("./")
                .trim_start_matches('/')
                .trim_end_matches('/');
            if p.is_empty() {
                continue;
            }
            for glob in [format!("**/{p}"), format!("**/{p}/**")] {
                builder.add(GlobBuilder::new(&glob).literal_separator(true).build()?);
            }
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn is_excluded(&self, rel: &Path) -> bool {
        self.set.is_match(rel)
    }
}

/// Pulls `{bytesProcessed, throughput}` out of archiver output such as
/// `(71MiB, 238MiB/s)`.
pub fn parse_tool_progress(line: &str) -> Option<ArchiveProgress> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| {
            Regex::new(
                r"\((\d+(?:\.\d+)?)\s*([KMGTP]?i?B),\s*(\d+(?:\.\d+)?)\s*([KMGTP]?i?B)/s\)",
            )
        })
        .as_ref()
        .ok()?;
    let caps = re.captures(line)?;
    let amount = |value: &str, unit: &str| -> Option<u64> {
        let value: f64 = value.parse().ok()?;
        Some((value * unit_multiplier(unit)? as f64) as u64)
    };
    Some(ArchiveProgress {
        bytes_processed: amount(&caps[1], &caps[2])?,
        throughput_bps: amount(&caps[3], &caps[4])?,
    })
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let exp = match unit.chars().next()? {
        'B' => 0,
        'K' => 1,
        'M' => 2,
        'G' => 3,
        'T' => 4,
        'P' => 5,
        _ => return None,
    };
    Some(1024u64.pow(exp))
}

/// In-process tar codec with zstd and lz4 (frame) backends.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarCodec;

impl TarCodec {
    pub fn new() -> Self {
        Self
    }
}

impl ArchiveCodec for TarCodec {
    fn compress(
        &self,
        source: &ArchiveSource,
        dst: &Path,
        exclusions: &[String],
        follow_symlinks: bool,
        params: CompressionParams,
        on_progress: &dyn Fn(ArchiveProgress),
    ) -> StepOutput {
        let exclusions = match ExclusionSet::new(exclusions) {
            Ok(set) => set,
            Err(e) => return StepOutput::line(false, e.to_string()),
        };
        if let Some(parent) = dst.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            return StepOutput::line(false, format!("Failed to create {}: {e}", parent.display()));
        }

        let partial = partial_path(dst);
        let written = write_archive(
            source,
            &partial,
            &exclusions,
            follow_symlinks,
            params,
            on_progress,
        )
        .and_then(|entries| fs::rename(&partial, dst).map(|()| entries));

        match written {
            Ok(entries) => {
                debug!(
                    event = "archive.compress.finish",
                    dst = %dst.display(),
                    compression = params.compression.as_str(),
                    entries,
                    "archive.compress.finish"
                );
                StepOutput::ok(vec![format!(
                    "Archived {entries} entries into {}.",
                    dst.display()
                )])
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                error!(
                    event = "io.archive.compress_failed",
                    dst = %dst.display(),
                    error = %e,
                    "io.archive.compress_failed"
                );
                StepOutput::line(false, format!("Failed to write {}: {e}", dst.display()))
            }
        }
    }

    fn decompress(
        &self,
        src: &Path,
        dst_dir: &Path,
        exclusions: &[String],
        options: ExtractOptions,
        params: CompressionParams,
        on_progress: &dyn Fn(ArchiveProgress),
    ) -> StepOutput {
        let exclusions = match ExclusionSet::new(exclusions) {
            Ok(set) => set,
            Err(e) => return StepOutput::line(false, e.to_string()),
        };
        match extract_archive(src, dst_dir, &exclusions, options, params, on_progress) {
            Ok(entries) => {
                debug!(
                    event = "archive.decompress.finish",
                    src = %src.display(),
                    dst_dir = %dst_dir.display(),
                    entries,
                    "archive.decompress.finish"
                );
                StepOutput::ok(vec![format!(
                    "Extracted {entries} entries into {}.",
                    dst_dir.display()
                )])
            }
            Err(e) => {
                error!(
                    event = "io.archive.decompress_failed",
                    src = %src.display(),
                    dst_dir = %dst_dir.display(),
                    error = %e,
                    "io.archive.decompress_failed"
                );
                StepOutput::line(false, format!("Failed to extract {}: {e}", src.display()))
            }
        }
    }

    fn test(&self, src: &Path, params: CompressionParams) -> StepOutput {
        match scan_archive(src, params) {
            Ok(entries) => StepOutput::ok(vec![format!("Tested {entries} entries.")]),
            Err(e) => {
                debug!(
                    event = "io.archive.test_failed",
                    src = %src.display(),
                    error = %e,
                    "io.archive.test_failed"
                );
                StepOutput::line(false, e.to_string())
            }
        }
    }
}

fn partial_path(dst: &Path) -> PathBuf {
    match dst.file_name() {
        Some(name) => {
            let mut name = OsString::from(name);
            name.push(".partial");
            dst.with_file_name(name)
        }
        None => dst.with_extension("partial"),
    }
}

enum Encoder<W: Write> {
    Plain(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
}

impl<W: Write> Encoder<W> {
    fn new(inner: W, params: CompressionParams) -> io::Result<Self> {
        Ok(match params.compression {
            CompressionType::Tar => Self::Plain(inner),
            CompressionType::Zstd => {
                Self::Zstd(zstd::stream::write::Encoder::new(inner, params.level)?)
            }
            CompressionType::Lz4 => Self::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Self::Plain(w) => Ok(w),
            Self::Zstd(e) => e.finish(),
            Self::Lz4(e) => e.finish().map_err(io::Error::other),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(w) => w.write(buf),
            Self::Zstd(e) => e.write(buf),
            Self::Lz4(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(w) => w.flush(),
            Self::Zstd(e) => e.flush(),
            Self::Lz4(e) => e.flush(),
        }
    }
}

fn decoder<'a, R: Read + 'a>(
    inner: R,
    compression: CompressionType,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        CompressionType::Tar => Box::new(inner),
        CompressionType::Zstd => Box::new(zstd::stream::read::Decoder::new(inner)?),
        CompressionType::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(inner)),
    })
}

struct CountingReader<'a, R> {
    inner: R,
    meter: &'a mut ProgressMeter,
    on_progress: &'a dyn Fn(ArchiveProgress),
}

impl<R: Read> Read for CountingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(p) = self.meter.advance(n as u64) {
            (self.on_progress)(p);
        }
        Ok(n)
    }
}

fn write_archive(
    source: &ArchiveSource,
    dst: &Path,
    exclusions: &ExclusionSet,
    follow_symlinks: bool,
    params: CompressionParams,
    on_progress: &dyn Fn(ArchiveProgress),
) -> io::Result<u64> {
    let file = File::create(dst)?;
    let encoder = Encoder::new(BufWriter::new(file), params)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(follow_symlinks);

    let mut meter = ProgressMeter::new(PROGRESS_INTERVAL);
    let mut entries = 0u64;
    match source {
        ArchiveSource::Tree { src_dir, src_name } => {
            let root = src_dir.join(src_name);
            let walker = WalkDir::new(&root)
                .follow_links(follow_symlinks)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| match e.path().strip_prefix(src_dir) {
                    Ok(rel) => !exclusions.is_excluded(rel),
                    Err(_) => true,
                });
            for entry in walker {
                let entry = entry.map_err(io::Error::from)?;
                let rel = entry
                    .path()
                    .strip_prefix(src_dir)
                    .map_err(io::Error::other)?;
                if append_entry(
                    &mut builder,
                    entry.path(),
                    rel,
                    follow_symlinks,
                    &mut meter,
                    on_progress,
                )? {
                    entries += 1;
                }
            }
        }
        ArchiveSource::CurrentDir { dir, pattern } => {
            let matcher = Glob::new(pattern)
                .map_err(io::Error::other)?
                .compile_matcher();
            let mut names = Vec::new();
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                if matcher.is_match(Path::new(&name)) {
                    names.push(name);
                }
            }
            names.sort();
            if names.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no files matching {pattern} in {}", dir.display()),
                ));
            }
            for name in names {
                if append_entry(
                    &mut builder,
                    &dir.join(&name),
                    Path::new(&name),
                    follow_symlinks,
                    &mut meter,
                    on_progress,
                )? {
                    entries += 1;
                }
            }
        }
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    on_progress(meter.snapshot());
    Ok(entries)
}

/// Appends one filesystem entry; special files (sockets, fifos, devices) are skipped.
fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &Path,
    follow_symlinks: bool,
    meter: &mut ProgressMeter,
    on_progress: &dyn Fn(ArchiveProgress),
) -> io::Result<bool> {
    let meta = if follow_symlinks {
        fs::metadata(path)?
    } else {
        fs::symlink_metadata(path)?
    };
    let file_type = meta.file_type();
    let mut header = tar::Header::new_gnu();
    header.set_metadata(&meta);

    if file_type.is_dir() {
        header.set_size(0);
        builder.append_data(&mut header, name, io::empty())?;
    } else if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        header.set_size(0);
        builder.append_link(&mut header, name, &target)?;
    } else if file_type.is_file() {
        let file = File::open(path)?;
        let reader = CountingReader {
            inner: file.take(meta.len()),
            meter,
            on_progress,
        };
        builder.append_data(&mut header, name, reader)?;
    } else {
        debug!(
            event = "archive.entry_skipped",
            path = %path.display(),
            "archive.entry_skipped"
        );
        return Ok(false);
    }
    Ok(true)
}

fn normalize_entry_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn extract_archive(
    src: &Path,
    dst_dir: &Path,
    exclusions: &ExclusionSet,
    options: ExtractOptions,
    params: CompressionParams,
    on_progress: &dyn Fn(ArchiveProgress),
) -> io::Result<u64> {
    let file = File::open(src)?;
    fs::create_dir_all(dst_dir)?;

    let mut meter = ProgressMeter::new(PROGRESS_INTERVAL);
    let counted = CountingReader {
        inner: BufReader::new(file),
        meter: &mut meter,
        on_progress,
    };
    let mut archive = tar::Archive::new(decoder(counted, params.compression)?);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut roots: HashSet<PathBuf> = HashSet::new();
    let mut entries = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = normalize_entry_path(&entry.path()?);
        let Some(root) = rel.components().next().map(|c| PathBuf::from(c.as_os_str())) else {
            continue;
        };
        if exclusions.is_excluded(&rel) {
            continue;
        }

        if !options.merge && roots.insert(root.clone()) {
            let root_path = dst_dir.join(&root);
            clear_tree(&root_path, dst_dir, exclusions)?;
            unpacked.insert(root_path);
        }

        let target = dst_dir.join(&rel);
        if options.clear_destination && !unpacked.contains(&target) {
            let is_dir_entry = entry.header().entry_type().is_dir();
            let existing_dir = fs::symlink_metadata(&target)
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if is_dir_entry {
                clear_tree(&target, dst_dir, exclusions)?;
            } else if existing_dir {
                fs::remove_dir_all(&target)?;
            }
        }

        entry.unpack_in(dst_dir)?;
        unpacked.insert(target);
        entries += 1;
    }
    drop(archive);

    on_progress(meter.snapshot());
    Ok(entries)
}

/// Removes `path`. Directories keep themselves and any excluded descendants.
fn clear_tree(path: &Path, base: &Path, exclusions: &ExclusionSet) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.is_dir() {
        return fs::remove_file(path);
    }
    for child in fs::read_dir(path)? {
        let child = child?.path();
        let rel = child.strip_prefix(base).unwrap_or(&child);
        if exclusions.is_excluded(rel) {
            continue;
        }
        clear_tree(&child, base, exclusions)?;
        if fs::symlink_metadata(&child).is_ok_and(|m| m.is_dir()) {
            // non-empty means an excluded path survives below it
            let _ = fs::remove_dir(&child);
        }
    }
    Ok(())
}

fn scan_archive(src: &Path, params: CompressionParams) -> io::Result<u64> {
    let file = File::open(src)?;
    let mut archive = tar::Archive::new(decoder(BufReader::new(file), params.compression)?);
    let mut entries = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let expected = entry.size();
        let copied = io::copy(&mut entry, &mut io::sink())?;
        if copied != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry truncated: {copied} of {expected} bytes"),
            ));
        }
        entries += 1;
    }
    if entries == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "archive contains no entries",
        ));
    }
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink())?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zstd() -> CompressionParams {
        CompressionParams {
            compression: CompressionType::Zstd,
            level: 3,
        }
    }

    fn no_progress(_: ArchiveProgress) {}

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn exclusions_are_unanchored_and_cover_descendants() {
        let set = ExclusionSet::new(&["com.app/cache".to_string(), "Backup_*".to_string()])
            .unwrap();
        assert!(set.is_excluded(Path::new("com.app/cache")));
        assert!(set.is_excluded(Path::new("com.app/cache/img/a.png")));
        assert!(set.is_excluded(Path::new("Backup_2024")));
        assert!(set.is_excluded(Path::new("com.app/files/Backup_old/x")));
        assert!(!set.is_excluded(Path::new("com.app/files/cache.db")));
        assert!(!set.is_excluded(Path::new("com.app/code_cache")));
    }

    #[test]
    fn anchored_pattern_spares_the_root_entry() {
        let set = ExclusionSet::new(&["Backup_photos/**/Backup_*".to_string()]).unwrap();
        assert!(!set.is_excluded(Path::new("Backup_photos")));
        assert!(!set.is_excluded(Path::new("Backup_photos/beach.jpg")));
        assert!(set.is_excluded(Path::new("Backup_photos/Backup_old")));
        assert!(set.is_excluded(Path::new("Backup_photos/2024/Backup_x/a.jpg")));
    }

    #[test]
    fn tree_round_trip_skips_excluded_paths() {
        let temp = tempfile::tempdir().unwrap();
        let src_dir = temp.path().join("src");
        write(&src_dir.join("com.app/files/a.txt"), b"alpha");
        write(&src_dir.join("com.app/cache/junk.bin"), b"junk");
        write(&src_dir.join("com.app/shared_prefs/p.xml"), b"<map/>");

        let codec = TarCodec::new();
        let dst = temp.path().join("out/user.tar.zst");
        let out = codec.compress(
            &ArchiveSource::Tree {
                src_dir: src_dir.clone(),
                src_name: "com.app".to_string(),
            },
            &dst,
            &["com.app/cache".to_string()],
            false,
            zstd(),
            &no_progress,
        );
        assert!(out.success, "{:?}", out.lines);
        assert!(dst.exists());
        assert!(!partial_path(&dst).exists());
        assert!(codec.test(&dst, zstd()).success);

        let restore_dir = temp.path().join("restore");
        let out = codec.decompress(
            &dst,
            &restore_dir,
            &[],
            ExtractOptions {
                clear_destination: true,
                merge: true,
            },
            zstd(),
            &no_progress,
        );
        assert!(out.success, "{:?}", out.lines);
        assert_eq!(
            fs::read(restore_dir.join("com.app/files/a.txt")).unwrap(),
            b"alpha"
        );
        assert!(restore_dir.join("com.app/shared_prefs/p.xml").exists());
        assert!(!restore_dir.join("com.app/cache").exists());
    }

    #[test]
    fn current_dir_source_takes_only_matching_top_level_files() {
        let temp = tempfile::tempdir().unwrap();
        let app_dir = temp.path().join("app");
        write(&app_dir.join("base.apk"), b"base");
        write(&app_dir.join("split_config.arm64.apk"), b"split");
        write(&app_dir.join("oat/arm64/base.odex"), b"odex");
        write(&app_dir.join("notes.txt"), b"nope");

        let codec = TarCodec::new();
        let params = CompressionParams {
            compression: CompressionType::Lz4,
            level: 0,
        };
        let dst = temp.path().join("apk.tar.lz4");
        let out = codec.compress(
            &ArchiveSource::CurrentDir {
                dir: app_dir.clone(),
                pattern: "*.apk".to_string(),
            },
            &dst,
            &[],
            false,
            params,
            &no_progress,
        );
        assert!(out.success, "{:?}", out.lines);

        let scratch = temp.path().join("scratch");
        let out = codec.decompress(
            &dst,
            &scratch,
            &[],
            ExtractOptions {
                clear_destination: false,
                merge: true,
            },
            params,
            &no_progress,
        );
        assert!(out.success, "{:?}", out.lines);
        let mut names: Vec<String> = fs::read_dir(&scratch)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["base.apk", "split_config.arm64.apk"]);
    }

    #[test]
    fn current_dir_without_matches_fails_and_leaves_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let app_dir = temp.path().join("app");
        write(&app_dir.join("readme.txt"), b"x");

        let dst = temp.path().join("apk.tar.zst");
        let out = TarCodec::new().compress(
            &ArchiveSource::CurrentDir {
                dir: app_dir,
                pattern: "*.apk".to_string(),
            },
            &dst,
            &[],
            false,
            zstd(),
            &no_progress,
        );
        assert!(!out.success);
        assert!(!dst.exists());
        assert!(!partial_path(&dst).exists());
    }

    #[test]
    fn test_rejects_garbage_and_truncated_archives() {
        let temp = tempfile::tempdir().unwrap();
        let codec = TarCodec::new();

        let garbage = temp.path().join("garbage.tar.zst");
        fs::write(&garbage, b"definitely not an archive".repeat(64)).unwrap();
        assert!(!codec.test(&garbage, zstd()).success);

        let src_dir = temp.path().join("src");
        write(&src_dir.join("tree/big.bin"), &vec![7u8; 256 * 1024]);
        let tar_params = CompressionParams {
            compression: CompressionType::Tar,
            level: 0,
        };
        let dst = temp.path().join("data.tar");
        let out = codec.compress(
            &ArchiveSource::Tree {
                src_dir,
                src_name: "tree".to_string(),
            },
            &dst,
            &[],
            false,
            tar_params,
            &no_progress,
        );
        assert!(out.success);
        assert!(codec.test(&dst, tar_params).success);

        let bytes = fs::read(&dst).unwrap();
        fs::write(&dst, &bytes[..bytes.len() / 2]).unwrap();
        assert!(!codec.test(&dst, tar_params).success);
    }

    #[test]
    fn clear_destination_removes_stale_files_but_merge_false_is_stricter() {
        let temp = tempfile::tempdir().unwrap();
        let src_dir = temp.path().join("src");
        write(&src_dir.join("pkg/files/new.txt"), b"new");

        let codec = TarCodec::new();
        let dst = temp.path().join("data.tar.zst");
        assert!(
            codec
                .compress(
                    &ArchiveSource::Tree {
                        src_dir,
                        src_name: "pkg".to_string(),
                    },
                    &dst,
                    &[],
                    false,
                    zstd(),
                    &no_progress,
                )
                .success
        );

        let target = temp.path().join("target");
        write(&target.join("pkg/files/stale.txt"), b"stale");
        write(&target.join("pkg/cache/keep.bin"), b"keep");
        write(&target.join("other/untouched.txt"), b"other");

        let out = codec.decompress(
            &dst,
            &target,
            &["pkg/cache".to_string()],
            ExtractOptions {
                clear_destination: true,
                merge: true,
            },
            zstd(),
            &no_progress,
        );
        assert!(out.success, "{:?}", out.lines);
        assert!(target.join("pkg/files/new.txt").exists());
        assert!(!target.join("pkg/files/stale.txt").exists());
        assert!(target.join("pkg/cache/keep.bin").exists());
        assert!(target.join("other/untouched.txt").exists());
    }

    #[test]
    fn merge_mode_keeps_unrelated_files_under_the_root() {
        let temp = tempfile::tempdir().unwrap();
        let src_dir = temp.path().join("src");
        write(&src_dir.join("Music/a.mp3"), b"a");

        let codec = TarCodec::new();
        let dst = temp.path().join("media.tar.zst");
        assert!(
            codec
                .compress(
                    &ArchiveSource::Tree {
                        src_dir,
                        src_name: "Music".to_string(),
                    },
                    &dst,
                    &[],
                    false,
                    zstd(),
                    &no_progress,
                )
                .success
        );

        let merged = temp.path().join("merged");
        write(&merged.join("Music/local.mp3"), b"l");
        let opts = ExtractOptions {
            clear_destination: false,
            merge: true,
        };
        assert!(codec.decompress(&dst, &merged, &[], opts, zstd(), &no_progress).success);
        assert!(merged.join("Music/local.mp3").exists());
        assert!(merged.join("Music/a.mp3").exists());

        let replaced = temp.path().join("replaced");
        write(&replaced.join("Music/local.mp3"), b"l");
        let opts = ExtractOptions {
            clear_destination: false,
            merge: false,
        };
        assert!(codec.decompress(&dst, &replaced, &[], opts, zstd(), &no_progress).success);
        assert!(!replaced.join("Music/local.mp3").exists());
        assert!(replaced.join("Music/a.mp3").exists());
    }

    #[test]
    fn parses_tool_progress_lines() {
        let p = parse_tool_progress("data.tar.zst: 71% (71MiB, 238MiB/s)").unwrap();
        assert_eq!(p.bytes_processed, 71 * 1024 * 1024);
        assert_eq!(p.throughput_bps, 238 * 1024 * 1024);

        let p = parse_tool_progress("(512B, 1.5KiB/s)").unwrap();
        assert_eq!(p.bytes_processed, 512);
        assert_eq!(p.throughput_bps, 1536);

        assert!(parse_tool_progress("no progress here").is_none());
    }
}
