//! File acquisition: memory-mapped reads with a buffered fallback.
//!
//! [`FileAcquirer::read`] never fails. Any error degrades to the buffered path, and an
//! unreadable file yields empty content (which downstream treats as zero blocks).

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use memmap2::Mmap;

use crate::config::ChunkerConfig;
use crate::error::{ChunkerError, ErrorCategory, ErrorReporter, Result};
use crate::metrics::{current_platform, ReadMetrics};

/// Files above this size are never mapped
pub const MAX_MAPPED_FILE_BYTES: u64 = 1024 * 1024 * 1024;

const PROBE_PAYLOAD: &[u8] = b"code-index-chunker mapped read probe\n";

const BINARY_SNIFF_BYTES: usize = 1024;

/// Settings the acquirer reads from [`ChunkerConfig`]
#[derive(Debug, Clone)]
pub struct AcquirerSettings {
    pub use_mapped_reads: bool,
    pub mapped_min_file_size_bytes: u64,
    pub platform_denylist: Vec<String>,
}

impl From<&ChunkerConfig> for AcquirerSettings {
    fn from(config: &ChunkerConfig) -> Self {
        Self {
            use_mapped_reads: config.use_mapped_file_reading,
            mapped_min_file_size_bytes: config.mapped_min_file_size_bytes,
            platform_denylist: config.mapped_platform_denylist.clone(),
        }
    }
}

#[derive(Debug)]
pub struct FileAcquirer {
    settings: AcquirerSettings,
    metrics: Arc<ReadMetrics>,
    errors: Arc<ErrorReporter>,
    platform: String,
    mapping_compatible: OnceLock<bool>,
}

impl FileAcquirer {
    pub fn new(
        settings: AcquirerSettings,
        metrics: Arc<ReadMetrics>,
        errors: Arc<ErrorReporter>,
    ) -> Self {
        Self {
            settings,
            metrics,
            errors,
            platform: current_platform(),
            mapping_compatible: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ReadMetrics> {
        &self.metrics
    }

    /// Read a file as text, replacing invalid UTF-8 sequences.
    ///
    /// `size_hint` skips the `stat` call when the caller already knows the size.
    pub fn read(&self, path: &Path, size_hint: Option<u64>) -> String {
        if !self.settings.use_mapped_reads {
            return self.read_buffered(path);
        }

        let size = match size_hint {
            Some(size) => size,
            None => match std::fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(_) => return self.read_buffered(path),
            },
        };

        if size < self.settings.mapped_min_file_size_bytes {
            return self.read_buffered(path);
        }

        if !self.is_mapping_compatible() {
            log::debug!("Mapped reads unavailable on {}, using buffered read", self.platform);
            self.metrics.record_mapped_skip();
            return self.read_buffered(path);
        }

        if size > MAX_MAPPED_FILE_BYTES {
            log::debug!(
                "{} exceeds the mapped read ceiling ({size} > {MAX_MAPPED_FILE_BYTES})",
                path.display()
            );
            self.metrics.record_mapped_skip();
            return self.read_buffered(path);
        }

        self.metrics.record_mapped_attempt();
        let started = Instant::now();
        match map_and_decode(path) {
            Ok((content, mapped_len)) => {
                self.metrics
                    .record_mapped_success(&self.platform, mapped_len, started.elapsed());
                content
            }
            Err(e) => {
                log::warn!(
                    "Mapped read failed for {}, falling back to buffered read: {e}",
                    path.display()
                );
                self.metrics.record_mapped_failure(&self.platform);
                self.read_buffered(path)
            }
        }
    }

    /// Result of the one-time compatibility probe, computed on first use.
    pub fn is_mapping_compatible(&self) -> bool {
        *self
            .mapping_compatible
            .get_or_init(|| probe_mapping(&self.platform, &self.settings.platform_denylist))
    }

    fn read_buffered(&self, path: &Path) -> String {
        match std::fs::read(path) {
            Ok(bytes) => {
                self.metrics.record_buffered_read(bytes.len() as u64);
                decode_lossy(&bytes)
            }
            Err(e) => {
                self.metrics.record_buffered_failure();
                self.errors.report(
                    ErrorCategory::FileSystem,
                    "acquirer",
                    "read",
                    format!("{}: {e}", path.display()),
                );
                String::new()
            }
        }
    }
}

fn map_and_decode(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path)?;
    let on_disk = file.metadata()?.len();
    if on_disk == 0 {
        return Ok((String::new(), 0));
    }

    // SAFETY: the mapping is read-only and copied out before it is dropped. A concurrent
    // truncation is caught by the length check below.
    let map = unsafe { Mmap::map(&file)? };
    let mapped_len = map.len() as u64;
    if mapped_len != on_disk {
        return Err(ChunkerError::Other(format!(
            "mapped length {mapped_len} does not match on-disk size {on_disk}"
        )));
    }

    Ok((decode_lossy(&map), mapped_len))
}

fn probe_mapping(platform: &str, denylist: &[String]) -> bool {
    if cfg!(target_family = "wasm") {
        return false;
    }

    if denylist.iter().any(|denied| denied.eq_ignore_ascii_case(platform)) {
        log::debug!("Mapped reads disabled by denylist for {platform}");
        return false;
    }

    match smoke_test_mapping() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Mapped read probe failed on {platform}: {e}");
            false
        }
    }
}

fn smoke_test_mapping() -> Result<()> {
    let mut scratch = tempfile::tempfile()?;
    scratch.write_all(PROBE_PAYLOAD)?;
    scratch.flush()?;

    // SAFETY: the scratch file is private to this process and not modified while mapped.
    let map = unsafe { Mmap::map(&scratch)? };
    if &map[..] == PROBE_PAYLOAD {
        Ok(())
    } else {
        Err(ChunkerError::Other(
            "mapped probe content mismatch".to_string(),
        ))
    }
}

/// Decode bytes as UTF-8, replacing invalid sequences with U+FFFD
#[must_use]
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Heuristic binary check over the first KiB: a NUL byte, or under 70% printable.
///
/// Invalid UTF-8 and control characters other than tab, CR and LF count as
/// unprintable, so the check gives the same answer on raw bytes and on their lossy
/// decoding.
#[must_use]
pub fn looks_binary(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sample.contains(&0) {
        return true;
    }

    let mut total = 0usize;
    let mut unprintable = 0usize;
    for ch in String::from_utf8_lossy(sample).chars() {
        total += 1;
        if ch == char::REPLACEMENT_CHARACTER
            || (ch.is_control() && !matches!(ch, '\n' | '\r' | '\t'))
        {
            unprintable += 1;
        }
    }
    total > 0 && unprintable * 10 > total * 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn acquirer(use_mapped_reads: bool, denylist: Vec<String>) -> FileAcquirer {
        FileAcquirer::new(
            AcquirerSettings {
                use_mapped_reads,
                mapped_min_file_size_bytes: 0,
                platform_denylist: denylist,
            },
            Arc::new(ReadMetrics::new()),
            Arc::new(ErrorReporter::new()),
        )
    }

    #[test]
    fn buffered_read_when_mapping_disabled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();

        let acquirer = acquirer(false, vec![]);
        assert_eq!(acquirer.read(&path, None), "hello");

        let snapshot = acquirer.metrics().snapshot();
        assert_eq!(snapshot.buffered_reads, 1);
        assert_eq!(snapshot.mapped_attempts, 0);
        assert_eq!(snapshot.bytes_read, 5);
    }

    #[cfg(unix)]
    #[test]
    fn mapped_read_records_success() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.rs");
        let body = "fn main() {}\n".repeat(100);
        std::fs::write(&path, &body).unwrap();

        let acquirer = acquirer(true, vec![]);
        assert!(acquirer.is_mapping_compatible());
        assert_eq!(acquirer.read(&path, None), body);

        let snapshot = acquirer.metrics().snapshot();
        assert_eq!(snapshot.mapped_attempts, 1);
        assert_eq!(snapshot.mapped_successes, 1);
        assert_eq!(snapshot.platforms[&current_platform()].successes, 1);
    }

    #[test]
    fn denylisted_platform_falls_back_to_buffered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "content").unwrap();

        let acquirer = acquirer(true, vec![current_platform().to_uppercase()]);
        assert!(!acquirer.is_mapping_compatible());
        assert_eq!(acquirer.read(&path, None), "content");

        let snapshot = acquirer.metrics().snapshot();
        assert_eq!(snapshot.mapped_attempts, 0);
        assert_eq!(snapshot.mapped_fallbacks, 1);
        assert_eq!(snapshot.buffered_reads, 1);
    }

    #[test]
    fn missing_file_yields_empty_content() {
        let dir = TempDir::new().unwrap();
        let acquirer = acquirer(true, vec![]);
        let content = acquirer.read(&dir.path().join("missing.rs"), None);
        assert!(content.is_empty());

        let snapshot = acquirer.metrics().snapshot();
        assert_eq!(snapshot.buffered_failures, 1);
        assert_eq!(acquirer.errors.count(ErrorCategory::FileSystem), 1);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("latin1.txt");
        std::fs::write(&path, [b'a', 0xff, b'b']).unwrap();

        let acquirer = acquirer(false, vec![]);
        assert_eq!(acquirer.read(&path, None), "a\u{fffd}b");
    }

    #[test]
    fn binary_detection() {
        assert!(looks_binary(&[0x89, b'P', b'N', b'G', 0, 0, 0]));
        assert!(looks_binary(&[1, 2, 3, 4, 5, 6, 7, 8, b'a', b'b']));
        assert!(!looks_binary(b"plain text\nwith lines\n"));
        assert!(!looks_binary("héllo wörld".as_bytes()));
        assert!(!looks_binary(b""));
    }

    #[test]
    fn binary_detection_agrees_after_decoding() {
        let raw = [0xffu8, 0xfe, 0xfa, b'a', 0xc3, 0x28, 0xa0, 0xa1];
        assert!(looks_binary(&raw));
        assert!(looks_binary(decode_lossy(&raw).as_bytes()));

        let text = "caf\u{e9} au lait\n".repeat(10);
        assert!(!looks_binary(text.as_bytes()));
    }
}
