//! Core-file inspection: size, content hash, and executable path.
//!
//! The executable path comes out of the dump via a strict fallback chain
//! over three external utilities:
//!
//! 1. `file -Pelf_phnum=10000` — fast, and carries the `from '…'` /
//!    `execfn: '…'` hint from the ELF notes. Dumps with thousands of
//!    program headers trip its limit.
//! 2. `readelf -n` — reads the note section directly; `psargs` may spread
//!    across lines and carries the full command line.
//! 3. `strings -n 8` — last-ditch scan for plausible absolute paths.
//!
//! Hashing streams the file into MD5 under a process-wide semaphore so a
//! burst of simultaneous crashes cannot saturate node I/O.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::debug;

/// Default concurrent MD5 computations.
pub const DEFAULT_HASH_CONCURRENCY: usize = 2;

/// Hard bounds for the hash concurrency cap.
const MIN_HASH_CONCURRENCY: usize = 1;
const MAX_HASH_CONCURRENCY: usize = 10;

/// Read buffer for MD5 streaming.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Errors that can occur during core-file inspection.
///
/// Any of these fails the whole inspection; the caller skips the file.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error("failed to stat core file: {0}")]
    Stat(#[source] std::io::Error),

    #[error("failed to hash core file: {0}")]
    Hash(#[source] std::io::Error),

    #[error("{utility} failed: {source}")]
    Command {
        utility: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not extract executable path from {0}")]
    NoExecutablePath(String),

    #[error("hash semaphore closed")]
    SemaphoreClosed,
}

/// Everything `parse` extracts from one core file.
#[derive(Debug, Clone)]
pub struct CoreInfo {
    /// File size in bytes.
    pub size: u64,
    /// Lowercase hex MD5 of the file bytes.
    pub md5: String,
    /// Absolute path of the crashed executable, best effort.
    pub executable_path: String,
    /// Basename of `executable_path`.
    pub process_name: String,
}

/// Inspects core files under a bounded hash-concurrency cap.
pub struct CoreInspector {
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

impl Default for CoreInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreInspector {
    pub fn new() -> Self {
        Self::with_concurrency(DEFAULT_HASH_CONCURRENCY)
    }

    /// Create an inspector with a specific hash-concurrency cap, clamped
    /// to [1, 10].
    pub fn with_concurrency(n: usize) -> Self {
        let concurrency = n.clamp(MIN_HASH_CONCURRENCY, MAX_HASH_CONCURRENCY);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// Replace the hash-concurrency cap, clamped to [1, 10].
    pub fn set_concurrency(&mut self, n: usize) {
        let concurrency = n.clamp(MIN_HASH_CONCURRENCY, MAX_HASH_CONCURRENCY);
        self.semaphore = Arc::new(Semaphore::new(concurrency));
        self.concurrency = concurrency;
    }

    /// Current hash-concurrency cap.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Inspect one core file. All three of size, hash, and executable
    /// path must be produced or the inspection fails.
    pub async fn parse(&self, path: &Path) -> Result<CoreInfo, InspectError> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(InspectError::Stat)?
            .len();

        let md5 = self.hash_file(path).await?;
        let executable_path = extract_executable_path(path).await?;
        let process_name = process_name(&executable_path);

        Ok(CoreInfo {
            size,
            md5,
            executable_path,
            process_name,
        })
    }

    /// Stream the file into MD5 while holding one semaphore slot.
    async fn hash_file(&self, path: &Path) -> Result<String, InspectError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| InspectError::SemaphoreClosed)?;

        let mut file = tokio::fs::File::open(path).await.map_err(InspectError::Hash)?;
        let mut context = md5::Context::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(InspectError::Hash)?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
        }
        Ok(format!("{:x}", context.compute()))
    }
}

/// Basename of an executable path; empty in, empty out.
pub fn process_name(executable_path: &str) -> String {
    if executable_path.is_empty() {
        return String::new();
    }
    Path::new(executable_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Run the fallback chain. First success wins.
async fn extract_executable_path(path: &Path) -> Result<String, InspectError> {
    let path_arg = path.to_string_lossy();

    match run_utility("file", &["-Pelf_phnum=10000", &path_arg]).await {
        Ok(output) => {
            if has_too_many_program_headers(&output) {
                debug!(path = %path.display(), "file reported too many program headers, trying readelf");
            } else if let Some(exec) = extract_from_file_output(&output) {
                return Ok(exec);
            }
        }
        Err(e) => debug!(path = %path.display(), error = %e, "file command failed, trying readelf"),
    }

    match run_utility("readelf", &["-n", &path_arg]).await {
        Ok(output) => {
            if let Some(exec) = extract_from_readelf_output(&output) {
                return Ok(exec);
            }
        }
        Err(e) => debug!(path = %path.display(), error = %e, "readelf failed, trying strings"),
    }

    let output = run_utility("strings", &["-n", "8", &path_arg])
        .await
        .map_err(|source| InspectError::Command {
            utility: "strings",
            source,
        })?;
    extract_from_strings_output(&output)
        .ok_or_else(|| InspectError::NoExecutablePath(path.display().to_string()))
}

async fn run_utility(program: &'static str, args: &[&str]) -> std::io::Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "{program} exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn from_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"from '([^']+)'").unwrap())
}

fn execfn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"execfn: '([^']+)'").unwrap())
}

fn psargs_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"psargs:\s+([^\n]+)").unwrap())
}

/// `file` output carries the originating binary as `from '…'` or, on some
/// builds, `execfn: '…'`. `from` wins when both appear.
fn extract_from_file_output(output: &str) -> Option<String> {
    if let Some(caps) = from_regex().captures(output) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = execfn_regex().captures(output) {
        return Some(caps[1].to_string());
    }
    None
}

fn has_too_many_program_headers(output: &str) -> bool {
    output.contains("too many program headers")
}

/// `readelf -n` formats `psargs` as the full command line, possibly
/// wrapped; the first whitespace-delimited token is the executable.
fn extract_from_readelf_output(output: &str) -> Option<String> {
    let caps = psargs_regex().captures(output)?;
    caps[1]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Roots under which an executable plausibly lives.
const STRINGS_ROOTS: [&str; 7] = ["/usr/", "/opt/", "/bin/", "/sbin/", "/home/", "/var/", "/tmp/"];

/// Prefixes strongly suggesting the main binary rather than a data path.
const PREFERRED_PREFIXES: [&str; 4] = ["/usr/bin/", "/usr/local/bin/", "/opt/", "/app/"];

/// Scan `strings` output for the most plausible executable path: shared
/// libraries are excluded, well-known binary prefixes win outright, and
/// the first other match under a known root is the fallback.
fn extract_from_strings_output(output: &str) -> Option<String> {
    let mut fallback: Option<&str> = None;
    for line in output.lines() {
        let line = line.trim();
        let preferred = PREFERRED_PREFIXES.iter().any(|p| line.starts_with(p));
        let under_root = STRINGS_ROOTS.iter().any(|r| line.starts_with(r));
        if !preferred && !under_root {
            continue;
        }
        if line.contains(".so") || line.contains("/lib/") {
            continue;
        }
        if line.contains(char::is_whitespace) {
            continue;
        }
        if preferred {
            return Some(line.to_string());
        }
        if fallback.is_none() {
            fallback = Some(line);
        }
    }
    fallback.map(str::to_string)
}
