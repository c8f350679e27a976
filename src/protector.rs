//! Lua script protector: parse, compile, encrypt, and emit a VM program

use crate::balance::{check_balance, BalanceReport};
use crate::compiler::compile;
use crate::crypto::{CipherContext, EncryptedChunk};
use crate::parser::parse;
use crate::scrambler::OpcodeMap;
use crate::{ProtectConfig, ProtectError, ProtectResult, RuntimeGenerator};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Result of protecting a single file
#[derive(Debug)]
pub struct ProtectOutput {
    /// Original Lua file path
    pub source: PathBuf,
    /// Generated program path
    pub output: PathBuf,
    /// Original file size
    pub original_size: u64,
    /// Generated program size
    pub protected_size: u64,
    /// Balance report, when the check is enabled
    pub balance: Option<BalanceReport>,
}

/// Result of protecting a directory
#[derive(Debug, Default)]
pub struct ProtectSummary {
    /// Successfully protected files
    pub protected: Vec<ProtectOutput>,
    /// Files that were skipped (excluded or failed) and copied unchanged
    pub skipped: Vec<PathBuf>,
    /// Total original size
    pub total_original_size: u64,
    /// Total generated size
    pub total_protected_size: u64,
}

impl ProtectSummary {
    /// Protected files whose output failed the balance check
    pub fn unbalanced(&self) -> impl Iterator<Item = &ProtectOutput> {
        self.protected
            .iter()
            .filter(|o| o.balance.as_ref().is_some_and(|b| !b.is_balanced()))
    }
}

/// Lua script protector
pub struct Protector {
    config: ProtectConfig,
}

impl Protector {
    /// Create a new protector
    pub fn new(config: ProtectConfig) -> Self {
        Self { config }
    }

    /// Obfuscate Lua source into a self-contained program
    pub fn obfuscate(&self, source: &str) -> ProtectResult<String> {
        self.obfuscate_with_rng(source, &mut rand::thread_rng())
    }

    /// Obfuscate with a caller-supplied generator; a seeded one gives
    /// reproducible output
    pub fn obfuscate_with_rng<R: Rng + ?Sized>(
        &self,
        source: &str,
        rng: &mut R,
    ) -> ProtectResult<String> {
        let block = parse(source)?;
        let chunk = compile(&block)?;

        let map = OpcodeMap::scramble(rng);
        let ctx = CipherContext::generate(rng);
        let root = EncryptedChunk::encrypt(&chunk, &map, &ctx);
        tracing::debug!(bytes = root.total_bytes(), "Encrypted chunk tree");

        Ok(RuntimeGenerator::new(self.config.clone()).generate(&root, &map, &ctx, rng))
    }

    /// Protect a single Lua file into `<output_dir>/<stem>.lua`
    pub fn protect_file(&self, source: &Path, output_dir: &Path) -> ProtectResult<ProtectOutput> {
        if !source.is_file() {
            return Err(ProtectError::FileNotFound(source.display().to_string()));
        }
        let text = fs::read_to_string(source)?;
        let original_size = text.len() as u64;

        let stem = source
            .file_stem()
            .ok_or_else(|| ProtectError::FileNotFound(source.display().to_string()))?
            .to_string_lossy();
        let output_path = output_dir.join(format!("{stem}.lua"));

        let program = self.obfuscate(&text)?;
        let balance = self.config.check_balance.then(|| check_balance(&program));
        if let Some(report) = balance.as_ref().filter(|r| !r.is_balanced()) {
            tracing::warn!("Unbalanced output for {}: {}", source.display(), report);
        }

        fs::create_dir_all(output_dir)?;
        fs::write(&output_path, &program)?;

        Ok(ProtectOutput {
            source: source.to_path_buf(),
            output: output_path,
            original_size,
            protected_size: program.len() as u64,
            balance,
        })
    }

    /// Protect all Lua files in a directory
    pub fn protect_directory(
        &self,
        input_dir: &Path,
        output_dir: &Path,
    ) -> ProtectResult<ProtectSummary> {
        if !input_dir.is_dir() {
            return Err(ProtectError::FileNotFound(input_dir.display().to_string()));
        }
        let mut summary = ProtectSummary::default();
        fs::create_dir_all(output_dir)?;

        for entry in WalkDir::new(input_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "lua") && e.path().is_file())
        {
            let rel_path = entry.path().strip_prefix(input_dir).unwrap_or(entry.path());

            if self.should_exclude(rel_path) {
                tracing::warn!("Skipping excluded file: {}", rel_path.display());
                copy_unchanged(entry.path(), &output_dir.join(rel_path))?;
                summary.skipped.push(entry.path().to_path_buf());
                continue;
            }

            let output_subdir = match rel_path.parent() {
                Some(parent) => output_dir.join(parent),
                None => output_dir.to_path_buf(),
            };

            match self.protect_file(entry.path(), &output_subdir) {
                Ok(output) => {
                    tracing::info!(
                        "Protected: {} -> {} ({} -> {} bytes)",
                        output.source.display(),
                        output.output.display(),
                        output.original_size,
                        output.protected_size
                    );
                    summary.total_original_size += output.original_size;
                    summary.total_protected_size += output.protected_size;
                    summary.protected.push(output);
                }
                Err(e) => {
                    tracing::warn!("Failed to protect {}: {}", entry.path().display(), e);
                    copy_unchanged(entry.path(), &output_dir.join(rel_path))?;
                    summary.skipped.push(entry.path().to_path_buf());
                }
            }
        }

        Ok(summary)
    }

    /// Check if a file should be excluded
    fn should_exclude(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy().replace('\\', "/");

        self.config.exclude.iter().any(|pattern| {
            if pattern.contains('*') || pattern.contains('?') {
                regex::Regex::new(&glob_to_regex(pattern))
                    .map(|re| re.is_match(&path_str))
                    .unwrap_or(false)
            } else {
                path_str.contains(pattern.as_str())
            }
        })
    }
}

fn copy_unchanged(source: &Path, dest: &Path) -> ProtectResult<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, dest)?;
    Ok(())
}

/// Translate a path glob into an anchored regex
///
/// `**/` matches zero or more directories, `*` and `?` stay inside one
/// path segment.
fn glob_to_regex(pattern: &str) -> String {
    let pattern = pattern.replace('\\', "/");
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }

    out.push('$');
    out
}
