use anyhow::{Context, Result};
use blake3::Hasher;
use ignore::WalkBuilder;
use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub hash: String,
    pub size: u64,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    /// Interpreter names recognised on a `#!` line.
    pub interpreters: &'static [&'static str],
    /// Prose chunked into text nodes instead of parsed.
    pub document: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub no_ignore: bool,
}

impl ScanOptions {
    pub fn new(no_ignore: bool) -> Self {
        Self { no_ignore }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { no_ignore: false }
    }
}

static LANGUAGE_SPECS: &[LanguageSpec] = &[
    LanguageSpec {
        name: "python",
        extensions: &["py", "pyi"],
        interpreters: &["python", "python3", "python2"],
        document: false,
    },
    LanguageSpec {
        name: "rust",
        extensions: &["rs"],
        interpreters: &[],
        document: false,
    },
    LanguageSpec {
        name: "javascript",
        extensions: &["js", "jsx", "mjs", "cjs"],
        interpreters: &["node", "nodejs"],
        document: false,
    },
    LanguageSpec {
        name: "typescript",
        extensions: &["ts", "mts", "cts"],
        interpreters: &["ts-node", "deno"],
        document: false,
    },
    LanguageSpec {
        name: "tsx",
        extensions: &["tsx"],
        interpreters: &[],
        document: false,
    },
    LanguageSpec {
        name: "go",
        extensions: &["go"],
        interpreters: &[],
        document: false,
    },
    LanguageSpec {
        name: "csharp",
        extensions: &["cs", "csx"],
        interpreters: &[],
        document: false,
    },
    LanguageSpec {
        name: "markdown",
        extensions: &["md", "markdown"],
        interpreters: &[],
        document: true,
    },
    LanguageSpec {
        name: "rst",
        extensions: &["rst"],
        interpreters: &[],
        document: true,
    },
    LanguageSpec {
        name: "text",
        extensions: &["txt"],
        interpreters: &[],
        document: true,
    },
];

pub fn language_specs() -> &'static [LanguageSpec] {
    LANGUAGE_SPECS
}

pub fn is_document(language: &str) -> bool {
    LANGUAGE_SPECS
        .iter()
        .any(|spec| spec.document && spec.name == language)
}

/// Every non-ignored regular file under `repo_root`, sorted.
pub fn walk_files(repo_root: &Path, options: ScanOptions) -> Vec<PathBuf> {
    let mut builder = WalkBuilder::new(repo_root);
    if options.no_ignore {
        builder
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .parents(false);
    } else {
        builder
            .ignore(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .parents(true)
            .require_git(false);
    }
    let walker = builder
        .hidden(false)
        .filter_entry(|entry| !is_ignored_entry(entry))
        .build();

    let mut paths = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "walk error");
                continue;
            }
        };
        if entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            paths.push(entry.into_path());
        }
    }
    paths.sort();
    paths
}

pub fn scan_repo(repo_root: &Path) -> Result<Vec<ScannedFile>> {
    scan_repo_with_options(repo_root, ScanOptions::default())
}

pub fn scan_repo_with_options(repo_root: &Path, options: ScanOptions) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    for path in walk_files(repo_root, options) {
        if let Some(file) = scan_path(repo_root, &path)? {
            files.push(file);
        }
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

/// Scan an explicit set of repository-relative paths (a changed-file set).
pub fn scan_rel_paths(repo_root: &Path, rel_paths: &[String]) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    for rel in rel_paths {
        if let Some(file) = scan_path(repo_root, &repo_root.join(rel))? {
            files.push(file);
        }
    }
    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    files.dedup_by(|a, b| a.rel_path == b.rel_path);
    Ok(files)
}

fn is_ignored_entry(entry: &ignore::DirEntry) -> bool {
    match entry.file_name() {
        name if name == OsStr::new(".repograph") => true,
        name if name == OsStr::new(".git") => true,
        _ => false,
    }
}

pub fn scan_path(repo_root: &Path, path: &Path) -> Result<Option<ScannedFile>> {
    if !path.is_file() {
        return Ok(None);
    }
    let language = match detect_language(path) {
        Some(value) => value,
        None => return Ok(None),
    };
    let rel_path = match crate::util::normalize_rel_path(repo_root, path) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    let metadata = fs::metadata(path)?;
    let hash = hash_file(path).with_context(|| format!("hash {}", path.display()))?;
    Ok(Some(ScannedFile {
        rel_path,
        abs_path: path.to_path_buf(),
        hash,
        size: metadata.len(),
        language: language.to_string(),
    }))
}

/// Extension first; files without one are sniffed for a shebang.
pub fn detect_language(path: &Path) -> Option<&'static str> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => LANGUAGE_SPECS
            .iter()
            .find(|spec| spec.extensions.contains(&ext))
            .map(|spec| spec.name),
        None => sniff_shebang(path),
    }
}

fn sniff_shebang(path: &Path) -> Option<&'static str> {
    let mut head = [0u8; 128];
    let read = fs::File::open(path).ok()?.read(&mut head).ok()?;
    let text = std::str::from_utf8(&head[..read]).ok()?;
    language_from_shebang(text.lines().next()?)
}

pub fn language_from_shebang(line: &str) -> Option<&'static str> {
    let rest = line.strip_prefix("#!")?;
    let mut parts = rest.split_whitespace();
    let program = parts.next()?;
    let mut interpreter = program.rsplit('/').next()?;
    if interpreter == "env" {
        interpreter = parts.find(|part| !part.starts_with('-'))?;
    }
    LANGUAGE_SPECS
        .iter()
        .find(|spec| spec.interpreters.contains(&interpreter))
        .map(|spec| spec.name)
}

fn hash_file(path: &Path) -> Result<String> {
    let data = fs::read(path)?;
    let mut hasher = Hasher::new();
    hasher.update(&data);
    Ok(hasher.finalize().to_hex().to_string())
}
