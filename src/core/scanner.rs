use crate::error::{Result, SyncError};
use crate::storage::FileType;
use regex::Regex;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 忽略规则匹配器，glob 在构造时编译为正则
///
/// - `**` 匹配任意层级
/// - `*` 与 `?` 不跨越 `/`
/// - 以 `/` 开头或含 `/` 的规则相对工作区根目录
/// - 不含 `/` 的规则匹配任意层级的文件名
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    patterns: Vec<(String, Regex, bool)>,
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

impl IgnoreMatcher {
    pub fn new(patterns: &[String]) -> Self {
        let mut compiled = Vec::new();
        for pattern in patterns {
            let trimmed = pattern.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let basename_only = !trimmed.contains('/');
            let body = trimmed.trim_start_matches('/');
            match Regex::new(&glob_to_regex(body)) {
                Ok(re) => compiled.push((trimmed.to_string(), re, basename_only)),
                Err(e) => warn!("忽略规则无效 {}: {}", trimmed, e),
            }
        }
        Self { patterns: compiled }
    }

    /// `relpath` 相对工作区根目录，使用 `/` 分隔
    pub fn is_ignored(&self, relpath: &str, is_dir: bool) -> bool {
        let path = relpath.trim_start_matches('/');
        if path.is_empty() {
            return false;
        }
        let basename = path.rsplit('/').next().unwrap_or(path);
        let as_dir = format!("{}/", path);

        self.patterns.iter().any(|(source, re, basename_only)| {
            let hit = if *basename_only {
                re.is_match(basename)
            } else {
                re.is_match(path) || (is_dir && re.is_match(&as_dir))
            };
            if hit {
                debug!("忽略 {} (规则 {})", path, source);
            }
            hit
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// 本地条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: FileType,
    pub size: u64,
    /// 修改时间（毫秒）
    pub mtime: i64,
}

pub fn mtime_ms(meta: &Metadata) -> i64 {
    meta.modified()
        .map(crate::storage::system_time_ms)
        .unwrap_or(0)
}

fn entry_from_metadata(path: &Path, meta: &Metadata) -> LocalEntry {
    let kind = if meta.file_type().is_symlink() {
        FileType::SymLink
    } else if meta.is_dir() {
        FileType::Directory
    } else {
        FileType::File
    };
    LocalEntry {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_path_buf(),
        kind,
        size: if kind == FileType::File { meta.len() } else { 0 },
        mtime: mtime_ms(meta),
    }
}

/// 本地路径状态，不存在时返回 `None`
pub async fn local_stat(path: &Path) -> Result<Option<LocalEntry>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => Ok(Some(entry_from_metadata(path, &meta))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 列出本地目录的直接子项（不跟随符号链接）
pub async fn scan_dir(dir: &Path) -> Result<Vec<LocalEntry>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| SyncError::Other(anyhow::Error::new(e)))?;
            let meta = entry
                .metadata()
                .map_err(|e| SyncError::Other(anyhow::Error::new(e)))?;
            entries.push(entry_from_metadata(entry.path(), &meta));
        }
        Ok(entries)
    })
    .await
    .map_err(crate::storage::join_error)?
}
