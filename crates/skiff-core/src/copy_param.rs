//! Declarative transfer policy: which files a transfer touches, how their
//! names are rewritten, and what gets preserved. Consumed read-only by the
//! controller, the synchronization engine, and backends.

use serde::{Deserialize, Serialize};

use crate::progress::BatchOverwrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferMode {
    #[default]
    Binary,
    Ascii,
    /// Pick binary/ascii per file from `ascii_mask`.
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileNameCase {
    #[default]
    NoChange,
    Upper,
    Lower,
    FirstUpper,
    /// Lowercase only names that are entirely uppercase (8.3 listings).
    LowerIfUpper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResumePolicy {
    #[default]
    Smart,
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    Local,
    Remote,
}

/// Size/time attributes a mask may constrain on.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskParams {
    pub size: u64,
}

/// Allow/deny name masks with size limits. Compiled glob sets are caches and
/// are rebuilt lazily after deserialization or [`TransferMask::clone_without_cache`].
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct TransferMask {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub exclude_dirs: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    #[serde(skip)]
    compiled_include: Option<globset::GlobSet>,
    #[serde(skip)]
    compiled_exclude: Option<globset::GlobSet>,
    #[serde(skip)]
    compiled_exclude_dirs: Option<globset::GlobSet>,
}

impl TransferMask {
    /// Shallow clone preserving the user-specified patterns while dropping
    /// compiled glob caches, so helpers can reuse masks without sharing
    /// mutable compilation state.
    pub fn clone_without_cache(&self) -> Self {
        Self {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            exclude_dirs: self.exclude_dirs.clone(),
            min_size: self.min_size,
            max_size: self.max_size,
            compiled_include: None,
            compiled_exclude: None,
            compiled_exclude_dirs: None,
        }
    }

    fn ensure_compiled(&mut self) {
        fn compile(patterns: &[String]) -> Option<globset::GlobSet> {
            let mut builder = globset::GlobSetBuilder::new();
            for pattern in patterns {
                if let Ok(glob) = globset::Glob::new(pattern) {
                    builder.add(glob);
                }
            }
            builder.build().ok()
        }
        if self.compiled_include.is_none() && !self.include.is_empty() {
            self.compiled_include = compile(&self.include);
        }
        if self.compiled_exclude.is_none() && !self.exclude.is_empty() {
            self.compiled_exclude = compile(&self.exclude);
        }
        if self.compiled_exclude_dirs.is_none() && !self.exclude_dirs.is_empty() {
            self.compiled_exclude_dirs = compile(&self.exclude_dirs);
        }
    }

    pub fn allows(&mut self, name: &str, is_directory: bool, params: MaskParams) -> bool {
        self.ensure_compiled();

        if is_directory {
            if let Some(set) = &self.compiled_exclude_dirs {
                if set.is_match(name) {
                    return false;
                }
            }
            return true;
        }

        if let Some(set) = &self.compiled_exclude {
            if set.is_match(name) {
                return false;
            }
        }
        if let Some(set) = &self.compiled_include {
            if !set.is_match(name) {
                return false;
            }
        }
        if let Some(min) = self.min_size {
            if params.size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size {
            if params.size > max {
                return false;
            }
        }
        true
    }
}

/// The transfer policy bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyParam {
    pub transfer_mode: TransferMode,
    pub ascii_mask: Vec<String>,
    pub file_name_case: FileNameCase,
    pub mask: TransferMask,
    pub preserve_time: bool,
    pub preserve_time_dirs: bool,
    pub preserve_rights: bool,
    /// Octal rights applied on upload when `preserve_rights` is off.
    pub default_rights: u32,
    pub resume: ResumePolicy,
    /// Files below this size never resume under `ResumePolicy::Smart`.
    pub resume_threshold: u64,
    /// Bandwidth cap in bytes per second; 0 means unlimited.
    pub cps_limit: u64,
    pub newer_only: bool,
    /// Default sticky answer a bulk operation starts with.
    pub batch_overwrite: BatchOverwrite,
    pub remove_ctrl_z: bool,
    pub remove_bom: bool,
    pub clear_archive: bool,
}

impl Default for CopyParam {
    fn default() -> Self {
        Self {
            transfer_mode: TransferMode::Binary,
            ascii_mask: vec!["*.txt".into(), "*.html".into(), "*.php".into(), "*.xml".into()],
            file_name_case: FileNameCase::NoChange,
            mask: TransferMask::default(),
            preserve_time: true,
            preserve_time_dirs: false,
            preserve_rights: false,
            default_rights: 0o644,
            resume: ResumePolicy::Smart,
            resume_threshold: 100 * 1024,
            cps_limit: 0,
            newer_only: false,
            batch_overwrite: BatchOverwrite::No,
            remove_ctrl_z: false,
            remove_bom: false,
            clear_archive: false,
        }
    }
}

impl CopyParam {
    /// Apply the configured case mapping when a name crosses sides.
    pub fn change_file_name(&self, name: &str, side: TransferSide) -> String {
        // Case mapping is defined for names arriving from the remote side;
        // local names upload verbatim.
        if side == TransferSide::Local {
            return name.to_string();
        }
        match self.file_name_case {
            FileNameCase::NoChange => name.to_string(),
            FileNameCase::Upper => name.to_uppercase(),
            FileNameCase::Lower => name.to_lowercase(),
            FileNameCase::FirstUpper => {
                let mut chars = name.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            }
            FileNameCase::LowerIfUpper => {
                if name.chars().any(|c| c.is_lowercase()) {
                    name.to_string()
                } else {
                    name.to_lowercase()
                }
            }
        }
    }

    /// Mask check for one candidate file or directory.
    pub fn allow_transfer(
        &self,
        name: &str,
        _side: TransferSide,
        is_directory: bool,
        params: MaskParams,
    ) -> bool {
        // Work on a cache-free clone; the policy itself stays read-only.
        let mut mask = self.mask.clone_without_cache();
        mask.allows(name, is_directory, params)
    }

    /// Effective per-file transfer mode.
    pub fn use_ascii(&self, name: &str) -> bool {
        match self.transfer_mode {
            TransferMode::Binary => false,
            TransferMode::Ascii => true,
            TransferMode::Automatic => {
                let mut builder = globset::GlobSetBuilder::new();
                for pattern in &self.ascii_mask {
                    if let Ok(glob) = globset::Glob::new(pattern) {
                        builder.add(glob);
                    }
                }
                builder.build().map(|set| set.is_match(name)).unwrap_or(false)
            }
        }
    }
}

/// Rewrite `name` through a rename mask: `*` copies the whole source part,
/// `?` copies one character, anything else is literal. The extension part of
/// the mask (after the last dot) applies to the extension of the name.
pub fn mask_file_name(name: &str, mask: &str) -> String {
    if mask.is_empty() || mask == "*" || mask == "*.*" {
        return name.to_string();
    }

    let (name_base, name_ext) = match name.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => (base, Some(ext)),
        _ => (name, None),
    };
    let (mask_base, mask_ext) = match mask.rsplit_once('.') {
        Some((base, ext)) => (base, Some(ext)),
        None => (mask, None),
    };

    let mut result = expand_mask_part(mask_base, name_base);
    match mask_ext {
        Some(ext_mask) => {
            let ext = expand_mask_part(ext_mask, name_ext.unwrap_or(""));
            if !ext.is_empty() {
                result.push('.');
                result.push_str(&ext);
            }
        }
        None => {
            if let Some(ext) = name_ext {
                result.push('.');
                result.push_str(ext);
            }
        }
    }
    result
}

fn expand_mask_part(mask: &str, source: &str) -> String {
    let mut out = String::new();
    let mut source_chars = source.chars();
    for ch in mask.chars() {
        match ch {
            '*' => {
                out.push_str(source_chars.as_str());
                source_chars = "".chars();
            }
            '?' => {
                if let Some(next) = source_chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_excludes_by_pattern_and_size() {
        let mut mask = TransferMask {
            exclude: vec!["*.bak".into()],
            max_size: Some(1000),
            ..TransferMask::default()
        };
        assert!(mask.allows("report.txt", false, MaskParams { size: 10 }));
        assert!(!mask.allows("report.bak", false, MaskParams { size: 10 }));
        assert!(!mask.allows("big.bin", false, MaskParams { size: 4000 }));
    }

    #[test]
    fn directory_masks_only_consult_dir_patterns() {
        let mut mask = TransferMask {
            exclude: vec!["*".into()],
            exclude_dirs: vec![".git".into()],
            ..TransferMask::default()
        };
        assert!(mask.allows("src", true, MaskParams::default()));
        assert!(!mask.allows(".git", true, MaskParams::default()));
    }

    #[test]
    fn case_mapping_applies_to_remote_names() {
        let param = CopyParam {
            file_name_case: FileNameCase::Lower,
            ..CopyParam::default()
        };
        assert_eq!(param.change_file_name("README.TXT", TransferSide::Remote), "readme.txt");
        assert_eq!(param.change_file_name("README.TXT", TransferSide::Local), "README.TXT");
    }

    #[test]
    fn rename_mask_expansion() {
        assert_eq!(mask_file_name("x.txt", "*-20260802-113000.*"), "x-20260802-113000.txt");
        assert_eq!(mask_file_name("notes", "*-old.*"), "notes-old");
        assert_eq!(mask_file_name("a.tar.gz", "*.bak"), "a.tar.bak");
        assert_eq!(mask_file_name("anything", "*.*"), "anything");
    }

    #[test]
    fn automatic_mode_uses_ascii_mask() {
        let param = CopyParam {
            transfer_mode: TransferMode::Automatic,
            ..CopyParam::default()
        };
        assert!(param.use_ascii("readme.txt"));
        assert!(!param.use_ascii("image.png"));
    }
}
