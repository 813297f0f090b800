//! Remote directory entries and listings, plus unix-path helpers shared by
//! the controller and the synchronization engine.

use chrono::{DateTime, Timelike, Utc};

pub const THIS_DIRECTORY: &str = ".";
pub const PARENT_DIRECTORY: &str = "..";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Special,
}

/// Granularity of a remote modification timestamp. Comparisons must reduce
/// both sides to the coarser of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModificationPrecision {
    None,
    Hour,
    Minute,
    Full,
}

/// Truncate a timestamp to the given precision.
pub fn reduce_precision(time: DateTime<Utc>, precision: ModificationPrecision) -> DateTime<Utc> {
    match precision {
        ModificationPrecision::Full => time,
        ModificationPrecision::Minute => time.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(time),
        ModificationPrecision::Hour => time
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(time),
        // Incomparable; callers bail out before reducing.
        ModificationPrecision::None => time,
    }
}

/// Compare two stamps after reducing both to the coarser precision.
/// Returns None when either side carries no usable stamp.
pub fn compare_modification(
    a: Option<DateTime<Utc>>,
    a_precision: ModificationPrecision,
    b: Option<DateTime<Utc>>,
    b_precision: ModificationPrecision,
) -> Option<std::cmp::Ordering> {
    let precision = a_precision.min(b_precision);
    if precision == ModificationPrecision::None {
        return None;
    }
    match (a, b) {
        (Some(a), Some(b)) => Some(reduce_precision(a, precision).cmp(&reduce_precision(b, precision))),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rights {
    pub octal: u32,
    pub text: String,
}

impl Rights {
    pub fn from_octal(octal: u32) -> Self {
        let mut text = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (octal >> shift) & 0o7;
            text.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            text.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            text.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        Self { octal, text }
    }
}

/// One entry of a remote listing. Created by a backend while parsing; owned
/// by its containing [`RemoteFileList`]. The `directory` field is the plain
/// path of the owning list, not an owning back-reference.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub modification: Option<DateTime<Utc>>,
    pub precision: ModificationPrecision,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub rights: Option<Rights>,
    /// Unresolved symlink target, verbatim from the listing.
    pub link_target: Option<String>,
    /// Target entry after a resolve-symlink round trip.
    pub resolved_target: Option<Box<RemoteFile>>,
    /// Path of the directory this entry was listed in.
    pub directory: String,
}

impl RemoteFile {
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            modification: None,
            precision: ModificationPrecision::Full,
            owner: None,
            group: None,
            rights: None,
            link_target: None,
            resolved_target: None,
            directory: String::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
            || matches!(
                (&self.kind, self.resolved_target.as_deref()),
                (FileKind::Symlink, Some(target)) if target.kind == FileKind::Directory
            )
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    pub fn is_this_directory(&self) -> bool {
        self.name == THIS_DIRECTORY
    }

    pub fn is_parent_directory(&self) -> bool {
        self.name == PARENT_DIRECTORY
    }

    pub fn full_name(&self) -> String {
        unix_combine(&self.directory, &self.name)
    }
}

/// An ordered remote directory listing.
///
/// Invariant: `directory` matches the `directory` back-reference of every
/// contained file.
#[derive(Debug, Clone)]
pub struct RemoteFileList {
    directory: String,
    pub timestamp: DateTime<Utc>,
    files: Vec<RemoteFile>,
}

impl RemoteFileList {
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: unix_exclude_trailing_slash(&directory.into()),
            timestamp: Utc::now(),
            files: Vec::new(),
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn set_directory(&mut self, directory: impl Into<String>) {
        self.directory = unix_exclude_trailing_slash(&directory.into());
        for file in &mut self.files {
            file.directory = self.directory.clone();
        }
    }

    pub fn push(&mut self, mut file: RemoteFile) {
        file.directory = self.directory.clone();
        self.files.push(file);
    }

    pub fn files(&self) -> &[RemoteFile] {
        &self.files
    }

    pub fn find(&self, name: &str) -> Option<&RemoteFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True when `other` was retrieved strictly later than this list.
    pub fn older_than(&self, other: &RemoteFileList) -> bool {
        self.timestamp < other.timestamp
    }
}

pub fn unix_include_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

pub fn unix_exclude_trailing_slash(path: &str) -> String {
    if path.len() > 1 && path.ends_with('/') {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

pub fn unix_combine(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else if directory.ends_with('/') {
        format!("{directory}{name}")
    } else {
        format!("{directory}/{name}")
    }
}

pub fn unix_extract_file_name(path: &str) -> &str {
    match unix_exclude_trailing_slash_ref(path).rfind('/') {
        Some(index) => &path[index + 1..],
        None => path,
    }
}

pub fn unix_extract_directory(path: &str) -> String {
    let trimmed = unix_exclude_trailing_slash_ref(path);
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(index) => trimmed[..index].to_string(),
        None => String::new(),
    }
}

fn unix_exclude_trailing_slash_ref(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// True when `path` lies underneath `parent` (or equals it).
pub fn unix_is_child_path(parent: &str, path: &str) -> bool {
    let parent = unix_include_trailing_slash(&unix_exclude_trailing_slash(parent));
    let path = unix_include_trailing_slash(&unix_exclude_trailing_slash(path));
    path.starts_with(&parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn list_keeps_child_directory_in_sync() {
        let mut list = RemoteFileList::new("/work/");
        list.push(RemoteFile::new("a.txt", FileKind::File));
        assert_eq!(list.directory(), "/work");
        assert_eq!(list.files()[0].directory, "/work");
        assert_eq!(list.files()[0].full_name(), "/work/a.txt");
    }

    #[test]
    fn precision_reduction_truncates_to_coarser_side() {
        let a = Utc.with_ymd_and_hms(2026, 3, 14, 10, 30, 45).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 14, 10, 30, 2).unwrap();
        // At minute precision the two stamps are equal.
        assert_eq!(
            compare_modification(
                Some(a),
                ModificationPrecision::Minute,
                Some(b),
                ModificationPrecision::Full
            ),
            Some(std::cmp::Ordering::Equal)
        );
        // At full precision a is newer.
        assert_eq!(
            compare_modification(
                Some(a),
                ModificationPrecision::Full,
                Some(b),
                ModificationPrecision::Full
            ),
            Some(std::cmp::Ordering::Greater)
        );
    }

    #[test]
    fn none_precision_is_incomparable() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            compare_modification(
                Some(a),
                ModificationPrecision::None,
                Some(a),
                ModificationPrecision::Full
            ),
            None
        );
    }

    #[test]
    fn unix_path_helpers() {
        assert_eq!(unix_combine("/a", "b"), "/a/b");
        assert_eq!(unix_combine("/a/", "b"), "/a/b");
        assert_eq!(unix_extract_file_name("/a/b.txt"), "b.txt");
        assert_eq!(unix_extract_directory("/a/b.txt"), "/a");
        assert_eq!(unix_extract_directory("/a"), "/");
        assert!(unix_is_child_path("/trash", "/trash/x.txt"));
        assert!(!unix_is_child_path("/trash", "/work/x.txt"));
    }

    #[test]
    fn rights_text_rendering() {
        assert_eq!(Rights::from_octal(0o644).text, "rw-r--r--");
        assert_eq!(Rights::from_octal(0o755).text, "rwxr-xr-x");
    }
}
