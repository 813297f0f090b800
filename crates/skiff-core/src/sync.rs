//! Directory-tree synchronization: collect a checklist by diffing the local
//! and remote trees, then apply it as transfers, deletes, or timestamp
//! copies.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use filetime::FileTime;

use crate::backend::{DeleteParams, FileProperties, TransferParams};
use crate::copy_param::{CopyParam, MaskParams, TransferSide};
use crate::error::{SessionError, SessionResult};
use crate::progress::{OperationKind, OperationProgress, OperationSide};
use crate::remote_file::{
    compare_modification, unix_combine, FileKind, ModificationPrecision, RemoteFile,
};
use crate::terminal::Terminal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Make the local tree match the remote one.
    Local,
    /// Make the remote tree match the local one.
    Remote,
    /// Newer side wins on both ends.
    Both,
}

/// Flag bundle steering collect and apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncParams {
    pub by_size: bool,
    pub not_by_time: bool,
    pub existing_only: bool,
    pub delete: bool,
    pub no_recurse: bool,
    pub sub_dirs: bool,
    pub mirror: bool,
    pub no_confirmation: bool,
    pub use_cache: bool,
    pub delay_progress: bool,
    /// Copy timestamps instead of file contents.
    pub timestamp_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    UploadNew,
    UploadUpdate,
    DownloadNew,
    DownloadUpdate,
    DeleteRemote,
    DeleteLocal,
}

/// One side of a checklist item.
#[derive(Debug, Clone)]
pub struct SyncSide {
    pub directory: String,
    pub file_name: String,
    pub size: u64,
    pub modification: Option<DateTime<Utc>>,
    pub precision: ModificationPrecision,
}

impl Default for SyncSide {
    fn default() -> Self {
        Self {
            directory: String::new(),
            file_name: String::new(),
            size: 0,
            modification: None,
            precision: ModificationPrecision::Full,
        }
    }
}

impl SyncSide {
    pub fn is_empty(&self) -> bool {
        self.directory.is_empty() && self.file_name.is_empty()
    }
}

/// One planned difference. At least one side is non-empty; `action` is
/// consistent with `is_directory` and the collect mode.
#[derive(Debug, Clone)]
pub struct ChecklistItem {
    pub local: SyncSide,
    pub remote: SyncSide,
    /// Owned handle for the apply phase (downloads, remote deletes).
    pub remote_file: Option<RemoteFile>,
    pub is_directory: bool,
    pub action: SyncAction,
    pub checked: bool,
}

impl ChecklistItem {
    fn sort_key(&self) -> (&str, &str) {
        let directory = if self.local.directory.is_empty() {
            &self.remote.directory
        } else {
            &self.local.directory
        };
        let name = if self.local.file_name.is_empty() {
            &self.remote.file_name
        } else {
            &self.local.file_name
        };
        (directory, name)
    }
}

/// The sorted plan produced by collect and consumed by apply.
#[derive(Debug, Default)]
pub struct SynchronizeChecklist {
    items: Vec<ChecklistItem>,
}

impl SynchronizeChecklist {
    fn new(items: Vec<ChecklistItem>) -> Self {
        Self { items }
    }

    /// Build a checklist from pre-made items, e.g. one edited by a host UI.
    /// Items are brought into the canonical order.
    pub fn from_items(items: Vec<ChecklistItem>) -> Self {
        let mut checklist = Self::new(items);
        checklist.sort();
        checklist
    }

    pub fn items(&self) -> &[ChecklistItem] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [ChecklistItem] {
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn sort(&mut self) {
        self.items
            .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }
}

/// Per-directory progress callback: `(local, remote, collecting)`.
pub type SyncDirectoryHandler<'a> = &'a mut dyn FnMut(&str, &str, bool);

struct LocalEntry {
    side: SyncSide,
    is_directory: bool,
    new: bool,
    modified: bool,
    matching_remote: Option<SyncSide>,
    matching_remote_file: Option<RemoteFile>,
}

fn checked_for_directory(is_directory: bool, params: SyncParams) -> bool {
    !is_directory || !params.no_recurse || params.sub_dirs
}

fn matches_root_filter(
    filter: Option<&[String]>,
    first_level: bool,
    name: &str,
    other_name: &str,
) -> bool {
    if !first_level {
        return true;
    }
    match filter {
        None => true,
        Some(names) => names
            .iter()
            .any(|entry| entry.eq_ignore_ascii_case(name) || entry.eq_ignore_ascii_case(other_name)),
    }
}

impl Terminal {
    /// Diff `local_directory` against `remote_directory` into a sorted
    /// checklist. Recoverable enumeration errors go through the retry loop;
    /// a partial checklist is discarded on abort.
    pub fn synchronize_collect(
        &mut self,
        local_directory: &Path,
        remote_directory: &str,
        mode: SyncMode,
        copy_param: &CopyParam,
        params: SyncParams,
        filter: Option<&[String]>,
        mut on_directory: Option<SyncDirectoryHandler<'_>>,
    ) -> SessionResult<SynchronizeChecklist> {
        self.log().event(format!(
            "Collecting synchronization list for local directory '{}' and remote directory '{}'",
            local_directory.display(),
            remote_directory
        ));
        let mut progress = OperationProgress::new(OperationKind::Copy, OperationSide::Local);
        let mut items = Vec::new();
        self.do_synchronize_collect_directory(
            local_directory,
            remote_directory,
            mode,
            copy_param,
            params,
            filter,
            true,
            &mut items,
            &mut progress,
            &mut on_directory,
        )?;
        let mut checklist = SynchronizeChecklist::new(items);
        checklist.sort();
        Ok(checklist)
    }

    #[allow(clippy::too_many_arguments)]
    fn do_synchronize_collect_directory(
        &mut self,
        local_directory: &Path,
        remote_directory: &str,
        mode: SyncMode,
        copy_param: &CopyParam,
        params: SyncParams,
        filter: Option<&[String]>,
        first_level: bool,
        items: &mut Vec<ChecklistItem>,
        progress: &mut OperationProgress,
        on_directory: &mut Option<SyncDirectoryHandler<'_>>,
    ) -> SessionResult<()> {
        let local_dir_string = local_directory.to_string_lossy().into_owned();
        if !params.delay_progress {
            if let Some(handler) = on_directory.as_deref_mut() {
                handler(&local_dir_string, remote_directory, true);
            }
        }

        // Pass 1: local enumeration.
        let list_message = format!(
            "error listing local directory '{}'",
            local_directory.display()
        );
        let local_entries: Vec<(String, std::fs::Metadata)> =
            self.file_operation_loop(progress, &list_message, false, |_terminal| {
                let mut entries = Vec::new();
                let reader = std::fs::read_dir(local_directory)
                    .map_err(|err| SessionError::command_with(list_message.clone(), err))?;
                for entry in reader {
                    let entry =
                        entry.map_err(|err| SessionError::command_with(list_message.clone(), err))?;
                    let metadata = entry
                        .metadata()
                        .map_err(|err| SessionError::command_with(list_message.clone(), err))?;
                    entries.push((entry.file_name().to_string_lossy().into_owned(), metadata));
                }
                Ok(entries)
            })?;

        let mut local_index: BTreeMap<String, LocalEntry> = BTreeMap::new();
        for (name, metadata) in local_entries {
            let is_directory = metadata.is_dir();
            let remote_name = copy_param.change_file_name(&name, TransferSide::Local);
            let admitted = copy_param.allow_transfer(
                &name,
                TransferSide::Local,
                is_directory,
                MaskParams { size: metadata.len() },
            ) && !self.temporary_transfer_file(&name)
                && matches_root_filter(filter, first_level, &name, &remote_name);
            if !admitted {
                self.log().event(format!(
                    "Local file '{}' excluded from synchronization",
                    local_directory.join(&name).display()
                ));
                continue;
            }
            let modification = metadata.modified().ok().map(DateTime::<Utc>::from);
            local_index.insert(
                name.to_lowercase(),
                LocalEntry {
                    side: SyncSide {
                        directory: local_dir_string.clone(),
                        file_name: name,
                        size: metadata.len(),
                        modification,
                        precision: ModificationPrecision::Full,
                    },
                    is_directory,
                    new: true,
                    modified: false,
                    matching_remote: None,
                    matching_remote_file: None,
                },
            );
        }

        if params.delay_progress {
            if let Some(handler) = on_directory.as_deref_mut() {
                handler(&local_dir_string, remote_directory, true);
            }
        }

        // Pass 2: remote walk against the local index.
        let remote_dir_owned = remote_directory.to_string();
        let local_dir_owned = local_directory.to_path_buf();
        self.process_directory(remote_directory, params.use_cache, &mut |terminal, file| {
            terminal.synchronize_collect_file(
                file,
                &local_dir_owned,
                &remote_dir_owned,
                mode,
                copy_param,
                params,
                filter,
                first_level,
                &mut local_index,
                items,
                progress,
                on_directory,
            )
        })?;

        // Pass 3: what is left new/modified on the local side.
        for entry in local_index.into_values() {
            let modified = entry.modified && matches!(mode, SyncMode::Both | SyncMode::Remote);
            let new = entry.new
                && (mode == SyncMode::Local
                    || (matches!(mode, SyncMode::Both | SyncMode::Remote) && !params.timestamp_only));
            if !modified && !new {
                continue;
            }
            debug_assert!(!(modified && new));

            if new {
                self.log().event(format!(
                    "Local file '{}' is new",
                    Path::new(&entry.side.directory).join(&entry.side.file_name).display()
                ));
            }

            let mut item = ChecklistItem {
                local: entry.side,
                remote: SyncSide {
                    directory: remote_directory.to_string(),
                    ..SyncSide::default()
                },
                remote_file: None,
                is_directory: entry.is_directory,
                action: SyncAction::UploadNew,
                checked: false,
            };
            if modified {
                item.remote = entry
                    .matching_remote
                    .expect("modified local entry keeps its matched remote side");
                item.remote_file = entry.matching_remote_file;
            }

            let emit = match mode {
                SyncMode::Both | SyncMode::Remote => {
                    item.action = if modified {
                        SyncAction::UploadUpdate
                    } else {
                        SyncAction::UploadNew
                    };
                    item.checked = (modified || !params.existing_only)
                        && checked_for_directory(item.is_directory, params);
                    true
                }
                SyncMode::Local => {
                    if params.timestamp_only {
                        false
                    } else {
                        item.action = SyncAction::DeleteLocal;
                        item.checked =
                            params.delete && checked_for_directory(item.is_directory, params);
                        true
                    }
                }
            };
            if emit {
                items.push(item);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn synchronize_collect_file(
        &mut self,
        file: &RemoteFile,
        local_directory: &Path,
        remote_directory: &str,
        mode: SyncMode,
        copy_param: &CopyParam,
        params: SyncParams,
        filter: Option<&[String]>,
        first_level: bool,
        local_index: &mut BTreeMap<String, LocalEntry>,
        items: &mut Vec<ChecklistItem>,
        progress: &mut OperationProgress,
        on_directory: &mut Option<SyncDirectoryHandler<'_>>,
    ) -> SessionResult<()> {
        let local_name = copy_param.change_file_name(&file.name, TransferSide::Remote);
        let admitted = copy_param.allow_transfer(
            &file.name,
            TransferSide::Remote,
            file.is_directory(),
            MaskParams { size: file.size },
        ) && !self.temporary_transfer_file(&file.name)
            && matches_root_filter(filter, first_level, &file.name, &local_name);
        if !admitted {
            self.log().event(format!(
                "Remote file '{}' excluded from synchronization",
                file.full_name()
            ));
            return Ok(());
        }

        let mut item = ChecklistItem {
            local: SyncSide::default(),
            remote: SyncSide {
                directory: remote_directory.to_string(),
                file_name: file.name.clone(),
                size: file.size,
                modification: file.modification,
                precision: file.precision,
            },
            remote_file: None,
            is_directory: file.is_directory(),
            action: SyncAction::DownloadNew,
            checked: false,
        };

        let key = local_name.to_lowercase();
        let mut new = false;
        let mut modified = false;
        match local_index.get_mut(&key) {
            Some(local) => {
                local.new = false;
                if file.is_directory() != local.is_directory {
                    self.log().event(format!(
                        "{} is a directory on one side, but a file on the other",
                        file.name
                    ));
                    return Ok(());
                }
                if !file.is_directory() {
                    item.local = local.side.clone();
                    let mut local_modified = false;

                    // For timestamp+by-size the sizes must match before the
                    // time comparison is meaningful.
                    let comparable = !params.not_by_time
                        && (!params.timestamp_only
                            || !params.by_size
                            || local.side.size == file.size);
                    let time_compare = if comparable {
                        compare_modification(
                            local.side.modification,
                            local.side.precision,
                            file.modification,
                            file.precision,
                        )
                        .unwrap_or(Ordering::Equal)
                    } else {
                        Ordering::Equal
                    };
                    match time_compare {
                        Ordering::Less => {
                            // Remote is newer.
                            if (!params.timestamp_only && !params.mirror)
                                || matches!(mode, SyncMode::Both | SyncMode::Local)
                            {
                                modified = true;
                            } else {
                                local_modified = true;
                            }
                        }
                        Ordering::Greater => {
                            // Local is newer.
                            if (!params.timestamp_only && !params.mirror)
                                || matches!(mode, SyncMode::Both | SyncMode::Remote)
                            {
                                local_modified = true;
                            } else {
                                modified = true;
                            }
                        }
                        Ordering::Equal => {
                            if params.by_size
                                && local.side.size != file.size
                                && !params.timestamp_only
                            {
                                // Same stamp, different content: the larger
                                // side is treated as the newer one.
                                if file.size > local.side.size {
                                    modified = true;
                                } else {
                                    local_modified = true;
                                }
                            }
                        }
                    }

                    if local_modified {
                        local.modified = true;
                        local.matching_remote = Some(item.remote.clone());
                        local.matching_remote_file = Some(file.clone());
                        self.log().event(format!(
                            "Local file '{}' is modified comparing to remote file '{}'",
                            Path::new(&local.side.directory).join(&local.side.file_name).display(),
                            file.full_name()
                        ));
                    }
                    if modified {
                        self.log().event(format!(
                            "Remote file '{}' is modified comparing to local file '{}'",
                            file.full_name(),
                            Path::new(&item.local.directory).join(&item.local.file_name).display()
                        ));
                    }
                } else if !params.no_recurse {
                    let sub_local = local_directory.join(&local.side.file_name);
                    let sub_remote = unix_combine(remote_directory, &file.name);
                    self.do_synchronize_collect_directory(
                        &sub_local,
                        &sub_remote,
                        mode,
                        copy_param,
                        params,
                        filter,
                        false,
                        items,
                        progress,
                        on_directory,
                    )?;
                    return Ok(());
                }
            }
            None => {
                new = true;
                item.local.directory = local_directory.to_string_lossy().into_owned();
                self.log().event(format!("Remote file '{}' is new", file.full_name()));
            }
        }

        if !new && !modified {
            return Ok(());
        }
        debug_assert!(!(new && modified));

        let emit = match mode {
            SyncMode::Both | SyncMode::Local => {
                if !params.timestamp_only || modified {
                    item.action = if modified {
                        SyncAction::DownloadUpdate
                    } else {
                        SyncAction::DownloadNew
                    };
                    item.checked = (modified || !params.existing_only)
                        && checked_for_directory(item.is_directory, params);
                    true
                } else {
                    false
                }
            }
            SyncMode::Remote => {
                if new && !params.timestamp_only {
                    item.action = SyncAction::DeleteRemote;
                    item.checked = params.delete && checked_for_directory(item.is_directory, params);
                    true
                } else {
                    false
                }
            }
        };
        if emit {
            item.remote_file = Some(file.clone());
            items.push(item);
        }
        Ok(())
    }

    /// Apply a checklist: per directory group, downloads, then remote
    /// deletes, then uploads, then local deletes, inside one transaction so
    /// cache reloads fire once at the end. Returns false when the user
    /// cancelled mid-way.
    pub fn synchronize_apply(
        &mut self,
        checklist: &SynchronizeChecklist,
        copy_param: &CopyParam,
        params: SyncParams,
        mut on_directory: Option<SyncDirectoryHandler<'_>>,
    ) -> SessionResult<bool> {
        let mut sync_copy_param = copy_param.clone();
        // When synchronizing by time, preserving it is what makes the plan
        // converge.
        if !params.not_by_time {
            sync_copy_param.preserve_time = true;
        }
        let transfer_params = TransferParams {
            no_confirmation: params.no_confirmation,
            ..TransferParams::default()
        };

        self.begin_transaction();
        let result = (|| -> SessionResult<bool> {
            let items = checklist.items();
            let mut index = 0;
            while index < items.len() {
                let local_dir = items[index].local.directory.clone();
                let remote_dir = items[index].remote.directory.clone();
                let mut end = index;
                while end < items.len()
                    && items[end].local.directory == local_dir
                    && items[end].remote.directory == remote_dir
                {
                    end += 1;
                }
                let group: Vec<&ChecklistItem> =
                    items[index..end].iter().filter(|item| item.checked).collect();
                index = end;
                if group.is_empty() {
                    continue;
                }

                self.log().event(format!(
                    "Synchronizing local directory '{local_dir}' with remote directory '{remote_dir}'"
                ));
                if let Some(handler) = on_directory.as_deref_mut() {
                    handler(&local_dir, &remote_dir, false);
                }

                if params.timestamp_only {
                    if !self.apply_timestamps(&group)? {
                        return Ok(false);
                    }
                    continue;
                }

                let mut downloads = Vec::new();
                let mut delete_remote = Vec::new();
                let mut uploads = Vec::new();
                let mut delete_local = Vec::new();
                for item in &group {
                    match item.action {
                        SyncAction::DownloadNew | SyncAction::DownloadUpdate => downloads
                            .push(unix_combine(&item.remote.directory, &item.remote.file_name)),
                        SyncAction::DeleteRemote => {
                            delete_remote.push(item.remote_file.clone().unwrap_or_else(|| {
                                let kind = if item.is_directory {
                                    FileKind::Directory
                                } else {
                                    FileKind::File
                                };
                                let mut file = RemoteFile::new(item.remote.file_name.clone(), kind);
                                file.directory = item.remote.directory.clone();
                                file
                            }))
                        }
                        SyncAction::UploadNew | SyncAction::UploadUpdate => uploads.push(
                            Path::new(&item.local.directory)
                                .join(&item.local.file_name)
                                .to_string_lossy()
                                .into_owned(),
                        ),
                        SyncAction::DeleteLocal => delete_local.push((
                            Path::new(&item.local.directory).join(&item.local.file_name),
                            item.is_directory,
                        )),
                    }
                }

                if !downloads.is_empty()
                    && !self.copy_to_local(&downloads, &local_dir, &sync_copy_param, transfer_params)?
                {
                    return Ok(false);
                }
                if !delete_remote.is_empty()
                    && self
                        .delete_files(&delete_remote, DeleteParams::default())?
                        .cancelled
                {
                    return Ok(false);
                }
                if !uploads.is_empty()
                    && !self.copy_to_remote(&uploads, &remote_dir, &sync_copy_param, transfer_params)?
                {
                    return Ok(false);
                }
                if !delete_local.is_empty() && !self.apply_local_deletions(&delete_local)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })();
        let flushed = self.end_transaction();
        let applied = result?;
        flushed?;
        Ok(applied)
    }

    /// Timestamp-only flavor: upload-updates push local stamps to the
    /// remote, download-updates pull remote stamps onto local files.
    fn apply_timestamps(&mut self, group: &[&ChecklistItem]) -> SessionResult<bool> {
        let mut progress =
            OperationProgress::new(OperationKind::SetProperties, OperationSide::Remote);
        progress.start(group.len(), 0);
        for item in group {
            if progress.is_cancelled() {
                break;
            }
            match item.action {
                SyncAction::UploadUpdate => {
                    let Some(stamp) = item.local.modification else {
                        continue;
                    };
                    let path = unix_combine(&item.remote.directory, &item.remote.file_name);
                    let properties = FileProperties::modification_only(stamp);
                    match self.change_file_properties(
                        &path,
                        item.remote_file.as_ref(),
                        &properties,
                        &mut progress,
                    ) {
                        Ok(()) => {}
                        Err(err) if err.is_skip() => continue,
                        Err(err) => return Err(err),
                    }
                }
                SyncAction::DownloadUpdate => {
                    let Some(stamp) = item.remote.modification else {
                        continue;
                    };
                    let path = Path::new(&item.local.directory).join(&item.local.file_name);
                    let message =
                        format!("error setting timestamp of '{}'", path.display());
                    let result = self.file_operation_loop(&mut progress, &message, true, |_t| {
                        filetime::set_file_mtime(&path, FileTime::from_system_time(stamp.into()))
                            .map_err(|err| SessionError::command_with(message.clone(), err))
                    });
                    match result {
                        Ok(()) => {}
                        Err(err) if err.is_skip() => continue,
                        Err(err) => return Err(err),
                    }
                }
                _ => {
                    debug_assert!(false, "timestamp apply sees only update actions");
                }
            }
        }
        Ok(!progress.is_cancelled())
    }

    fn apply_local_deletions(&mut self, paths: &[(PathBuf, bool)]) -> SessionResult<bool> {
        let mut progress = OperationProgress::new(OperationKind::Delete, OperationSide::Local);
        progress.start(paths.len(), 0);
        for (path, is_directory) in paths {
            if progress.is_cancelled() {
                break;
            }
            progress.set_file(path.to_string_lossy().into_owned());
            let message = format!("error deleting local file '{}'", path.display());
            let result = self.file_operation_loop(&mut progress, &message, true, |terminal| {
                let outcome = if *is_directory {
                    terminal.events.remove_local_directory(path)
                } else {
                    terminal.events.remove_local_file(path)
                };
                outcome.map_err(|err| SessionError::command_with(message.clone(), err))
            });
            match result {
                Ok(()) => {}
                Err(err) if err.is_skip() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(!progress.is_cancelled())
    }
}
