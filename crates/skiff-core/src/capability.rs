//! Static capability matrix advertised by protocol backends.
//!
//! Every "can the backend do X?" question in the session controller is routed
//! through these tags; the controller never inspects the concrete backend
//! type. The set is fixed once a backend is bound to a session.

/// One backend capability tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    UserGroupListing,
    ModeChanging,
    GroupChanging,
    OwnerChanging,
    GroupOwnerChangingById,
    AnyCommand,
    ShellAnyCommand,
    HardLink,
    SymbolicLink,
    ResolveSymlink,
    TextMode,
    Rename,
    NativeTextMode,
    NewerOnlyUpload,
    RemoteCopy,
    TimestampChanging,
    RemoteMove,
    LoadingAdditionalProperties,
    CheckingSpaceAvailable,
    IgnorePermErrors,
    CalculatingChecksum,
    ModeChangingUpload,
    PreservingTimestampUpload,
    SecondaryShell,
    RemoveCtrlZUpload,
    RemoveBomUpload,
    Locking,
    PreservingTimestampDirs,
    ResumeSupport,
    ChangePassword,
    SkipTransfer,
    ParallelTransfers,
    BackgroundTransfers,
}

/// Immutable bit-vector of capability tags.
///
/// Backends build one with [`CapabilitySet::builder`] and return it from
/// `FileSystemBackend::capabilities`; it must not change while the backend is
/// bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    bits: u64,
}

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn builder() -> CapabilitySetBuilder {
        CapabilitySetBuilder { bits: 0 }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.bits & (1u64 << capability as u8) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut builder = CapabilitySet::builder();
        for capability in iter {
            builder = builder.with(capability);
        }
        builder.build()
    }
}

pub struct CapabilitySetBuilder {
    bits: u64,
}

impl CapabilitySetBuilder {
    pub fn with(mut self, capability: Capability) -> Self {
        self.bits |= 1u64 << capability as u8;
        self
    }

    pub fn build(self) -> CapabilitySet {
        CapabilitySet { bits: self.bits }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_has_no_capabilities() {
        let set = CapabilitySet::empty();
        assert!(!set.contains(Capability::Rename));
        assert!(set.is_empty());
    }

    #[test]
    fn builder_sets_requested_tags_only() {
        let set = CapabilitySet::builder()
            .with(Capability::Rename)
            .with(Capability::ResolveSymlink)
            .build();
        assert!(set.contains(Capability::Rename));
        assert!(set.contains(Capability::ResolveSymlink));
        assert!(!set.contains(Capability::AnyCommand));
    }

    #[test]
    fn collects_from_iterator() {
        let set: CapabilitySet =
            [Capability::RemoteCopy, Capability::RemoteMove].into_iter().collect();
        assert!(set.contains(Capability::RemoteCopy));
        assert!(set.contains(Capability::RemoteMove));
        assert!(!set.contains(Capability::Locking));
    }
}
