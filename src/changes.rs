//! Change tracking over the sections of a route document.
//!
//! [`ChangeTracker`] is a cheap, cloneable handle onto one shared
//! [`ChangeSet`]. Every clone observes the same marks, so a save that is
//! suspended on an upload reads the edits that landed while it was waiting
//! instead of the set it would have captured when it started.
//!
//! Each mark carries a generation from a counter that only grows. Marking a
//! section again while a save is in flight bumps its generation, so
//! acknowledging the older snapshot leaves the newer mark in place.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::SegmentPatch;

/// Logical section of a route document that can change independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SectionName {
    MapState,
    Routes,
    Description,
    Metadata,
    Photos,
    PhotoChangeType,
    Pois,
    Lines,
    HeaderSettings,
    MapOverview,
    OverallName,
}

impl SectionName {
    pub const ALL: [SectionName; 11] = [
        SectionName::MapState,
        SectionName::Routes,
        SectionName::Description,
        SectionName::Metadata,
        SectionName::Photos,
        SectionName::PhotoChangeType,
        SectionName::Pois,
        SectionName::Lines,
        SectionName::HeaderSettings,
        SectionName::MapOverview,
        SectionName::OverallName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionName::MapState => "mapState",
            SectionName::Routes => "routes",
            SectionName::Description => "description",
            SectionName::Metadata => "metadata",
            SectionName::Photos => "photos",
            SectionName::PhotoChangeType => "photoChangeType",
            SectionName::Pois => "pois",
            SectionName::Lines => "lines",
            SectionName::HeaderSettings => "headerSettings",
            SectionName::MapOverview => "mapOverview",
            SectionName::OverallName => "overallName",
        }
    }

    /// Sections carried by the identity fields of every payload.
    pub fn is_identity(&self) -> bool {
        matches!(self, SectionName::OverallName)
    }
}

/// What happened to the photo list in the most recent photo edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoChangeKind {
    Added,
    Deleted,
    Updated,
    Reordered,
}

/// Sections changed since the last successful save.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeSet {
    /// Section -> generation of its latest mark
    sections: BTreeMap<SectionName, u64>,
    photo_change: Option<PhotoChangeKind>,
}

impl ChangeSet {
    pub fn contains(&self, section: SectionName) -> bool {
        self.sections.contains_key(&section)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = SectionName> + '_ {
        self.sections.keys().copied()
    }

    pub fn photo_change(&self) -> Option<PhotoChangeKind> {
        self.photo_change
    }

    pub fn insert(&mut self, section: SectionName) {
        self.sections.entry(section).or_insert(0);
    }

    pub fn insert_photo_change(&mut self, kind: PhotoChangeKind) {
        self.insert(SectionName::Photos);
        self.insert(SectionName::PhotoChangeType);
        self.photo_change = Some(kind);
    }

    /// Returns true if `section` was not marked before.
    fn mark(&mut self, section: SectionName, generation: u64) -> bool {
        self.sections.insert(section, generation).is_none()
    }

    /// True when `section` is the only changed section besides identity ones.
    pub fn only(&self, section: SectionName) -> bool {
        let mut non_identity = self.iter().filter(|s| !s.is_identity());
        non_identity.next() == Some(section) && non_identity.next().is_none()
    }

    /// Drop the marks `sent` carried, unless they were renewed since.
    fn remove_all(&mut self, sent: &ChangeSet) {
        for (section, generation) in &sent.sections {
            if self.sections.get(section) == Some(generation) {
                self.sections.remove(section);
            }
        }
        if !self.sections.contains_key(&SectionName::PhotoChangeType) {
            self.photo_change = None;
        }
    }
}

impl FromIterator<SectionName> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = SectionName>>(iter: I) -> Self {
        Self {
            sections: iter.into_iter().map(|s| (s, 0)).collect(),
            photo_change: None,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    changes: ChangeSet,
    generation: u64,
}

impl TrackerState {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// Shared handle onto the session's change set.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    inner: Arc<Mutex<TrackerState>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `section` differs from the last saved snapshot.
    pub fn mark_changed(&self, section: SectionName) {
        let mut state = self.lock();
        let generation = state.next_generation();
        if state.changes.mark(section, generation) {
            log::debug!("[ChangeTracker] Marked {} as changed", section.as_str());
        }
    }

    /// Record a photo edit together with its kind.
    pub fn mark_photos_changed(&self, kind: PhotoChangeKind) {
        let mut state = self.lock();
        let generation = state.next_generation();
        state.changes.mark(SectionName::Photos, generation);
        state.changes.mark(SectionName::PhotoChangeType, generation);
        state.changes.photo_change = Some(kind);
        log::debug!("[ChangeTracker] Marked photos as changed ({:?})", kind);
    }

    /// Current change set (always the latest marks).
    pub fn snapshot(&self) -> ChangeSet {
        self.lock().changes.clone()
    }

    pub fn has_changed(&self, section: SectionName) -> bool {
        self.lock().changes.contains(section)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().changes.is_empty()
    }

    /// Forget every mark.
    pub fn reset(&self) {
        let mut state = self.lock();
        if !state.changes.is_empty() {
            log::debug!("[ChangeTracker] Reset {} changed sections", state.changes.len());
        }
        state.changes = ChangeSet::default();
    }

    /// Clear the sections that were just persisted, keeping marks that
    /// arrived or were renewed after `sent` was taken.
    pub fn acknowledge(&self, sent: &ChangeSet) {
        self.lock().changes.remove_all(sent);
    }
}

impl SegmentPatch {
    /// Section a segment patch dirties: description-only and metadata-only
    /// edits are tracked on their own; anything else resends the routes.
    pub fn change_section(&self) -> SectionName {
        let only_description = self.description.is_some()
            && SegmentPatch {
                description: None,
                ..self.clone()
            }
            .is_empty();
        let only_metadata = self.metadata.is_some()
            && SegmentPatch {
                metadata: None,
                ..self.clone()
            }
            .is_empty();

        if only_description {
            SectionName::Description
        } else if only_metadata {
            SectionName::Metadata
        } else {
            SectionName::Routes
        }
    }
}
