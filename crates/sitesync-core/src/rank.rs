// Copyright 2024 The Sitesync Authors
// SPDX-License-Identifier: Apache-2.0

//! The rank table.
//!
//! Object lifecycle statuses are totally ordered and encoded as small integers
//! when exchanged between sites. [`Rank`] extends the status table with one
//! synthetic sentinel, [`Rank::ToUpdate`], whose value is the length of the
//! status table. It marks an object under repair and is never a terminal
//! status on a converged object.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Persisted lifecycle status of an object in the authoritative store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectStatus {
    /// Status never recorded or lost.
    #[default]
    Unknown,
    /// Upload in progress.
    Upload,
    /// Object fully written and readable.
    Ready,
    /// Upload failed.
    ErrUpl,
    /// Delete in progress.
    Deleting,
    /// Object deleted.
    Deleted,
    /// Delete failed.
    ErrDel,
}

impl ObjectStatus {
    /// Every status in rank order.
    pub const ALL: [ObjectStatus; 7] = [
        Self::Unknown,
        Self::Upload,
        Self::Ready,
        Self::ErrUpl,
        Self::Deleting,
        Self::Deleted,
        Self::ErrDel,
    ];

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Upload => "UPLOAD",
            Self::Ready => "READY",
            Self::ErrUpl => "ERR_UPL",
            Self::Deleting => "DELETING",
            Self::Deleted => "DELETED",
            Self::ErrDel => "ERR_DEL",
        }
    }

    /// Returns the rank of this status.
    #[must_use]
    pub const fn rank(self) -> Rank {
        match self {
            Self::Unknown => Rank::Unknown,
            Self::Upload => Rank::Upload,
            Self::Ready => Rank::Ready,
            Self::ErrUpl => Rank::ErrUpl,
            Self::Deleting => Rank::Deleting,
            Self::Deleted => Rank::Deleted,
            Self::ErrDel => Rank::ErrDel,
        }
    }

    /// Parses a status name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer value of [`Rank::ToUpdate`]: the length of the status table.
pub const TO_UPDATE_RANK: u8 = ObjectStatus::ALL.len() as u8;

/// Reconciliation rank: a status of the table or the `TO_UPDATE` sentinel.
///
/// The derived ordering matches the integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Rank {
    /// `UNKNOWN`
    Unknown,
    /// `UPLOAD`
    Upload,
    /// `READY`
    Ready,
    /// `ERR_UPL`
    ErrUpl,
    /// `DELETING`
    Deleting,
    /// `DELETED`
    Deleted,
    /// `ERR_DEL`
    ErrDel,
    /// Under repair, see [`TO_UPDATE_RANK`].
    ToUpdate,
}

impl Rank {
    /// Returns the integer value of this rank.
    #[must_use]
    pub const fn value(self) -> u8 {
        match self.status() {
            Some(status) => status as u8,
            None => TO_UPDATE_RANK,
        }
    }

    /// Reverse lookup from an integer value.
    #[must_use]
    pub fn from_value(value: u8) -> Option<Self> {
        if value == TO_UPDATE_RANK {
            return Some(Self::ToUpdate);
        }
        ObjectStatus::ALL.get(usize::from(value)).map(|s| s.rank())
    }

    /// Returns the status this rank stands for, `None` for the sentinel.
    #[must_use]
    pub const fn status(self) -> Option<ObjectStatus> {
        match self {
            Self::Unknown => Some(ObjectStatus::Unknown),
            Self::Upload => Some(ObjectStatus::Upload),
            Self::Ready => Some(ObjectStatus::Ready),
            Self::ErrUpl => Some(ObjectStatus::ErrUpl),
            Self::Deleting => Some(ObjectStatus::Deleting),
            Self::Deleted => Some(ObjectStatus::Deleted),
            Self::ErrDel => Some(ObjectStatus::ErrDel),
            Self::ToUpdate => None,
        }
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self.status() {
            Some(status) => status.as_str(),
            None => "TO_UPDATE",
        }
    }

    /// Parses a rank name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("TO_UPDATE") {
            return Some(Self::ToUpdate);
        }
        ObjectStatus::parse(name).map(ObjectStatus::rank)
    }

    /// `UPLOAD`, `READY`, `ERR_UPL` or `TO_UPDATE`: the object is claimed present.
    #[must_use]
    pub const fn is_upload_like(self) -> bool {
        matches!(self, Self::Upload | Self::Ready | Self::ErrUpl | Self::ToUpdate)
    }

    /// `DELETING`, `DELETED` or `ERR_DEL`.
    #[must_use]
    pub const fn is_delete_like(self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted | Self::ErrDel)
    }

    /// Ranks carried forward across sites once a request is finalized.
    #[must_use]
    pub const fn is_converged_signal(self) -> bool {
        matches!(self, Self::Ready | Self::Deleted | Self::ToUpdate)
    }

    /// Ranks that may win an upload in the action planner.
    #[must_use]
    pub const fn is_upload_candidate(self) -> bool {
        matches!(self, Self::Ready | Self::ToUpdate)
    }
}

impl From<ObjectStatus> for Rank {
    fn from(status: ObjectStatus) -> Self {
        status.rank()
    }
}

impl From<Rank> for u8 {
    fn from(rank: Rank) -> Self {
        rank.value()
    }
}

impl TryFrom<u8> for Rank {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_value(value).ok_or_else(|| format!("rank out of range: {value}"))
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
