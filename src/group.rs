//! Ordered sets of ranks.
//!
//! A [`ProcessGroup`] names a subset of a communicator's ranks, in a chosen
//! order. It is plain data: building one involves no communication. It only
//! becomes a communication context when passed to
//! [`Communicator::create_group`](crate::Communicator::create_group) or
//! [`ProcessController::create_sub_controller`](crate::ProcessController::create_sub_controller).

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// An ordered, duplicate-free list of ranks relative to a parent communicator.
///
/// Position `i` in the group becomes rank `i` in a communicator built from it.
///
/// # Example
///
/// ```
/// use ferroctl::ProcessGroup;
///
/// let mut group = ProcessGroup::from_ranks([3, 1]).unwrap();
/// assert_eq!(group.add_rank(2).unwrap(), 2);
/// assert_eq!(group.add_rank(1).unwrap(), 1); // already present
/// assert_eq!(group.ranks(), &[3, 1, 2]);
/// assert!(ProcessGroup::from_ranks([0, 0]).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessGroup {
    ranks: Vec<i32>,
}

impl ProcessGroup {
    /// An empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// The group `0, 1, …, size-1`, i.e. every rank of a communicator of `size`.
    pub fn with_size(size: i32) -> Self {
        ProcessGroup {
            ranks: (0..size.max(0)).collect(),
        }
    }

    /// Build a group from ranks in the given order.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRank`] for a negative rank, [`Error::DuplicateRank`]
    /// if a rank appears twice.
    pub fn from_ranks<I>(ranks: I) -> Result<Self>
    where
        I: IntoIterator<Item = i32>,
    {
        let mut group = ProcessGroup::new();
        for rank in ranks {
            if group.contains(rank) {
                return Err(Error::DuplicateRank(rank));
            }
            group.add_rank(rank)?;
        }
        Ok(group)
    }

    /// Append `rank` unless already present; returns its position either way.
    pub fn add_rank(&mut self, rank: i32) -> Result<usize> {
        if rank < 0 {
            return Err(Error::InvalidRank(rank));
        }
        if let Some(position) = self.position_of(rank) {
            return Ok(position);
        }
        self.ranks.push(rank);
        Ok(self.ranks.len() - 1)
    }

    /// Remove `rank`, returning the position it held.
    ///
    /// Ranks after it move up one position.
    pub fn remove_rank(&mut self, rank: i32) -> Option<usize> {
        let position = self.position_of(rank)?;
        self.ranks.remove(position);
        Some(position)
    }

    /// Remove every rank.
    pub fn clear(&mut self) {
        self.ranks.clear();
    }

    /// Rank at `position`.
    pub fn rank_at(&self, position: usize) -> Option<i32> {
        self.ranks.get(position).copied()
    }

    /// Position of `rank` in the group.
    pub fn position_of(&self, rank: i32) -> Option<usize> {
        self.ranks.iter().position(|&r| r == rank)
    }

    /// Whether `rank` is a member.
    pub fn contains(&self, rank: i32) -> bool {
        self.ranks.contains(&rank)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Members in group order.
    pub fn ranks(&self) -> &[i32] {
        &self.ranks
    }

    /// Iterate over members in group order.
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.ranks.iter().copied()
    }

    /// Sub-group made of the members at `positions`, in that order.
    pub fn select(&self, positions: &[usize]) -> Result<Self> {
        let ranks = positions
            .iter()
            .map(|&p| {
                self.rank_at(p)
                    .ok_or_else(|| Error::InvalidRank(i32::try_from(p).unwrap_or(i32::MAX)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_ranks(ranks)
    }

    /// Split into disjoint sub-groups keyed by `color(rank)`.
    ///
    /// Members keep their relative order. Ranks mapped to `None` are left out.
    pub fn partition<F>(&self, mut color: F) -> BTreeMap<i32, ProcessGroup>
    where
        F: FnMut(i32) -> Option<i32>,
    {
        let mut parts: BTreeMap<i32, ProcessGroup> = BTreeMap::new();
        for rank in self.iter() {
            if let Some(c) = color(rank) {
                parts.entry(c).or_default().ranks.push(rank);
            }
        }
        parts
    }
}

impl<'a> IntoIterator for &'a ProcessGroup {
    type Item = i32;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, i32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranks.iter().copied()
    }
}

/// Layout of a colour/key split.
///
/// `entries[r]` is the `(color, key)` pair supplied by parent rank `r`.
/// Returns, for every non-negative colour in ascending order, the parent ranks
/// of that colour sorted by ascending key with ties broken by parent rank.
/// Negative colours opt out.
pub fn partition_members(entries: &[(i32, i32)]) -> BTreeMap<i32, Vec<i32>> {
    let mut layout: BTreeMap<i32, Vec<(i32, i32)>> = BTreeMap::new();
    for (rank, &(color, key)) in entries.iter().enumerate() {
        if color >= 0 {
            layout.entry(color).or_default().push((key, rank as i32));
        }
    }
    layout
        .into_iter()
        .map(|(color, mut members)| {
            members.sort_unstable();
            (color, members.into_iter().map(|(_, rank)| rank).collect())
        })
        .collect()
}
