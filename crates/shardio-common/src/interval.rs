//! Byte interval sets
//!
//! A set of half-open `[start, start + len)` ranges over `u64`, kept
//! coalesced: no two stored intervals overlap or touch. Used for clone
//! overlap maps, dirty-region tracking and recovery subsets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntervalSet {
    /// start -> length, never overlapping or adjacent
    map: BTreeMap<u64, u64>,
}

impl IntervalSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Set containing the single interval `[start, start + len)`
    #[must_use]
    pub fn from_range(start: u64, len: u64) -> Self {
        let mut set = Self::new();
        set.insert(start, len);
        set
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of disjoint intervals
    #[must_use]
    pub fn num_intervals(&self) -> usize {
        self.map.len()
    }

    /// Total number of bytes covered
    #[must_use]
    pub fn size(&self) -> u64 {
        self.map.values().sum()
    }

    /// First covered offset
    #[must_use]
    pub fn range_start(&self) -> Option<u64> {
        self.map.keys().next().copied()
    }

    /// One past the last covered offset
    #[must_use]
    pub fn range_end(&self) -> Option<u64> {
        self.map.iter().next_back().map(|(s, l)| s + l)
    }

    /// Iterate `(start, len)` pairs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(s, l)| (*s, *l))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Add `[start, start + len)`, merging with anything it overlaps or
    /// touches
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start.saturating_add(len);

        // A predecessor that reaches `start` absorbs into the new interval
        if let Some((&s, &l)) = self.map.range(..=start).next_back() {
            if s + l >= start {
                new_start = s;
                new_end = new_end.max(s + l);
                self.map.remove(&s);
            }
        }

        let swallowed: Vec<(u64, u64)> = self
            .map
            .range(new_start..=new_end)
            .map(|(s, l)| (*s, *l))
            .collect();
        for (s, l) in swallowed {
            new_end = new_end.max(s + l);
            self.map.remove(&s);
        }

        self.map.insert(new_start, new_end - new_start);
    }

    /// Remove `[start, start + len)`; parts not present are ignored
    pub fn erase(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start.saturating_add(len);

        let mut touched: Vec<(u64, u64)> = Vec::new();
        if let Some((&s, &l)) = self.map.range(..start).next_back() {
            if s + l > start {
                touched.push((s, l));
            }
        }
        touched.extend(self.map.range(start..end).map(|(s, l)| (*s, *l)));

        for (s, l) in touched {
            self.map.remove(&s);
            let e = s + l;
            if s < start {
                self.map.insert(s, start - s);
            }
            if e > end {
                self.map.insert(end, e - end);
            }
        }
    }

    /// True if `[start, start + len)` is fully covered
    #[must_use]
    pub fn contains(&self, start: u64, len: u64) -> bool {
        let end = start.saturating_add(len);
        self.map
            .range(..=start)
            .next_back()
            .is_some_and(|(s, l)| *s <= start && s + l >= end)
    }

    /// True if any byte of `[start, start + len)` is covered
    #[must_use]
    pub fn intersects(&self, start: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let end = start.saturating_add(len);
        if let Some((s, l)) = self.map.range(..=start).next_back() {
            if s + l > start {
                return true;
            }
        }
        self.map.range(start..end).next().is_some()
    }

    /// Keep only what is also covered by `other`
    pub fn intersection_of(&mut self, other: &Self) {
        let mut out = BTreeMap::new();
        let mut a = self.map.iter().peekable();
        let mut b = other.map.iter().peekable();

        while let (Some(&(&sa, &la)), Some(&(&sb, &lb))) = (a.peek(), b.peek()) {
            let (ea, eb) = (sa + la, sb + lb);
            let lo = sa.max(sb);
            let hi = ea.min(eb);
            if lo < hi {
                out.insert(lo, hi - lo);
            }
            if ea <= eb {
                a.next();
            } else {
                b.next();
            }
        }

        self.map = out;
    }

    /// Add everything covered by `other`
    pub fn union_of(&mut self, other: &Self) {
        for (s, l) in other.iter() {
            self.insert(s, l);
        }
    }

    /// Remove everything covered by `other`
    pub fn subtract(&mut self, other: &Self) {
        for (s, l) in other.iter() {
            self.erase(s, l);
        }
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (s, l)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{s}~{l}")?;
        }
        write!(f, "]")
    }
}

impl FromIterator<(u64, u64)> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (s, l) in iter {
            set.insert(s, l);
        }
        set
    }
}
