//! Read preferences: how operations are routed to members of the set.

use std::{collections::HashMap, fmt, time::Duration};

/// The default width of the acceptable-latency window.
pub(crate) const DEFAULT_ACCEPTABLE_LATENCY: Duration = Duration::from_millis(15);

/// A read preference tag set. A member matches a tag set when the member's
/// tags are a superset of it; the empty tag set matches any member.
pub type TagSet = HashMap<String, String>;

/// Which member roles an operation may be routed to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReadMode {
    /// Only route this operation to the primary.
    #[default]
    Primary,

    /// Route this operation to the primary if it's available, otherwise to a
    /// secondary.
    PrimaryPreferred,

    /// Only route this operation to a secondary.
    Secondary,

    /// Route this operation to a secondary if one is available, otherwise to
    /// the primary.
    SecondaryPreferred,

    /// Route this operation to the member with the lowest network latency
    /// regardless of role.
    Nearest,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadMode::Primary => "primary",
            ReadMode::PrimaryPreferred => "primaryPreferred",
            ReadMode::Secondary => "secondary",
            ReadMode::SecondaryPreferred => "secondaryPreferred",
            ReadMode::Nearest => "nearest",
        };
        write!(f, "{}", name)
    }
}

impl ReadMode {
    /// The noun used when reporting that no member satisfied this mode.
    pub(crate) fn role_noun(&self) -> &'static str {
        match self {
            ReadMode::Primary => "primary",
            ReadMode::Secondary => "secondary",
            _ => "members",
        }
    }
}

/// A full read preference: mode, tag sets tried in order, and the width of
/// the acceptable-latency window used when several members are eligible.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadPreference {
    /// Which member roles are acceptable.
    pub mode: ReadMode,

    /// Tag sets, tried in order until one matches at least one member. A
    /// final empty set means "any member matching the mode".
    pub tag_sets: Vec<TagSet>,

    /// Any eligible member whose average ping time is within this window of
    /// the fastest eligible member may be chosen.
    pub latency: Duration,
}

impl Default for ReadPreference {
    fn default() -> Self {
        Self::new(ReadMode::Primary, None)
    }
}

impl ReadPreference {
    /// Creates a read preference with the default latency window.
    pub fn new(mode: ReadMode, tag_sets: Option<Vec<TagSet>>) -> Self {
        let tag_sets = match tag_sets {
            Some(sets) if !sets.is_empty() => sets,
            _ => vec![TagSet::new()],
        };
        Self {
            mode,
            tag_sets,
            latency: DEFAULT_ACCEPTABLE_LATENCY,
        }
    }

    /// Only route to the primary.
    pub fn primary() -> Self {
        Self::new(ReadMode::Primary, None)
    }

    /// Route to a secondary matching `tag_sets`.
    pub fn secondary(tag_sets: Option<Vec<TagSet>>) -> Self {
        Self::new(ReadMode::Secondary, tag_sets)
    }

    /// Route to the primary when available, else a matching secondary.
    pub fn primary_preferred(tag_sets: Option<Vec<TagSet>>) -> Self {
        Self::new(ReadMode::PrimaryPreferred, tag_sets)
    }

    /// Route to a matching secondary when available, else the primary.
    pub fn secondary_preferred(tag_sets: Option<Vec<TagSet>>) -> Self {
        Self::new(ReadMode::SecondaryPreferred, tag_sets)
    }

    /// Route to the nearest matching member regardless of role.
    pub fn nearest(tag_sets: Option<Vec<TagSet>>) -> Self {
        Self::new(ReadMode::Nearest, tag_sets)
    }

    /// Replaces the latency window.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// Convenience constructor for a [`TagSet`]:
/// `tag_set! { "dc" => "ny", "rack" => "1" }`.
#[macro_export]
macro_rules! tag_set {
    ( $($k:expr => $v:expr),* $(,)? ) => {
        {
            #[allow(unused_mut)]
            let mut ts = $crate::TagSet::new();
            $(
                ts.insert($k.to_string(), $v.to_string());
            )*
            ts
        }
    }
}
