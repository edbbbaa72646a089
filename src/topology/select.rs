use std::time::Duration;

use rand::seq::IndexedRandom;

use super::member::Member;
use crate::read_preference::{ReadMode, TagSet};

/// Picks the member an operation should be routed to, or `None` when no
/// member satisfies the preference. Only `up` members are ever returned.
pub(crate) fn select_member<'a>(
    members: &'a [Member],
    mode: ReadMode,
    tag_sets: &[TagSet],
    latency: Duration,
) -> Option<&'a Member> {
    match mode {
        ReadMode::Primary => select_primary(members, tag_sets),
        ReadMode::PrimaryPreferred => select_primary(members, tag_sets)
            .or_else(|| select_with_tags(members, tag_sets, true, latency)),
        ReadMode::Secondary => select_with_tags(members, tag_sets, true, latency),
        ReadMode::SecondaryPreferred => select_with_tags(members, tag_sets, true, latency)
            .or_else(|| select_primary(members, &[TagSet::new()])),
        ReadMode::Nearest => select_with_tags(members, tag_sets, false, latency),
    }
}

fn select_primary<'a>(members: &'a [Member], tag_sets: &[TagSet]) -> Option<&'a Member> {
    members
        .iter()
        .find(|m| m.is_primary() && m.up && m.matches_tag_sets(tag_sets))
}

/// Tries each tag set in order; the first one with matching members defines
/// the eligible subset, from which a member inside the latency window is
/// chosen at random.
fn select_with_tags<'a>(
    members: &'a [Member],
    tag_sets: &[TagSet],
    secondary_only: bool,
    latency: Duration,
) -> Option<&'a Member> {
    let candidates: Vec<&Member> = members
        .iter()
        .filter(|m| m.up)
        .filter(|m| !secondary_only || m.is_secondary())
        .filter(|m| m.is_primary() || m.is_secondary())
        .collect();

    for tags in tag_sets {
        let matching: Vec<&Member> = candidates
            .iter()
            .filter(|m| m.matches_tags(tags))
            .copied()
            .collect();
        if matching.is_empty() {
            continue;
        }

        let fastest = matching.iter().map(|m| m.average_ping()).min()?;
        let near: Vec<&Member> = matching
            .into_iter()
            .filter(|m| m.average_ping().saturating_sub(fastest) <= latency)
            .collect();
        return near.choose(&mut rand::rng()).copied();
    }

    None
}
