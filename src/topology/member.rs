use std::time::Duration;

use bson::{Bson, Document};

use crate::{
    options::ServerAddress,
    pool::Pool,
    read_preference::{ReadMode, TagSet},
};

/// The default maximum document size, used when a member's handshake does not
/// report one.
pub(crate) const DEFAULT_MAX_DOCUMENT_SIZE: i32 = 4 * 1024 * 1024;

/// The number of handshake round-trip samples a ping average retains.
const PING_SAMPLES: usize = 5;

/// A member's role as reported by its latest handshake. Recovering, starting,
/// and hidden members all land in `Other` and are never routing targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MemberState {
    Primary,
    Secondary,
    Other,
}

/// A moving average of handshake round-trip times over the most recent
/// samples. Extending it returns a new value; existing snapshots keep the
/// average they were built with.
#[derive(Clone, Debug)]
pub(crate) struct MovingAverage {
    samples: Vec<Duration>,
}

impl MovingAverage {
    pub(crate) fn new(sample: Duration) -> Self {
        Self {
            samples: vec![sample],
        }
    }

    pub(crate) fn clone_with(&self, sample: Duration) -> Self {
        let mut samples = self.samples.clone();
        samples.push(sample);
        if samples.len() > PING_SAMPLES {
            samples.remove(0);
        }
        Self { samples }
    }

    pub(crate) fn get(&self) -> Duration {
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }
}

/// Immutable description of one member of the set: its role, tags and limits
/// from the last handshake, plus a handle to its connection pool. Pools are
/// shared by address across successive snapshots; everything else is replaced
/// wholesale by `clone_with`.
#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub(crate) address: ServerAddress,
    pub(crate) pool: Pool,
    #[allow(dead_code)]
    pub(crate) handshake: Document,
    pub(crate) state: MemberState,
    pub(crate) tags: TagSet,
    pub(crate) max_document_size: i32,
    pub(crate) ping: MovingAverage,
    pub(crate) up: bool,
}

impl Member {
    pub(crate) fn new(
        address: ServerAddress,
        pool: Pool,
        handshake: Document,
        ping: MovingAverage,
        up: bool,
    ) -> Self {
        let state = if handshake.get_bool("ismaster").unwrap_or(false) {
            MemberState::Primary
        } else if handshake.get_bool("secondary").unwrap_or(false) {
            MemberState::Secondary
        } else {
            MemberState::Other
        };

        let tags = handshake
            .get_document("tags")
            .map(|tags| {
                tags.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let max_document_size = match handshake.get("maxBsonObjectSize") {
            Some(Bson::Int32(size)) => *size,
            Some(Bson::Int64(size)) => *size as i32,
            Some(Bson::Double(size)) => *size as i32,
            _ => DEFAULT_MAX_DOCUMENT_SIZE,
        };

        Self {
            address,
            pool,
            handshake,
            state,
            tags,
            max_document_size,
            ping,
            up,
        }
    }

    /// An updated member from a fresh handshake and its round-trip time. The
    /// pool carries over; the role, tags and limits are rederived.
    pub(crate) fn clone_with(&self, handshake: Document, ping_sample: Duration) -> Self {
        Self::new(
            self.address.clone(),
            self.pool.clone(),
            handshake,
            self.ping.clone_with(ping_sample),
            true,
        )
    }

    /// The same member marked unavailable. It keeps its last handshake but
    /// must not be selected until a refresh revives it.
    pub(crate) fn clone_down(&self) -> Self {
        Self {
            up: false,
            ..self.clone()
        }
    }

    /// The same member with its primacy revoked. Applied to the losers of a
    /// double-primary race so that a snapshot never carries two primaries.
    pub(crate) fn clone_demoted(&self) -> Self {
        Self {
            state: MemberState::Other,
            ..self.clone()
        }
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.state == MemberState::Primary
    }

    pub(crate) fn is_secondary(&self) -> bool {
        self.state == MemberState::Secondary
    }

    pub(crate) fn average_ping(&self) -> Duration {
        self.ping.get()
    }

    /// Whether this member's role satisfies `mode`. Members that are neither
    /// primary nor secondary (recovering etc.) satisfy no mode.
    pub(crate) fn matches_mode(&self, mode: ReadMode) -> bool {
        match mode {
            ReadMode::Primary => self.is_primary(),
            ReadMode::Secondary => self.is_secondary(),
            _ => self.is_primary() || self.is_secondary(),
        }
    }

    /// Whether this member's tags are a superset of `tags`. A member tagged
    /// `{dc: ny, rack: 1}` matches `{dc: ny}`.
    pub(crate) fn matches_tags(&self, tags: &TagSet) -> bool {
        tags.iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }

    /// Whether this member matches any of `tag_sets`.
    pub(crate) fn matches_tag_sets(&self, tag_sets: &[TagSet]) -> bool {
        tag_sets.iter().any(|tags| self.matches_tags(tags))
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use bson::doc;

    use super::*;
    use crate::tag_set;

    pub(crate) fn test_member(handshake: Document) -> Member {
        let address = ServerAddress::parse("test:27017").unwrap();
        let pool = Pool::new(address.clone(), Default::default());
        Member::new(
            address,
            pool,
            handshake,
            MovingAverage::new(Duration::from_millis(5)),
            true,
        )
    }

    #[test]
    fn moving_average_keeps_a_bounded_window() {
        let mut avg = MovingAverage::new(Duration::from_millis(10));
        for _ in 0..10 {
            avg = avg.clone_with(Duration::from_millis(20));
        }
        // The initial sample has aged out of the window entirely.
        assert_relative_eq!(avg.get().as_secs_f64(), 0.020, epsilon = 1e-9);
    }

    #[test]
    fn moving_average_is_monotone_in_recent_samples() {
        let slow = MovingAverage::new(Duration::from_millis(10))
            .clone_with(Duration::from_millis(40));
        let fast = MovingAverage::new(Duration::from_millis(10))
            .clone_with(Duration::from_millis(20));
        assert!(slow.get() > fast.get());
    }

    #[test]
    fn state_is_derived_from_the_handshake() {
        assert_eq!(
            test_member(doc! { "ismaster": true }).state,
            MemberState::Primary
        );
        assert_eq!(
            test_member(doc! { "ismaster": false, "secondary": true }).state,
            MemberState::Secondary
        );
        assert_eq!(
            test_member(doc! { "ismaster": false }).state,
            MemberState::Other
        );
    }

    #[test]
    fn recovering_members_match_no_mode() {
        let recovering = test_member(doc! { "ismaster": false, "secondary": false });
        for mode in [
            ReadMode::Primary,
            ReadMode::PrimaryPreferred,
            ReadMode::Secondary,
            ReadMode::SecondaryPreferred,
            ReadMode::Nearest,
        ] {
            assert!(!recovering.matches_mode(mode));
        }
    }

    #[test]
    fn tag_matching_is_superset_based() {
        let member = test_member(doc! {
            "ismaster": false,
            "secondary": true,
            "tags": { "dc": "ny", "rack": "1" },
        });
        assert!(member.matches_tags(&tag_set! { "dc" => "ny" }));
        assert!(member.matches_tags(&tag_set! {}));
        assert!(!member.matches_tags(&tag_set! { "dc" => "la" }));
        assert!(member.matches_tag_sets(&[tag_set! { "dc" => "la" }, tag_set! { "dc" => "ny" }]));
        assert!(!member.matches_tag_sets(&[tag_set! { "dc" => "la" }]));
    }

    #[test]
    fn clone_with_rederives_role_and_extends_ping() {
        let member = test_member(doc! { "ismaster": true, "maxBsonObjectSize": 16 * 1024 * 1024 });
        assert_eq!(member.max_document_size, 16 * 1024 * 1024);

        let demoted = member.clone_with(
            doc! { "ismaster": false, "secondary": true },
            Duration::from_millis(15),
        );
        assert_eq!(demoted.state, MemberState::Secondary);
        assert_eq!(demoted.max_document_size, DEFAULT_MAX_DOCUMENT_SIZE);
        assert!(demoted.up);
        assert!(demoted.average_ping() > member.average_ping());

        let down = demoted.clone_down();
        assert!(!down.up);
        assert_eq!(down.state, MemberState::Secondary);
    }

    #[test]
    fn clone_demoted_revokes_primacy_but_not_availability() {
        let member = test_member(doc! { "ismaster": true });
        let demoted = member.clone_demoted();
        assert_eq!(demoted.state, MemberState::Other);
        assert!(demoted.up);
        assert!(!demoted.matches_mode(ReadMode::Primary));
    }
}
