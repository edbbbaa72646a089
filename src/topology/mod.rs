//! The client's view of the replica set: immutable state snapshots, member
//! descriptors, and the member-selection rules.

pub(crate) mod member;
pub(crate) mod monitor;
pub(crate) mod select;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    options::ServerAddress,
    read_preference::{ReadMode, TagSet},
    runtime,
};

pub(crate) use self::member::Member;

const NO_PRIMARY: &str = "No primary available";

/// A task's routing pin: the member it last used and the read preference it
/// used it under. Kept only while the preference stays the same.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TaskPin {
    host: ServerAddress,
    mode: ReadMode,
    tag_sets: Vec<TagSet>,
    latency: Duration,
}

/// Per-task pin storage. Shared between consecutive snapshots while the
/// primary is unchanged; replacing it wholesale unpins every task.
pub(crate) type PinStore = Arc<Mutex<HashMap<tokio::task::Id, TaskPin>>>;

/// An immutable snapshot of the client's view of the replica set.
///
/// Snapshots are never mutated (the task-pin store aside, which is only a
/// routing hint): the client replaces its current snapshot with an updated
/// clone, so any task that copied the pointer keeps a consistent view for
/// the duration of its operation.
#[derive(Clone, Debug)]
pub(crate) struct RsState {
    members: HashMap<ServerAddress, Member>,
    arbiters: HashSet<ServerAddress>,
    writer: Option<ServerAddress>,
    error_message: String,
    pins: PinStore,
}

impl RsState {
    /// A snapshot with no known members and a fresh pin store.
    pub(crate) fn empty() -> Self {
        Self::with_error(
            Arc::default(),
            HashMap::new(),
            HashSet::new(),
            None,
            NO_PRIMARY,
        )
    }

    pub(crate) fn new(
        pins: PinStore,
        members: HashMap<ServerAddress, Member>,
        arbiters: HashSet<ServerAddress>,
        writer: Option<ServerAddress>,
    ) -> Self {
        Self::with_error(pins, members, arbiters, writer, NO_PRIMARY)
    }

    fn with_error(
        pins: PinStore,
        members: HashMap<ServerAddress, Member>,
        arbiters: HashSet<ServerAddress>,
        writer: Option<ServerAddress>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            members,
            arbiters,
            writer,
            error_message: error_message.into(),
            pins,
        }
    }

    pub(crate) fn get(&self, address: &ServerAddress) -> Option<&Member> {
        self.members.get(address)
    }

    pub(crate) fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// The addresses of the data-bearing members.
    pub(crate) fn hosts(&self) -> HashSet<ServerAddress> {
        self.members.keys().cloned().collect()
    }

    pub(crate) fn arbiters(&self) -> &HashSet<ServerAddress> {
        &self.arbiters
    }

    pub(crate) fn writer(&self) -> Option<&ServerAddress> {
        self.writer.as_ref()
    }

    pub(crate) fn secondaries(&self) -> HashSet<ServerAddress> {
        self.members
            .iter()
            .filter(|(_, member)| member.is_secondary())
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// The primary, when it is known and up.
    pub(crate) fn primary_member(&self) -> Option<&Member> {
        self.writer
            .as_ref()
            .and_then(|writer| self.members.get(writer))
            .filter(|member| member.up && member.is_primary())
    }

    /// Why `writer` is unset, for error reporting.
    pub(crate) fn error_message(&self) -> &str {
        &self.error_message
    }

    pub(crate) fn pin_store(&self) -> PinStore {
        Arc::clone(&self.pins)
    }

    /// A clone with the given member marked down. If the downed member was
    /// the writer, the clone has no writer and records `error_message`;
    /// otherwise the writer and its error message carry over.
    pub(crate) fn clone_with_host_down(
        &self,
        address: &ServerAddress,
        error_message: impl Into<String>,
    ) -> Self {
        let mut members = self.members.clone();
        if let Some(member) = members.get(address) {
            members.insert(address.clone(), member.clone_down());
        }

        if Some(address) == self.writer.as_ref() {
            Self::with_error(
                Arc::clone(&self.pins),
                members,
                self.arbiters.clone(),
                None,
                error_message,
            )
        } else {
            Self::with_error(
                Arc::clone(&self.pins),
                members,
                self.arbiters.clone(),
                self.writer.clone(),
                self.error_message.clone(),
            )
        }
    }

    /// A clone without a writer and with a fresh pin store, which unpins
    /// every task.
    pub(crate) fn clone_without_writer(&self) -> Self {
        Self::new(
            Arc::default(),
            self.members.clone(),
            self.arbiters.clone(),
            None,
        )
    }

    /// Pins the running task to a member under the given preference.
    pub(crate) fn pin_host(
        &self,
        host: ServerAddress,
        mode: ReadMode,
        tag_sets: &[TagSet],
        latency: Duration,
    ) {
        if let Some(task) = runtime::task_id() {
            self.pins.lock().unwrap().insert(
                task,
                TaskPin {
                    host,
                    mode,
                    tag_sets: tag_sets.to_vec(),
                    latency,
                },
            );
        }
    }

    /// Whether the running task's stored pin was made under exactly this
    /// read preference.
    pub(crate) fn keep_pinned_host(
        &self,
        mode: ReadMode,
        tag_sets: &[TagSet],
        latency: Duration,
    ) -> bool {
        match runtime::task_id() {
            Some(task) => self.pins.lock().unwrap().get(&task).is_some_and(|pin| {
                pin.mode == mode && pin.tag_sets == tag_sets && pin.latency == latency
            }),
            None => false,
        }
    }

    /// The member the running task last used, if it is pinned.
    pub(crate) fn pinned_host(&self) -> Option<ServerAddress> {
        runtime::task_id()
            .and_then(|task| self.pins.lock().unwrap().get(&task).map(|pin| pin.host.clone()))
    }

    /// Forgets the running task's pin.
    pub(crate) fn unpin_host(&self) {
        if let Some(task) = runtime::task_id() {
            self.pins.lock().unwrap().remove(&task);
        }
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;
    use crate::{read_preference::ReadMode, testutil};

    fn fixture() -> RsState {
        let a = testutil::member("a:27017", doc! { "ismaster": true }, 5);
        let b = testutil::member("b:27017", doc! { "ismaster": false, "secondary": true }, 5);
        let members: HashMap<_, _> = [(a.address.clone(), a), (b.address.clone(), b)].into();
        let arbiters = [ServerAddress::parse("c:27017").unwrap()].into();
        RsState::new(
            Arc::default(),
            members,
            arbiters,
            Some(ServerAddress::parse("a:27017").unwrap()),
        )
    }

    #[test]
    fn primary_member_requires_an_up_primary() {
        let state = fixture();
        assert_eq!(
            state.primary_member().unwrap().address.to_string(),
            "a:27017"
        );
        assert_eq!(state.secondaries().len(), 1);
        assert_eq!(state.arbiters().len(), 1);
    }

    #[test]
    fn arbiters_are_disjoint_from_members() {
        let state = fixture();
        for arbiter in state.arbiters() {
            assert!(state.get(arbiter).is_none());
        }
    }

    #[test]
    fn marking_the_writer_down_clears_it_and_records_the_error() {
        let state = fixture();
        let writer = ServerAddress::parse("a:27017").unwrap();
        let downed = state.clone_with_host_down(&writer, "connection reset");

        assert!(downed.writer().is_none());
        assert!(downed.primary_member().is_none());
        assert_eq!(downed.error_message(), "connection reset");
        assert!(!downed.get(&writer).unwrap().up);

        // The original snapshot is untouched.
        assert!(state.primary_member().is_some());
        assert!(state.get(&writer).unwrap().up);
    }

    #[test]
    fn marking_a_secondary_down_keeps_the_writer() {
        let state = fixture();
        let secondary = ServerAddress::parse("b:27017").unwrap();
        let downed = state.clone_with_host_down(&secondary, "connection reset");

        assert_eq!(downed.writer(), state.writer());
        assert_eq!(downed.error_message(), NO_PRIMARY);
        assert!(!downed.get(&secondary).unwrap().up);
    }

    #[tokio::test]
    async fn pins_are_scoped_to_the_preference() {
        let state = fixture();
        let host = ServerAddress::parse("b:27017").unwrap();
        let tag_sets = vec![TagSet::new()];
        let latency = Duration::from_millis(15);

        assert!(state.pinned_host().is_none());
        state.pin_host(host.clone(), ReadMode::Secondary, &tag_sets, latency);
        assert_eq!(state.pinned_host(), Some(host));
        assert!(state.keep_pinned_host(ReadMode::Secondary, &tag_sets, latency));
        assert!(!state.keep_pinned_host(ReadMode::Nearest, &tag_sets, latency));

        state.unpin_host();
        assert!(state.pinned_host().is_none());
    }

    #[tokio::test]
    async fn clone_without_writer_unpins_tasks() {
        let state = fixture();
        let host = ServerAddress::parse("b:27017").unwrap();
        state.pin_host(
            host,
            ReadMode::Secondary,
            &[TagSet::new()],
            Duration::from_millis(15),
        );

        let cleared = state.clone_without_writer();
        assert!(cleared.writer().is_none());
        assert!(cleared.pinned_host().is_none());
        assert_eq!(cleared.hosts(), state.hosts());
        // Members are carried over without being marked down.
        assert!(cleared.get(&ServerAddress::parse("a:27017").unwrap()).unwrap().up);
    }
}
