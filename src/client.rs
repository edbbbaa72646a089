//! The client facade: topology refresh, request routing, and the public
//! operations surface.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use bson::{doc, Document};
use tracing::debug;

use crate::{
    auth::{self, Credential},
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    pool::{Pool, PoolOptions, PooledSocket},
    read_preference::{ReadMode, ReadPreference, TagSet},
    runtime::{self, TlsConfig},
    topology::{
        member::MovingAverage,
        monitor::{Monitor, MonitorSignals, REFRESH_INTERVAL, REFRESH_WAIT_TIMEOUT},
        select::select_member,
        Member, PinStore, RsState,
    },
    wire::{self, RawMessage},
};

/// How many members the router tries before giving up on an operation.
const MAX_RETRY: usize = 3;

/// Designates the member an operation must run on, overriding member
/// selection. Cursor follow-ups (get-more, kill-cursors) use `Member` to
/// reach the node that owns the cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UseConnection {
    /// Route to the current primary, whichever member that is.
    Primary,

    /// Route to this specific member.
    Member(ServerAddress),
}

pub(crate) struct ClientInner {
    seeds: Vec<ServerAddress>,
    options: ClientOptions,
    pool_options: PoolOptions,
    state: RwLock<Arc<RsState>>,
    signals: MonitorSignals,
    monitor_started: AtomicBool,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    request_counter: Mutex<HashMap<tokio::task::Id, u32>>,
    credentials: Mutex<HashMap<String, Credential>>,
}

impl ClientInner {
    pub(crate) fn state(&self) -> Arc<RsState> {
        Arc::clone(&self.state.read().unwrap())
    }

    fn install(&self, state: RsState) {
        *self.state.write().unwrap() = Arc::new(state);
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.signals.shutdown();
    }
}

/// A single logical connection to a replica set.
///
/// The client discovers and tracks the membership and roles of the set from
/// a seed list, routes operations according to read preferences, and keeps a
/// connection pool per member. Cloning is cheap and shares all state.
///
/// A background monitor task refreshes the view of the set every 30 seconds
/// and on demand after errors; call [`close`](Self::close) to stop it before
/// discarding the last clone.
#[derive(Clone)]
pub struct ReplicaSetClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ReplicaSetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut hosts: Vec<String> = self
            .inner
            .state()
            .hosts()
            .into_iter()
            .map(|h| h.to_string())
            .collect();
        hosts.sort();
        f.debug_struct("ReplicaSetClient")
            .field("hosts", &hosts)
            .finish()
    }
}

impl ReplicaSetClient {
    /// Connects to the replica set described by `options`, performing the
    /// initial discovery handshake against the seed list.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let tls = options
            .tls_options
            .as_ref()
            .map(TlsConfig::new)
            .transpose()?;
        let pool_options = PoolOptions {
            max_size: options.max_pool_size,
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            wait_queue_timeout: options.wait_queue_timeout,
            wait_queue_multiple: options.wait_queue_multiple,
            tls,
        };

        let mut seeds = options.hosts.clone();
        seeds.sort();
        seeds.dedup();

        let inner = Arc::new(ClientInner {
            seeds,
            options,
            pool_options,
            state: RwLock::new(Arc::new(RsState::empty())),
            signals: MonitorSignals::new(),
            monitor_started: AtomicBool::new(false),
            monitor: Mutex::new(None),
            request_counter: Mutex::new(HashMap::new()),
            credentials: Mutex::new(HashMap::new()),
        });

        if let Err(error) = refresh(&inner, false).await {
            // The set being unreachable at construction is a hard failure,
            // not a retry-later condition.
            if error.is_auto_reconnect() {
                return Err(Error::connection(error.to_string()));
            }
            return Err(error);
        }

        let client = Self { inner };
        ensure_monitor(&client.inner);
        Ok(client)
    }

    /// The seed list this client was configured with.
    pub fn seeds(&self) -> &[ServerAddress] {
        &self.inner.seeds
    }

    /// All data-bearing members currently known.
    pub fn hosts(&self) -> HashSet<ServerAddress> {
        self.inner.state().hosts()
    }

    /// The current primary, if one is known.
    pub fn primary(&self) -> Option<ServerAddress> {
        self.inner.state().writer().cloned()
    }

    /// The secondaries currently known.
    pub fn secondaries(&self) -> HashSet<ServerAddress> {
        self.inner.state().secondaries()
    }

    /// The arbiters currently known. Arbiters are never routing targets.
    pub fn arbiters(&self) -> HashSet<ServerAddress> {
        self.inner.state().arbiters().clone()
    }

    /// The largest document the current primary accepts, in bytes. Returns 0
    /// when no primary is known.
    pub fn max_document_size(&self) -> i32 {
        self.inner
            .state()
            .primary_member()
            .map_or(0, |member| member.max_document_size)
    }

    /// The default read preference for this client.
    pub fn read_preference(&self) -> &ReadPreference {
        &self.inner.options.read_preference
    }

    /// Ensures the running task reuses one socket per member until the
    /// returned guard is dropped (or [`end_request`](Self::end_request) is
    /// called). Multi-step operations that must observe their own writes
    /// bracket themselves this way so every message hits the same socket.
    pub fn start_request(&self) -> Request {
        start_request_inner(&self.inner);
        Request {
            client: self.clone(),
            ended: false,
        }
    }

    /// Whether the running task is inside a request.
    pub fn in_request(&self) -> bool {
        in_request(&self.inner)
    }

    /// Undoes one [`start_request`](Self::start_request). When the calls
    /// balance, the task's sockets return to their pools and its pin is
    /// cleared.
    pub fn end_request(&self) {
        end_request_inner(&self.inner);
    }

    /// Drops the primary's sockets, forgets the primary, and wakes the
    /// monitor. The next operation that needs the primary will wait for the
    /// refresh to find it again.
    pub fn disconnect(&self) {
        let state = self.inner.state();
        if let Some(primary) = state.primary_member() {
            primary.pool.reset();
        }
        {
            let mut guard = self.inner.state.write().unwrap();
            *guard = Arc::new(guard.clone_without_writer());
        }
        drop(self.inner.signals.schedule_refresh());
    }

    /// Shuts the monitor down (bounded join) and installs an empty view.
    /// The client must not be used afterwards.
    pub async fn close(&self) {
        self.inner.signals.shutdown();
        let handle = self.inner.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
        self.inner.install(RsState::empty());
    }

    /// Best-effort primary liveness check: grabs a socket to the primary and
    /// polls it for an error state, without sending anything. Returns false
    /// when no primary can be found. Spurious false results are possible; a
    /// caller needing certainty issues a real command.
    pub async fn alive(&self) -> bool {
        let member = match find_primary(&self.inner).await {
            Ok(member) => member,
            Err(_) => return false,
        };
        match socket(&self.inner, &member, false).await {
            Ok(sock) => {
                let healthy = !sock.peer_closed();
                member.pool.maybe_return_socket(sock);
                healthy
            }
            Err(_) => false,
        }
    }

    /// Caches a credential for `source` and verifies it against a reachable
    /// member. Every socket loan reconciles the socket's authenticated set
    /// against the cache, so the credential takes effect on all members.
    /// Caching a conflicting credential for the same source is an operation
    /// failure; log out first.
    pub async fn authenticate(&self, source: &str, username: &str, password: &str) -> Result<()> {
        let credential = Credential {
            source: source.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };

        {
            let credentials = self.inner.credentials.lock().unwrap();
            if let Some(existing) = credentials.get(source) {
                if *existing == credential {
                    return Ok(());
                }
                return Err(Error::from_server_error(
                    None,
                    "another user is already authenticated to this database - log out first",
                ));
            }
        }

        // Verify even during failover: any primary or secondary will do.
        let state = self.inner.state();
        let members: Vec<Member> = state.members().cloned().collect();
        let member = select_member(
            &members,
            ReadMode::PrimaryPreferred,
            &[TagSet::new()],
            self.inner.options.read_preference.latency,
        )
        .ok_or_else(|| {
            Error::auto_reconnect("No replica set members available for authentication")
        })?;

        let mut sock = socket(&self.inner, member, false).await?;
        let result = auth::authenticate(&mut sock, &credential).await;
        if result.is_ok() {
            sock.authset.insert(credential.clone());
        }
        member.pool.maybe_return_socket(sock);
        result?;

        self.inner
            .credentials
            .lock()
            .unwrap()
            .insert(source.to_string(), credential);
        Ok(())
    }

    /// Drops the cached credential for `source`. Sockets log the source out
    /// the next time they are loaned.
    pub fn logout(&self, source: &str) {
        self.inner.credentials.lock().unwrap().remove(source);
    }

    /// Sends an already-framed write message to the primary (or to an
    /// explicit member) and, when `with_ack` is true, reads and checks the
    /// acknowledgement document framed into the message.
    ///
    /// Returns the acknowledgement document, or `None` for unacknowledged
    /// writes. A "not master" acknowledgement triggers
    /// [`disconnect`](Self::disconnect) and surfaces as an auto-reconnect
    /// error so the caller's retry sees the new primary.
    pub async fn send_message(
        &self,
        message: &RawMessage,
        with_ack: bool,
        connection: Option<UseConnection>,
    ) -> Result<Option<Document>> {
        ensure_monitor(&self.inner);

        let member = match connection {
            None | Some(UseConnection::Primary) => find_primary(&self.inner).await?,
            Some(UseConnection::Member(ref address)) => self
                .inner
                .state()
                .get(address)
                .cloned()
                .ok_or_else(|| Error::auto_reconnect(format!("{} not available", address)))?,
        };

        check_document_size(message, member.max_document_size)?;
        let mut sock = socket(&self.inner, &member, false).await?;

        let io = async {
            sock.send_message(&message.data).await?;
            if with_ack {
                Ok::<_, Error>(Some(sock.receive_reply(message.request_id).await?))
            } else {
                Ok(None)
            }
        };
        match io.await {
            Ok(Some(payload)) => {
                member.pool.maybe_return_socket(sock);
                Ok(Some(self.check_write_response(&payload)?))
            }
            Ok(None) => {
                member.pool.maybe_return_socket(sock);
                Ok(None)
            }
            Err(error) => {
                member.pool.discard_socket(sock);
                if error.is_connection_error() {
                    if !matches!(connection, Some(UseConnection::Member(_))) {
                        self.disconnect();
                    }
                    return Err(Error::auto_reconnect(format!(
                        "{}: {}",
                        member.address, error
                    )));
                }
                Err(error)
            }
        }
    }

    /// Routes an already-framed message according to `read_preference` (or
    /// the client default), reads one response, and returns it along with
    /// the member that served it.
    ///
    /// Inside a request the task is pinned to the member that first serves
    /// it, and subsequent operations under the same preference return to
    /// that member. Up to three members are tried before the operation
    /// fails with an auto-reconnect error naming the attempts.
    pub async fn send_message_with_response(
        &self,
        message: &RawMessage,
        connection: Option<UseConnection>,
        must_use_primary: bool,
        read_preference: Option<&ReadPreference>,
    ) -> Result<(ServerAddress, Vec<u8>)> {
        ensure_monitor(&self.inner);

        let default = &self.inner.options.read_preference;
        let preference = read_preference.unwrap_or(default);
        let (mode, tag_sets, latency) = if must_use_primary {
            (ReadMode::Primary, vec![TagSet::new()], preference.latency)
        } else {
            (
                preference.mode,
                preference.tag_sets.clone(),
                preference.latency,
            )
        };

        let mut rs_state = self.inner.state();
        if rs_state.primary_member().is_none() {
            // The primary was down last we checked. Kick off a refresh; wait
            // for it only when the caller actually needs the primary.
            schedule_refresh(&self.inner, mode == ReadMode::Primary).await;
            rs_state = self.inner.state();
        }

        // An explicit target bypasses selection, retry, and pinning.
        if let Some(ref target) = connection {
            let (member, error_message) = match target {
                UseConnection::Primary => (
                    rs_state.primary_member().cloned(),
                    rs_state.error_message().to_string(),
                ),
                UseConnection::Member(address) => (
                    rs_state.get(address).cloned(),
                    format!("{} not available", address),
                ),
            };
            let Some(member) = member else {
                return Err(Error::auto_reconnect(error_message));
            };

            return match try_read(&self.inner, &member, message).await {
                Ok(response) => Ok((member.address.clone(), response)),
                Err(error) => {
                    let targeted_primary = *target == UseConnection::Primary
                        || Some(&member.address) == rs_state.writer();
                    if targeted_primary && error.is_auto_reconnect() {
                        self.disconnect();
                    }
                    Err(error)
                }
            };
        }

        let mut errors: Vec<String> = Vec::new();

        // A pinned member keeps serving this task while it still fits the
        // preference. The pin is a hint only; a failure below falls through
        // to normal selection.
        if let Some(pinned_address) = rs_state.pinned_host() {
            if let Some(pinned) = rs_state.get(&pinned_address) {
                if pinned.matches_mode(mode)
                    && pinned.matches_tag_sets(&tag_sets)
                    && rs_state.keep_pinned_host(mode, &tag_sets, latency)
                {
                    match try_read(&self.inner, pinned, message).await {
                        Ok(response) => return Ok((pinned_address, response)),
                        Err(error) if error.is_auto_reconnect() => {
                            if must_use_primary || mode == ReadMode::Primary {
                                self.disconnect();
                                return Err(error);
                            }
                            errors.push(error.to_string());
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        rs_state.unpin_host();

        let mut candidates: Vec<Member> = rs_state.members().cloned().collect();
        while errors.len() < MAX_RETRY {
            let Some(selected) = select_member(&candidates, mode, &tag_sets, latency) else {
                break;
            };
            let address = selected.address.clone();

            match try_read(&self.inner, selected, message).await {
                Ok(response) => {
                    if in_request(&self.inner) {
                        rs_state.pin_host(address.clone(), mode, &tag_sets, latency);
                    }
                    return Ok((address, response));
                }
                Err(error) if error.is_auto_reconnect() => {
                    errors.push(error.to_string());
                    candidates.retain(|member| member.address != address);
                }
                Err(error) => return Err(error),
            }
        }

        let mut message_text = format!(
            "No replica set {} available for query with ReadPreference {}",
            mode.role_noun(),
            mode
        );
        if !(tag_sets.len() == 1 && tag_sets[0].is_empty()) {
            message_text.push_str(&format!(" and tags {:?}", tag_sets));
        }
        Err(Error::auto_reconnect_with(message_text, errors))
    }

    /// Checks an acknowledgement document for errors, recovering from "not
    /// master" by disconnecting so the next attempt finds the new primary.
    fn check_write_response(&self, payload: &[u8]) -> Result<Document> {
        let reply = wire::parse_reply(payload)?;
        let response = reply.documents.into_iter().next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidResponse {
                message: "empty acknowledgement reply".to_string(),
            })
        })?;

        if reply.flags & wire::REPLY_QUERY_FAILURE != 0 || !wire::response_ok(&response) {
            let message = response
                .get_str("errmsg")
                .or_else(|_| response.get_str("$err"))
                .unwrap_or("write acknowledgement failed")
                .to_string();
            if message.starts_with("not master") {
                self.disconnect();
                return Err(Error::auto_reconnect(message));
            }
            return Err(Error::from_server_error(
                wire::response_code(&response),
                message,
            ));
        }

        let err_message = response
            .get_str("err")
            .ok()
            .map(|err| err.to_string());
        match err_message {
            None => Ok(response),
            Some(err) if err.starts_with("not master") => {
                self.disconnect();
                Err(Error::auto_reconnect(err))
            }
            Some(err) => Err(Error::from_server_error(
                wire::response_code(&response),
                err,
            )),
        }
    }
}

/// A guard holding the running task's request open; dropping it ends the
/// request, which covers tasks that unwind or are cancelled mid-request.
#[must_use = "the request ends when this guard is dropped"]
pub struct Request {
    client: ReplicaSetClient,
    ended: bool,
}

impl Request {
    /// Ends the request explicitly.
    pub fn end(mut self) {
        self.ended = true;
        self.client.end_request();
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.ended {
            self.client.end_request();
        }
    }
}

fn start_request_inner(inner: &Arc<ClientInner>) {
    let Some(task) = runtime::task_id() else {
        return;
    };
    let first = {
        let mut counters = inner.request_counter.lock().unwrap();
        let count = counters.entry(task).or_insert(0);
        *count += 1;
        *count == 1
    };
    // Each pool's request counter is only ever moved between 0 and 1 here,
    // which keeps things sane when pools come and go within a request.
    if first {
        for member in inner.state().members() {
            member.pool.start_request();
        }
    }
}

fn end_request_inner(inner: &Arc<ClientInner>) {
    let Some(task) = runtime::task_id() else {
        return;
    };
    let last = {
        let mut counters = inner.request_counter.lock().unwrap();
        let remove = match counters.get_mut(&task) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            counters.remove(&task);
        }
        remove
    };
    if last {
        let state = inner.state();
        for member in state.members() {
            // No effect on pools the task never started a request on.
            member.pool.end_request();
        }
        state.unpin_host();
    }
}

pub(crate) fn in_request(inner: &Arc<ClientInner>) -> bool {
    match runtime::task_id() {
        Some(task) => inner
            .request_counter
            .lock()
            .unwrap()
            .get(&task)
            .is_some_and(|count| *count > 0),
        None => false,
    }
}

fn ensure_monitor(inner: &Arc<ClientInner>) {
    if inner.monitor_started.swap(true, Ordering::SeqCst) {
        return;
    }
    let interval = inner.options.heartbeat_freq.unwrap_or(REFRESH_INTERVAL);
    let handle = Monitor::start(Arc::downgrade(inner), inner.signals.clone(), interval);
    *inner.monitor.lock().unwrap() = Some(handle);
}

/// Wakes the monitor; when `sync`, also waits (bounded) for the resulting
/// refresh to complete. Concurrent calls coalesce into a single refresh.
pub(crate) async fn schedule_refresh(inner: &Arc<ClientInner>, sync: bool) {
    ensure_monitor(inner);
    let listener = inner.signals.schedule_refresh();
    if sync {
        listener.wait(REFRESH_WAIT_TIMEOUT).await;
    }
}

/// Resolves the primary, scheduling a synchronous refresh when it is not
/// currently known.
pub(crate) async fn find_primary(inner: &Arc<ClientInner>) -> Result<Member> {
    if let Some(member) = inner.state().primary_member() {
        return Ok(member.clone());
    }

    // We had a failover; wait for the monitor to look again.
    schedule_refresh(inner, true).await;

    let state = inner.state();
    match state.primary_member() {
        Some(member) => Ok(member.clone()),
        None => Err(Error::auto_reconnect(state.error_message())),
    }
}

/// Loans a socket from the member's pool, reconciling its authenticated
/// credentials against the client cache first.
pub(crate) async fn socket(
    inner: &Arc<ClientInner>,
    member: &Member,
    force: bool,
) -> Result<PooledSocket> {
    if inner.options.auto_start_request && !in_request(inner) {
        start_request_inner(inner);
    }

    let mut sock = member.pool.get_socket(force).await?;
    if let Err(error) = check_auth(inner, &mut sock).await {
        member.pool.maybe_return_socket(sock);
        return Err(error);
    }
    Ok(sock)
}

/// Logs out credentials that were dropped from the cache and authenticates
/// ones the socket is missing, on the socket itself.
async fn check_auth(inner: &Arc<ClientInner>, sock: &mut PooledSocket) -> Result<()> {
    let cached: HashSet<Credential> = {
        let credentials = inner.credentials.lock().unwrap();
        credentials.values().cloned().collect()
    };
    if cached.is_empty() && sock.authset.is_empty() {
        return Ok(());
    }

    let stale: Vec<Credential> = sock.authset.difference(&cached).cloned().collect();
    for credential in stale {
        auth::logout(sock, &credential.source).await?;
        sock.authset.remove(&credential);
    }

    let missing: Vec<Credential> = cached.difference(&sock.authset).cloned().collect();
    for credential in missing {
        auth::authenticate(sock, &credential).await?;
        sock.authset.insert(credential);
    }
    Ok(())
}

fn check_document_size(message: &RawMessage, max_size: i32) -> Result<()> {
    // Only messages that actually carry documents have a size to enforce.
    if let Some(size) = message.max_doc_size {
        if size > max_size {
            return Err(Error::document_too_large(size, max_size));
        }
    }
    Ok(())
}

/// Sends `message` on a socket from the member's pool and reads one reply.
async fn send_and_receive(
    inner: &Arc<ClientInner>,
    member: &Member,
    message: &RawMessage,
) -> Result<Vec<u8>> {
    check_document_size(message, member.max_document_size)?;
    let mut sock = socket(inner, member, false).await?;

    let io = async {
        sock.send_message(&message.data).await?;
        sock.receive_reply(message.request_id).await
    };
    match io.await {
        Ok(response) => {
            member.pool.maybe_return_socket(sock);
            Ok(response)
        }
        Err(error) => {
            member.pool.discard_socket(sock);
            Err(error)
        }
    }
}

/// One read attempt against one member. A timeout may just be a slow query,
/// so it only fails the attempt; any other network error additionally marks
/// the member down in the shared view (best effort, lost updates are fine)
/// and wakes the monitor.
pub(crate) async fn try_read(
    inner: &Arc<ClientInner>,
    member: &Member,
    message: &RawMessage,
) -> Result<Vec<u8>> {
    match send_and_receive(inner, member, message).await {
        Ok(response) => Ok(response),
        // Could be one slow query or a briefly exhausted pool; don't condemn
        // the member over it.
        Err(error)
            if error.is_network_timeout()
                || matches!(
                    error.kind.as_ref(),
                    ErrorKind::WaitQueueTimeout { .. } | ErrorKind::WaitQueueFull { .. }
                ) =>
        {
            Err(Error::auto_reconnect(format!(
                "{}: {}",
                member.address, error
            )))
        }
        Err(error) if error.is_connection_error() => {
            {
                let mut guard = inner.state.write().unwrap();
                *guard = Arc::new(guard.clone_with_host_down(&member.address, error.to_string()));
            }
            drop(inner.signals.schedule_refresh());
            Err(Error::auto_reconnect(format!(
                "{}: {}",
                member.address, error
            )))
        }
        Err(error) => Err(error),
    }
}

async fn handshake_member(
    inner: &Arc<ClientInner>,
    member: &Member,
    force: bool,
) -> Result<(Document, Duration)> {
    let mut sock = socket(inner, member, force).await?;
    match sock.command("admin", &doc! { "ismaster": 1 }).await {
        Ok(result) => {
            member.pool.maybe_return_socket(sock);
            Ok(result)
        }
        Err(error) if error.is_connection_error() => {
            member.pool.discard_socket(sock);
            Err(error)
        }
        Err(error) => {
            member.pool.maybe_return_socket(sock);
            Err(error)
        }
    }
}

/// Handshakes an endpoint we have no member for yet, constructing its pool.
async fn handshake_new(
    inner: &Arc<ClientInner>,
    address: &ServerAddress,
) -> Result<(Document, Pool, Duration)> {
    let pool = Pool::new(address.clone(), inner.pool_options.clone());
    if in_request(inner) {
        pool.start_request();
    }

    let mut sock = pool.get_socket(false).await?;
    match sock.command("admin", &doc! { "ismaster": 1 }).await {
        Ok((response, ping)) => {
            pool.maybe_return_socket(sock);
            Ok((response, pool, ping))
        }
        Err(error) => {
            pool.discard_socket(sock);
            Err(error)
        }
    }
}

fn parse_host_list(response: &Document, field: &str) -> Result<Vec<ServerAddress>> {
    match response.get_array(field) {
        Ok(list) => list
            .iter()
            .filter_map(|entry| entry.as_str())
            .map(ServerAddress::parse)
            .collect(),
        Err(_) => Ok(Vec::new()),
    }
}

/// Rebuilds the client's view of the set and installs it atomically.
///
/// Only the constructor and the monitor run this, so refreshes never race
/// each other; operations racing a refresh keep reading their own snapshot.
pub(crate) async fn refresh(inner: &Arc<ClientInner>, force: bool) -> Result<()> {
    let rs_state = inner.state();
    let set_name = inner.options.set_name().to_string();
    let mut errors: Vec<String> = Vec::new();

    let known_hosts = rs_state.hosts();
    let nodes: Vec<ServerAddress> = if !known_hosts.is_empty() {
        // Candidates we believe are up go first; address order within each
        // group keeps the iteration deterministic.
        let mut nodes: Vec<_> = known_hosts.into_iter().collect();
        nodes.sort_by_key(|address| {
            let up = rs_state.get(address).map_or(false, |member| member.up);
            (std::cmp::Reverse(up), address.clone())
        });
        nodes
    } else {
        inner.seeds.clone()
    };

    let mut hosts: HashSet<ServerAddress> = HashSet::new();
    let mut arbiters: HashSet<ServerAddress> = HashSet::new();
    let mut members: HashMap<ServerAddress, Member> = HashMap::new();
    let mut writer: Option<ServerAddress> = None;

    // Find the first member that can tell us who belongs to the set.
    for node in &nodes {
        let attempt: Result<(Document, Member)> = match rs_state.get(node) {
            Some(member) => handshake_member(inner, member, force)
                .await
                .map(|(response, ping)| (response.clone(), member.clone_with(response, ping))),
            None => handshake_new(inner, node).await.map(|(response, pool, ping)| {
                let member = Member::new(
                    node.clone(),
                    pool,
                    response.clone(),
                    MovingAverage::new(ping),
                    true,
                );
                (response, member)
            }),
        };

        match attempt {
            Ok((response, new_member)) => {
                // Older servers omit setName; only an explicit mismatch is
                // a misconfiguration.
                if let Ok(name) = response.get_str("setName") {
                    if name != set_name {
                        return Err(Error::configuration(format!(
                            "{} is not a member of replica set {}",
                            node, set_name
                        )));
                    }
                }

                arbiters = parse_host_list(&response, "arbiters")?
                    .into_iter()
                    .collect();
                hosts.extend(parse_host_list(&response, "hosts")?);
                hosts.extend(parse_host_list(&response, "passives")?);

                // Seed the member map with this node, unless it turned out
                // not to be a member of the set at all.
                if hosts.contains(node) {
                    if response.get_bool("ismaster").unwrap_or(false) {
                        writer = Some(node.clone());
                    }
                    members.insert(node.clone(), new_member);
                }
            }
            Err(error) if error.is_connection_error() => {
                errors.push(format!("{}: {}", node, error));
            }
            Err(error) => return Err(error),
        }

        if !hosts.is_empty() {
            break;
        }
    }

    if hosts.is_empty() {
        if !errors.is_empty() {
            return Err(Error::auto_reconnect(errors.join(", ")));
        }
        return Err(Error::configuration("No suitable hosts found"));
    }

    // Probe the remaining members in address order, so that when a stale
    // view leaves two members claiming to be primary, the winner is
    // deterministic (the last claim in probe order).
    let mut remaining: Vec<ServerAddress> = hosts
        .iter()
        .filter(|host| !members.contains_key(*host))
        .cloned()
        .collect();
    remaining.sort();

    for host in remaining {
        let attempt: Result<(Document, Member)> = match rs_state.get(&host) {
            Some(member) => handshake_member(inner, member, false)
                .await
                .map(|(response, ping)| (response.clone(), member.clone_with(response, ping))),
            None => handshake_new(inner, &host)
                .await
                .map(|(response, pool, ping)| {
                    let member = Member::new(
                        host.clone(),
                        pool,
                        response.clone(),
                        MovingAverage::new(ping),
                        true,
                    );
                    (response, member)
                }),
        };

        match attempt {
            Ok((response, new_member)) => {
                if response.get_bool("ismaster").unwrap_or(false) {
                    writer = Some(host.clone());
                }
                members.insert(host, new_member);
            }
            // Unreachable members are simply absent from the new view; the
            // next refresh will pick them up.
            Err(error) if error.is_connection_error() => continue,
            Err(error) => return Err(error),
        }
    }

    // A stale view can leave more than one member answering the handshake
    // as primary in a single pass. The writer tiebreak above already decided
    // the race; demote the losers so the snapshot never carries two up
    // primaries.
    if let Some(ref writer) = writer {
        for (address, member) in members.iter_mut() {
            if member.is_primary() && address != writer {
                let demoted = member.clone_demoted();
                *member = demoted;
            }
        }
    }

    // Pins only make sense while the primary is unchanged; a new primary
    // voids any monotonic-read hinting.
    let pins = if writer == rs_state.writer().cloned() {
        rs_state.pin_store()
    } else {
        PinStore::default()
    };

    debug!(
        members = members.len(),
        arbiters = arbiters.len(),
        primary = ?writer,
        "installing refreshed topology"
    );
    inner.install(RsState::new(pins, members, arbiters, writer));
    Ok(())
}
