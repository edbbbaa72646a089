//! Per-member connection pooling with request affinity.
//!
//! A pool is bound to one member address. Sockets are loaned out under a
//! counting semaphore, health-checked when they have sat idle, and bound to
//! the borrowing task for the duration of a request so that a logical
//! sequence of operations reuses one socket per member.

use std::{
    collections::{HashMap, HashSet},
    process,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use bson::Document;
use tokio::{io::AsyncWriteExt, sync::Semaphore};
use tracing::{debug, warn};

use crate::{
    auth::Credential,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::{self, AsyncStream, TlsConfig},
    wire,
};

/// Idle sockets older than this get a readiness probe before being handed
/// out again; younger ones are assumed healthy to keep checkouts cheap.
const IDLE_RECHECK_THRESHOLD: Duration = Duration::from_secs(1);

/// Pool behavior knobs, derived from the client options.
#[derive(Clone, Debug, Default)]
pub(crate) struct PoolOptions {
    /// Cap on concurrently checked-out sockets and on pooled idle sockets.
    /// `None` disables both limits.
    pub(crate) max_size: Option<u32>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) wait_queue_timeout: Option<Duration>,
    pub(crate) wait_queue_multiple: Option<u32>,
    pub(crate) tls: Option<TlsConfig>,
}

/// Whether a loaned socket is charged against the pool's semaphore.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum PermitState {
    /// Counted; must be released exactly once.
    Held,
    /// Created by bypassing the limiter; never released.
    Forced,
    /// Not counted (idle, or already settled).
    Released,
}

/// The request-affinity slot for one task.
#[derive(Debug)]
enum RequestSocket {
    /// In a request, no socket assigned yet.
    NoSocketYet,
    /// The request socket is checked out, identified by its id.
    Loaned(u32),
    /// The request socket is checked in between operations, waiting for the
    /// task's next checkout.
    Parked(PooledSocket),
}

#[derive(Debug)]
struct RequestState {
    depth: u32,
    sock: RequestSocket,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<PooledSocket>,
    requests: HashMap<tokio::task::Id, RequestState>,
}

#[derive(Debug)]
pub(crate) struct PoolInner {
    address: ServerAddress,
    options: PoolOptions,
    generation: AtomicU32,
    pid: AtomicU32,
    next_socket_id: AtomicU32,
    semaphore: Option<Arc<Semaphore>>,
    waiters: AtomicU32,
    state: Mutex<PoolState>,
}

/// A pool of sockets to one member. Cloning shares the underlying pool, so
/// the handle stays stable across topology snapshots for the same address.
#[derive(Clone, Debug)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub(crate) fn new(address: ServerAddress, options: PoolOptions) -> Self {
        let semaphore = options
            .max_size
            .map(|max| Arc::new(Semaphore::new(max as usize)));
        Self {
            inner: Arc::new(PoolInner {
                address,
                options,
                generation: AtomicU32::new(0),
                pid: AtomicU32::new(process::id()),
                next_socket_id: AtomicU32::new(1),
                semaphore,
                waiters: AtomicU32::new(0),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn pid_changed(&self) -> bool {
        self.inner.pid.load(Ordering::SeqCst) != process::id()
    }

    /// OS-level sockets do not survive a fork, so every entry point resets
    /// the pool when it finds itself in a new process.
    fn check_pid(&self) {
        if self.pid_changed() {
            warn!(address = %self.inner.address, "process id changed, resetting pool");
            self.reset();
        }
    }

    /// Bumps the generation and drops all idle sockets. Loaned sockets are
    /// recognized by their stale generation when they come back and are
    /// closed at that point.
    pub(crate) fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.pid.store(process::id(), Ordering::SeqCst);

        let idle = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::take(&mut state.idle)
        };
        debug!(
            address = %self.inner.address,
            closed = idle.len(),
            "pool reset"
        );
        for mut sock in idle {
            sock.close();
        }
    }

    /// Marks the running task as being in a request. Reentrant; no socket is
    /// assigned until the task's next checkout.
    pub(crate) fn start_request(&self) {
        self.check_pid();
        let Some(task) = runtime::task_id() else {
            return;
        };
        let mut state = self.inner.state.lock().unwrap();
        let request = state.requests.entry(task).or_insert(RequestState {
            depth: 0,
            sock: RequestSocket::NoSocketYet,
        });
        request.depth += 1;
    }

    /// Ends the running task's request once the start/end calls balance,
    /// returning any socket bound to the task to the idle set.
    pub(crate) fn end_request(&self) {
        let Some(task) = runtime::task_id() else {
            return;
        };
        let parked = {
            let mut state = self.inner.state.lock().unwrap();
            let last = match state.requests.get_mut(&task) {
                Some(request) if request.depth > 1 => {
                    request.depth -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if last {
                match state.requests.remove(&task) {
                    Some(RequestState {
                        sock: RequestSocket::Parked(sock),
                        ..
                    }) => Some(sock),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some(sock) = parked {
            self.return_to_idle(sock);
        }
    }

    /// Whether the running task is inside a request on this pool.
    pub(crate) fn in_request(&self) -> bool {
        match runtime::task_id() {
            Some(task) => {
                let state = self.inner.state.lock().unwrap();
                state.requests.get(&task).is_some_and(|r| r.depth > 0)
            }
            None => false,
        }
    }

    /// Checks out a socket.
    ///
    /// If the running task has a request socket parked, it is health-checked
    /// and returned. Otherwise a permit is acquired (skipped with `force`,
    /// marking the socket so its return does not release a permit), an idle
    /// socket is revived or a fresh one connected, and the result is bound
    /// to the task when its request is still awaiting a socket.
    pub(crate) async fn get_socket(&self, force: bool) -> Result<PooledSocket> {
        self.check_pid();

        if let Some(task) = runtime::task_id() {
            if let Some(sock) = self.take_parked(task) {
                let mut sock = self.check_socket(sock, true).await?;
                sock.permit = PermitState::Held;
                sock.owner = Some(task);
                sock.last_checkout = Instant::now();
                let mut state = self.inner.state.lock().unwrap();
                if let Some(request) = state.requests.get_mut(&task) {
                    request.sock = RequestSocket::Loaned(sock.id);
                }
                return Ok(sock);
            }
        }

        let mut forced = false;
        if force {
            if !self.try_acquire() {
                debug!(
                    address = %self.inner.address,
                    "limiter exhausted, forcing a new socket"
                );
                forced = true;
            }
        } else {
            self.acquire().await?;
        }

        let idle = { self.inner.state.lock().unwrap().idle.pop() };
        let checked = match idle {
            Some(sock) => self.check_socket(sock, false).await,
            None => self.connect().await,
        };
        let mut sock = match checked {
            Ok(sock) => sock,
            Err(error) => {
                if !forced {
                    self.release_permit();
                }
                return Err(error);
            }
        };

        sock.forced = forced;
        sock.permit = if forced {
            PermitState::Forced
        } else {
            PermitState::Held
        };
        sock.last_checkout = Instant::now();

        if let Some(task) = runtime::task_id() {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(request) = state.requests.get_mut(&task) {
                if matches!(request.sock, RequestSocket::NoSocketYet) {
                    request.sock = RequestSocket::Loaned(sock.id);
                    sock.owner = Some(task);
                }
            }
        }

        Ok(sock)
    }

    /// Checks a socket back in. Closed sockets settle their permit and are
    /// dropped; the task's request socket is parked for its next checkout;
    /// anything else returns to the idle set.
    pub(crate) fn maybe_return_socket(&self, mut sock: PooledSocket) {
        if self.pid_changed() {
            self.reset();
            sock.close();
            self.unbind_if_loaned(&sock);
            self.release_for(&mut sock);
            return;
        }

        if sock.closed {
            self.unbind_if_loaned(&sock);
            self.release_for(&mut sock);
            return;
        }

        if let Some(task) = runtime::task_id() {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(request) = state.requests.get_mut(&task) {
                if matches!(request.sock, RequestSocket::Loaned(id) if id == sock.id) {
                    request.sock = RequestSocket::Parked(sock);
                    return;
                }
            }
        }

        self.return_to_idle(sock);
    }

    /// Force-closes a socket. If it was the task's request socket, the
    /// binding reverts to awaiting a socket so the next checkout reconnects.
    pub(crate) fn discard_socket(&self, mut sock: PooledSocket) {
        if self.pid_changed() {
            self.reset();
        }
        debug!(address = %self.inner.address, id = sock.id, "discarding socket");
        sock.close();
        self.unbind_if_loaned(&sock);
        self.release_for(&mut sock);
    }

    fn take_parked(&self, task: tokio::task::Id) -> Option<PooledSocket> {
        let mut state = self.inner.state.lock().unwrap();
        let request = state.requests.get_mut(&task)?;
        match std::mem::replace(&mut request.sock, RequestSocket::NoSocketYet) {
            RequestSocket::Parked(sock) => {
                request.sock = RequestSocket::Loaned(sock.id);
                Some(sock)
            }
            other => {
                request.sock = other;
                None
            }
        }
    }

    fn unbind_if_loaned(&self, sock: &PooledSocket) {
        let Some(task) = sock.owner else {
            return;
        };
        let mut state = self.inner.state.lock().unwrap();
        if let Some(request) = state.requests.get_mut(&task) {
            if matches!(request.sock, RequestSocket::Loaned(id) if id == sock.id) {
                request.sock = RequestSocket::NoSocketYet;
            }
        }
    }

    /// Settles a socket's permit: held permits are released, forced sockets
    /// are exempt.
    fn release_for(&self, sock: &mut PooledSocket) {
        if sock.permit == PermitState::Held {
            self.release_permit();
        }
        sock.permit = PermitState::Released;
        sock.forced = false;
    }

    fn return_to_idle(&self, mut sock: PooledSocket) {
        let stale = sock.generation != self.generation();
        self.release_for(&mut sock);
        sock.owner = None;

        let mut state = self.inner.state.lock().unwrap();
        let full = self
            .inner
            .options
            .max_size
            .is_some_and(|max| state.idle.len() >= max as usize);
        if stale || full {
            drop(state);
            sock.close();
        } else {
            state.idle.push(sock);
        }
    }

    fn waiter_budget(&self) -> Option<u32> {
        Some(self.inner.options.max_size? * self.inner.options.wait_queue_multiple?)
    }

    fn try_acquire(&self) -> bool {
        match &self.inner.semaphore {
            None => true,
            Some(semaphore) => match semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
        }
    }

    async fn acquire(&self) -> Result<()> {
        let Some(semaphore) = self.inner.semaphore.clone() else {
            return Ok(());
        };
        if let Ok(permit) = semaphore.try_acquire() {
            permit.forget();
            return Ok(());
        }

        if let Some(budget) = self.waiter_budget() {
            if self.inner.waiters.load(Ordering::SeqCst) >= budget {
                return Err(ErrorKind::WaitQueueFull {
                    address: self.inner.address.clone(),
                }
                .into());
            }
        }

        self.inner.waiters.fetch_add(1, Ordering::SeqCst);
        let wait_timeout = self
            .inner
            .options
            .wait_queue_timeout
            .or(self.inner.options.connect_timeout);
        let acquired = match wait_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, semaphore.acquire()).await {
                Ok(result) => result.map_err(|_| Error::connection("connection pool closed")),
                Err(_) => Err(ErrorKind::WaitQueueTimeout {
                    address: self.inner.address.clone(),
                }
                .into()),
            },
            None => semaphore
                .acquire()
                .await
                .map_err(|_| Error::connection("connection pool closed")),
        };
        self.inner.waiters.fetch_sub(1, Ordering::SeqCst);
        acquired.map(|permit| permit.forget())
    }

    fn release_permit(&self) {
        if let Some(ref semaphore) = self.inner.semaphore {
            semaphore.add_permits(1);
        }
    }

    async fn connect(&self) -> Result<PooledSocket> {
        let stream = AsyncStream::connect(
            &self.inner.address,
            self.inner.options.connect_timeout,
            self.inner.options.tls.as_ref(),
        )
        .await?;
        let id = self.inner.next_socket_id.fetch_add(1, Ordering::SeqCst);
        debug!(address = %self.inner.address, id, "connected a new socket");
        Ok(PooledSocket {
            id,
            address: self.inner.address.clone(),
            stream,
            authset: HashSet::new(),
            generation: self.generation(),
            closed: false,
            forced: false,
            last_checkout: Instant::now(),
            permit: PermitState::Released,
            pool: Arc::downgrade(&self.inner),
            owner: None,
            socket_timeout: self.inner.options.socket_timeout,
        })
    }

    /// Returns `sock` if it still looks healthy, otherwise transparently
    /// connects a replacement. A socket is unhealthy when it is known
    /// closed, belongs to a previous generation, or has been idle for over a
    /// second and its descriptor polls readable (an unrequested readable
    /// byte means the peer closed). A failed replacement resets the pool.
    async fn check_socket(
        &self,
        mut sock: PooledSocket,
        acquire_on_connect: bool,
    ) -> Result<PooledSocket> {
        let mut dead = false;
        if sock.closed {
            dead = true;
        } else if sock.generation != self.generation() {
            sock.close();
            dead = true;
        } else if sock.last_checkout.elapsed() > IDLE_RECHECK_THRESHOLD && sock.peer_closed() {
            debug!(address = %self.inner.address, id = sock.id, "idle socket lost its peer");
            sock.close();
            dead = true;
        }

        if !dead {
            return Ok(sock);
        }

        drop(sock);
        if acquire_on_connect {
            self.acquire().await?;
        }
        match self.connect().await {
            Ok(sock) => Ok(sock),
            Err(error) => {
                if acquire_on_connect {
                    self.release_permit();
                }
                self.reset();
                Err(error)
            }
        }
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    #[cfg(test)]
    fn available_permits(&self) -> Option<usize> {
        self.inner
            .semaphore
            .as_ref()
            .map(|sem| sem.available_permits())
    }

    #[cfg(test)]
    fn simulate_fork(&self) {
        self.inner
            .pid
            .store(process::id().wrapping_add(1), Ordering::SeqCst);
    }

    #[cfg(test)]
    fn age_idle_sockets(&self, by: Duration) {
        let mut state = self.inner.state.lock().unwrap();
        for sock in &mut state.idle {
            if let Some(then) = sock.last_checkout.checked_sub(by) {
                sock.last_checkout = then;
            }
        }
    }
}

/// A socket loaned out by a [`Pool`]. At rest it is owned by exactly one
/// pool; in use it is owned by exactly one task.
#[derive(Debug)]
pub(crate) struct PooledSocket {
    id: u32,
    pub(crate) address: ServerAddress,
    stream: AsyncStream,

    /// Credentials already authenticated on this socket.
    pub(crate) authset: HashSet<Credential>,

    generation: u32,
    closed: bool,
    forced: bool,
    last_checkout: Instant,
    permit: PermitState,
    pool: Weak<PoolInner>,
    owner: Option<tokio::task::Id>,
    socket_timeout: Option<Duration>,
}

impl PooledSocket {
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Best-effort probe for a peer-closed connection.
    pub(crate) fn peer_closed(&self) -> bool {
        self.stream.probably_closed()
    }

    /// Writes one already-framed message, bounded by the socket timeout.
    pub(crate) async fn send_message(&mut self, data: &[u8]) -> Result<()> {
        let timeout = self.socket_timeout;
        let stream = &mut self.stream;
        runtime::timeout(timeout, async {
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }

    /// Reads one reply to `request_id`, bounded by the socket timeout.
    pub(crate) async fn receive_reply(&mut self, request_id: i32) -> Result<Vec<u8>> {
        let timeout = self.socket_timeout;
        let stream = &mut self.stream;
        runtime::timeout(timeout, wire::read_reply(stream, request_id)).await
    }

    /// Runs a command against `db` on this socket, returning the response
    /// document and the round-trip time. The socket is closed on transport
    /// errors so it cannot be reused in a broken state.
    pub(crate) async fn command(&mut self, db: &str, command: &Document) -> Result<(Document, Duration)> {
        let request_id = wire::next_request_id();
        let message = wire::build_command_query(request_id, db, command)?;

        let start = Instant::now();
        let io = async {
            self.send_message(&message).await?;
            self.receive_reply(request_id).await
        };
        let payload = match io.await {
            Ok(payload) => payload,
            Err(error) => {
                self.close();
                return Err(error);
            }
        };
        let round_trip = start.elapsed();

        let reply = wire::parse_reply(&payload)?;
        let document = reply.documents.into_iter().next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidResponse {
                message: "empty command reply".to_string(),
            })
        })?;
        wire::check_command_response(&document)?;
        Ok((document, round_trip))
    }
}

impl Drop for PooledSocket {
    /// A loaned socket abandoned without a checkin (its task was cancelled
    /// mid-operation) settles its permit and clears the request binding
    /// here, through the weak pool handle and the captured owner id only.
    fn drop(&mut self) {
        if self.permit != PermitState::Held {
            return;
        }
        debug!(address = %self.address, id = self.id, "socket dropped while loaned");
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if let Some(task) = self.owner {
            if let Ok(mut state) = pool.state.lock() {
                if let Some(request) = state.requests.get_mut(&task) {
                    if matches!(request.sock, RequestSocket::Loaned(id) if id == self.id) {
                        request.sock = RequestSocket::NoSocketYet;
                    }
                }
            }
        }
        if let Some(ref semaphore) = pool.semaphore {
            semaphore.add_permits(1);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex as StdMutex;

    use super::*;

    type Held = Arc<StdMutex<Vec<tokio::net::TcpStream>>>;

    /// A bare TCP acceptor that keeps accepted sockets open until dropped.
    async fn spawn_acceptor() -> (ServerAddress, Held) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = ServerAddress {
            host: "127.0.0.1".to_string(),
            port,
        };
        let held: Held = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&held);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                sink.lock().unwrap().push(stream);
            }
        });
        (address, held)
    }

    fn bounded(max: u32, wait: Duration) -> PoolOptions {
        PoolOptions {
            max_size: Some(max),
            wait_queue_timeout: Some(wait),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn cap_blocks_then_force_bypasses_the_limiter() {
        let (address, _held) = spawn_acceptor().await;
        let pool = Pool::new(address, bounded(2, Duration::from_millis(100)));

        let first = pool.get_socket(false).await.unwrap();
        let second = pool.get_socket(false).await.unwrap();

        let start = Instant::now();
        let err = pool.get_socket(false).await.unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::WaitQueueTimeout { .. }
        ));
        assert!(start.elapsed() >= Duration::from_millis(100));

        let forced = pool.get_socket(true).await.unwrap();
        assert!(forced.forced);
        pool.maybe_return_socket(forced);
        // Returning a forced socket does not release a permit.
        assert_eq!(pool.available_permits(), Some(0));

        pool.maybe_return_socket(first);
        pool.maybe_return_socket(second);
        assert_eq!(pool.available_permits(), Some(2));
    }

    #[tokio::test]
    async fn waiter_budget_fails_fast() {
        let (address, _held) = spawn_acceptor().await;
        let mut options = bounded(1, Duration::from_secs(5));
        options.wait_queue_multiple = Some(1);
        let pool = Pool::new(address, options);

        let held_sock = pool.get_socket(false).await.unwrap();

        // Fill the waiter budget with a blocked checkout.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_socket(false).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = pool.get_socket(false).await.unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::WaitQueueFull { .. }));

        pool.maybe_return_socket(held_sock);
        let freed = waiter.await.unwrap().unwrap();
        pool.maybe_return_socket(freed);
        assert_eq!(pool.available_permits(), Some(1));
    }

    #[tokio::test]
    async fn idle_socket_with_a_dead_peer_is_replaced_transparently() {
        let (address, held) = spawn_acceptor().await;
        let pool = Pool::new(address, PoolOptions::default());

        let sock = pool.get_socket(false).await.unwrap();
        let original_id = sock.id;
        pool.maybe_return_socket(sock);
        assert_eq!(pool.idle_len(), 1);

        // Close the server end and let the reactor observe the hangup.
        held.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.age_idle_sockets(Duration::from_secs(2));

        let replacement = pool.get_socket(false).await.unwrap();
        assert_ne!(replacement.id, original_id);
        pool.maybe_return_socket(replacement);
    }

    #[tokio::test]
    async fn fresh_idle_sockets_skip_the_readiness_probe() {
        let (address, held) = spawn_acceptor().await;
        let pool = Pool::new(address, PoolOptions::default());

        let sock = pool.get_socket(false).await.unwrap();
        let original_id = sock.id;
        pool.maybe_return_socket(sock);

        held.lock().unwrap().clear();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Checked out within a second of its last checkout, the socket is
        // handed back without probing.
        let sock = pool.get_socket(false).await.unwrap();
        assert_eq!(sock.id, original_id);
        pool.maybe_return_socket(sock);
    }

    #[tokio::test]
    async fn request_operations_reuse_one_socket_until_end_request() {
        let (address, _held) = spawn_acceptor().await;
        let pool = Pool::new(address, PoolOptions::default());

        pool.start_request();
        assert!(pool.in_request());

        let first = pool.get_socket(false).await.unwrap();
        let id = first.id;
        pool.maybe_return_socket(first);
        // Parked on the task rather than returned to the idle set.
        assert_eq!(pool.idle_len(), 0);

        let second = pool.get_socket(false).await.unwrap();
        assert_eq!(second.id, id);
        pool.maybe_return_socket(second);

        pool.end_request();
        assert!(!pool.in_request());
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn start_request_is_reentrant() {
        let (address, _held) = spawn_acceptor().await;
        let pool = Pool::new(address, PoolOptions::default());

        pool.start_request();
        pool.start_request();
        pool.end_request();
        assert!(pool.in_request());
        pool.end_request();
        assert!(!pool.in_request());
    }

    #[tokio::test]
    async fn discarding_the_request_socket_reconnects_on_next_checkout() {
        let (address, _held) = spawn_acceptor().await;
        let pool = Pool::new(address, bounded(2, Duration::from_millis(100)));

        pool.start_request();
        let first = pool.get_socket(false).await.unwrap();
        let id = first.id;
        pool.discard_socket(first);

        let second = pool.get_socket(false).await.unwrap();
        assert_ne!(second.id, id);
        pool.maybe_return_socket(second);
        pool.end_request();
        assert_eq!(pool.available_permits(), Some(2));
    }

    #[tokio::test]
    async fn pid_change_resets_the_pool_and_never_returns_prefork_sockets() {
        let (address, _held) = spawn_acceptor().await;
        let pool = Pool::new(address, bounded(2, Duration::from_millis(100)));

        let sock = pool.get_socket(false).await.unwrap();
        let prefork_id = sock.id;
        pool.maybe_return_socket(sock);
        assert_eq!(pool.idle_len(), 1);

        pool.simulate_fork();
        let sock = pool.get_socket(false).await.unwrap();
        assert_ne!(sock.id, prefork_id);
        assert_eq!(pool.idle_len(), 0);
        pool.maybe_return_socket(sock);
        assert_eq!(pool.available_permits(), Some(2));
    }

    #[tokio::test]
    async fn stale_generation_sockets_are_closed_on_return() {
        let (address, _held) = spawn_acceptor().await;
        let pool = Pool::new(address, bounded(2, Duration::from_millis(100)));

        let sock = pool.get_socket(false).await.unwrap();
        pool.reset();
        pool.maybe_return_socket(sock);
        // Closed rather than pooled, and the permit was still released.
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(pool.available_permits(), Some(2));
    }

    #[tokio::test]
    async fn dropping_a_loaned_socket_settles_its_permit() {
        let (address, _held) = spawn_acceptor().await;
        let pool = Pool::new(address, bounded(1, Duration::from_millis(100)));

        let sock = pool.get_socket(false).await.unwrap();
        assert_eq!(pool.available_permits(), Some(0));
        // A cancelled task drops its socket without checking it in.
        drop(sock);
        assert_eq!(pool.available_permits(), Some(1));

        let sock = pool.get_socket(false).await.unwrap();
        pool.maybe_return_socket(sock);
    }
}
