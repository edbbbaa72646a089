//! The background task that keeps the client's view of the set current, and
//! the signalling used to request and await refreshes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{client, client::ClientInner, runtime};

/// How often the monitor refreshes when nothing wakes it.
pub(crate) const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// How long a synchronous `schedule_refresh` waits for the refresh to land.
pub(crate) const REFRESH_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// The wake/refreshed signal pair shared between the monitor and the
/// operations that need a refresh. Both channels have capacity one, so any
/// number of concurrent wake-ups coalesce into a single pending message.
#[derive(Clone, Debug)]
pub(crate) struct MonitorSignals {
    wake: broadcast::Sender<()>,
    // Held from creation so a wake-up fired before the monitor task first
    // polls is buffered rather than lost; the monitor claims it at startup.
    wake_receiver: Arc<Mutex<Option<broadcast::Receiver<()>>>>,
    refreshed: broadcast::Sender<()>,
    stopped: Arc<AtomicBool>,
}

impl MonitorSignals {
    pub(crate) fn new() -> Self {
        let (wake, wake_receiver) = broadcast::channel(1);
        let (refreshed, _) = broadcast::channel(1);
        Self {
            wake,
            wake_receiver: Arc::new(Mutex::new(Some(wake_receiver))),
            refreshed,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn take_wake_receiver(&self) -> broadcast::Receiver<()> {
        self.wake_receiver
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| self.wake.subscribe())
    }

    /// Asks the monitor to refresh as soon as possible. The returned
    /// listener can be awaited to block until that refresh completes;
    /// subscribing before the wake-up is sent is what gives the
    /// schedule-then-wait pattern its set/clear semantics.
    pub(crate) fn schedule_refresh(&self) -> RefreshListener {
        let listener = RefreshListener {
            receiver: self.refreshed.subscribe(),
        };
        let _ = self.wake.send(());
        listener
    }

    /// Signals the monitor to exit its loop.
    pub(crate) fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.wake.send(());
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn notify_refreshed(&self) {
        let _ = self.refreshed.send(());
    }
}

/// Awaits completion of a refresh requested via
/// [`MonitorSignals::schedule_refresh`].
pub(crate) struct RefreshListener {
    receiver: broadcast::Receiver<()>,
}

impl RefreshListener {
    /// Waits for the refresh to complete, up to `timeout`. Returns false on
    /// timeout.
    pub(crate) async fn wait(mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .is_ok()
    }
}

/// The background task driving periodic and on-demand refreshes. It holds
/// the client weakly so that dropping the last client handle ends the loop.
pub(crate) struct Monitor {
    client: Weak<ClientInner>,
    signals: MonitorSignals,
    interval: Duration,
}

impl Monitor {
    /// Spawns the monitor task and returns its join handle.
    pub(crate) fn start(
        client: Weak<ClientInner>,
        signals: MonitorSignals,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        register_monitor(&signals);
        let monitor = Self {
            client,
            signals,
            interval,
        };
        runtime::spawn(monitor.run())
    }

    async fn run(self) {
        let mut wake = self.signals.take_wake_receiver();
        loop {
            // Wait out the heartbeat interval unless someone wakes us first;
            // a lagged receiver counts as a wake-up.
            let _ = tokio::time::timeout(self.interval, wake.recv()).await;
            if self.signals.is_stopped() {
                break;
            }

            // Coalesce wake-ups that raced in: this refresh serves them all.
            drain_wake_ups(&mut wake);

            let Some(client) = self.client.upgrade() else {
                break;
            };
            let result = client::refresh(&client, true).await;
            drop(client);
            self.signals.notify_refreshed();

            match result {
                Ok(()) => {}
                Err(error) if error.is_auto_reconnect() => {
                    debug!(%error, "refresh found no reachable members");
                }
                Err(error) => {
                    warn!(%error, "monitor exiting");
                    break;
                }
            }
        }
        debug!("replica set monitor stopped");
    }
}

fn drain_wake_ups(wake: &mut broadcast::Receiver<()>) {
    loop {
        match wake.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// A registry entry: a monitor's stop flag (weak, so the registry never
/// keeps a client alive) plus its wake channel, so a process-wide shutdown
/// can end the interval nap a monitor may be sleeping in.
struct RegisteredMonitor {
    stopped: Weak<AtomicBool>,
    wake: broadcast::Sender<()>,
}

impl RegisteredMonitor {
    /// Stops the monitor the way [`MonitorSignals::shutdown`] does: flag
    /// first, then a wake-up so the loop observes the flag now rather than
    /// after its interval elapses. Returns false when the monitor's client
    /// is already gone.
    fn shutdown(&self) -> bool {
        let Some(stopped) = self.stopped.upgrade() else {
            return false;
        };
        stopped.store(true, Ordering::SeqCst);
        let _ = self.wake.send(());
        true
    }
}

static MONITORS: OnceLock<Mutex<Vec<RegisteredMonitor>>> = OnceLock::new();

fn monitors() -> &'static Mutex<Vec<RegisteredMonitor>> {
    MONITORS.get_or_init(Default::default)
}

fn register_monitor(signals: &MonitorSignals) {
    let mut registry = monitors().lock().unwrap();
    registry.retain(|monitor| monitor.stopped.upgrade().is_some());
    registry.push(RegisteredMonitor {
        stopped: Arc::downgrade(&signals.stopped),
        wake: signals.wake.clone(),
    });
}

/// Stops and wakes every live monitor in the process so each runs to
/// completion promptly instead of sleeping out its refresh interval.
/// Intended for orderly shutdown; monitors whose clients are already gone
/// are skipped.
pub fn shutdown_monitors() {
    for monitor in monitors().lock().unwrap().drain(..) {
        monitor.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn schedule_refresh_listener_sees_a_later_notification() {
        let signals = MonitorSignals::new();
        let listener = signals.schedule_refresh();
        signals.notify_refreshed();
        assert!(listener.wait(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn refresh_wait_times_out_without_a_notification() {
        let signals = MonitorSignals::new();
        let listener = signals.schedule_refresh();
        assert!(!listener.wait(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wake_ups_fired_before_the_monitor_starts_are_buffered() {
        let signals = MonitorSignals::new();
        signals.schedule_refresh();
        let mut wake = signals.take_wake_receiver();
        assert!(wake.try_recv().is_ok());
    }

    #[tokio::test]
    async fn wake_ups_coalesce() {
        let signals = MonitorSignals::new();
        let mut wake = signals.take_wake_receiver();
        for _ in 0..10 {
            signals.schedule_refresh();
        }
        // Capacity-one channel: at most one pending message survives, plus a
        // lag marker. Draining the way the monitor does observes a single
        // effective wake-up.
        let _ = wake.recv().await;
        drain_wake_ups(&mut wake);
        assert!(matches!(
            wake.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn a_registered_monitor_shuts_down_without_waiting_out_its_interval() {
        let signals = MonitorSignals::new();
        // A dangling client reference: the monitor exits as soon as it wakes.
        let handle = Monitor::start(Weak::new(), signals.clone(), Duration::from_secs(30));

        let registered = RegisteredMonitor {
            stopped: Arc::downgrade(&signals.stopped),
            wake: signals.wake.clone(),
        };
        assert!(registered.shutdown());
        assert!(signals.is_stopped());

        // Without the wake-up this join would only return after the 30
        // second interval elapsed.
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor did not exit promptly")
            .unwrap();

        // A second shutdown finds the flag's owner gone once the signals
        // are dropped.
        drop(signals);
        assert!(!registered.shutdown());
    }
}
