use crate::net::socket::{ClientSocket, SocketState};
use flare::logging;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One-shot wakeup consumed by `accept()`: set whenever a connection enters
/// or leaves the PENDING_ACCEPT state.
pub struct AcceptSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl AcceptSignal {
    pub fn new() -> AcceptSignal {
        AcceptSignal {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut flag = self.flag.lock().expect("accept signal lock poisoned");
        *flag = true;
        self.cond.notify_all();
    }

    /// Blocks until notified or the timeout elapses, consuming the pending
    /// notification. Returns true when a notification was observed. The
    /// bounded wait keeps waiters interruptible on server shutdown.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock().expect("accept signal lock poisoned");

        if !*flag {
            let (guard, _) = self
                .cond
                .wait_timeout(flag, timeout)
                .expect("accept signal lock poisoned");
            flag = guard;
        }

        let notified = *flag;
        *flag = false;
        notified
    }
}

struct TableInner {
    available_ids: Vec<u8>,
    sockets: Vec<Arc<ClientSocket>>,
}

/// Owns every connection plus the pool of free client ids (1..max). Lookups
/// are linear scans, which is fine at a hard cap of 15 connections.
pub struct ConnectionTable {
    max_connections: usize,
    tx_vendor_ie: bool,
    accept_signal: Arc<AcceptSignal>,
    inner: Mutex<TableInner>,
    log: logging::Logger,
}

impl ConnectionTable {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        max_connections: usize,
        tx_vendor_ie: bool,
        log: L,
    ) -> ConnectionTable {
        let table_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        // Stacked so the lowest id is handed out first. Id 0 stays reserved
        // for clients that have no assignment yet.
        let available_ids: Vec<u8> = (1..=max_connections as u8).rev().collect();

        ConnectionTable {
            max_connections,
            tx_vendor_ie,
            accept_signal: Arc::new(AcceptSignal::new()),
            inner: Mutex::new(TableInner {
                available_ids,
                sockets: Vec::new(),
            }),
            log: table_log,
        }
    }

    #[inline]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Creates a socket with a freshly popped client id, or `None` when the
    /// pool is exhausted. The stage-1 request is then silently ignored; the
    /// client keeps repeating it and gets through once an id frees up.
    pub fn provide_new_client_socket(&self, srv_id: u8) -> Option<Arc<ClientSocket>> {
        let mut inner = self.inner.lock().expect("connection table lock poisoned");

        let client_id = match inner.available_ids.pop() {
            Some(id) => id,
            None => {
                logging::debug!(self.log, "no additional connections possible";
                                "context" => "provide");
                return None;
            }
        };

        let socket = Arc::new(ClientSocket::new(
            client_id,
            srv_id,
            self.tx_vendor_ie,
            self.accept_signal.clone(),
            &self.log,
        ));
        inner.sockets.push(socket.clone());

        Some(socket)
    }

    /// Looks a connection up by the stage-1 nonce. Sockets that have not seen
    /// their first request yet are skipped, their nonce is still unset.
    pub fn get_by_client_iv(&self, client_iv: u32) -> Option<Arc<ClientSocket>> {
        let inner = self.inner.lock().expect("connection table lock poisoned");

        inner
            .sockets
            .iter()
            .find(|socket| socket.state() != SocketState::Close && socket.client_iv() == client_iv)
            .cloned()
    }

    pub fn get_by_client_id(&self, client_id: u8) -> Option<Arc<ClientSocket>> {
        let inner = self.inner.lock().expect("connection table lock poisoned");

        inner
            .sockets
            .iter()
            .find(|socket| socket.client_id() == client_id)
            .cloned()
    }

    pub fn first_by_state(&self, state: SocketState) -> Option<Arc<ClientSocket>> {
        let inner = self.inner.lock().expect("connection table lock poisoned");

        inner
            .sockets
            .iter()
            .find(|socket| socket.state() == state)
            .cloned()
    }

    /// Snapshot of all live sockets, used by housekeeping sweeps.
    pub fn snapshot(&self) -> Vec<Arc<ClientSocket>> {
        self.inner
            .lock()
            .expect("connection table lock poisoned")
            .sockets
            .clone()
    }

    /// Removes sockets in the DELETE state and returns their client ids to
    /// the pool.
    pub fn reap_deleted(&self) {
        let mut inner = self.inner.lock().expect("connection table lock poisoned");

        let mut reclaimed = Vec::new();
        inner.sockets.retain(|socket| {
            let retain = socket.state() != SocketState::Delete;
            if !retain {
                reclaimed.push(socket.client_id());
            }
            retain
        });

        for client_id in reclaimed {
            logging::debug!(self.log, "reclaiming client id";
                            "context" => "reap",
                            "client_id" => client_id);
            inner.available_ids.push(client_id);
        }
    }

    #[inline]
    pub fn wait_for_pending_accept_change(&self, timeout: Duration) -> bool {
        self.accept_signal.wait(timeout)
    }

    /// Wakes any blocked `accept()`, used on server shutdown.
    #[inline]
    pub fn notify_accept_waiters(&self) {
        self.accept_signal.notify();
    }
}
