//! # UDP Multiplexer
//!
//! Owns the node's single UDP socket. Outbound datagrams are queued and
//! drained by one sender task in FIFO order. One receiver task fans each
//! inbound datagram out to every waiter registered at that moment;
//! waiters are drained per datagram, they do not form a queue. A datagram
//! arriving while nobody waits is held in a small bounded backlog for the
//! next waiter, so the reader loop cannot lose packets between polls.
//! `close` aborts both tasks and completes all pending operations with
//! [`Error::Aborted`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Largest datagram we are willing to receive.
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Datagrams held while no reader is waiting.
const MAX_BACKLOG: usize = 64;

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct RecvState {
    waiters: Vec<oneshot::Sender<Datagram>>,
    backlog: VecDeque<Datagram>,
}

#[derive(Clone)]
pub struct UdpMultiplexer {
    inner: Arc<Inner>,
}

struct Inner {
    local_addr: SocketAddr,
    send_tx: mpsc::UnboundedSender<Datagram>,
    recv: Mutex<RecvState>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpMultiplexer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Datagram>();

        let inner = Arc::new(Inner {
            local_addr,
            send_tx,
            recv: Mutex::new(RecvState::default()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let send_socket = socket.clone();
        let sender = tokio::spawn(async move {
            while let Some((message, to)) = send_rx.recv().await {
                if let Err(e) = send_socket.send_to(&message, to).await {
                    // Losing a datagram is normal UDP behavior.
                    trace!(%to, error = %e, "udp send failed");
                }
            }
        });

        let recv_inner = inner.clone();
        let receiver = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let datagram = buf[..len].to_vec();
                        let mut state = recv_inner
                            .recv
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        if state.waiters.is_empty() {
                            if state.backlog.len() == MAX_BACKLOG {
                                state.backlog.pop_front();
                            }
                            state.backlog.push_back((datagram, from));
                        } else {
                            for waiter in state.waiters.drain(..) {
                                let _ = waiter.send((datagram.clone(), from));
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "udp receive failed, stopping receiver");
                        break;
                    }
                }
            }
        });

        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([sender, receiver]);

        Ok(UdpMultiplexer { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Queue a datagram for transmission. Returns once enqueued; delivery
    /// is best-effort, in enqueue order.
    pub fn send(&self, message: Vec<u8>, to: SocketAddr) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Aborted);
        }
        self.inner
            .send_tx
            .send((message, to))
            .map_err(|_| Error::Aborted)
    }

    /// Complete with the next datagram: a backlogged one if any arrived
    /// while nobody was waiting, otherwise the next one off the wire.
    pub async fn receive(&self) -> Result<Datagram> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Aborted);
        }
        let rx = {
            let mut state = self
                .inner
                .recv
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(datagram) = state.backlog.pop_front() {
                return Ok(datagram);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        rx.await.map_err(|_| Error::Aborted)
    }

    /// Shut the multiplexer down. Idempotent; all pending sends and
    /// receives complete with `Aborted`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let mut state = self
            .inner
            .recv
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        state.waiters.clear();
        state.backlog.clear();
    }
}
