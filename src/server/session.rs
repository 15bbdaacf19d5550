use anyhow::{anyhow, Context, Result};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::registry::{Binding, ConnectionId, Registration, SessionRegistry};
use super::sink::{TelemetryEvent, TelemetrySink};
use crate::config::ServerConfig;
use crate::transport::{
    encode_line, parse_client_message, Ack, Action, ClientMessage, ControlRequest, Link, TcpLink,
    TransportError,
};

const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(100);
/// Consecutive accept failures between repeated warnings.
const ACCEPT_WARN_EVERY: u64 = 100;

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// False once the accept thread has exited, whether by `stop` or a fatal listener error.
    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    /// Stop accepting, join every connection thread, then tear down the registry.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("session server thread panicked"))?;
        }
        let dropped = self.registry.clear()?;
        log::info!("session server on {} stopped ({} sessions cleared)", self.addr, dropped);
        Ok(())
    }
}

pub struct SessionServer {
    cfg: ServerConfig,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn TelemetrySink>,
}

impl SessionServer {
    pub fn new(cfg: ServerConfig, registry: Arc<SessionRegistry>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            cfg,
            registry,
            sink,
        }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.cfg.bind_addr.as_str())
            .with_context(|| format!("bind session server on {}", self.cfg.bind_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("session server listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let registry = self.registry.clone();
        let join = thread::spawn(move || {
            if let Err(err) = accept_loop(listener, &self, &shutdown_thread) {
                log::error!("session server stopped: {}", err);
            }
        });

        Ok(ServerHandle {
            addr,
            registry,
            shutdown,
            join: Some(join),
        })
    }
}

fn accept_loop(listener: TcpListener, server: &SessionServer, shutdown: &Arc<AtomicBool>) -> Result<()> {
    let next_conn = AtomicU64::new(1);
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let mut failures: u64 = 0;
    let mut outcome = Ok(());
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                failures = 0;
                let conn = Connection {
                    id: next_conn.fetch_add(1, Ordering::SeqCst),
                    peer,
                    registry: server.registry.clone(),
                    sink: server.sink.clone(),
                    shutdown: shutdown.clone(),
                    max_message_bytes: server.cfg.max_message_bytes,
                };
                workers.retain(|w| !w.is_finished());
                workers.push(thread::spawn(move || conn.serve(stream)));
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(err) if is_fatal_accept_error(&err) => {
                outcome = Err(anyhow!("listener on {} failed: {}", server.cfg.bind_addr, err));
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(err) => {
                failures += 1;
                if failures % ACCEPT_WARN_EVERY == 1 {
                    log::warn!("accept failed ({} in a row): {}", failures, err);
                }
                thread::sleep(ACCEPT_IDLE);
            }
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
    outcome
}

/// Errors that mean the listener itself is unusable.
///
/// Aborted handshakes, interrupts and descriptor or buffer exhaustion clear up
/// on their own, so everything else is retried.
fn is_fatal_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported
    )
}

/// One accepted socket and the session (if any) it is bound to.
struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn TelemetrySink>,
    shutdown: Arc<AtomicBool>,
    max_message_bytes: usize,
}

impl Connection {
    fn serve(self, stream: TcpStream) {
        log::debug!("connection {} from {}", self.id, self.peer);
        let mut link = match stream
            .set_nonblocking(false)
            .and_then(|_| TcpLink::new(stream, self.max_message_bytes))
        {
            Ok(link) => link,
            Err(err) => {
                log::warn!("dropping connection from {}: {}", self.peer, err);
                return;
            }
        };

        let mut bound: Option<String> = None;
        while !self.shutdown.load(Ordering::SeqCst) {
            match link.recv_line(Some(READ_POLL)) {
                Ok(None) => continue,
                Ok(Some(line)) => {
                    if let Err(err) = self.handle_line(&mut link, &line, &mut bound) {
                        log::warn!("connection {} from {} failed: {:#}", self.id, self.peer, err);
                        break;
                    }
                }
                Err(TransportError::Closed) => break,
                Err(err) => {
                    log::warn!("closing connection from {}: {}", self.peer, err);
                    break;
                }
            }
        }

        match self.registry.mark_disconnected(self.id) {
            Ok(ids) => {
                for id in ids {
                    log::info!("session {} disconnected without notice", id);
                }
            }
            Err(err) => log::error!("{:#}", err),
        }
        link.close();
    }

    fn handle_line(&self, link: &mut TcpLink, line: &[u8], bound: &mut Option<String>) -> Result<()> {
        match parse_client_message(line) {
            Ok(ClientMessage::Control(request)) => self.handle_control(link, request, bound),
            Ok(ClientMessage::Telemetry(payload)) => self.handle_telemetry(bound.as_deref(), payload),
            Err(err) => {
                log::warn!("dropping message from {}: {}", self.peer, err);
                Ok(())
            }
        }
    }

    fn handle_control(
        &self,
        link: &mut TcpLink,
        request: ControlRequest,
        bound: &mut Option<String>,
    ) -> Result<()> {
        let client_id = request.client_id;
        match request.action {
            Action::Register | Action::Reconnect => {
                let binding = Binding::new(self.id, Some(self.peer), link.try_clone_stream().ok());
                let outcome = if request.action == Action::Register {
                    self.registry.register(&client_id, binding)?
                } else {
                    self.registry.rebind(&client_id, binding)?
                };
                match (request.action, outcome) {
                    (Action::Register, Registration::Rebound) => {
                        log::warn!("register for known id {} from {}; rebinding", client_id, self.peer)
                    }
                    (_, Registration::Created) => {
                        log::info!("session {} registered from {}", client_id, self.peer)
                    }
                    (_, Registration::Rebound) => {
                        log::info!("session {} rebound to {}", client_id, self.peer)
                    }
                }
                reply(link, request.action)?;
                *bound = Some(client_id);
                Ok(())
            }
            Action::Disconnect => {
                reply(link, Action::Disconnect)?;
                if self.registry.remove(&client_id)? {
                    log::info!("session {} removed", client_id);
                } else {
                    log::debug!("disconnect for unknown id {}", client_id);
                }
                if bound.as_deref() == Some(client_id.as_str()) {
                    *bound = None;
                }
                Ok(())
            }
        }
    }

    fn handle_telemetry(&self, bound: Option<&str>, payload: serde_json::Value) -> Result<()> {
        let Some(client_id) = bound else {
            log::warn!("dropping telemetry from {}: connection is not registered", self.peer);
            return Ok(());
        };
        if !self.registry.is_bound_to(client_id, self.id)? {
            log::warn!("dropping telemetry for {} on a superseded connection", client_id);
            return Ok(());
        }
        log::debug!("telemetry from {}: {}", client_id, payload);
        self.sink.deliver(TelemetryEvent {
            client_id: client_id.to_string(),
            payload,
        })
    }
}

fn reply(link: &mut TcpLink, action: Action) -> Result<(), TransportError> {
    let line = encode_line(&Ack::new(action.ack()))?;
    link.send_line(&line)
}
