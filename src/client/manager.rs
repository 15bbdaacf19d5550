use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use super::reconnect::ReconnectPolicy;
use crate::delivery::SharedQueue;
use crate::detect::TrackId;
use crate::transport::{
    encode_line, parse_server_message, AckCode, Action, Connector, ControlRequest, Link,
    ProtocolError, TransportError,
};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SEND_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted; the manager will not try again on its own.
    Failed { attempts: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ConnectionState::Failed { attempts } => write!(f, "failed after {} attempts", attempts),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub client_id: String,
    pub policy: ReconnectPolicy,
    /// How long to wait for the server's acknowledgement of a control action.
    pub handshake_timeout: Duration,
    /// Period of the drain/poll cycle while connected.
    pub send_interval: Duration,
}

impl ManagerSettings {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            policy: ReconnectPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            send_interval: DEFAULT_SEND_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub enum PumpOutcome {
    Sent(TrackId),
    /// Connected but nothing was queued.
    Idle,
    NotConnected,
    /// The send failed; the entry went back to the head of the queue.
    LinkLost(TransportError),
}

#[derive(Debug)]
pub enum InboundOutcome {
    Quiet,
    Ack(AckCode),
    /// Unparseable or unexpected message, logged and discarded.
    Dropped(ProtocolError),
    /// The server acknowledged a disconnect nobody asked for.
    ServerTeardown,
    LinkLost(TransportError),
    NotConnected,
}

/// Client side of the session protocol.
///
/// Owns the link, performs the register/reconnect/disconnect handshakes and
/// drains the delivery queue onto the wire while connected. Every transition
/// is driven by a `TransportError` value returned from the link.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    settings: ManagerSettings,
    queue: SharedQueue,
    state: ConnectionState,
    link: Option<C::Link>,
    retries: u32,
    registered: bool,
    sent: u64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, settings: ManagerSettings, queue: SharedQueue) -> Self {
        Self {
            connector,
            settings,
            queue,
            state: ConnectionState::Disconnected,
            link: None,
            retries: 0,
            registered: false,
            sent: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failures since the last successful handshake.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Detections written to the wire over the manager's lifetime.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// True once a register handshake has ever succeeded.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    /// Open a link and register. On failure the previous state is restored.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        let previous = self.state;
        self.drop_link();
        self.set_state(ConnectionState::Connecting);
        match self.handshake(Action::Register) {
            Ok(link) => {
                self.registered = true;
                self.established(link);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "register with {} failed: {}",
                    self.connector.endpoint(),
                    err
                );
                self.set_state(previous);
                Err(err)
            }
        }
    }

    /// Open a fresh link and rebind the session with a reconnect action.
    ///
    /// A failure counts against the retry budget; once it is spent the state
    /// becomes `Failed`.
    pub fn reconnect(&mut self) -> Result<(), TransportError> {
        self.drop_link();
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.retries + 1,
        });
        match self.handshake(Action::Reconnect) {
            Ok(link) => {
                self.established(link);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "reconnect attempt {} to {} failed: {}",
                    self.retries + 1,
                    self.connector.endpoint(),
                    err
                );
                self.record_failed_attempt();
                Err(err)
            }
        }
    }

    /// Send the head of the delivery queue, if connected and non-empty.
    pub fn pump(&mut self) -> Result<PumpOutcome> {
        if !self.state.is_connected() {
            return Ok(PumpOutcome::NotConnected);
        }
        let Some(link) = self.link.as_mut() else {
            return Ok(PumpOutcome::NotConnected);
        };
        let Some(detection) = self.queue.drain()? else {
            return Ok(PumpOutcome::Idle);
        };
        let line = encode_line(&detection)?;
        match link.send_line(&line) {
            Ok(()) => {
                self.sent += 1;
                debug!("sent detection {} ({})", detection.id, detection.class);
                Ok(PumpOutcome::Sent(detection.id))
            }
            Err(err) => {
                let id = detection.id.clone();
                if !self.queue.restore(detection)? {
                    debug!("detection {} superseded while in flight", id);
                }
                self.link_lost(&err);
                Ok(PumpOutcome::LinkLost(err))
            }
        }
    }

    /// Wait up to `wait` for one inbound control message.
    pub fn poll_inbound(&mut self, wait: Duration) -> InboundOutcome {
        let Some(link) = self.link.as_mut() else {
            return InboundOutcome::NotConnected;
        };
        match link.recv_line(Some(wait)) {
            Ok(None) => InboundOutcome::Quiet,
            Ok(Some(line)) => match parse_server_message(&line) {
                Ok(ack) if ack.msg == AckCode::DisconnectAck => {
                    info!(
                        "server {} ended the session for {}",
                        self.connector.endpoint(),
                        self.settings.client_id
                    );
                    self.drop_link();
                    self.retries += 1;
                    self.set_state(ConnectionState::Disconnected);
                    InboundOutcome::ServerTeardown
                }
                Ok(ack) => {
                    debug!("ignoring unsolicited {}", ack.msg);
                    InboundOutcome::Ack(ack.msg)
                }
                Err(err) => {
                    warn!("dropping inbound message: {}", err);
                    InboundOutcome::Dropped(err)
                }
            },
            Err(err) => {
                self.link_lost(&err);
                InboundOutcome::LinkLost(err)
            }
        }
    }

    /// Explicit disconnect: send the action, wait for the acknowledgement,
    /// then close the link.
    pub fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(mut link) = self.link.take() else {
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        };
        let result = exchange(
            &mut link,
            &self.settings.client_id,
            Action::Disconnect,
            self.settings.handshake_timeout,
        );
        link.close();
        self.set_state(ConnectionState::Disconnected);
        result
    }

    /// Drive the manager until `shutdown` is raised or the retry budget runs
    /// out. On shutdown the session is closed with an explicit disconnect.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            match self.state {
                ConnectionState::Connected => self.service(),
                ConnectionState::Failed { attempts } => {
                    return Err(anyhow!(
                        "giving up on {} after {} failed attempts",
                        self.connector.endpoint(),
                        attempts
                    ));
                }
                _ => {
                    if self.retries > 0 {
                        let delay = self.settings.policy.backoff_delay(self.retries);
                        debug!("backing off {:?} before next attempt", delay);
                        sleep_unless(delay, shutdown);
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    let attempt = if self.registered {
                        self.reconnect()
                    } else {
                        self.connect().inspect_err(|_| self.record_failed_attempt())
                    };
                    match attempt {
                        Ok(()) => debug!("session for {} is live", self.settings.client_id),
                        Err(err) if err.is_connection_failure() => debug!(
                            "{} unreachable ({} failures)",
                            self.connector.endpoint(),
                            self.retries
                        ),
                        Err(err) => debug!(
                            "{} rejected the handshake ({} failures): {}",
                            self.connector.endpoint(),
                            self.retries,
                            err
                        ),
                    }
                }
            }
        }

        if self.state.is_connected() {
            match self.disconnect() {
                Ok(()) => info!("disconnected {} cleanly", self.settings.client_id),
                Err(err) => warn!("disconnect handshake failed: {}", err),
            }
        }
        Ok(())
    }

    fn service(&mut self) {
        let deadline = Instant::now() + self.settings.send_interval;
        loop {
            match self.pump() {
                Ok(PumpOutcome::Sent(_)) => continue,
                Ok(PumpOutcome::LinkLost(_)) | Ok(PumpOutcome::NotConnected) => return,
                Ok(PumpOutcome::Idle) => break,
                Err(err) => {
                    warn!("delivery queue unavailable: {:#}", err);
                    break;
                }
            }
        }
        let wait = deadline.saturating_duration_since(Instant::now());
        match self.poll_inbound(wait) {
            InboundOutcome::Quiet | InboundOutcome::Ack(_) | InboundOutcome::Dropped(_) => {}
            InboundOutcome::ServerTeardown
            | InboundOutcome::LinkLost(_)
            | InboundOutcome::NotConnected => {
                debug!("session for {} interrupted, now {}", self.settings.client_id, self.state)
            }
        }
    }

    fn handshake(&mut self, action: Action) -> Result<C::Link, TransportError> {
        let mut link = self.connector.connect()?;
        match exchange(
            &mut link,
            &self.settings.client_id,
            action,
            self.settings.handshake_timeout,
        ) {
            Ok(()) => Ok(link),
            Err(err) => {
                link.close();
                Err(err)
            }
        }
    }

    fn established(&mut self, link: C::Link) {
        self.link = Some(link);
        self.retries = 0;
        self.set_state(ConnectionState::Connected);
    }

    fn link_lost(&mut self, err: &TransportError) {
        warn!("link to {} lost: {}", self.connector.endpoint(), err);
        self.drop_link();
        self.retries += 1;
        self.set_state(ConnectionState::Disconnected);
    }

    fn record_failed_attempt(&mut self) {
        self.retries += 1;
        if !self.settings.policy.should_retry(self.retries) {
            self.set_state(ConnectionState::Failed {
                attempts: self.retries,
            });
        }
    }

    fn drop_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("connection {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

/// Send one control action and require its matching acknowledgement.
fn exchange<L: Link>(
    link: &mut L,
    client_id: &str,
    action: Action,
    timeout: Duration,
) -> Result<(), TransportError> {
    let line = encode_line(&ControlRequest::new(client_id, action))?;
    link.send_line(&line)?;
    let reply = link
        .recv_line(Some(timeout))?
        .ok_or(TransportError::Timeout)?;
    let ack = parse_server_message(&reply)?;
    if ack.msg != action.ack() {
        return Err(TransportError::UnexpectedReply {
            expected: action.ack(),
            got: ack.msg,
        });
    }
    Ok(())
}

fn sleep_unless(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        thread::sleep(left.min(SHUTDOWN_POLL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::ConfirmedDetection;
    use crate::transport::{parse_client_message, Ack, ClientMessage};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Wire {
        sent: Vec<String>,
        closed: usize,
    }

    struct FakeLink {
        wire: Arc<Mutex<Wire>>,
        replies: VecDeque<Result<Vec<u8>, TransportError>>,
        auto_ack: bool,
        send_budget: Option<usize>,
        sends: usize,
    }

    impl FakeLink {
        fn acking(wire: &Arc<Mutex<Wire>>) -> Self {
            Self {
                wire: Arc::clone(wire),
                replies: VecDeque::new(),
                auto_ack: true,
                send_budget: None,
                sends: 0,
            }
        }

        fn scripted(wire: &Arc<Mutex<Wire>>, replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| Ok(r.as_bytes().to_vec())).collect(),
                auto_ack: false,
                ..Self::acking(wire)
            }
        }

        fn failing_after(mut self, sends: usize) -> Self {
            self.send_budget = Some(sends);
            self
        }

        fn then(mut self, reply: &str) -> Self {
            self.replies.push_back(Ok(reply.as_bytes().to_vec()));
            self
        }
    }

    impl Link for FakeLink {
        fn send_line(&mut self, line: &[u8]) -> Result<(), TransportError> {
            if self.send_budget.is_some_and(|budget| self.sends >= budget) {
                return Err(TransportError::Send(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer gone",
                )));
            }
            self.sends += 1;
            let text = String::from_utf8_lossy(line).trim_end().to_string();
            if self.auto_ack {
                if let Ok(ClientMessage::Control(req)) = parse_client_message(text.as_bytes()) {
                    let ack = encode_line(&Ack::new(req.action.ack())).expect("encode ack");
                    self.replies.push_back(Ok(ack[..ack.len() - 1].to_vec()));
                }
            }
            self.wire.lock().expect("wire").sent.push(text);
            Ok(())
        }

        fn recv_line(
            &mut self,
            timeout: Option<Duration>,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            match self.replies.pop_front() {
                Some(reply) => reply.map(Some),
                None => {
                    thread::sleep(timeout.unwrap_or_default().min(Duration::from_millis(5)));
                    Ok(None)
                }
            }
        }

        fn close(&mut self) {
            self.wire.lock().expect("wire").closed += 1;
        }
    }

    struct FakeConnector {
        links: VecDeque<FakeLink>,
    }

    impl FakeConnector {
        fn new(links: Vec<FakeLink>) -> Self {
            Self {
                links: links.into(),
            }
        }
    }

    impl Connector for FakeConnector {
        type Link = FakeLink;

        fn connect(&mut self) -> Result<FakeLink, TransportError> {
            self.links.pop_front().ok_or_else(|| {
                TransportError::Connect(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                ))
            })
        }

        fn endpoint(&self) -> &str {
            "fake:4000"
        }
    }

    fn det(id: i64) -> ConfirmedDetection {
        ConfirmedDetection {
            id: TrackId::from(id),
            bbox: [id, id, id + 10, id + 10],
            age: 48,
            class: "car".to_string(),
        }
    }

    fn settings(max_retries: u32) -> ManagerSettings {
        ManagerSettings {
            policy: ReconnectPolicy::immediate(max_retries),
            handshake_timeout: Duration::from_millis(50),
            send_interval: Duration::from_millis(10),
            ..ManagerSettings::new("edge-1")
        }
    }

    fn manager(links: Vec<FakeLink>, queue: &SharedQueue) -> ConnectionManager<FakeConnector> {
        ConnectionManager::new(FakeConnector::new(links), settings(3), queue.clone())
    }

    #[test]
    fn connect_registers_and_resets_retries() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let mut mgr = manager(vec![FakeLink::acking(&wire)], &SharedQueue::default());
        mgr.retries = 2;
        mgr.connect().expect("connect");
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.retries(), 0);
        assert!(mgr.is_registered());
        assert_eq!(
            wire.lock().unwrap().sent,
            vec![r#"{"client_id":"edge-1","action":"100"}"#.to_string()]
        );
    }

    #[test]
    fn failed_connect_leaves_state_unchanged() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let mut mgr = manager(
            vec![FakeLink::scripted(&wire, &[r#"{"msg":"600_1"}"#])],
            &SharedQueue::default(),
        );
        let err = mgr.connect().unwrap_err();
        assert!(matches!(
            err,
            TransportError::UnexpectedReply {
                expected: AckCode::RegisterAck,
                got: AckCode::ReconnectAck
            }
        ));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(wire.lock().unwrap().closed, 1);

        assert!(matches!(mgr.connect(), Err(TransportError::Connect(_))));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert!(!mgr.is_registered());
    }

    #[test]
    fn silent_server_times_out_handshake() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let mut mgr = manager(vec![FakeLink::scripted(&wire, &[])], &SharedQueue::default());
        assert!(matches!(mgr.connect(), Err(TransportError::Timeout)));
    }

    #[test]
    fn pump_sends_in_queue_order() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let queue = SharedQueue::default();
        let mut mgr = manager(vec![FakeLink::acking(&wire)], &queue);
        assert!(matches!(mgr.pump().unwrap(), PumpOutcome::NotConnected));

        queue.offer(det(3)).unwrap();
        queue.offer(det(1)).unwrap();
        mgr.connect().expect("connect");
        assert!(matches!(mgr.pump().unwrap(), PumpOutcome::Sent(TrackId::Int(3))));
        assert!(matches!(mgr.pump().unwrap(), PumpOutcome::Sent(TrackId::Int(1))));
        assert!(matches!(mgr.pump().unwrap(), PumpOutcome::Idle));
        assert_eq!(mgr.sent(), 2);

        let sent = &wire.lock().unwrap().sent;
        let first: ConfirmedDetection = serde_json::from_str(&sent[1]).expect("detection");
        assert_eq!(first, det(3));
        assert_eq!(sent[2], r#"{"id":1,"bbox":[1,1,11,11],"age":48,"class":"car"}"#);
    }

    #[test]
    fn send_failure_restores_entry_and_disconnects() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let queue = SharedQueue::default();
        queue.offer(det(7)).unwrap();
        queue.offer(det(8)).unwrap();
        let mut mgr = manager(vec![FakeLink::acking(&wire).failing_after(1)], &queue);
        mgr.connect().expect("connect");

        let outcome = mgr.pump().unwrap();
        assert!(matches!(outcome, PumpOutcome::LinkLost(TransportError::Send(_))));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(mgr.retries(), 1);
        assert_eq!(queue.len().unwrap(), 2);
        assert_eq!(queue.drain().unwrap(), Some(det(7)));
    }

    #[test]
    fn reconnect_rebinds_with_reconnect_action() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let mut mgr = manager(
            vec![FakeLink::acking(&wire), FakeLink::acking(&wire)],
            &SharedQueue::default(),
        );
        mgr.connect().expect("connect");
        mgr.retries = 1;
        mgr.reconnect().expect("reconnect");
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.retries(), 0);
        assert_eq!(
            wire.lock().unwrap().sent[1],
            r#"{"client_id":"edge-1","action":"600"}"#
        );
    }

    #[test]
    fn exhausted_retries_end_in_failed_state() {
        let mut mgr = ConnectionManager::new(
            FakeConnector::new(Vec::new()),
            settings(2),
            SharedQueue::default(),
        );
        assert!(mgr.reconnect().is_err());
        assert_eq!(mgr.state(), ConnectionState::Reconnecting { attempt: 1 });
        assert!(mgr.reconnect().is_err());
        assert_eq!(mgr.state(), ConnectionState::Failed { attempts: 2 });
    }

    #[test]
    fn malformed_inbound_is_dropped_without_disconnecting() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let link = FakeLink::scripted(&wire, &[r#"{"msg":"100_1"}"#])
            .then("not json")
            .then(r#"{"msg":"600_1"}"#);
        let mut mgr = manager(vec![link], &SharedQueue::default());
        mgr.connect().expect("connect");

        let wait = Duration::from_millis(5);
        assert!(matches!(
            mgr.poll_inbound(wait),
            InboundOutcome::Dropped(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            mgr.poll_inbound(wait),
            InboundOutcome::Ack(AckCode::ReconnectAck)
        ));
        assert!(matches!(mgr.poll_inbound(wait), InboundOutcome::Quiet));
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn unsolicited_disconnect_ack_tears_down() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let link = FakeLink::scripted(&wire, &[r#"{"msg":"100_1"}"#, r#"{"msg":"800_1"}"#]);
        let mut mgr = manager(vec![link], &SharedQueue::default());
        mgr.connect().expect("connect");
        assert!(matches!(
            mgr.poll_inbound(Duration::from_millis(5)),
            InboundOutcome::ServerTeardown
        ));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        assert_eq!(wire.lock().unwrap().closed, 1);
    }

    #[test]
    fn disconnect_waits_for_ack_then_closes() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let mut mgr = manager(vec![FakeLink::acking(&wire)], &SharedQueue::default());
        mgr.connect().expect("connect");
        mgr.disconnect().expect("disconnect");
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        let wire = wire.lock().unwrap();
        assert_eq!(wire.sent[1], r#"{"client_id":"edge-1","action":"800"}"#);
        assert_eq!(wire.closed, 1);
    }

    fn stop_after(delay: Duration) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || {
            thread::sleep(delay);
            flag.store(true, Ordering::SeqCst);
        });
        (shutdown, handle)
    }

    #[test]
    fn run_delivers_then_disconnects_on_shutdown() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let queue = SharedQueue::default();
        queue.offer(det(5)).unwrap();
        let mut mgr = manager(vec![FakeLink::acking(&wire)], &queue);

        let (shutdown, stopper) = stop_after(Duration::from_millis(150));
        mgr.run(&shutdown).expect("run");
        stopper.join().unwrap();

        let sent = wire.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains(r#""action":"100""#));
        assert!(sent[1].contains(r#""id":5"#));
        assert!(sent[2].contains(r#""action":"800""#));
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn run_reconnects_and_redelivers_failed_send() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let queue = SharedQueue::default();
        queue.offer(det(9)).unwrap();
        let links = vec![
            FakeLink::acking(&wire).failing_after(1),
            FakeLink::acking(&wire),
        ];
        let mut mgr = manager(links, &queue);

        let (shutdown, stopper) = stop_after(Duration::from_millis(300));
        mgr.run(&shutdown).expect("run");
        stopper.join().unwrap();

        let sent = wire.lock().unwrap().sent.clone();
        assert!(sent[0].contains(r#""action":"100""#));
        assert!(sent[1].contains(r#""action":"600""#));
        assert_eq!(sent.iter().filter(|l| l.contains(r#""id":9"#)).count(), 1);
        assert_eq!(mgr.sent(), 1);
        assert!(queue.lock().unwrap().is_empty());
    }

    #[test]
    fn run_surfaces_persistent_failure() {
        let mut mgr = ConnectionManager::new(
            FakeConnector::new(Vec::new()),
            settings(2),
            SharedQueue::default(),
        );
        let shutdown = AtomicBool::new(false);
        let err = mgr.run(&shutdown).unwrap_err();
        assert!(err.to_string().contains("after 2 failed attempts"));
        assert_eq!(mgr.state(), ConnectionState::Failed { attempts: 2 });
    }

    #[test]
    fn run_counts_rejected_handshakes_against_the_budget() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let links = vec![
            FakeLink::scripted(&wire, &[r#"{"msg":"600_1"}"#]),
            FakeLink::scripted(&wire, &[r#"{"msg":"600_1"}"#]),
        ];
        let mut mgr = ConnectionManager::new(
            FakeConnector::new(links),
            settings(2),
            SharedQueue::default(),
        );
        let shutdown = AtomicBool::new(false);
        assert!(mgr.run(&shutdown).is_err());
        assert_eq!(mgr.state(), ConnectionState::Failed { attempts: 2 });
        assert!(!mgr.is_registered());

        let wire = wire.lock().unwrap();
        assert_eq!(wire.sent.len(), 2);
        assert!(wire.sent.iter().all(|line| line.contains(r#""action":"100""#)));
        assert_eq!(wire.closed, 2);
    }
}
