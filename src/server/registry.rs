use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Mutex, MutexGuard};

/// Identifies one accepted connection for the lifetime of the server.
pub type ConnectionId = u64;

/// The live socket a session is bound to.
#[derive(Debug)]
pub struct Binding {
    pub conn_id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub socket: Option<TcpStream>,
}

impl Binding {
    pub fn new(conn_id: ConnectionId, peer: Option<SocketAddr>, socket: Option<TcpStream>) -> Self {
        Self {
            conn_id,
            peer,
            socket,
        }
    }

    /// A binding with no socket handle, for tests and embedding.
    pub fn detached(conn_id: ConnectionId) -> Self {
        Self::new(conn_id, None, None)
    }
}

#[derive(Debug)]
pub struct ClientSession {
    pub client_id: String,
    pub binding: Binding,
    pub connected: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// The id existed and now points at the new connection.
    Rebound,
}

/// `client_id -> session` map shared by all connection threads.
///
/// Every mutation takes the lock for its whole read-modify-write, so
/// concurrent register/reconnect/disconnect calls never interleave.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, ClientSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ClientSession>>> {
        self.sessions
            .lock()
            .map_err(|_| anyhow!("session registry lock poisoned"))
    }

    /// Create a session, or rebind an existing one to `binding`.
    pub fn register(&self, client_id: &str, binding: Binding) -> Result<Registration> {
        self.bind(client_id, binding)
    }

    /// Bind `client_id` to a new socket whether or not it was known before.
    pub fn rebind(&self, client_id: &str, binding: Binding) -> Result<Registration> {
        self.bind(client_id, binding)
    }

    fn bind(&self, client_id: &str, binding: Binding) -> Result<Registration> {
        let mut sessions = self.lock()?;
        let session = ClientSession {
            client_id: client_id.to_string(),
            binding,
            connected: true,
        };
        Ok(match sessions.insert(client_id.to_string(), session) {
            Some(_) => Registration::Rebound,
            None => Registration::Created,
        })
    }

    /// Remove a session. Returns false if the id was unknown.
    pub fn remove(&self, client_id: &str) -> Result<bool> {
        Ok(self.lock()?.remove(client_id).is_some())
    }

    /// Mark every session bound to `conn_id` as disconnected, keeping the
    /// record so a later reconnect can rebind it. Returns the affected ids.
    pub fn mark_disconnected(&self, conn_id: ConnectionId) -> Result<Vec<String>> {
        let mut sessions = self.lock()?;
        let mut affected = Vec::new();
        for session in sessions.values_mut() {
            if session.binding.conn_id == conn_id && session.connected {
                session.connected = false;
                session.binding.socket = None;
                affected.push(session.client_id.clone());
            }
        }
        affected.sort();
        Ok(affected)
    }

    /// True if `client_id` is connected through `conn_id`.
    pub fn is_bound_to(&self, client_id: &str, conn_id: ConnectionId) -> Result<bool> {
        Ok(self
            .lock()?
            .get(client_id)
            .is_some_and(|s| s.connected && s.binding.conn_id == conn_id))
    }

    pub fn is_connected(&self, client_id: &str) -> Result<bool> {
        Ok(self.lock()?.get(client_id).is_some_and(|s| s.connected))
    }

    pub fn contains(&self, client_id: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(client_id))
    }

    pub fn peer_of(&self, client_id: &str) -> Result<Option<SocketAddr>> {
        Ok(self.lock()?.get(client_id).and_then(|s| s.binding.peer))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    pub fn client_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.lock()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Drop every session, shutting down any socket still attached.
    pub fn clear(&self) -> Result<usize> {
        let mut sessions = self.lock()?;
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            if let Some(socket) = session.binding.socket {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
        Ok(count)
    }
}
