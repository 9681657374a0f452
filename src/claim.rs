//! Connections which are borrowed from a host pool.

use crate::host::{Connection, Name};
use crate::Role;

use std::sync::{Arc, Mutex};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{event, Level};

/// A [Connection] which is returned to its host pool when dropped.
///
/// The handle implements [std::ops::Deref] for the generic `Conn` type;
/// clients generally use a handle as the connection itself. It also
/// carries the [Role] of the endpoint that vended it, so instrumentation
/// can attribute every query to the role that served it.
pub struct Handle<Conn: Connection> {
    conn: Option<Conn>,
    idle: Arc<Mutex<Vec<Conn>>>,
    host: Name,
    role: Role,
    discard: bool,
    // Dropping the permit is what frees the pool slot; held for the
    // lifetime of the borrow.
    _permit: OwnedSemaphorePermit,
}

impl<Conn: Connection> std::fmt::Debug for Handle<Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("host", &self.host)
            .field("role", &self.role)
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(
        conn: Conn,
        idle: Arc<Mutex<Vec<Conn>>>,
        permit: OwnedSemaphorePermit,
        host: Name,
        role: Role,
    ) -> Self {
        Self {
            conn: Some(conn),
            idle,
            host,
            role,
            discard: false,
            _permit: permit,
        }
    }

    /// The role of the endpoint this connection belongs to.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The name of the host this connection belongs to.
    pub fn host(&self) -> &Name {
        &self.host
    }

    /// Marks the connection as broken: it is dropped on return instead of
    /// being recycled into the pool.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;
    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap()
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        let conn = self.conn.take().unwrap();
        if self.discard {
            event!(Level::TRACE, host = %self.host, "Dropping discarded connection");
            return;
        }
        event!(Level::TRACE, host = %self.host, "Returning connection to pool");
        self.idle.lock().unwrap().push(conn);
    }
}
