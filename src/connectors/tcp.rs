//! Implementation of [Connector] for TCP.

use crate::host::{self, Connector, Host};

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Connects to hosts at the transport level.
///
/// Useful for endpoints fronted by a protocol-aware proxy, and as the
/// liveness layer when the query protocol is handled elsewhere.
pub struct TcpConnector {}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = TcpStream;

    async fn connect(&self, host: &Host) -> Result<Self::Connection, host::Error> {
        TcpStream::connect(host.address).await.map_err(|e| e.into())
    }

    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), host::Error> {
        // A zero-length read can't distinguish "server closed" from "bad
        // client arguments", and a real read would interfere with the
        // connection's traffic. Servers that support a ping/pong message
        // should get a protocol-aware connector instead.
        Ok(())
    }
}
