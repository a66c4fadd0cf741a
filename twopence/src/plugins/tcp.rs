//! The `tcp` plugin: a thin loopback-friendly transport over a plain TCP
//! socket, for connecting to a `twopence`-speaking responder that already
//! exists on the network (e.g. a test fixture started separately, or a
//! future responder binary) rather than spawning one in-process the way
//! `local` does. Grounded on `monocoque-core/src/socket.rs`'s TCP dial path
//! and `twopence_core::tcp::enable_tcp_nodelay`, which this plugin is the
//! first real caller of.

use twopence_core::error::{Result, TwopenceError};
use twopence_protocol::Connection;

use crate::plugins::TransportStream;

/// Connect to `spec`, a `host:port` pair (e.g. `"127.0.0.1:9999"`).
pub async fn connect(spec: &str) -> Result<Connection<TransportStream>> {
    let addr: std::net::SocketAddr = spec
        .parse()
        .map_err(|_| TwopenceError::invalid_target(format!("invalid tcp address: {spec}")))?;
    let stream = compio::net::TcpStream::connect(addr)
        .await
        .map_err(|e| TwopenceError::OpenSession(e.to_string()))?;
    twopence_core::tcp::enable_tcp_nodelay(&stream).map_err(|e| TwopenceError::OpenSession(e.to_string()))?;
    Ok(Connection::new(
        TransportStream::Tcp(stream),
        twopence_core::config::ConnectionOptions::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn rejects_an_unparseable_address() {
        let err = connect("not-an-address").await.unwrap_err();
        assert!(matches!(err, TwopenceError::InvalidTarget(_)));
    }

    #[compio::test]
    async fn reports_open_session_error_when_nothing_is_listening() {
        // Port 0 on loopback never has a listener to connect to.
        let err = connect("127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, TwopenceError::OpenSession(_)));
    }
}
