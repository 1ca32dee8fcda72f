//! The protocol listener: socket accept loop, per-connection workers,
//! handshake/auth orchestration, and connection metrics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthServer, MYSQL_DIALOG, MYSQL_NATIVE_PASSWORD};
use crate::config::ListenerOpts;
use crate::connection::{serve_commands, Conn};
use crate::error::{Result, WireError};
use crate::handler::Handler;
use crate::handshake::{
    parse_client_handshake, write_auth_switch_request, write_handshake_v10, ClientAuth, ClientHello,
};
use crate::metrics::metrics;
use crate::protocol::{CR_SERVER_HANDSHAKE_ERR, SS_UNKNOWN_SQL_STATE};
use crate::tls::ClientStream;

enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

struct Shared {
    auth_server: Arc<dyn AuthServer>,
    handler: Arc<dyn Handler>,
    opts: ListenerOpts,
    tls_acceptor: Option<TlsAcceptor>,
}

/// Closes the listener it was taken from; in-flight connections keep
/// running until their clients disconnect or their I/O times out.
#[derive(Clone)]
pub struct ListenerHandle {
    shutdown: Arc<Notify>,
}

impl ListenerHandle {
    pub fn close(&self) {
        self.shutdown.notify_one();
    }
}

/// The MySQL server protocol listener.
pub struct Listener {
    socket: ListenerSocket,
    shared: Arc<Shared>,
    connection_id: u32,
    shutdown: Arc<Notify>,
}

impl Listener {
    /// Bind a TCP listener.
    pub async fn bind_tcp(
        addr: &str,
        auth_server: Arc<dyn AuthServer>,
        handler: Arc<dyn Handler>,
        opts: ListenerOpts,
    ) -> Result<Self> {
        let socket = TcpListener::bind(addr).await?;
        Self::from_tcp_listener(socket, auth_server, handler, opts)
    }

    /// Wrap an already-bound TCP listener.
    pub fn from_tcp_listener(
        socket: TcpListener,
        auth_server: Arc<dyn AuthServer>,
        handler: Arc<dyn Handler>,
        opts: ListenerOpts,
    ) -> Result<Self> {
        Self::new(ListenerSocket::Tcp(socket), auth_server, handler, opts)
    }

    /// Bind a Unix-domain socket listener. TLS cannot be advertised on
    /// unix sockets.
    pub fn bind_unix(
        path: &str,
        auth_server: Arc<dyn AuthServer>,
        handler: Arc<dyn Handler>,
        opts: ListenerOpts,
    ) -> Result<Self> {
        let socket = UnixListener::bind(path)?;
        Self::new(ListenerSocket::Unix(socket), auth_server, handler, opts)
    }

    fn new(
        socket: ListenerSocket,
        auth_server: Arc<dyn AuthServer>,
        handler: Arc<dyn Handler>,
        opts: ListenerOpts,
    ) -> Result<Self> {
        let tls_acceptor = match (&socket, &opts.tls) {
            (ListenerSocket::Tcp(_), Some(tls)) => Some(tls.build_acceptor()?),
            (ListenerSocket::Unix(_), Some(_)) => {
                return Err(WireError::Config(
                    "TLS is not supported on unix sockets".to_string(),
                ));
            }
            _ => None,
        };

        Ok(Self {
            socket,
            shared: Arc::new(Shared {
                auth_server,
                handler,
                opts,
                tls_acceptor,
            }),
            connection_id: 0,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// The bound TCP address, for tests and logs.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        match &self.socket {
            ListenerSocket::Tcp(socket) => Ok(socket.local_addr()?),
            ListenerSocket::Unix(_) => Err(WireError::Config(
                "unix listeners have no TCP address".to_string(),
            )),
        }
    }

    /// A handle that closes this listener from another task.
    pub fn shutdown_handle(&self) -> ListenerHandle {
        ListenerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    async fn accept_one(&self) -> std::io::Result<(ClientStream, String)> {
        match &self.socket {
            ListenerSocket::Tcp(socket) => {
                let (stream, addr) = socket.accept().await?;
                Ok((ClientStream::Tcp(stream), addr.to_string()))
            }
            ListenerSocket::Unix(socket) => {
                let (stream, addr) = socket.accept().await?;
                Ok((ClientStream::Unix(stream), format!("{:?}", addr)))
            }
        }
    }

    /// Run the accept loop until the shutdown handle fires or the
    /// socket fails.
    pub async fn serve(mut self) -> Result<()> {
        info!("MySQL protocol listener accepting connections");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("MySQL protocol listener shutting down");
                    return Ok(());
                }
                accepted = self.accept_one() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Accept failing usually means the socket closed.
                    error!("accept failed: {}", e);
                    return Ok(());
                }
            };

            let accept_time = Instant::now();
            self.connection_id = self.connection_id.wrapping_add(1);
            let connection_id = self.connection_id;

            metrics().connection_count.inc();
            metrics().connection_accepted.inc();
            debug!("accepted connection {} from {}", connection_id, remote_addr);

            let shared = Arc::clone(&self.shared);
            tokio::spawn(handle_connection(
                shared,
                stream,
                remote_addr,
                connection_id,
                accept_time,
            ));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One spawned worker per accepted connection. Whether it ends in a
/// clean quit, an I/O error, or a handler panic, the live-connection
/// gauge is released and `connection_closed` fires exactly once.
async fn handle_connection(
    shared: Arc<Shared>,
    stream: ClientStream,
    remote_addr: String,
    connection_id: u32,
    accept_time: Instant,
) {
    let mut conn = Conn::new(
        stream,
        connection_id,
        remote_addr,
        shared.opts.read_timeout(),
        shared.opts.write_timeout(),
    );

    // The recovery barrier spans the whole worker, `new_connection`
    // included: a panicking handler still gets logged and its socket
    // dropped through this path.
    let served = AssertUnwindSafe(async {
        shared.handler.new_connection(&mut conn);
        serve_connection(&shared, &mut conn, accept_time).await
    })
    .catch_unwind()
    .await;
    match served {
        Ok(Ok(())) => {}
        Ok(Err(WireError::ConnectionClosed)) => {
            debug!("connection {} closed", connection_id);
        }
        Ok(Err(e)) => {
            error!("connection {} failed: {}", connection_id, e);
        }
        Err(panic) => {
            error!(
                "connection {} panicked: {}",
                connection_id,
                panic_message(panic.as_ref())
            );
        }
    }

    shared.handler.connection_closed(&mut conn);
    metrics().connection_count.dec();
}

/// Handshake, authenticate, then run the command loop. The socket is
/// closed by the caller when this returns.
async fn serve_connection(
    shared: &Shared,
    conn: &mut Conn,
    accept_time: Instant,
) -> Result<()> {
    let tls_enabled = shared.tls_acceptor.is_some();

    let salt = write_handshake_v10(
        conn,
        &shared.opts.server_version,
        shared.auth_server.as_ref(),
        tls_enabled,
    )
    .await?;

    // The response has to be a direct read so the buffered reader
    // cannot swallow the first TLS negotiation bytes.
    let response = conn.read_packet_direct().await?;
    let hello = parse_client_handshake(conn, true, response, tls_enabled)?;

    let client = match hello {
        ClientHello::Response(client) => client,
        ClientHello::TlsUpgrade => {
            let acceptor = shared
                .tls_acceptor
                .as_ref()
                .ok_or_else(|| WireError::Tls("TLS requested but not configured".to_string()))?;
            conn.upgrade_to_tls(acceptor).await?;

            // Re-read the full handshake response on the encrypted
            // stream.
            let response = conn.read_packet().await?;
            match parse_client_handshake(conn, false, response, tls_enabled)? {
                ClientHello::Response(client) => client,
                ClientHello::TlsUpgrade => {
                    return Err(WireError::Handshake(
                        "client repeated the TLS upgrade request".to_string(),
                    ));
                }
            }
        }
    };

    authenticate(shared, conn, &salt, client).await?;

    conn.write_ok_packet(0, 0).await?;

    let connect_time = accept_time.elapsed();
    metrics().connect_timing.observe(connect_time);
    if let Some(threshold) = shared.opts.slow_connect_warn_threshold() {
        if connect_time > threshold {
            metrics().connection_slow.inc();
            warn!(
                "slow connection from {}: {:?}",
                conn.remote_addr, connect_time
            );
        }
    }

    serve_commands(conn, shared.handler.as_ref()).await
}

/// Drive the three-way auth decision between what the auth server
/// wants for this user and what the client offered.
async fn authenticate(
    shared: &Shared,
    conn: &mut Conn,
    salt: &[u8; 20],
    client: ClientAuth,
) -> Result<()> {
    let auth_server = shared.auth_server.as_ref();

    let server_method = match auth_server.auth_method(&client.username) {
        Ok(method) => method,
        Err(e) => {
            conn.write_error_packet_from_error(&e).await?;
            return Err(WireError::ConnectionClosed);
        }
    };

    if server_method == MYSQL_NATIVE_PASSWORD && client.auth_method == MYSQL_NATIVE_PASSWORD {
        // Fast path: the proof is already in the handshake response.
        let remote_addr = conn.remote_addr.clone();
        match auth_server
            .validate_hash(salt, &client.username, &client.auth_response, &remote_addr)
            .await
        {
            Ok(user_data) => {
                conn.user = client.username;
                conn.user_data = Some(user_data);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "native password authentication failed for '{}': {}",
                    client.username, e
                );
                conn.write_error_packet_from_error(&e).await?;
                Err(WireError::ConnectionClosed)
            }
        }
    } else if server_method == MYSQL_NATIVE_PASSWORD {
        // The client answered with some other plugin; switching back
        // to native password is not supported.
        conn.write_error_packet(
            CR_SERVER_HANDSHAKE_ERR,
            SS_UNKNOWN_SQL_STATE,
            &format!(
                "Client asked for auth {}, but server wants auth mysql_native_password",
                client.auth_method
            ),
        )
        .await?;
        Err(WireError::ConnectionClosed)
    } else {
        // Any other plugin renegotiates in clear text; make sure the
        // transport allows that.
        if !shared.opts.allow_clear_text_without_tls && !conn.is_tls() {
            conn.write_error_packet(
                CR_SERVER_HANDSHAKE_ERR,
                SS_UNKNOWN_SQL_STATE,
                "Cannot use clear text authentication over non-SSL connections.",
            )
            .await?;
            return Err(WireError::ConnectionClosed);
        }

        let plugin_data = if server_method == MYSQL_DIALOG {
            crate::auth::dialog_switch_data()
        } else {
            Vec::new()
        };
        write_auth_switch_request(conn, &server_method, &plugin_data).await?;

        let remote_addr = conn.remote_addr.clone();
        match auth_server
            .negotiate(conn, &client.username, &remote_addr)
            .await
        {
            Ok(user_data) => {
                conn.user = client.username;
                conn.user_data = Some(user_data);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "auth negotiation failed for '{}': {}",
                    client.username, e
                );
                conn.write_error_packet_from_error(&e).await?;
                Err(WireError::ConnectionClosed)
            }
        }
    }
}
