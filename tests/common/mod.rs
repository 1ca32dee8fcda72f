//! Shared fixtures: an in-process listener, a scripted handler, and a
//! raw packet-level test client.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use mysql_wire::auth::scramble_native_password;
use mysql_wire::packet::Packet;
use mysql_wire::protocol::{
    CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
};
use mysql_wire::{
    AuthServer, BindVars, ColumnType, Conn, Field, Handler, Listener, ListenerHandle,
    ListenerOpts, PrepareWriter, QueryResult, Result, ResultWriter, StaticAuthServer, Value,
    WireError,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// Scripted handler driven by exact query strings.
#[derive(Default)]
pub struct TestHandler {
    pub connections_opened: AtomicUsize,
    pub connections_closed: AtomicUsize,
}

fn as_i64(value: &Value) -> Result<i64> {
    match value {
        Value::Int(v) => Ok(*v),
        Value::UInt(v) => Ok(*v as i64),
        other => Err(WireError::server(
            1064,
            "HY000",
            format!("expected an integer bind value, got {:?}", other),
        )),
    }
}

#[async_trait]
impl Handler for TestHandler {
    fn new_connection(&self, _conn: &mut Conn) {
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_closed(&self, _conn: &mut Conn) {
        self.connections_closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn com_query(
        &self,
        query: &str,
        bind_vars: &BindVars,
        results: &mut ResultWriter<'_>,
    ) -> Result<()> {
        match query {
            "DO 1" => results.send(&QueryResult::ok(0, 0)).await,

            "INSERT INTO t VALUES (1)" => results.send(&QueryResult::ok(3, 42)).await,

            "SELECT two rows" => {
                let mut qr = QueryResult::with_fields(vec![
                    Field::new("a", ColumnType::VarChar),
                    Field::new("b", ColumnType::VarChar),
                ]);
                qr.rows.push(vec![Value::from("a"), Value::from("b")]);
                qr.rows.push(vec![Value::from("c"), Value::from("d")]);
                results.send(&qr).await
            }

            "SELECT ? + ?" => {
                let a = as_i64(bind_vars.get("v1").ok_or_else(|| {
                    WireError::server(1064, "HY000", "missing bind variable v1")
                })?)?;
                let b = as_i64(bind_vars.get("v2").ok_or_else(|| {
                    WireError::server(1064, "HY000", "missing bind variable v2")
                })?)?;
                let mut qr = QueryResult::with_fields(vec![Field::new("sum", ColumnType::LongLong)]);
                qr.rows.push(vec![Value::Int(a + b)]);
                results.send(&qr).await
            }

            "SELECT ?" => {
                let v = bind_vars
                    .get("v1")
                    .cloned()
                    .ok_or_else(|| WireError::server(1064, "HY000", "missing bind variable v1"))?;
                let mut qr = QueryResult::with_fields(vec![Field::new("echo", ColumnType::LongBlob)]);
                qr.rows.push(vec![v]);
                results.send(&qr).await
            }

            "fail before fields" => Err(WireError::server(
                1146,
                "42S02",
                "Table 'missing' doesn't exist",
            )),

            "fail after fields" => {
                // Field metadata goes out, but the row stream never
                // starts before the failure.
                let qr = QueryResult::with_fields(vec![Field::new("x", ColumnType::VarChar)]);
                results.send(&qr).await?;
                Err(WireError::server(
                    1317,
                    "70100",
                    "Query execution was interrupted",
                ))
            }

            "fail mid stream" => {
                let mut qr = QueryResult::with_fields(vec![Field::new("x", ColumnType::VarChar)]);
                qr.rows.push(vec![Value::from("one")]);
                results.send(&qr).await?;
                Err(WireError::server(1105, "HY000", "storage engine gave up"))
            }

            "panic now" => panic!("handler blew up"),

            other => Err(WireError::server(
                1064,
                "42000",
                format!("unsupported test query: {}", other),
            )),
        }
    }

    async fn com_prepare(
        &self,
        query: &str,
        _bind_vars: &BindVars,
        reply: &mut PrepareWriter<'_>,
    ) -> Result<()> {
        let fields = match query {
            "SELECT ? + ?" => vec![Field::new("sum", ColumnType::LongLong)],
            "SELECT ?" => vec![Field::new("echo", ColumnType::LongBlob)],
            _ => Vec::new(),
        };
        reply.send(&QueryResult::with_fields(fields)).await
    }
}

pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub handler: Arc<TestHandler>,
    pub shutdown: ListenerHandle,
    pub join: JoinHandle<Result<()>>,
}

pub async fn start_server(opts: ListenerOpts) -> TestServer {
    let mut auth = StaticAuthServer::new();
    auth.add_user("app", "secret");
    start_server_with_auth(opts, Arc::new(auth)).await
}

pub async fn start_server_with_auth(
    opts: ListenerOpts,
    auth_server: Arc<dyn AuthServer>,
) -> TestServer {
    let handler = Arc::new(TestHandler::default());
    let listener = Listener::bind_tcp("127.0.0.1:0", auth_server, handler.clone(), opts)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = listener.shutdown_handle();
    let join = tokio::spawn(listener.serve());

    TestServer {
        addr,
        handler,
        shutdown,
        join,
    }
}

/// Fields pulled out of the server greeting.
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub salt: [u8; 20],
    pub capabilities: u32,
    pub character_set: u8,
    pub auth_plugin: String,
}

pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn read_packet(&mut self) -> Packet {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(packet) = Packet::decode(&mut self.buf).unwrap() {
                    return packet;
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "connection closed while expecting a packet");
            }
        })
        .await
        .expect("timed out waiting for a packet")
    }

    /// Assert the server dropped the connection without further data.
    pub async fn expect_closed(&mut self) {
        assert!(
            self.buf.is_empty(),
            "unexpected buffered bytes: {:?}",
            &self.buf[..]
        );
        let n = timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf))
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert_eq!(n, 0, "expected the connection to be closed");
    }

    pub async fn write_packet(&mut self, sequence_id: u8, payload: &[u8]) {
        let packet = Packet::new(sequence_id, payload.to_vec());
        self.stream.write_all(&packet.encode()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn read_greeting(&mut self) -> Greeting {
        let packet = self.read_packet().await;
        assert_eq!(packet.sequence_id, 0);
        let p = &packet.payload[..];

        let protocol_version = p[0];
        let version_end = 1 + p[1..].iter().position(|&b| b == 0).unwrap();
        let server_version = String::from_utf8(p[1..version_end].to_vec()).unwrap();

        let mut pos = version_end + 1;
        let connection_id = u32::from_le_bytes(p[pos..pos + 4].try_into().unwrap());
        pos += 4;

        let mut salt = [0u8; 20];
        salt[..8].copy_from_slice(&p[pos..pos + 8]);
        pos += 8;
        assert_eq!(p[pos], 0, "filler byte");
        pos += 1;

        let caps_low = u16::from_le_bytes(p[pos..pos + 2].try_into().unwrap());
        pos += 2;
        let character_set = p[pos];
        pos += 1;
        let _status_flags = u16::from_le_bytes(p[pos..pos + 2].try_into().unwrap());
        pos += 2;
        let caps_high = u16::from_le_bytes(p[pos..pos + 2].try_into().unwrap());
        pos += 2;
        let capabilities = (caps_low as u32) | ((caps_high as u32) << 16);

        assert_eq!(p[pos], 21, "auth plugin data length");
        pos += 1;
        assert_eq!(&p[pos..pos + 10], &[0u8; 10], "reserved bytes");
        pos += 10;

        salt[8..20].copy_from_slice(&p[pos..pos + 12]);
        pos += 12;
        assert_eq!(p[pos], 0, "salt terminator");
        pos += 1;

        let plugin_end = pos + p[pos..].iter().position(|&b| b == 0).unwrap();
        let auth_plugin = String::from_utf8(p[pos..plugin_end].to_vec()).unwrap();

        Greeting {
            protocol_version,
            server_version,
            connection_id,
            salt,
            capabilities,
            character_set,
            auth_plugin,
        }
    }

    pub fn build_handshake_response(
        user: &str,
        auth_response: &[u8],
        extra_flags: u32,
        db: Option<&str>,
        auth_plugin: Option<&str>,
    ) -> BytesMut {
        let mut flags = CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | extra_flags;
        if db.is_some() {
            flags |= mysql_wire::protocol::CLIENT_CONNECT_WITH_DB;
        }
        if auth_plugin.is_some() {
            flags |= CLIENT_PLUGIN_AUTH;
        }

        let mut buf = BytesMut::new();
        buf.put_u32_le(flags);
        buf.put_u32_le(16 * 1024 * 1024); // max packet size
        buf.put_u8(33); // character set
        buf.put_bytes(0, 23); // reserved

        buf.put_slice(user.as_bytes());
        buf.put_u8(0);

        buf.put_u8(auth_response.len() as u8);
        buf.put_slice(auth_response);

        if let Some(db) = db {
            buf.put_slice(db.as_bytes());
            buf.put_u8(0);
        }

        if let Some(plugin) = auth_plugin {
            buf.put_slice(plugin.as_bytes());
            buf.put_u8(0);
        }

        buf
    }

    /// Full native-password handshake; asserts the final OK.
    pub async fn handshake(&mut self, user: &str, password: &str, extra_flags: u32) -> Greeting {
        let greeting = self.read_greeting().await;
        let scramble = scramble_native_password(&greeting.salt, password);
        let response = Self::build_handshake_response(
            user,
            &scramble,
            extra_flags,
            None,
            Some("mysql_native_password"),
        );
        self.write_packet(1, &response).await;

        let ok = self.read_packet().await;
        assert_eq!(ok.payload[0], 0x00, "expected an OK packet after auth");
        greeting
    }

    pub async fn com_query(&mut self, sql: &str) {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        self.write_packet(0, &payload).await;
    }

    pub async fn com_prepare(&mut self, sql: &str) {
        let mut payload = vec![0x16];
        payload.extend_from_slice(sql.as_bytes());
        self.write_packet(0, &payload).await;
    }
}

/// Decode a length-encoded integer from the front of a slice, test
/// side. Returns (value, bytes consumed).
pub fn lenenc_int(data: &[u8]) -> (u64, usize) {
    match data[0] {
        0xfc => (
            u16::from_le_bytes(data[1..3].try_into().unwrap()) as u64,
            3,
        ),
        0xfd => {
            let mut v = [0u8; 4];
            v[..3].copy_from_slice(&data[1..4]);
            (u32::from_le_bytes(v) as u64, 4)
        }
        0xfe => (u64::from_le_bytes(data[1..9].try_into().unwrap()), 9),
        b => (b as u64, 1),
    }
}
