//! Per-connection state, packet I/O, and the command dispatcher.
//!
//! One `Conn` lives for the duration of one client socket. All handler
//! methods for a given connection are invoked strictly one at a time,
//! so the handler may keep scratch state in `client_data` without any
//! locking; concurrency only happens across distinct connections.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::auth::{PacketChannel, UserData};
use crate::error::{Result, WireError};
use crate::metrics::metrics;
use crate::packet::{check_sequence, encode_frames, Packet};
use crate::protocol::{
    write_lenenc_int, Command, CLIENT_DEPRECATE_EOF, CLIENT_MULTI_STATEMENTS, CLIENT_SSL,
    CR_COMMANDS_OUT_OF_SYNC, EOF_PACKET, ER_UNKNOWN_COM_ERROR, ER_UNKNOWN_ERROR, ERR_PACKET,
    MAX_FRAME_SIZE, MAX_PACKET_SIZE, OK_PACKET, SERVER_STATUS_AUTOCOMMIT, SS_UNKNOWN_COM_ERROR,
    SS_UNKNOWN_SQL_STATE,
};
use crate::resultset::{encode_binary_row, encode_column_definition, encode_text_row, Field, QueryResult};
use crate::tls::ClientStream;
use crate::value::{bind_var_key, read_binary_param, BindVars, Value};
use crate::handler::Handler;

/// Server-side record of one prepared statement.
#[derive(Debug, Default)]
pub struct PrepareData {
    pub statement_id: u32,
    pub prepare_stmt: String,
    pub params_count: u16,
    /// Parameter `(type code, unsigned)` pairs, recorded on the first
    /// execute that binds new parameters.
    pub params_type: Vec<(u8, bool)>,
    /// Current per-execute bindings, including accumulated long-data
    /// chunks. Cleared after every execute.
    pub bind_vars: BindVars,
    /// Result column names captured from the prepare reply; used to
    /// rewrite field names on execute.
    pub column_names: Vec<String>,
}

/// One client connection.
pub struct Conn {
    stream: Option<ClientStream>,
    read_buf: BytesMut,
    sequence: u8,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,

    pub connection_id: u32,
    /// Display form of the peer address (socket address or unix path).
    pub remote_addr: String,
    /// Capabilities retained from the handshake, possibly extended by
    /// `COM_SET_OPTION`.
    pub capabilities: u32,
    /// Status flags echoed in every OK/EOF payload. The handler may
    /// adjust these in `new_connection`.
    pub status_flags: u16,
    pub character_set: u8,
    /// Current default database, from the handshake or `COM_INIT_DB`.
    pub schema_name: String,
    /// Authenticated username; empty until auth completes.
    pub user: String,
    pub user_data: Option<Box<dyn UserData>>,
    /// Handler-owned scratch state.
    pub client_data: Option<Box<dyn Any + Send>>,

    statement_id: u32,
    pub(crate) prepare_data: HashMap<u32, PrepareData>,
}

async fn with_deadline<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    match limit {
        Some(d) => match timeout(d, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection deadline exceeded",
            ))),
        },
        None => Ok(fut.await?),
    }
}

impl Conn {
    pub(crate) fn new(
        stream: ClientStream,
        connection_id: u32,
        remote_addr: String,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream: Some(stream),
            read_buf: BytesMut::with_capacity(8192),
            sequence: 0,
            read_timeout,
            write_timeout,
            connection_id,
            remote_addr,
            capabilities: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            character_set: 0,
            schema_name: String::new(),
            user: String::new(),
            user_data: None,
            client_data: None,
            statement_id: 0,
            prepare_data: HashMap::new(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.stream.as_ref().is_some_and(ClientStream::is_tls)
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }

    /// Swap the transport for its TLS-wrapped form. Anything still
    /// sitting in the plaintext read buffer is discarded; it must not
    /// leak into the TLS session.
    pub(crate) async fn upgrade_to_tls(&mut self, acceptor: &TlsAcceptor) -> Result<()> {
        let stream = self.stream.take().ok_or(WireError::ConnectionClosed)?;
        self.read_buf.clear();
        let upgraded = stream.upgrade_to_tls(acceptor).await?;
        self.stream = Some(upgraded);
        self.capabilities |= CLIENT_SSL;
        Ok(())
    }

    async fn fill_read_buf(&mut self) -> Result<()> {
        let limit = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(WireError::ConnectionClosed)?;
        let buf = &mut self.read_buf;
        let n = with_deadline(limit, stream.read_buf(buf)).await?;
        if n == 0 {
            return Err(WireError::ConnectionClosed);
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.read_buf)? {
                check_sequence(&packet, self.sequence)?;
                self.sequence = self.sequence.wrapping_add(1);
                return Ok(packet);
            }
            self.fill_read_buf().await?;
        }
    }

    /// Read one logical packet, joining continuation frames. The
    /// common single-frame case is a zero-copy slice of the read
    /// buffer.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let first = self.read_frame().await?;
        if first.payload.len() < MAX_FRAME_SIZE {
            return Ok(first.payload);
        }

        let mut full = first.payload.to_vec();
        loop {
            let next = self.read_frame().await?;
            let done = next.payload.len() < MAX_FRAME_SIZE;
            full.extend_from_slice(&next.payload);
            if full.len() > MAX_PACKET_SIZE {
                return Err(WireError::InvalidPacket(format!(
                    "packet larger than {} bytes",
                    MAX_PACKET_SIZE
                )));
            }
            if done {
                return Ok(Bytes::from(full));
            }
        }
    }

    async fn read_frame_direct(&mut self) -> Result<Packet> {
        let limit = self.read_timeout;
        let expected = self.sequence;

        let stream = self.stream.as_mut().ok_or(WireError::ConnectionClosed)?;
        let mut header = [0u8; 4];
        with_deadline(limit, stream.read_exact(&mut header)).await?;
        let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);

        let mut payload = vec![0u8; len];
        with_deadline(limit, stream.read_exact(&mut payload)).await?;

        let packet = Packet::new(header[3], payload);
        check_sequence(&packet, expected)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(packet)
    }

    /// Read one logical packet without the buffered reader, consuming
    /// exactly the packet's bytes from the stream. Used for the
    /// handshake response so buffered plaintext can never contain TLS
    /// negotiation bytes.
    pub(crate) async fn read_packet_direct(&mut self) -> Result<Bytes> {
        let first = self.read_frame_direct().await?;
        if first.payload.len() < MAX_FRAME_SIZE {
            return Ok(first.payload);
        }

        let mut full = first.payload.to_vec();
        loop {
            let next = self.read_frame_direct().await?;
            let done = next.payload.len() < MAX_FRAME_SIZE;
            full.extend_from_slice(&next.payload);
            if full.len() > MAX_PACKET_SIZE {
                return Err(WireError::InvalidPacket(format!(
                    "packet larger than {} bytes",
                    MAX_PACKET_SIZE
                )));
            }
            if done {
                return Ok(Bytes::from(full));
            }
        }
    }

    /// Frame and flush one packet payload, splitting oversized
    /// payloads into continuation frames.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let framed = encode_frames(payload, &mut self.sequence);
        let limit = self.write_timeout;
        let stream = self.stream.as_mut().ok_or(WireError::ConnectionClosed)?;
        with_deadline(limit, stream.write_all(&framed)).await?;
        with_deadline(limit, stream.flush()).await?;
        Ok(())
    }

    fn build_ok_payload(&self, header: u8, affected_rows: u64, last_insert_id: u64) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(header);
        write_lenenc_int(&mut buf, affected_rows);
        write_lenenc_int(&mut buf, last_insert_id);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(0); // warnings
        buf
    }

    pub async fn write_ok_packet(&mut self, affected_rows: u64, last_insert_id: u64) -> Result<()> {
        let payload = self.build_ok_payload(OK_PACKET, affected_rows, last_insert_id);
        self.write_packet(&payload).await
    }

    async fn write_eof_packet(&mut self) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(EOF_PACKET);
        buf.put_u16_le(0); // warnings
        buf.put_u16_le(self.status_flags);
        self.write_packet(&buf.split()).await
    }

    /// The terminator of a result set or column list: an EOF packet,
    /// or an OK packet with an EOF header once DeprecateEOF is
    /// negotiated.
    pub(crate) async fn write_end_result(&mut self) -> Result<()> {
        if self.deprecate_eof() {
            let payload = self.build_ok_payload(EOF_PACKET, 0, 0);
            self.write_packet(&payload).await
        } else {
            self.write_eof_packet().await
        }
    }

    pub async fn write_error_packet(
        &mut self,
        code: u16,
        sql_state: &str,
        message: &str,
    ) -> Result<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(ERR_PACKET);
        buf.put_u16_le(code);
        buf.put_u8(b'#');
        buf.put_slice(sql_state.as_bytes());
        buf.put_slice(message.as_bytes());
        self.write_packet(&buf.split()).await
    }

    pub async fn write_error_packet_from_error(&mut self, err: &WireError) -> Result<()> {
        let (code, sql_state, message) = err.err_packet_parts();
        self.write_error_packet(code, sql_state, &message).await
    }
}

#[async_trait]
impl PacketChannel for Conn {
    async fn read_packet(&mut self) -> Result<Bytes> {
        Conn::read_packet(self).await
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        Conn::write_packet(self, payload).await
    }
}

/// Streams result batches for one query. Handed to the handler, which
/// calls [`send`](Self::send) once per batch; the writer owns the
/// framing state that decides between OK, field metadata, rows, and
/// the terminator.
pub struct ResultWriter<'a> {
    conn: &'a mut Conn,
    binary: bool,
    column_names: Vec<String>,
    fields: Vec<Field>,
    fields_sent: bool,
    rows_sent: bool,
    finished: bool,
}

impl<'a> ResultWriter<'a> {
    fn new(conn: &'a mut Conn, binary: bool, column_names: Vec<String>) -> Self {
        Self {
            conn,
            binary,
            column_names,
            fields: Vec::new(),
            fields_sent: false,
            rows_sent: false,
            finished: false,
        }
    }

    /// The connection this result stream belongs to.
    pub fn conn(&mut self) -> &mut Conn {
        self.conn
    }

    pub async fn send(&mut self, result: &QueryResult) -> Result<()> {
        if self.finished {
            // The terminating OK already went out; nothing more may be
            // written on this stream.
            return Err(WireError::ResultsFinished);
        }

        if !self.fields_sent {
            self.fields_sent = true;

            if result.fields.is_empty() {
                self.finished = true;
                return self
                    .conn
                    .write_ok_packet(result.rows_affected, result.insert_id)
                    .await;
            }

            self.write_fields(&result.fields).await?;
            self.fields = result.fields.clone();
        }

        for row in &result.rows {
            self.rows_sent = true;
            let payload = if self.binary {
                encode_binary_row(&self.fields, row)?
            } else {
                encode_text_row(row)
            };
            self.conn.write_packet(&payload).await?;
        }

        Ok(())
    }

    async fn write_fields(&mut self, fields: &[Field]) -> Result<()> {
        let mut buf = BytesMut::new();
        write_lenenc_int(&mut buf, fields.len() as u64);
        self.conn.write_packet(&buf.split()).await?;

        for (i, field) in fields.iter().enumerate() {
            let name_override = self.column_names.get(i).map(String::as_str);
            let payload = encode_column_definition(field, name_override);
            self.conn.write_packet(&payload).await?;
        }

        // Under DeprecateEOF the rows follow the column definitions
        // directly.
        if !self.conn.deprecate_eof() {
            self.conn.write_eof_packet().await?;
        }
        Ok(())
    }
}

/// Writes the reply to one `COM_STMT_PREPARE`. The handler calls
/// [`send`](Self::send) exactly once with the parameter/column schema.
pub struct PrepareWriter<'a> {
    conn: &'a mut Conn,
    statement_id: u32,
    params_count: u16,
    sent: bool,
    column_names: Vec<String>,
}

impl<'a> PrepareWriter<'a> {
    fn new(conn: &'a mut Conn, statement_id: u32, params_count: u16) -> Self {
        Self {
            conn,
            statement_id,
            params_count,
            sent: false,
            column_names: Vec::new(),
        }
    }

    pub fn conn(&mut self) -> &mut Conn {
        self.conn
    }

    pub async fn send(&mut self, result: &QueryResult) -> Result<()> {
        if self.sent {
            return Err(WireError::ResultsFinished);
        }
        self.sent = true;
        self.column_names = result.fields.iter().map(|f| f.name.clone()).collect();

        let mut buf = BytesMut::new();
        buf.put_u8(OK_PACKET);
        buf.put_u32_le(self.statement_id);
        buf.put_u16_le(result.fields.len() as u16);
        buf.put_u16_le(self.params_count);
        buf.put_u8(0); // filler
        buf.put_u16_le(0); // warnings
        self.conn.write_packet(&buf.split()).await?;

        if self.params_count > 0 {
            let placeholder = Field::new("?", crate::protocol::ColumnType::VarString);
            for _ in 0..self.params_count {
                let payload = encode_column_definition(&placeholder, None);
                self.conn.write_packet(&payload).await?;
            }
            if !self.conn.deprecate_eof() {
                self.conn.write_eof_packet().await?;
            }
        }

        if !result.fields.is_empty() {
            for field in &result.fields {
                let payload = encode_column_definition(field, None);
                self.conn.write_packet(&payload).await?;
            }
            if !self.conn.deprecate_eof() {
                self.conn.write_eof_packet().await?;
            }
        }

        Ok(())
    }
}

/// Decode the parameter section of a `COM_STMT_EXECUTE` payload into
/// the statement's bind variables. `buf` starts after the iteration
/// count. Parameters already populated by long-data chunks carry no
/// bytes on the wire and are left untouched.
fn parse_stmt_execute_params(prep: &mut PrepareData, mut buf: Bytes) -> Result<()> {
    if prep.params_count == 0 {
        return Ok(());
    }

    let malformed = |what: &str| WireError::InvalidPacket(format!("malformed statement execute packet: {}", what));

    let params = prep.params_count as usize;
    let bitmap_len = (params + 7) / 8;
    if buf.remaining() < bitmap_len + 1 {
        return Err(malformed("missing NULL bitmap"));
    }
    let bitmap = buf.copy_to_bytes(bitmap_len);
    let new_params_bound = buf.get_u8();

    if new_params_bound == 1 {
        let mut types = Vec::with_capacity(params);
        for _ in 0..params {
            if buf.remaining() < 2 {
                return Err(malformed("missing parameter types"));
            }
            let type_code = buf.get_u8();
            let flags = buf.get_u8();
            types.push((type_code, flags & 0x80 != 0));
        }
        prep.params_type = types;
    }

    for i in 0..prep.params_count {
        let key = bind_var_key(i);
        let idx = i as usize;
        if bitmap[idx >> 3] & (1 << (idx & 7)) != 0 {
            prep.bind_vars.insert(key, Value::Null);
            continue;
        }
        if prep.bind_vars.contains_key(&key) {
            // Populated by COM_STMT_SEND_LONG_DATA; no wire bytes.
            continue;
        }
        // A parameter that needs decoding must have a type, either
        // from this packet or from a previous execute.
        let (type_code, unsigned) = *prep
            .params_type
            .get(idx)
            .ok_or_else(|| malformed("no parameter types bound"))?;
        let value = read_binary_param(&mut buf, type_code, unsigned)?;
        prep.bind_vars.insert(key, value);
    }

    Ok(())
}

/// The per-connection command loop. Runs until the client quits, the
/// socket drops, or the stream becomes unrecoverable.
pub(crate) async fn serve_commands(conn: &mut Conn, handler: &dyn Handler) -> Result<()> {
    loop {
        conn.sequence = 0;
        let data = match conn.read_packet().await {
            Ok(data) => data,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => {
                error!(
                    "connection {}: error reading command packet: {}",
                    conn.connection_id, e
                );
                return Ok(());
            }
        };

        if data.is_empty() {
            conn.write_error_packet(
                ER_UNKNOWN_COM_ERROR,
                SS_UNKNOWN_COM_ERROR,
                "empty command packet",
            )
            .await?;
            continue;
        }

        let command = Command::from(data[0]);
        debug!("connection {}: {:?}", conn.connection_id, command);

        match command {
            Command::Quit => return Ok(()),

            Command::InitDb => {
                let db = String::from_utf8_lossy(&data[1..]).to_string();
                conn.schema_name = db;
                conn.write_ok_packet(0, 0).await?;
            }

            Command::Ping => {
                conn.write_ok_packet(0, 0).await?;
            }

            Command::Query => {
                let query_start = Instant::now();
                let query = String::from_utf8_lossy(&data[1..]).to_string();
                drop(data);

                if run_query(conn, handler, &query, BindVars::new(), false, Vec::new()).await? {
                    metrics().query_timing.observe(query_start.elapsed());
                } else {
                    return Ok(());
                }
            }

            Command::StmtPrepare => {
                let query = String::from_utf8_lossy(&data[1..]).to_string();
                drop(data);

                conn.statement_id = conn.statement_id.wrapping_add(1);
                let statement_id = conn.statement_id;
                let params_count = query.matches('?').count() as u16;

                conn.prepare_data.insert(
                    statement_id,
                    PrepareData {
                        statement_id,
                        prepare_stmt: query.clone(),
                        params_count,
                        ..Default::default()
                    },
                );

                let mut bind_vars = BindVars::with_capacity(params_count as usize);
                for i in 0..params_count {
                    bind_vars.insert(bind_var_key(i), Value::from("?"));
                }

                let mut writer = PrepareWriter::new(conn, statement_id, params_count);
                let result = handler.com_prepare(&query, &bind_vars, &mut writer).await;
                let sent = writer.sent;
                let column_names = std::mem::take(&mut writer.column_names);

                let failure = match result {
                    Err(e) => Some(e),
                    Ok(()) if !sent => Some(WireError::server(
                        ER_UNKNOWN_ERROR,
                        SS_UNKNOWN_SQL_STATE,
                        "unexpected: prepare ended without a reply and without error",
                    )),
                    Ok(()) => None,
                };

                if let Some(e) = failure {
                    conn.write_error_packet_from_error(&e).await?;
                    conn.prepare_data.remove(&statement_id);
                    continue;
                }

                if let Some(prep) = conn.prepare_data.get_mut(&statement_id) {
                    prep.column_names = column_names;
                }
            }

            Command::StmtExecute => {
                let query_start = Instant::now();

                let mut buf = data.clone();
                buf.advance(1);
                if buf.remaining() < 9 {
                    conn.write_error_packet(
                        ER_UNKNOWN_COM_ERROR,
                        SS_UNKNOWN_COM_ERROR,
                        "malformed statement execute packet",
                    )
                    .await?;
                    continue;
                }
                let statement_id = buf.get_u32_le();
                let _cursor_flags = buf.get_u8();
                let _iteration_count = buf.get_u32_le();
                drop(data);

                let parsed = match conn.prepare_data.get_mut(&statement_id) {
                    None => Err(WireError::server(
                        CR_COMMANDS_OUT_OF_SYNC,
                        SS_UNKNOWN_COM_ERROR,
                        format!("statement id {} not found", statement_id),
                    )),
                    Some(prep) => parse_stmt_execute_params(prep, buf).map(|()| {
                        (
                            prep.prepare_stmt.clone(),
                            prep.bind_vars.clone(),
                            prep.column_names.clone(),
                        )
                    }),
                };

                match parsed {
                    Err(e) => {
                        if let Some(prep) = conn.prepare_data.get_mut(&statement_id) {
                            prep.bind_vars.clear();
                        }
                        conn.write_error_packet_from_error(&e).await?;
                        continue;
                    }
                    Ok((query, bind_vars, column_names)) => {
                        let ok =
                            run_query(conn, handler, &query, bind_vars, true, column_names).await?;

                        // Long-data chunks are one-shot.
                        if let Some(prep) = conn.prepare_data.get_mut(&statement_id) {
                            prep.bind_vars.clear();
                        }

                        if ok {
                            metrics().query_timing.observe(query_start.elapsed());
                        } else {
                            return Ok(());
                        }
                    }
                }
            }

            Command::StmtSendLongData => {
                // No reply is defined for this command; every failure
                // terminates the connection silently.
                let mut buf = data.clone();
                buf.advance(1);
                if buf.remaining() < 6 {
                    error!(
                        "connection {}: malformed statement long data packet",
                        conn.connection_id
                    );
                    return Ok(());
                }
                let statement_id = buf.get_u32_le();
                let param_id = buf.get_u16_le();
                let chunk = buf;

                if chunk.len() > MAX_PACKET_SIZE {
                    error!(
                        "connection {}: long data chunk of {} bytes exceeds the maximum packet size",
                        conn.connection_id,
                        chunk.len()
                    );
                    return Ok(());
                }

                let Some(prep) = conn.prepare_data.get_mut(&statement_id) else {
                    error!(
                        "connection {}: long data for unknown statement id {}",
                        conn.connection_id, statement_id
                    );
                    return Ok(());
                };

                if prep.params_count == 0 || param_id >= prep.params_count {
                    error!(
                        "connection {}: long data for invalid parameter {} of statement {:?}",
                        conn.connection_id, param_id, prep.prepare_stmt
                    );
                    return Ok(());
                }

                let key = bind_var_key(param_id);
                match prep.bind_vars.get_mut(&key) {
                    Some(Value::Bytes(existing)) => {
                        existing.extend_from_slice(&chunk);
                        if existing.len() > MAX_PACKET_SIZE {
                            error!(
                                "connection {}: accumulated long data of {} bytes exceeds the maximum packet size",
                                conn.connection_id,
                                existing.len()
                            );
                            return Ok(());
                        }
                    }
                    _ => {
                        prep.bind_vars.insert(key, Value::Bytes(chunk.to_vec()));
                    }
                }
            }

            Command::StmtClose => {
                // No reply, even for unknown ids.
                let mut buf = data.clone();
                buf.advance(1);
                if buf.remaining() >= 4 {
                    let statement_id = buf.get_u32_le();
                    conn.prepare_data.remove(&statement_id);
                }
            }

            Command::StmtReset => {
                let mut buf = data.clone();
                buf.advance(1);
                if buf.remaining() >= 4 {
                    let statement_id = buf.get_u32_le();
                    if let Some(prep) = conn.prepare_data.get_mut(&statement_id) {
                        prep.bind_vars.clear();
                        conn.write_ok_packet(0, 0).await?;
                    } else {
                        conn.write_error_packet(
                            CR_COMMANDS_OUT_OF_SYNC,
                            SS_UNKNOWN_COM_ERROR,
                            "commands were executed in an improper order",
                        )
                        .await?;
                    }
                } else {
                    conn.write_error_packet(
                        ER_UNKNOWN_COM_ERROR,
                        SS_UNKNOWN_COM_ERROR,
                        "malformed statement reset packet",
                    )
                    .await?;
                }
            }

            Command::SetOption => {
                if data.len() == 3 {
                    let operation = u16::from_le_bytes([data[1], data[2]]);
                    match operation {
                        0 => {
                            conn.capabilities |= CLIENT_MULTI_STATEMENTS;
                            conn.write_end_result().await?;
                        }
                        1 => {
                            conn.capabilities &= !CLIENT_MULTI_STATEMENTS;
                            conn.write_end_result().await?;
                        }
                        other => {
                            warn!(
                                "connection {}: unknown set option operation {}",
                                conn.connection_id, other
                            );
                            conn.write_error_packet(
                                ER_UNKNOWN_COM_ERROR,
                                SS_UNKNOWN_COM_ERROR,
                                "unknown set option operation",
                            )
                            .await?;
                        }
                    }
                } else {
                    conn.write_error_packet(
                        ER_UNKNOWN_COM_ERROR,
                        SS_UNKNOWN_COM_ERROR,
                        "malformed set option packet",
                    )
                    .await?;
                }
            }

            Command::Unknown(byte) => {
                warn!(
                    "connection {}: unsupported command {:#04x}",
                    conn.connection_id, byte
                );
                conn.write_error_packet(
                    ER_UNKNOWN_COM_ERROR,
                    SS_UNKNOWN_COM_ERROR,
                    &format!("command handling not implemented: {:#04x}", byte),
                )
                .await?;
            }
        }
    }
}

/// Drive one query through the handler and apply the streaming failure
/// policy. Returns `Ok(false)` when the connection must close because
/// the stream broke mid-flight.
async fn run_query(
    conn: &mut Conn,
    handler: &dyn Handler,
    query: &str,
    bind_vars: BindVars,
    binary: bool,
    column_names: Vec<String>,
) -> Result<bool> {
    let mut writer = ResultWriter::new(conn, binary, column_names);
    let result = handler.com_query(query, &bind_vars, &mut writer).await;
    let fields_sent = writer.fields_sent;
    let rows_sent = writer.rows_sent;
    let finished = writer.finished;

    if !fields_sent {
        // Nothing went out yet, so an ERR packet is still legal.
        let err = match result {
            Err(e) => e,
            Ok(()) => WireError::server(
                ER_UNKNOWN_ERROR,
                SS_UNKNOWN_SQL_STATE,
                "unexpected: query ended without results and without error",
            ),
        };
        conn.write_error_packet_from_error(&err).await?;
        return Ok(true);
    }

    if let Err(e) = result {
        if !rows_sent {
            // Field metadata is out but the row stream has not
            // started; clients still accept an ERR terminator here.
            conn.write_error_packet_from_error(&e).await?;
            return Ok(true);
        }
        // Mid-row-stream there is no legal ERR framing left. Abort so
        // the client sees the connection drop.
        error!(
            "connection {}: error in the middle of a result stream: {}",
            conn.connection_id, e
        );
        return Ok(false);
    }

    if !finished {
        conn.write_end_result().await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ColumnType;

    #[test]
    fn test_parse_stmt_execute_new_params() {
        let mut prep = PrepareData {
            statement_id: 1,
            prepare_stmt: "SELECT ? + ?".to_string(),
            params_count: 2,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        buf.put_u8(0); // NULL bitmap
        buf.put_u8(1); // new params bound
        buf.put_u8(ColumnType::LongLong as u8);
        buf.put_u8(0);
        buf.put_u8(ColumnType::LongLong as u8);
        buf.put_u8(0);
        buf.put_u64_le(3);
        buf.put_u64_le(4);

        parse_stmt_execute_params(&mut prep, buf.freeze()).unwrap();
        assert_eq!(prep.bind_vars["v1"], Value::Int(3));
        assert_eq!(prep.bind_vars["v2"], Value::Int(4));
        assert_eq!(prep.params_type.len(), 2);
    }

    #[test]
    fn test_parse_stmt_execute_null_bitmap() {
        let mut prep = PrepareData {
            params_count: 2,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        buf.put_u8(0b0000_0001); // first param NULL
        buf.put_u8(1);
        buf.put_u8(ColumnType::Null as u8);
        buf.put_u8(0);
        buf.put_u8(ColumnType::VarString as u8);
        buf.put_u8(0);
        buf.put_u8(2);
        buf.put_slice(b"hi");

        parse_stmt_execute_params(&mut prep, buf.freeze()).unwrap();
        assert_eq!(prep.bind_vars["v1"], Value::Null);
        assert_eq!(prep.bind_vars["v2"], Value::from("hi"));
    }

    #[test]
    fn test_parse_stmt_execute_reuses_long_data() {
        let mut prep = PrepareData {
            params_count: 1,
            ..Default::default()
        };
        prep.bind_vars
            .insert("v1".to_string(), Value::Bytes(b"Hello World".to_vec()));
        prep.params_type = vec![(ColumnType::LongBlob as u8, false)];

        let mut buf = BytesMut::new();
        buf.put_u8(0); // NULL bitmap
        buf.put_u8(0); // reuse previous bindings

        parse_stmt_execute_params(&mut prep, buf.freeze()).unwrap();
        assert_eq!(prep.bind_vars["v1"], Value::Bytes(b"Hello World".to_vec()));
    }

    #[test]
    fn test_parse_stmt_execute_reuse_without_types_fails() {
        let mut prep = PrepareData {
            params_count: 1,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(0); // reuse, but no types were ever bound

        assert!(parse_stmt_execute_params(&mut prep, buf.freeze()).is_err());
    }
}
