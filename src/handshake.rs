//! The connection-establishment packets: the HandshakeV10 greeting,
//! the client's handshake response, and the auth-switch request.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::auth::{AuthServer, MYSQL_NATIVE_PASSWORD};
use crate::connection::Conn;
use crate::error::{Result, WireError};
use crate::protocol::{
    read_lenenc_int, read_null_terminated_string, server_capabilities, write_null_terminated_str,
    AUTH_SWITCH_REQUEST_PACKET, CHARSET_UTF8, CLIENT_CONNECT_WITH_DB, CLIENT_DEPRECATE_EOF,
    CLIENT_FOUND_ROWS, CLIENT_MULTI_STATEMENTS, CLIENT_PLUGIN_AUTH,
    CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA, CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
    CLIENT_SSL, PROTOCOL_VERSION,
};

/// What the client told us during the handshake.
#[derive(Debug)]
pub(crate) struct ClientAuth {
    pub username: String,
    pub auth_method: String,
    pub auth_response: Vec<u8>,
}

/// Outcome of parsing one handshake-response packet.
#[derive(Debug)]
pub(crate) enum ClientHello {
    /// Both sides advertise SSL; the caller must upgrade the stream
    /// and re-read the response on the encrypted channel.
    TlsUpgrade,
    Response(ClientAuth),
}

/// Build and send the server greeting. Returns the salt embedded in
/// it so the auth path can verify the client's proof.
pub(crate) async fn write_handshake_v10(
    conn: &mut Conn,
    server_version: &str,
    auth_server: &dyn AuthServer,
    enable_tls: bool,
) -> Result<[u8; 20]> {
    let mut capabilities = server_capabilities();
    if enable_tls {
        capabilities |= CLIENT_SSL;
    }

    let salt = auth_server.salt()?;

    let mut buf = BytesMut::new();
    buf.put_u8(PROTOCOL_VERSION);
    write_null_terminated_str(&mut buf, server_version);
    buf.put_u32_le(conn.connection_id);

    // First 8 bytes of the salt, then a filler zero.
    buf.put_slice(&salt[..8]);
    buf.put_u8(0);

    buf.put_u16_le((capabilities & 0xffff) as u16);
    buf.put_u8(CHARSET_UTF8);
    buf.put_u16_le(conn.status_flags);
    buf.put_u16_le((capabilities >> 16) as u16);

    // Length of the auth plugin data: 8 + 12 + trailing zero.
    buf.put_u8(21);

    // Reserved.
    buf.put_bytes(0, 10);

    // Remaining 12 salt bytes plus the trailing zero.
    buf.put_slice(&salt[8..20]);
    buf.put_u8(0);

    write_null_terminated_str(&mut buf, MYSQL_NATIVE_PASSWORD);

    conn.write_packet(&buf).await?;
    Ok(salt)
}

/// Parse the client's handshake response.
///
/// On the first read, when both sides advertise SSL, this stops after
/// the fixed header and asks the caller to upgrade; the re-read on the
/// encrypted stream passes `first_time = false` so capabilities
/// already negotiated are not overwritten.
pub(crate) fn parse_client_handshake(
    conn: &mut Conn,
    first_time: bool,
    payload: Bytes,
    tls_available: bool,
) -> Result<ClientHello> {
    let mut buf = payload;

    if buf.remaining() < 32 {
        return Err(WireError::Handshake(
            "handshake response too short".to_string(),
        ));
    }

    let client_flags = buf.get_u32_le();
    if client_flags & CLIENT_PROTOCOL_41 == 0 {
        return Err(WireError::Handshake(
            "only clients supporting protocol 4.1 are supported".to_string(),
        ));
    }

    // Remember the subset of client capabilities the rest of the
    // protocol depends on. The post-TLS re-read must not overwrite
    // what is already negotiated.
    if first_time {
        conn.capabilities |= client_flags & (CLIENT_DEPRECATE_EOF | CLIENT_FOUND_ROWS);
    }
    if client_flags & CLIENT_MULTI_STATEMENTS != 0 {
        conn.capabilities |= CLIENT_MULTI_STATEMENTS;
    }

    // Max packet size: parsed, unused.
    let _max_packet_size = buf.get_u32_le();

    conn.character_set = buf.get_u8();

    // 23 reserved bytes.
    buf.advance(23);

    if first_time && tls_available && client_flags & CLIENT_SSL != 0 {
        return Ok(ClientHello::TlsUpgrade);
    }

    let username = read_null_terminated_string(&mut buf)
        .ok_or_else(|| WireError::Handshake("cannot read username".to_string()))?;

    // The auth response has three encodings, selected by capability.
    let auth_response = if client_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        let len = read_lenenc_int(&mut buf)
            .ok_or_else(|| WireError::Handshake("cannot read auth response length".to_string()))?
            as usize;
        if buf.remaining() < len {
            return Err(WireError::Handshake(
                "cannot read auth response".to_string(),
            ));
        }
        buf.copy_to_bytes(len).to_vec()
    } else if client_flags & CLIENT_SECURE_CONNECTION != 0 {
        if buf.remaining() < 1 {
            return Err(WireError::Handshake(
                "cannot read auth response length".to_string(),
            ));
        }
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(WireError::Handshake(
                "cannot read auth response".to_string(),
            ));
        }
        buf.copy_to_bytes(len).to_vec()
    } else {
        read_null_terminated_string(&mut buf)
            .ok_or_else(|| WireError::Handshake("cannot read auth response".to_string()))?
            .into_bytes()
    };

    if client_flags & CLIENT_CONNECT_WITH_DB != 0 {
        let db = read_null_terminated_string(&mut buf)
            .ok_or_else(|| WireError::Handshake("cannot read database name".to_string()))?;
        conn.schema_name = db;
    }

    let mut auth_method = MYSQL_NATIVE_PASSWORD.to_string();
    if client_flags & CLIENT_PLUGIN_AUTH != 0 {
        if let Some(plugin) = read_null_terminated_string(&mut buf) {
            auth_method = plugin;
        }
    }

    // Some JDBC drivers send an empty plugin name when they mean
    // mysql_native_password.
    if auth_method.is_empty() {
        auth_method = MYSQL_NATIVE_PASSWORD.to_string();
    }

    Ok(ClientHello::Response(ClientAuth {
        username,
        auth_method,
        auth_response,
    }))
}

/// Ask the client to switch auth plugins: `0xfe`, the plugin name,
/// then plugin-specific data.
pub(crate) async fn write_auth_switch_request(
    conn: &mut Conn,
    plugin_name: &str,
    plugin_data: &[u8],
) -> Result<()> {
    let mut buf = BytesMut::new();
    buf.put_u8(AUTH_SWITCH_REQUEST_PACKET);
    write_null_terminated_str(&mut buf, plugin_name);
    buf.put_slice(plugin_data);
    conn.write_packet(&buf).await
}
