//! Authentication: plugin selection, the mysql_native_password
//! scheme, and an in-memory credential store.
//!
//! All password comparisons use constant-time operations.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::error::{Result, WireError};
use crate::protocol::{ER_ACCESS_DENIED_ERROR, SS_ACCESS_DENIED};

/// The auth method we start every handshake with.
pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
/// Clear-text plugin; only allowed over TLS unless explicitly enabled.
pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
/// PAM-style dialog plugin.
pub const MYSQL_DIALOG: &str = "dialog";

/// Identity attached to a connection after successful authentication.
pub trait UserData: Send + Sync {
    fn username(&self) -> &str;

    fn groups(&self) -> &[String] {
        &[]
    }
}

/// The plain username/groups identity used by [`StaticAuthServer`].
#[derive(Debug, Clone)]
pub struct StaticUserData {
    pub username: String,
    pub groups: Vec<String>,
}

impl UserData for StaticUserData {
    fn username(&self) -> &str {
        &self.username
    }

    fn groups(&self) -> &[String] {
        &self.groups
    }
}

/// Raw packet access handed to [`AuthServer::negotiate`] so a plugin
/// can run as many round trips as it needs.
#[async_trait]
pub trait PacketChannel: Send {
    async fn read_packet(&mut self) -> Result<Bytes>;
    async fn write_packet(&mut self, payload: &[u8]) -> Result<()>;
}

/// The credential store consulted during the handshake. Shared across
/// all connections; implementations must be thread-safe.
#[async_trait]
pub trait AuthServer: Send + Sync {
    /// The auth method this server wants to use for `user`.
    fn auth_method(&self, user: &str) -> Result<String>;

    /// The 20-byte per-connection salt sent in the greeting.
    fn salt(&self) -> Result<[u8; 20]> {
        Ok(new_salt())
    }

    /// Validate a mysql_native_password proof against the salt.
    async fn validate_hash(
        &self,
        salt: &[u8],
        user: &str,
        auth_response: &[u8],
        remote_addr: &str,
    ) -> Result<Box<dyn UserData>>;

    /// Drive any other auth plugin after the switch request has been
    /// sent. May read and write packets directly.
    async fn negotiate(
        &self,
        channel: &mut dyn PacketChannel,
        user: &str,
        remote_addr: &str,
    ) -> Result<Box<dyn UserData>>;
}

/// A fresh 20-byte salt. Kept NUL-free (and `$`-free) so it survives
/// clients that treat it as a C string.
pub fn new_salt() -> [u8; 20] {
    let mut salt = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    for byte in salt.iter_mut() {
        *byte &= 0x7f;
        if *byte == 0 || *byte == b'$' {
            *byte += 1;
        }
    }
    salt
}

/// The scramble a client sends for mysql_native_password:
/// `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`.
/// An empty password scrambles to an empty response.
pub fn scramble_native_password(salt: &[u8], password: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stage2);
    let mask = hasher.finalize();

    stage1
        .iter()
        .zip(mask.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// The stored form of a native password: `SHA1(SHA1(password))`.
pub fn hash_native_password(password: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    hasher.finalize().into()
}

/// Parse the `*HEX` form mysql stores in `mysql.user`.
pub fn parse_native_password_hash(stored: &str) -> Option<[u8; 20]> {
    let hex_part = stored.strip_prefix('*')?;
    let bytes = hex::decode(hex_part).ok()?;
    bytes.try_into().ok()
}

/// Verify a client scramble against a stored `SHA1(SHA1(password))`
/// hash, without knowing the password itself.
pub fn verify_hashed_native_password(
    auth_response: &[u8],
    salt: &[u8],
    stored_hash: &[u8; 20],
) -> bool {
    if auth_response.len() != 20 {
        return false;
    }

    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(stored_hash);
    let mask = hasher.finalize();

    // Recover SHA1(password), hash it once more, and compare with the
    // stored second-stage hash.
    let stage1: Vec<u8> = auth_response
        .iter()
        .zip(mask.iter())
        .map(|(a, b)| a ^ b)
        .collect();

    let mut hasher = Sha1::new();
    hasher.update(&stage1);
    let candidate: [u8; 20] = hasher.finalize().into();

    candidate.ct_eq(stored_hash).into()
}

/// The switch-request payload for the dialog plugin: a single
/// ask-password prompt frame.
pub fn dialog_switch_data() -> Vec<u8> {
    let mut data = Vec::with_capacity(12);
    data.push(0x04);
    data.extend_from_slice(b"Password: ");
    data.push(0);
    data
}

#[derive(Debug, Clone)]
struct StaticEntry {
    password: String,
    hashed_password: Option<[u8; 20]>,
    groups: Vec<String>,
}

/// An in-memory [`AuthServer`] keyed by username. Stores either a
/// plaintext password or a `*HEX` mysql_native_password hash per user.
pub struct StaticAuthServer {
    method: String,
    entries: HashMap<String, StaticEntry>,
}

impl StaticAuthServer {
    pub fn new() -> Self {
        Self {
            method: MYSQL_NATIVE_PASSWORD.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Answer `method` from [`AuthServer::auth_method`] instead of
    /// mysql_native_password.
    pub fn with_method(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            entries: HashMap::new(),
        }
    }

    pub fn add_user(&mut self, user: impl Into<String>, password: impl Into<String>) {
        self.add_user_with_groups(user, password, Vec::new());
    }

    pub fn add_user_with_groups(
        &mut self,
        user: impl Into<String>,
        password: impl Into<String>,
        groups: Vec<String>,
    ) {
        self.entries.insert(
            user.into(),
            StaticEntry {
                password: password.into(),
                hashed_password: None,
                groups,
            },
        );
    }

    /// Register a user by stored `*HEX` hash instead of plaintext.
    pub fn add_hashed_user(
        &mut self,
        user: impl Into<String>,
        stored_hash: &str,
    ) -> Result<()> {
        let hashed = parse_native_password_hash(stored_hash).ok_or_else(|| {
            WireError::Config(format!("invalid mysql_native_password hash {:?}", stored_hash))
        })?;
        self.entries.insert(
            user.into(),
            StaticEntry {
                password: String::new(),
                hashed_password: Some(hashed),
                groups: Vec::new(),
            },
        );
        Ok(())
    }

    fn access_denied(user: &str) -> WireError {
        WireError::server(
            ER_ACCESS_DENIED_ERROR,
            SS_ACCESS_DENIED,
            format!("Access denied for user '{}'", user),
        )
    }

    fn entry(&self, user: &str) -> Result<&StaticEntry> {
        self.entries.get(user).ok_or_else(|| Self::access_denied(user))
    }

    fn user_data(&self, user: &str, entry: &StaticEntry) -> Box<dyn UserData> {
        Box::new(StaticUserData {
            username: user.to_string(),
            groups: entry.groups.clone(),
        })
    }
}

impl Default for StaticAuthServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthServer for StaticAuthServer {
    fn auth_method(&self, _user: &str) -> Result<String> {
        Ok(self.method.clone())
    }

    async fn validate_hash(
        &self,
        salt: &[u8],
        user: &str,
        auth_response: &[u8],
        remote_addr: &str,
    ) -> Result<Box<dyn UserData>> {
        let entry = self.entry(user)?;

        let valid = match &entry.hashed_password {
            Some(stored) => verify_hashed_native_password(auth_response, salt, stored),
            None => {
                let expected = scramble_native_password(salt, &entry.password);
                expected.ct_eq(auth_response).into()
            }
        };

        if !valid {
            tracing::warn!(
                "native password rejected for user '{}' from {}",
                user,
                remote_addr
            );
            return Err(Self::access_denied(user));
        }

        Ok(self.user_data(user, entry))
    }

    async fn negotiate(
        &self,
        channel: &mut dyn PacketChannel,
        user: &str,
        remote_addr: &str,
    ) -> Result<Box<dyn UserData>> {
        // Clear-text exchange: the client answers the switch request
        // with its password, optionally NUL-terminated.
        let packet = channel.read_packet().await?;
        let password = if packet.ends_with(&[0]) {
            &packet[..packet.len() - 1]
        } else {
            &packet[..]
        };

        let entry = self.entry(user)?;
        let valid: bool = entry.password.as_bytes().ct_eq(password).into();
        if !valid {
            tracing::warn!(
                "clear text password rejected for user '{}' from {}",
                user,
                remote_addr
            );
            return Err(Self::access_denied(user));
        }

        Ok(self.user_data(user, entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_salt_shape() {
        let salt = new_salt();
        assert_eq!(salt.len(), 20);
        assert!(salt.iter().all(|&b| b != 0 && b != b'$' && b < 0x81));
        // Two salts should differ.
        assert_ne!(salt, new_salt());
    }

    #[test]
    fn test_scramble_round_trip_against_hash() {
        let salt = new_salt();
        let scramble = scramble_native_password(&salt, "letmein");
        let stored = hash_native_password("letmein");
        assert!(verify_hashed_native_password(&scramble, &salt, &stored));

        let wrong = scramble_native_password(&salt, "other");
        assert!(!verify_hashed_native_password(&wrong, &salt, &stored));
    }

    #[test]
    fn test_empty_password_scramble_is_empty() {
        let salt = new_salt();
        assert!(scramble_native_password(&salt, "").is_empty());
    }

    #[test]
    fn test_parse_native_password_hash() {
        // Well-known hash of "password".
        let stored = "*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19";
        let hash = parse_native_password_hash(stored).unwrap();
        assert_eq!(hash, hash_native_password("password"));

        assert!(parse_native_password_hash("no-star").is_none());
        assert!(parse_native_password_hash("*zz").is_none());
    }

    #[tokio::test]
    async fn test_static_validate_hash() {
        let mut auth = StaticAuthServer::new();
        auth.add_user_with_groups("alice", "secret", vec!["admin".to_string()]);

        let salt = new_salt();
        let response = scramble_native_password(&salt, "secret");
        let user_data = auth
            .validate_hash(&salt, "alice", &response, "127.0.0.1:5")
            .await
            .unwrap();
        assert_eq!(user_data.username(), "alice");
        assert_eq!(user_data.groups(), ["admin".to_string()]);

        let bad = scramble_native_password(&salt, "wrong");
        assert!(auth
            .validate_hash(&salt, "alice", &bad, "127.0.0.1:5")
            .await
            .is_err());
        assert!(auth
            .validate_hash(&salt, "nobody", &response, "127.0.0.1:5")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_static_validate_against_stored_hash() {
        let mut auth = StaticAuthServer::new();
        auth.add_hashed_user("bob", "*2470C0C06DEE42FD1618BB99005ADCA2EC9D1E19")
            .unwrap();

        let salt = new_salt();
        let response = scramble_native_password(&salt, "password");
        assert!(auth
            .validate_hash(&salt, "bob", &response, "127.0.0.1:5")
            .await
            .is_ok());
    }

    #[test]
    fn test_dialog_switch_data() {
        let data = dialog_switch_data();
        assert_eq!(data[0], 0x04);
        assert_eq!(&data[1..11], b"Password: ");
        assert_eq!(*data.last().unwrap(), 0);
    }
}
