// Copyright 2020 Joyent, Inc.

//! SASL authentication providers.
//!
//! When a provider is configured, every freshly connected socket performs the
//! SASL handshake before it may enter the pool (see
//! [`ops::authenticate`](crate::proto::ops::authenticate)). A failed
//! handshake aborts socket creation entirely.

/// Client side of a SASL mechanism.
pub trait AuthProvider: Send + Sync {
    /// Mechanism name as sent to the server, e.g. `"PLAIN"`.
    fn mechanism(&self) -> &str;

    /// The initial response sent along with the authentication start
    /// request.
    fn start(&self) -> Vec<u8>;

    /// The answer to a server challenge during a continuation step.
    fn step(&self, challenge: &[u8]) -> Vec<u8>;
}

/// The SASL PLAIN mechanism: authzid, authcid and password in a single
/// NUL-separated message.
pub struct PlainAuthProvider {
    username: String,
    password: String,
}

impl PlainAuthProvider {
    pub fn new<S: Into<String>>(username: S, password: S) -> Self {
        PlainAuthProvider {
            username: username.into(),
            password: password.into(),
        }
    }

    fn message(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(self.username.len() + self.password.len() + 2);
        data.push(0);
        data.extend_from_slice(self.username.as_bytes());
        data.push(0);
        data.extend_from_slice(self.password.as_bytes());
        data
    }
}

impl AuthProvider for PlainAuthProvider {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn start(&self) -> Vec<u8> {
        self.message()
    }

    // PLAIN is a single-step mechanism. A server that challenges anyway gets
    // the same credentials again.
    fn step(&self, _challenge: &[u8]) -> Vec<u8> {
        self.message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_layout() {
        let provider = PlainAuthProvider::new("user", "secret");
        assert_eq!(provider.mechanism(), "PLAIN");
        assert_eq!(provider.start(), b"\0user\0secret".to_vec());
        assert_eq!(provider.step(b"challenge"), b"\0user\0secret".to_vec());
    }
}
