/// Credentials for the upstream SOCKS5 server.
///
/// These authenticate this gateway against the upstream circuit; the local
/// HTTP side is deliberately unauthenticated.
#[derive(Debug, Clone)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}
