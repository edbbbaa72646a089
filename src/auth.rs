//! The nonce/key challenge-response login used to authenticate sockets, and
//! the credential type cached by the client.

use bson::doc;
use md5::{Digest, Md5};

use crate::{
    error::{Error, ErrorKind, Result},
    pool::PooledSocket,
};

/// A cached credential for one authentication source (database).
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Credential {
    /// The database the credential authenticates against.
    pub source: String,

    /// The username.
    pub username: String,

    /// The password.
    pub password: String,
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// The server stores `md5(user:mongo:password)`; the login proves knowledge
/// of it without sending it by keying it with the server's nonce.
fn auth_key(nonce: &str, credential: &Credential) -> String {
    let digest = md5_hex(&format!(
        "{}:mongo:{}",
        credential.username, credential.password
    ));
    md5_hex(&format!("{}{}{}", nonce, credential.username, digest))
}

/// Logs `credential` in on this socket.
pub(crate) async fn authenticate(sock: &mut PooledSocket, credential: &Credential) -> Result<()> {
    let (response, _) = sock.command(&credential.source, &doc! { "getnonce": 1 }).await?;
    let nonce = response
        .get_str("nonce")
        .map_err(|_| {
            Error::new(ErrorKind::InvalidResponse {
                message: "getnonce reply is missing its nonce".to_string(),
            })
        })?
        .to_string();

    let command = doc! {
        "authenticate": 1,
        "user": credential.username.as_str(),
        "nonce": nonce.as_str(),
        "key": auth_key(&nonce, credential),
    };
    sock.command(&credential.source, &command).await?;
    Ok(())
}

/// Logs the given source out on this socket.
pub(crate) async fn logout(sock: &mut PooledSocket, source: &str) -> Result<()> {
    sock.command(source, &doc! { "logout": 1 }).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn auth_key_matches_the_reference_digest() {
        // Worked example: md5("mongo:mongo:pencil") keyed with the nonce.
        let credential = Credential {
            source: "admin".to_string(),
            username: "mongo".to_string(),
            password: "pencil".to_string(),
        };
        let digest = md5_hex("mongo:mongo:pencil");
        let expected = md5_hex(&format!("{}{}{}", "abc123", "mongo", digest));
        assert_eq!(auth_key("abc123", &credential), expected);
        // Hex, lowercase, 128 bits.
        let key = auth_key("abc123", &credential);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
