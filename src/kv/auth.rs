//! SASL authentication for the KV session handshake: mechanism negotiation
//! plus the SCRAM-SHA1, CRAM-MD5, and PLAIN client sides. Mirrors the shape
//! of the HELLO negotiation it runs alongside -- client proposes, server
//! picks, client drives a short stateful exchange to completion.

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::error::{Error, ErrorKind, Result};

/// Credentials for one KV session. Threaded from `AgentGroup`/`Agent`
/// construction down to `KvSession::connect`; never parsed out of a
/// connection string, which has no such field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    ScramSha1,
    CramMd5,
    Plain,
}

impl SaslMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::ScramSha1 => "SCRAM-SHA1",
            SaslMechanism::CramMd5 => "CRAM-MD5",
            SaslMechanism::Plain => "PLAIN",
        }
    }
}

/// Picks the strongest mechanism both sides support, from the
/// space-separated list `SASL_LIST_MECHS` returns.
pub fn choose_mechanism(server_mechs: &str) -> Option<SaslMechanism> {
    let offered: Vec<&str> = server_mechs.split_whitespace().collect();
    for candidate in [SaslMechanism::ScramSha1, SaslMechanism::CramMd5, SaslMechanism::Plain] {
        if offered.iter().any(|m| m.eq_ignore_ascii_case(candidate.name())) {
            return Some(candidate);
        }
    }
    None
}

pub fn plain_response(credentials: &Credentials) -> Vec<u8> {
    let mut out = Vec::with_capacity(credentials.username.len() + credentials.password.len() + 2);
    out.push(0);
    out.extend_from_slice(credentials.username.as_bytes());
    out.push(0);
    out.extend_from_slice(credentials.password.as_bytes());
    out
}

pub fn cram_md5_response(credentials: &Credentials, challenge: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Md5>::new_from_slice(credentials.password.as_bytes())
        .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?;
    mac.update(challenge);
    let digest = mac.finalize().into_bytes();
    Ok(format!("{} {}", credentials.username, hex::encode(digest)).into_bytes())
}

/// Escapes `,` and `=` the way RFC 5802 requires in a SCRAM username: `=`
/// first, then `,`, so an already-escaped `=3D`/`=2C` is never re-escaped.
fn scram_escape(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    data_encoding::BASE64.encode(&bytes)
}

fn parse_server_first(message: &str) -> Result<(String, Vec<u8>, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;
    for field in message.split(',') {
        let Some((key, value)) = field.split_once('=') else { continue };
        match key {
            "r" => nonce = Some(value.to_string()),
            "s" => {
                salt = Some(
                    data_encoding::BASE64
                        .decode(value.as_bytes())
                        .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?,
                )
            }
            "i" => {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| Error::new(ErrorKind::HandshakeFailure, "malformed SCRAM iteration count"))?,
                )
            }
            _ => {}
        }
    }
    match (nonce, salt, iterations) {
        (Some(nonce), Some(salt), Some(iterations)) => Ok((nonce, salt, iterations)),
        _ => Err(Error::new(ErrorKind::HandshakeFailure, "server-first-message missing r/s/i")),
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Drives one SCRAM-SHA1 exchange client-side. `client_first`/`client_final`
/// are sent as `SASL_AUTH`/`SASL_STEP` request values; `verify_final`
/// checks the server's closing `v=` signature against the expected one.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
}

impl ScramClient {
    pub fn new(credentials: &Credentials) -> Self {
        let client_nonce = random_nonce();
        let client_first_bare = format!("n={},r={}", scram_escape(&credentials.username), client_nonce);
        ScramClient {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            client_nonce,
            client_first_bare,
        }
    }

    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consumes the server-first-message and produces the client-final
    /// message plus the server signature this client expects back.
    pub fn client_final_message(&self, server_first: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| Error::new(ErrorKind::HandshakeFailure, "server-first-message is not UTF-8"))?;
        let (combined_nonce, salt, iterations) = parse_server_first(server_first)?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(Error::new(ErrorKind::HandshakeFailure, "server nonce does not extend client nonce"));
        }

        let mut salted_password = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(self.password.as_bytes(), &salt, iterations, &mut salted_password);

        let client_key = hmac_sha1(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);
        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, client_final_without_proof);
        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        let server_key = hmac_sha1(&salted_password, b"Server Key");
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes());

        let client_final = format!("{client_final_without_proof},p={}", data_encoding::BASE64.encode(&client_proof));
        Ok((client_final.into_bytes(), server_signature))
    }

    pub fn verify_server_final(expected_signature: &[u8], server_final: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| Error::new(ErrorKind::HandshakeFailure, "server-final-message is not UTF-8"))?;
        let signature = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::new(ErrorKind::HandshakeFailure, "server-final-message missing v="))?;
        let decoded = data_encoding::BASE64
            .decode(signature.as_bytes())
            .map_err(|e| Error::new(ErrorKind::HandshakeFailure, e.to_string()))?;
        if decoded != expected_signature {
            return Err(Error::new(ErrorKind::AuthenticationFailure, "server signature mismatch"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chooses_scram_over_cram_and_plain() {
        let mech = choose_mechanism("PLAIN CRAM-MD5 SCRAM-SHA1").unwrap();
        assert_eq!(mech, SaslMechanism::ScramSha1);
    }

    #[test]
    fn falls_back_to_cram_md5_when_scram_is_not_offered() {
        let mech = choose_mechanism("PLAIN CRAM-MD5").unwrap();
        assert_eq!(mech, SaslMechanism::CramMd5);
    }

    #[test]
    fn falls_back_to_plain_when_nothing_else_is_offered() {
        let mech = choose_mechanism("PLAIN").unwrap();
        assert_eq!(mech, SaslMechanism::Plain);
    }

    #[test]
    fn no_known_mechanism_offered_returns_none() {
        assert!(choose_mechanism("GSSAPI").is_none());
    }

    #[test]
    fn scram_escape_handles_equals_before_comma() {
        assert_eq!(scram_escape("a=b,c"), "a=3Db=2Cc");
    }

    #[test]
    fn plain_response_is_nul_separated_triple() {
        let creds = Credentials::new("Administrator", "password");
        let resp = plain_response(&creds);
        assert_eq!(resp, b"\0Administrator\0password");
    }

    #[test]
    fn client_first_message_carries_the_escaped_username_and_nonce() {
        let creds = Credentials::new("a=b,c", "pw");
        let client = ScramClient::new(&creds);
        let msg = String::from_utf8(client.client_first_message()).unwrap();
        assert!(msg.starts_with("n,,n=a=3Db=2Cc,r="));
    }

    #[test]
    fn full_scram_exchange_round_trips_against_a_reference_server_computation() {
        let creds = Credentials::new("user", "pencil");
        let client = ScramClient::new(&creds);

        // Simulate a server extending the client nonce and choosing salt/iterations.
        let server_nonce_suffix = "serverpart";
        let combined_nonce = format!("{}{}", client.client_nonce, server_nonce_suffix);
        let salt = b"salt-bytes".to_vec();
        let iterations = 4096u32;
        let server_first = format!(
            "r={combined_nonce},s={},i={iterations}",
            data_encoding::BASE64.encode(&salt)
        );

        let (client_final, expected_server_sig) = client.client_final_message(server_first.as_bytes()).unwrap();
        assert!(String::from_utf8(client_final).unwrap().contains(&format!("r={combined_nonce}")));

        // An independently computed server signature must match what the
        // client expects, proving both sides derive the same key material.
        let mut salted_password = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(b"pencil", &salt, iterations, &mut salted_password);
        let server_key = hmac_sha1(&salted_password, b"Server Key");
        let auth_message = format!("{},{},c=biws,r={combined_nonce}", client.client_first_bare, server_first);
        let server_signature = hmac_sha1(&server_key, auth_message.as_bytes());
        assert_eq!(server_signature, expected_server_sig);

        let server_final = format!("v={}", data_encoding::BASE64.encode(&server_signature));
        ScramClient::verify_server_final(&expected_server_sig, server_final.as_bytes()).unwrap();
    }

    #[test]
    fn rejects_a_server_nonce_that_does_not_extend_the_client_nonce() {
        let creds = Credentials::new("user", "pencil");
        let client = ScramClient::new(&creds);
        let server_first = "r=totally-different,s=c2FsdA==,i=1";
        assert!(client.client_final_message(server_first.as_bytes()).is_err());
    }
}
