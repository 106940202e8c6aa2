// SCRAM-SHA-256 authentication (RFC 5802 with SHA-256), run over the wire
// protocol before a connection joins the pool.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, timeout};

use crate::bson::spec::BinarySubtype;
use crate::bson::{Binary, Bson, Document};
use crate::doc;
use crate::error::{Error, Result};
use crate::protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, HEADER_LEN, MessageHeader, RequestIds, decode_reply, encode_op_msg,
};

const SCRAM_MECHANISM: &str = "SCRAM-SHA-256";
const CLIENT_NONCE_LEN: usize = 24;

/// SCRAM-SHA-256 authentication state
pub struct ScramAuth {
    username: String,
    password: String,
    auth_db: String,
    client_nonce: String,
    server_nonce: Option<String>,
    salt: Option<Vec<u8>>,
    iterations: Option<u32>,
    auth_message: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramAuth {
    /// Create a new SCRAM authentication context
    pub fn new(username: String, password: String, auth_db: String) -> Self {
        Self::with_nonce(username, password, auth_db, generate_nonce())
    }

    fn with_nonce(username: String, password: String, auth_db: String, nonce: String) -> Self {
        Self {
            username,
            password,
            auth_db,
            client_nonce: nonce,
            server_nonce: None,
            salt: None,
            iterations: None,
            auth_message: String::new(),
            server_signature: None,
        }
    }

    /// Perform the full SCRAM-SHA-256 conversation on the given stream.
    pub async fn authenticate<S>(
        &mut self,
        stream: &mut S,
        ids: &RequestIds,
        dur: Duration,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Step 1: saslStart with client-first-message
        let client_first = self.build_client_first();
        let sasl_start = self.build_sasl_start(&client_first);
        let msg = encode_op_msg(&sasl_start, 0, ids.next())?;

        timeout(dur, stream.write_all(&msg))
            .await
            .map_err(|_| Error::Timeout("saslStart write".to_string()))??;
        let response = timeout(dur, read_one_reply(stream))
            .await
            .map_err(|_| Error::Timeout("saslStart read".to_string()))??;
        let server_first = sasl_payload(&response, "saslStart")?;
        let conversation_id = response.get_i32("conversationId").unwrap_or(1);

        // Step 2: parse server-first, send client-final
        self.parse_server_first(&server_first)?;
        let client_final = self.build_client_final()?;
        let sasl_continue = self.build_sasl_continue(&client_final, conversation_id);
        let msg = encode_op_msg(&sasl_continue, 0, ids.next())?;

        timeout(dur, stream.write_all(&msg))
            .await
            .map_err(|_| Error::Timeout("saslContinue write".to_string()))??;
        let response = timeout(dur, read_one_reply(stream))
            .await
            .map_err(|_| Error::Timeout("saslContinue read".to_string()))??;
        let server_final = sasl_payload(&response, "saslContinue")?;

        // Step 3: verify the server's signature
        self.verify_server_final(&server_final)?;

        // Some servers need an empty final round before reporting done.
        if !response.get_bool("done").unwrap_or(false) {
            let finish = self.build_sasl_continue("", conversation_id);
            let msg = encode_op_msg(&finish, 0, ids.next())?;
            timeout(dur, stream.write_all(&msg))
                .await
                .map_err(|_| Error::Timeout("saslContinue write".to_string()))??;
            let response = timeout(dur, read_one_reply(stream))
                .await
                .map_err(|_| Error::Timeout("saslContinue read".to_string()))??;
            check_ok(&response, "saslContinue")?;
        }

        tracing::debug!(username = %self.username, auth_db = %self.auth_db,
            "SCRAM-SHA-256 authentication successful");
        Ok(())
    }

    /// Build client-first-message (RFC 5802)
    fn build_client_first(&self) -> String {
        format!("n={},r={}", escape_username(&self.username), self.client_nonce)
    }

    /// Parse server-first-message
    fn parse_server_first(&mut self, server_first: &str) -> Result<()> {
        for part in server_first.split(',') {
            if let Some(rest) = part.strip_prefix("r=") {
                self.server_nonce = Some(rest.to_string());
            } else if let Some(rest) = part.strip_prefix("s=") {
                let salt = BASE64
                    .decode(rest)
                    .map_err(|_| auth_err("invalid base64 salt"))?;
                self.salt = Some(salt);
            } else if let Some(rest) = part.strip_prefix("i=") {
                self.iterations = Some(
                    rest.parse()
                        .map_err(|_| auth_err("invalid iteration count"))?,
                );
            }
        }

        let server_nonce = self
            .server_nonce
            .as_ref()
            .ok_or_else(|| auth_err("missing nonce in server-first"))?;
        if self.salt.is_none() || self.iterations.is_none() {
            return Err(auth_err("missing required fields in server-first"));
        }

        // The server nonce must extend ours, or someone is replaying.
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(auth_err("server nonce does not start with client nonce"));
        }

        // AuthMessage = client-first-bare + "," + server-first + "," +
        // client-final-without-proof
        let client_first_bare = format!(
            "n={},r={}",
            escape_username(&self.username),
            self.client_nonce
        );
        let client_final_without_proof = format!("c=biws,r={}", server_nonce);
        self.auth_message = format!(
            "{},{},{}",
            client_first_bare, server_first, client_final_without_proof
        );

        Ok(())
    }

    /// Build client-final-message with proof
    fn build_client_final(&mut self) -> Result<String> {
        let server_nonce = self
            .server_nonce
            .as_ref()
            .ok_or_else(|| auth_err("client-final before server-first"))?;
        let salt = self
            .salt
            .as_ref()
            .ok_or_else(|| auth_err("client-final before server-first"))?;
        let iterations = self
            .iterations
            .ok_or_else(|| auth_err("client-final before server-first"))?;

        // SaltedPassword = PBKDF2(password, salt, iterations)
        let salted_password = pbkdf2_hmac_sha256(&self.password, salt, iterations);

        // ClientKey = HMAC(SaltedPassword, "Client Key"); StoredKey = H(ClientKey)
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        // ClientSignature = HMAC(StoredKey, AuthMessage)
        let client_signature = hmac_sha256(&stored_key, self.auth_message.as_bytes());

        // ClientProof = ClientKey XOR ClientSignature
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        // ServerSignature = HMAC(HMAC(SaltedPassword, "Server Key"), AuthMessage),
        // kept for verifying the server-final message.
        let server_key = hmac_sha256(&salted_password, b"Server Key");
        self.server_signature = Some(hmac_sha256(&server_key, self.auth_message.as_bytes()));

        Ok(format!(
            "c=biws,r={},p={}",
            server_nonce,
            BASE64.encode(&client_proof)
        ))
    }

    /// Verify server-final-message
    fn verify_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(auth_err(&format!("server returned error: {}", err)));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| auth_err(&format!("expected server verifier, got: {}", server_final)))?;

        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| auth_err("server-final before client-final"))?;
        if BASE64.encode(expected) != verifier {
            return Err(auth_err("server signature mismatch"));
        }
        Ok(())
    }

    /// Build saslStart command
    fn build_sasl_start(&self, client_first: &str) -> Document {
        doc! {
            "saslStart": 1i32,
            "mechanism": SCRAM_MECHANISM,
            "payload": Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: client_first.as_bytes().to_vec(),
            }),
            "options": {"skipEmptyExchange": true},
            "$db": &self.auth_db,
        }
    }

    /// Build saslContinue command
    fn build_sasl_continue(&self, client_final: &str, conversation_id: i32) -> Document {
        doc! {
            "saslContinue": 1i32,
            "conversationId": conversation_id,
            "payload": Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes: client_final.as_bytes().to_vec(),
            }),
            "$db": &self.auth_db,
        }
    }
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn auth_err(message: &str) -> Error {
    Error::AuthenticationFailure(message.to_string())
}

fn check_ok(response: &Document, step: &str) -> Result<()> {
    if response.get_f64("ok").unwrap_or(0.0) != 1.0 {
        let errmsg = response.get_str("errmsg").unwrap_or("authentication failed");
        return Err(auth_err(&format!("{} failed: {}", step, errmsg)));
    }
    Ok(())
}

fn sasl_payload(response: &Document, step: &str) -> Result<String> {
    check_ok(response, step)?;
    let payload = response
        .get_binary_generic("payload")
        .map_err(|_| auth_err(&format!("missing payload in {} response", step)))?;
    Ok(String::from_utf8_lossy(payload).into_owned())
}

/// Generate a random nonce
fn generate_nonce() -> String {
    let mut bytes = vec![0u8; CLIENT_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(&bytes)
}

/// PBKDF2 with HMAC-SHA-256
fn pbkdf2_hmac_sha256(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut result = vec![0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut result);
    result
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SHA-256 hash
fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Read one reply frame and return its command document.
async fn read_one_reply<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Document> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (hdr, _) = MessageHeader::parse(&header)
        .ok_or_else(|| Error::Protocol("failed to parse header".to_string()))?;

    let mut body = vec![0u8; hdr.body_len(DEFAULT_MAX_MESSAGE_SIZE)?];
    stream.read_exact(&mut body).await?;

    let reply = decode_reply(&hdr, &body)?;
    Ok(reply.first_document()?.clone())
}
