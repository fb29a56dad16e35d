//! HTTP Digest access authentication (RFC 7616, with RFC 2069 fallback when
//! the server offers no `qop`).
//!
//! The exchange has exactly two rounds: the request first goes out without
//! credentials, and only a `401` carrying a usable `Digest` challenge leads to
//! a single authenticated retry.

use md5::Md5;
use regex::Regex;
use reqwest::Method;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::LazyLock;
use zeroize::Zeroizing;

use crate::gateway::executor::RemoteResponse;

const NONCE_COUNT: &str = "00000001";

static AUTH_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z][A-Za-z0-9_-]*)\s*=\s*(?:"((?:[^"\\]|\\.)*)"|([^\s,]+))"#)
        .expect("valid auth-param regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn parse(token: Option<&str>) -> Option<Self> {
        match token.map(|t| t.to_ascii_uppercase()).as_deref() {
            None | Some("MD5") => Some(DigestAlgorithm::Md5),
            Some("MD5-SESS") => Some(DigestAlgorithm::Md5Sess),
            Some("SHA-256") => Some(DigestAlgorithm::Sha256),
            Some("SHA-256-SESS") => Some(DigestAlgorithm::Sha256Sess),
            Some(_) => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                hex::encode(Md5::digest(input.as_bytes()))
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(Sha256::digest(input.as_bytes()))
            }
        }
    }
}

/// Server-issued parameters needed to answer a digest challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// `Some("auth")` when the server offered it, `None` for legacy digest.
    pub qop: Option<String>,
    pub algorithm: DigestAlgorithm,
}

impl DigestChallenge {
    /// Parses the `Digest` challenge out of a `WWW-Authenticate` value.
    /// Returns `None` when there is no digest challenge or it uses an
    /// algorithm or qop this client does not implement.
    pub fn parse(header: &str) -> Option<Self> {
        let params_text = &header[digest_params_start(header)?..];

        let mut params: HashMap<String, String> = HashMap::new();
        for caps in AUTH_PARAM.captures_iter(params_text) {
            let key = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .map(|m| unescape(m.as_str()))
                .or_else(|| caps.get(3).map(|m| m.as_str().to_string()))
                .unwrap_or_default();
            params.entry(key).or_insert(value);
        }

        let nonce = params.remove("nonce")?;
        let algorithm = match DigestAlgorithm::parse(params.get("algorithm").map(String::as_str)) {
            Some(algorithm) => algorithm,
            None => {
                tracing::warn!("Unsupported digest algorithm: {:?}", params.get("algorithm"));
                return None;
            }
        };
        let qop = match params.get("qop") {
            None => None,
            Some(offered) => {
                if offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    Some("auth".to_string())
                } else {
                    tracing::warn!("Unsupported digest qop: {}", offered);
                    return None;
                }
            }
        };

        Some(Self {
            realm: params.remove("realm").unwrap_or_default(),
            nonce,
            opaque: params.remove("opaque"),
            qop,
            algorithm,
        })
    }

    /// Builds the `Authorization` header value for one request.
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &Method,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let response = self.response_hash(username, password, method, uri, cnonce);

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}, response=\"{}\"",
            quote(username),
            quote(&self.realm),
            quote(&self.nonce),
            quote(uri),
            self.algorithm.name(),
            response
        );
        if let Some(qop) = &self.qop {
            header.push_str(&format!(
                ", qop={}, nc={}, cnonce=\"{}\"",
                qop,
                NONCE_COUNT,
                quote(cnonce)
            ));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", quote(opaque)));
        }
        header
    }

    pub fn response_hash(
        &self,
        username: &str,
        password: &str,
        method: &Method,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let algorithm = self.algorithm;
        let credentials = Zeroizing::new(format!("{}:{}:{}", username, self.realm, password));
        let mut ha1 = algorithm.hash(&credentials);
        if algorithm.is_session() {
            ha1 = algorithm.hash(&format!("{}:{}:{}", ha1, self.nonce, cnonce));
        }
        let ha2 = algorithm.hash(&format!("{}:{}", method.as_str(), uri));

        match &self.qop {
            Some(qop) => algorithm.hash(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, NONCE_COUNT, cnonce, qop, ha2
            )),
            None => algorithm.hash(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
        }
    }
}

/// Result of the unauthenticated first round.
#[derive(Debug)]
pub enum FirstRound {
    /// No usable challenge: the first response is the answer.
    Final(RemoteResponse),
    /// The server challenged; one authenticated retry follows.
    Challenged(DigestChallenge),
}

impl FirstRound {
    pub fn classify(response: RemoteResponse) -> Self {
        if response.status_code != 401 {
            return FirstRound::Final(response);
        }
        match response
            .header("www-authenticate")
            .and_then(DigestChallenge::parse)
        {
            Some(challenge) => FirstRound::Challenged(challenge),
            None => FirstRound::Final(response),
        }
    }
}

/// Byte offset just past the `Digest` scheme token. Quoted strings are
/// skipped, and the token must begin the header or follow a comma or space.
fn digest_params_start(header: &str) -> Option<usize> {
    const SCHEME: &[u8] = b"digest";
    let bytes = header.as_bytes();
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quotes = false;
            }
            continue;
        }
        if b == b'"' {
            in_quotes = true;
            continue;
        }

        let token_start = i == 0 || matches!(bytes[i - 1], b' ' | b'\t' | b',');
        let end = i + SCHEME.len();
        if token_start
            && end < bytes.len()
            && bytes[i..end].eq_ignore_ascii_case(SCHEME)
            && matches!(bytes[end], b' ' | b'\t')
        {
            return Some(end);
        }
    }
    None
}

pub fn new_cnonce() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
