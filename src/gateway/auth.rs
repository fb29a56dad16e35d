use base64::Engine;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use zeroize::Zeroizing;

use crate::crypto::{SealedSecret, SecretCipher};
use crate::db::models::{AuthType, EndpointProfile};
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::digest::{new_cnonce, FirstRound};
use crate::gateway::executor::{OutboundRequest, RemoteResponse, Transport};

/// The authentication pathway of one profile, carrying exactly the fields
/// that scheme needs. Secrets stay sealed until a request is decorated.
#[derive(Debug, Clone)]
pub enum AuthScheme {
    None,
    Basic {
        username: String,
        password: SealedSecret,
    },
    Bearer {
        token: SealedSecret,
    },
    ApiKey {
        header: HeaderName,
        key: SealedSecret,
    },
    Digest {
        username: String,
        password: SealedSecret,
    },
}

impl AuthScheme {
    pub fn from_profile(
        profile: &EndpointProfile,
        default_api_key_header: &str,
    ) -> GatewayResult<Self> {
        profile
            .auth_type
            .check_fields(profile.username.as_deref(), profile.secret.is_some())?;

        let username = || profile.username.clone().unwrap_or_default();
        let secret = || {
            profile.secret.clone().ok_or_else(|| {
                GatewayError::Configuration(format!(
                    "{} authentication requires a secret",
                    profile.auth_type.as_str()
                ))
            })
        };

        Ok(match profile.auth_type {
            AuthType::None => AuthScheme::None,
            AuthType::Basic => AuthScheme::Basic {
                username: username(),
                password: secret()?,
            },
            AuthType::Bearer => AuthScheme::Bearer { token: secret()? },
            AuthType::ApiKey => {
                let name = profile
                    .api_key_header
                    .as_deref()
                    .filter(|h| !h.trim().is_empty())
                    .unwrap_or(default_api_key_header);
                let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    GatewayError::Configuration(format!("Invalid API key header '{}'", name))
                })?;
                AuthScheme::ApiKey {
                    header,
                    key: secret()?,
                }
            }
            AuthType::Digest => AuthScheme::Digest {
                username: username(),
                password: secret()?,
            },
        })
    }

    pub fn auth_type(&self) -> AuthType {
        match self {
            AuthScheme::None => AuthType::None,
            AuthScheme::Basic { .. } => AuthType::Basic,
            AuthScheme::Bearer { .. } => AuthType::Bearer,
            AuthScheme::ApiKey { .. } => AuthType::ApiKey,
            AuthScheme::Digest { .. } => AuthType::Digest,
        }
    }
}

/// Attaches authentication to outbound requests and sends them.
pub struct AuthDispatcher<'a> {
    cipher: &'a SecretCipher,
    transport: &'a dyn Transport,
}

impl<'a> AuthDispatcher<'a> {
    pub fn new(cipher: &'a SecretCipher, transport: &'a dyn Transport) -> Self {
        Self { cipher, transport }
    }

    pub async fn dispatch(
        &self,
        scheme: &AuthScheme,
        mut request: OutboundRequest,
    ) -> GatewayResult<RemoteResponse> {
        match scheme {
            AuthScheme::Digest { username, password } => {
                self.digest_exchange(username, password, request).await
            }
            stateless => {
                self.decorate(stateless, &mut request.headers)?;
                self.transport.send(request).await
            }
        }
    }

    /// Sets the auth header for the stateless schemes. Any header of the
    /// same name already present is replaced.
    pub fn decorate(&self, scheme: &AuthScheme, headers: &mut HeaderMap) -> GatewayResult<()> {
        match scheme {
            AuthScheme::None => {}
            AuthScheme::Basic { username, password } => {
                let password = self.cipher.decrypt(password)?;
                let credentials = Zeroizing::new(format!("{}:{}", username, password.as_str()));
                let token = Zeroizing::new(
                    base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes()),
                );
                let value = Zeroizing::new(format!("Basic {}", token.as_str()));
                headers.insert(AUTHORIZATION, sensitive_value(&value)?);
            }
            AuthScheme::Bearer { token } => {
                let token = self.cipher.decrypt(token)?;
                let value = Zeroizing::new(format!("Bearer {}", token.as_str()));
                headers.insert(AUTHORIZATION, sensitive_value(&value)?);
            }
            AuthScheme::ApiKey { header, key } => {
                let key = self.cipher.decrypt(key)?;
                headers.insert(header.clone(), sensitive_value(&key)?);
            }
            AuthScheme::Digest { .. } => {
                return Err(GatewayError::Configuration(
                    "Digest authentication needs a server challenge".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn digest_exchange(
        &self,
        username: &str,
        password: &SealedSecret,
        mut request: OutboundRequest,
    ) -> GatewayResult<RemoteResponse> {
        // Decrypt before any I/O so a corrupted secret never reaches the network.
        let password = self.cipher.decrypt(password)?;
        request.headers.remove(AUTHORIZATION);

        let first = self.transport.send(request.clone()).await?;
        let challenge = match FirstRound::classify(first) {
            FirstRound::Final(response) => return Ok(response),
            FirstRound::Challenged(challenge) => challenge,
        };

        let authorization = challenge.authorization(
            username,
            password.as_str(),
            &request.method,
            &request.request_uri(),
            &new_cnonce(),
        );
        drop(password);
        request
            .headers
            .insert(AUTHORIZATION, sensitive_value(&authorization)?);

        self.transport.send(request).await
    }
}

fn sensitive_value(value: &str) -> GatewayResult<HeaderValue> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        GatewayError::Configuration(
            "Stored credentials contain characters that are not valid in a header".to_string(),
        )
    })?;
    value.set_sensitive(true);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_cipher;
    use crate::gateway::digest::DigestChallenge;
    use crate::gateway::test_support::MockTransport;
    use reqwest::Method;
    use std::time::Duration;

    fn request(path: &str) -> OutboundRequest {
        OutboundRequest {
            method: Method::GET,
            url: format!("http://device.local{}", path),
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_secs(1),
            verify_tls: true,
        }
    }

    fn header(request: &OutboundRequest, name: &str) -> Option<String> {
        request
            .headers
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn bearer_sets_token_verbatim() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        let scheme = AuthScheme::Bearer {
            token: cipher.encrypt("tok123").unwrap(),
        };

        AuthDispatcher::new(&cipher, &transport)
            .dispatch(&scheme, request("/ping"))
            .await
            .unwrap();

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(header(&sent[0], "authorization").as_deref(), Some("Bearer tok123"));
    }

    #[tokio::test]
    async fn basic_encodes_username_and_password() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        let scheme = AuthScheme::Basic {
            username: "svc".to_string(),
            password: cipher.encrypt("p@ss").unwrap(),
        };

        AuthDispatcher::new(&cipher, &transport)
            .dispatch(&scheme, request("/ping"))
            .await
            .unwrap();

        assert_eq!(
            header(&transport.requests()[0], "authorization").as_deref(),
            Some("Basic c3ZjOnBAc3M=")
        );
    }

    #[tokio::test]
    async fn api_key_uses_configured_header() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        let scheme = AuthScheme::ApiKey {
            header: HeaderName::from_static("x-custom-key"),
            key: cipher.encrypt("k-42").unwrap(),
        };

        AuthDispatcher::new(&cipher, &transport)
            .dispatch(&scheme, request("/ping"))
            .await
            .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(header(sent, "x-custom-key").as_deref(), Some("k-42"));
        assert!(sent.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn none_leaves_request_untouched() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        let mut req = request("/ping");
        req.headers.insert("accept", HeaderValue::from_static("text/plain"));

        AuthDispatcher::new(&cipher, &transport)
            .dispatch(&AuthScheme::None, req)
            .await
            .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.headers.len(), 1);
        assert!(sent.headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn auth_header_overrides_existing_authorization() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        let mut req = request("/ping");
        req.headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer forged"));
        let scheme = AuthScheme::Bearer {
            token: cipher.encrypt("real").unwrap(),
        };

        AuthDispatcher::new(&cipher, &transport)
            .dispatch(&scheme, req)
            .await
            .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.headers.get_all(AUTHORIZATION).iter().count(), 1);
        assert_eq!(header(sent, "authorization").as_deref(), Some("Bearer real"));
    }

    #[tokio::test]
    async fn corrupted_secret_fails_before_any_request() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        for scheme in [
            AuthScheme::Bearer {
                token: SealedSecret::from_envelope("tok123"),
            },
            AuthScheme::Digest {
                username: "svc".to_string(),
                password: SealedSecret::from_envelope("00:zz"),
            },
        ] {
            let err = AuthDispatcher::new(&cipher, &transport)
                .dispatch(&scheme, request("/ping"))
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Crypto(_)));
        }
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn digest_answers_challenge_once() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        transport.push_response(
            401,
            &[("www-authenticate", r#"Digest realm="x", nonce="abc", qop="auth""#)],
            "",
        );
        // Even a second 401 must not trigger a third round.
        transport.push_response(
            401,
            &[("www-authenticate", r#"Digest realm="x", nonce="def", qop="auth""#)],
            "",
        );
        let scheme = AuthScheme::Digest {
            username: "svc".to_string(),
            password: cipher.encrypt("p@ss").unwrap(),
        };

        let mut req = request("/ISAPI/System/deviceInfo");
        req.headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller"));
        let response = AuthDispatcher::new(&cipher, &transport)
            .dispatch(&scheme, req)
            .await
            .unwrap();
        assert_eq!(response.status_code, 401);

        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].headers.get(AUTHORIZATION).is_none());

        let authorization = header(&sent[1], "authorization").unwrap();
        assert!(authorization.starts_with("Digest "));
        assert!(authorization.contains(r#"username="svc""#));
        assert!(authorization.contains(r#"nonce="abc""#));
        assert!(authorization.contains(r#"uri="/ISAPI/System/deviceInfo""#));
        assert!(authorization.contains("qop=auth"));
        assert!(authorization.contains("nc=00000001"));

        let cnonce = authorization
            .split("cnonce=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
            .unwrap();
        let challenge =
            DigestChallenge::parse(r#"Digest realm="x", nonce="abc", qop="auth""#).unwrap();
        let expected = challenge.response_hash(
            "svc",
            "p@ss",
            &Method::GET,
            "/ISAPI/System/deviceInfo",
            cnonce,
        );
        assert!(authorization.contains(&format!(r#"response="{}""#, expected)));
    }

    #[tokio::test]
    async fn digest_without_challenge_keeps_first_response() {
        let cipher = test_cipher();
        let transport = MockTransport::new();
        transport.push_response(200, &[], r#"{"ok": true}"#);
        let scheme = AuthScheme::Digest {
            username: "svc".to_string(),
            password: cipher.encrypt("p@ss").unwrap(),
        };

        let response = AuthDispatcher::new(&cipher, &transport)
            .dispatch(&scheme, request("/ping"))
            .await
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body["ok"], true);
        assert_eq!(transport.calls(), 1);
    }
}
