use chrono::{DateTime, Utc};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::crypto::SealedSecret;
use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    Basic,
    Bearer,
    ApiKey,
    Digest,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::Basic => "basic",
            AuthType::Bearer => "bearer",
            AuthType::ApiKey => "api_key",
            AuthType::Digest => "digest",
        }
    }

    /// Checks that the fields this scheme depends on are present.
    pub fn check_fields(&self, username: Option<&str>, has_secret: bool) -> GatewayResult<()> {
        let has_username = username.is_some_and(|u| !u.trim().is_empty());
        match self {
            AuthType::None => Ok(()),
            AuthType::Basic | AuthType::Digest => {
                if !has_username {
                    return Err(GatewayError::Configuration(format!(
                        "{} authentication requires a username",
                        self.as_str()
                    )));
                }
                if !has_secret {
                    return Err(GatewayError::Configuration(format!(
                        "{} authentication requires a password",
                        self.as_str()
                    )));
                }
                Ok(())
            }
            AuthType::Bearer | AuthType::ApiKey => {
                if !has_secret {
                    return Err(GatewayError::Configuration(format!(
                        "{} authentication requires a token",
                        self.as_str()
                    )));
                }
                Ok(())
            }
        }
    }
}

impl FromStr for AuthType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthType::None),
            "basic" => Ok(AuthType::Basic),
            "bearer" => Ok(AuthType::Bearer),
            "api_key" => Ok(AuthType::ApiKey),
            "digest" => Ok(AuthType::Digest),
            other => Err(GatewayError::Configuration(format!(
                "Unknown auth type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Active,
    Inactive,
    Error,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Active => "active",
            EndpointStatus::Inactive => "inactive",
            EndpointStatus::Error => "error",
        }
    }
}

impl FromStr for EndpointStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EndpointStatus::Active),
            "inactive" => Ok(EndpointStatus::Inactive),
            "error" => Ok(EndpointStatus::Error),
            other => Err(GatewayError::Validation(format!(
                "Unknown endpoint status '{}'",
                other
            ))),
        }
    }
}

/// One remote operation callable through a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedOperation {
    pub name: String,
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AllowedOperation {
    pub fn matches(&self, path: &str, method: &str) -> bool {
        self.path == path && self.method.eq_ignore_ascii_case(method)
    }
}

/// Raw `api_endpoints` row.
#[derive(Debug, Clone, FromRow)]
pub struct EndpointRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    pub auth_type: String,
    pub username: Option<String>,
    pub secret_encrypted: Option<String>,
    pub api_key_header: Option<String>,
    pub custom_headers: String,
    pub allowed_operations: String,
    pub status: String,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_test_result: Option<String>,
    pub timeout_ms: Option<i64>,
    pub verify_tls: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EndpointProfile {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    pub auth_type: AuthType,
    pub username: Option<String>,
    pub secret: Option<SealedSecret>,
    pub api_key_header: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub allowed_operations: Vec<AllowedOperation>,
    pub status: EndpointStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_test_result: Option<String>,
    pub timeout_ms: Option<u64>,
    pub verify_tls: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<EndpointRow> for EndpointProfile {
    type Error = GatewayError;

    fn try_from(row: EndpointRow) -> Result<Self, Self::Error> {
        Ok(Self {
            auth_type: row.auth_type.parse()?,
            status: row.status.parse()?,
            custom_headers: serde_json::from_str(&row.custom_headers)?,
            allowed_operations: serde_json::from_str(&row.allowed_operations)?,
            secret: row.secret_encrypted.map(SealedSecret::from_envelope),
            timeout_ms: row.timeout_ms.and_then(|ms| u64::try_from(ms).ok()),
            id: row.id,
            name: row.name,
            description: row.description,
            base_url: row.base_url,
            username: row.username,
            api_key_header: row.api_key_header,
            last_tested_at: row.last_tested_at,
            last_test_result: row.last_test_result,
            verify_tls: row.verify_tls,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl EndpointProfile {
    pub fn find_operation(&self, path: &str, method: &str) -> Option<&AllowedOperation> {
        self.allowed_operations
            .iter()
            .find(|op| op.matches(path, method))
    }

    pub fn view(&self) -> EndpointView {
        EndpointView {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            base_url: self.base_url.clone(),
            auth_type: self.auth_type,
            username: self.username.clone(),
            has_secret: self.secret.is_some(),
            api_key_header: self.api_key_header.clone(),
            custom_headers: self.custom_headers.clone(),
            allowed_operations: self.allowed_operations.clone(),
            status: self.status,
            last_tested_at: self.last_tested_at,
            last_test_result: self.last_test_result.clone(),
            timeout_ms: self.timeout_ms,
            verify_tls: self.verify_tls,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Outward representation of a profile. Carries no secret material.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointView {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    pub auth_type: AuthType,
    pub username: Option<String>,
    pub has_secret: bool,
    pub api_key_header: Option<String>,
    pub custom_headers: BTreeMap<String, String>,
    pub allowed_operations: Vec<AllowedOperation>,
    pub status: EndpointStatus,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub last_test_result: Option<String>,
    pub timeout_ms: Option<u64>,
    pub verify_tls: bool,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Authentication settings supplied at creation, one variant per scheme.
///
/// Each secret field also accepts the name `secret`, and the API key header
/// accepts `apiKeyHeader`, so a create body can use the same names as the
/// flat fields of [`UpdateEndpoint`].
#[derive(Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthInput {
    #[default]
    None,
    Basic {
        #[serde(default)]
        username: String,
        #[serde(default, alias = "secret")]
        password: String,
    },
    Bearer {
        #[serde(default, alias = "secret")]
        token: String,
    },
    ApiKey {
        #[serde(default, alias = "secret")]
        key: String,
        #[serde(default, alias = "apiKeyHeader")]
        header: Option<String>,
    },
    Digest {
        #[serde(default)]
        username: String,
        #[serde(default, alias = "secret")]
        password: String,
    },
}

impl AuthInput {
    pub fn auth_type(&self) -> AuthType {
        match self {
            AuthInput::None => AuthType::None,
            AuthInput::Basic { .. } => AuthType::Basic,
            AuthInput::Bearer { .. } => AuthType::Bearer,
            AuthInput::ApiKey { .. } => AuthType::ApiKey,
            AuthInput::Digest { .. } => AuthType::Digest,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            AuthInput::Basic { username, .. } | AuthInput::Digest { username, .. } => {
                Some(username.as_str())
            }
            _ => None,
        }
    }

    pub fn secret(&self) -> Option<&str> {
        let secret = match self {
            AuthInput::None => return None,
            AuthInput::Basic { password, .. } | AuthInput::Digest { password, .. } => password,
            AuthInput::Bearer { token } => token,
            AuthInput::ApiKey { key, .. } => key,
        };
        if secret.is_empty() {
            None
        } else {
            Some(secret.as_str())
        }
    }

    pub fn api_key_header(&self) -> Option<&str> {
        match self {
            AuthInput::ApiKey { header, .. } => header.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Debug for AuthInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthInput")
            .field("type", &self.auth_type().as_str())
            .field("username", &self.username())
            .field("has_secret", &self.secret().is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEndpoint {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthInput,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub allowed_operations: Vec<AllowedOperation>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
}

fn default_verify_tls() -> bool {
    true
}

impl CreateEndpoint {
    pub fn validate(&self) -> GatewayResult<()> {
        validate_name(&self.name)?;
        validate_base_url(&self.base_url)?;
        validate_headers(&self.custom_headers)?;
        validate_operations(&self.allowed_operations)?;
        if let Some(header) = self.auth.api_key_header() {
            validate_header_name(header)?;
        }
        self.auth
            .auth_type()
            .check_fields(self.auth.username(), self.auth.secret().is_some())
    }
}

/// Partial update. An outer `None` means the field was not sent; for
/// nullable fields the inner `Option` carries an explicit null.
///
/// Auth fields are flat here (`authType`, `username`, `secret`,
/// `apiKeyHeader`) so one of them can change without restating the scheme.
/// Creation takes the nested `auth` object instead, see [`AuthInput`].
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEndpoint {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub description: Option<Option<String>>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth_type: Option<AuthType>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub username: Option<Option<String>>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub api_key_header: Option<Option<String>>,
    #[serde(default)]
    pub custom_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub allowed_operations: Option<Vec<AllowedOperation>>,
    #[serde(default)]
    pub status: Option<EndpointStatus>,
    #[serde(default, deserialize_with = "deserialize_present")]
    pub timeout_ms: Option<Option<u64>>,
    #[serde(default)]
    pub verify_tls: Option<bool>,
}

impl UpdateEndpoint {
    /// A present but empty secret keeps the stored one.
    pub fn new_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Applies the non-secret fields onto `profile`.
    pub fn apply_to(&self, profile: &mut EndpointProfile) -> GatewayResult<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
            profile.name = name.clone();
        }
        if let Some(description) = &self.description {
            profile.description = description.clone();
        }
        if let Some(base_url) = &self.base_url {
            validate_base_url(base_url)?;
            profile.base_url = base_url.clone();
        }
        if let Some(auth_type) = self.auth_type {
            profile.auth_type = auth_type;
        }
        if let Some(username) = &self.username {
            profile.username = username.clone();
        }
        if let Some(header) = &self.api_key_header {
            if let Some(name) = header {
                validate_header_name(name)?;
            }
            profile.api_key_header = header.clone();
        }
        if let Some(headers) = &self.custom_headers {
            validate_headers(headers)?;
            profile.custom_headers = headers.clone();
        }
        if let Some(operations) = &self.allowed_operations {
            validate_operations(operations)?;
            profile.allowed_operations = normalize_operations(operations);
        }
        if let Some(status) = self.status {
            profile.status = status;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            profile.timeout_ms = timeout_ms;
        }
        if let Some(verify_tls) = self.verify_tls {
            profile.verify_tls = verify_tls;
        }
        Ok(())
    }
}

impl fmt::Debug for UpdateEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateEndpoint")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("auth_type", &self.auth_type)
            .field("secret", &self.new_secret().map(|_| "<redacted>"))
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn normalize_operations(operations: &[AllowedOperation]) -> Vec<AllowedOperation> {
    operations
        .iter()
        .map(|op| AllowedOperation {
            method: op.method.trim().to_ascii_uppercase(),
            ..op.clone()
        })
        .collect()
}

fn validate_name(name: &str) -> GatewayResult<()> {
    if name.trim().is_empty() {
        return Err(GatewayError::Validation("Endpoint name is required".to_string()));
    }
    Ok(())
}

fn validate_base_url(base_url: &str) -> GatewayResult<()> {
    let parsed = url::Url::parse(base_url)
        .map_err(|e| GatewayError::Validation(format!("Invalid base URL '{}': {}", base_url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(GatewayError::Validation(format!(
            "Base URL must use http or https, got '{}'",
            parsed.scheme()
        )));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(GatewayError::Validation(
            "Base URL must not carry a query or fragment".to_string(),
        ));
    }
    Ok(())
}

fn validate_header_name(name: &str) -> GatewayResult<()> {
    HeaderName::from_bytes(name.as_bytes())
        .map(|_| ())
        .map_err(|_| GatewayError::Validation(format!("Invalid header name '{}'", name)))
}

pub fn validate_headers(headers: &BTreeMap<String, String>) -> GatewayResult<()> {
    for (name, value) in headers {
        validate_header_name(name)?;
        HeaderValue::from_str(value).map_err(|_| {
            GatewayError::Validation(format!("Invalid value for header '{}'", name))
        })?;
    }
    Ok(())
}

fn validate_operations(operations: &[AllowedOperation]) -> GatewayResult<()> {
    for op in operations {
        if !op.path.starts_with('/') {
            return Err(GatewayError::Validation(format!(
                "Operation '{}' path must start with '/'",
                op.name
            )));
        }
        Method::from_bytes(op.method.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
            GatewayError::Validation(format!(
                "Operation '{}' has invalid method '{}'",
                op.name, op.method
            ))
        })?;
    }
    Ok(())
}
