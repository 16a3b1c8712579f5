//! Authentication on both sides of the proxy.
//!
//! Outbound, [`Credentials`] and [`AuthChallenge`] describe how the proxy
//! authenticates against an upstream registry, including the bearer token
//! flow of the OCI Distribution Specification. Inbound, [`Identity`] is the
//! already-authenticated caller of a request, used to decide whether a push
//! into a proxy project is allowed.

use crate::error::{DepotError, Result};
use serde::Deserialize;

#[cfg(test)]
mod tests;

/// Credentials for upstream registry authentication.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Credentials {
    /// No authentication required (anonymous access)
    #[default]
    Anonymous,

    /// HTTP Basic authentication with username and password
    Basic { username: String, password: String },

    /// A pre-issued bearer token
    Bearer { token: String },
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::Anonymous
    }

    /// Creates Basic authentication credentials.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::auth::Credentials;
    ///
    /// let creds = Credentials::basic("username", "password");
    /// assert!(creds.to_header_value().unwrap().starts_with("Basic "));
    /// ```
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Returns the Authorization header value for these credentials.
    pub fn to_header_value(&self) -> Option<String> {
        match self {
            Self::Anonymous => None,
            Self::Basic { username, password } => {
                use base64::{Engine as _, engine::general_purpose};
                let credentials = format!("{}:{}", username, password);
                let encoded = general_purpose::STANDARD.encode(credentials);
                Some(format!("Basic {}", encoded))
            }
            Self::Bearer { token } => Some(format!("Bearer {}", token)),
        }
    }
}

/// Information parsed from a WWW-Authenticate header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// The authentication scheme (e.g., "Bearer")
    pub scheme: String,
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parses a WWW-Authenticate header value.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::auth::AuthChallenge;
    ///
    /// let header = r#"Bearer realm="https://auth.example.com/token",service="registry""#;
    /// let challenge = AuthChallenge::parse(header).unwrap();
    /// assert_eq!(challenge.scheme, "Bearer");
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();

        let (scheme, params) = header
            .split_once(' ')
            .ok_or_else(|| DepotError::validation("Invalid WWW-Authenticate header format"))?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for (key, value) in split_params(params) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        let realm = realm.ok_or_else(|| {
            DepotError::validation("WWW-Authenticate header missing required 'realm' parameter")
        })?;

        Ok(Self {
            scheme: scheme.to_string(),
            realm,
            service,
            scope,
        })
    }

    pub fn is_bearer(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("bearer")
    }

    /// Query parameters for the token endpoint. `fallback_scope` is used when
    /// the challenge did not name one.
    pub fn token_query(&self, fallback_scope: &str) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(service) = &self.service {
            query.push(("service", service.clone()));
        }
        let scope = self.scope.as_deref().unwrap_or(fallback_scope);
        if !scope.is_empty() {
            query.push(("scope", scope.to_string()));
        }
        query
    }
}

/// Splits `k="v",k2="v,2"` honoring quotes, since scopes may contain commas.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in params.chars().chain(std::iter::once(',')) {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if let Some((key, value)) = current.split_once('=') {
                    pairs.push((
                        key.trim().to_string(),
                        value.trim().trim_matches('"').to_string(),
                    ));
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    pairs
}

/// Body returned by a registry token endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Result<String> {
        self.token
            .or(self.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DepotError::authentication("Token endpoint returned no token", None))
    }
}

/// The authenticated caller of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    User {
        name: String,
    },
    /// A robot account, named `robot$<project>+<suffix>`.
    Robot {
        name: String,
    },
    /// The proxy cache's own service session, scoped to one repository.
    ProxyService {
        repository: String,
    },
}

impl Identity {
    const ROBOT_PREFIX: &'static str = "robot$";
    const SCANNER: &'static str = "scanner";

    pub fn user(name: impl Into<String>) -> Self {
        Self::User { name: name.into() }
    }

    pub fn robot(name: impl Into<String>) -> Self {
        Self::Robot { name: name.into() }
    }

    pub fn proxy_service(repository: impl Into<String>) -> Self {
        Self::ProxyService {
            repository: repository.into(),
        }
    }

    /// Display name used in logs and events.
    pub fn name(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::User { name } | Self::Robot { name } => name,
            Self::ProxyService { .. } => "proxy-cache-service",
        }
    }

    /// Returns true if this caller may write into proxy project `project`.
    ///
    /// That is the proxy service itself working on a repository of the
    /// project, or one of the project's scanner robots.
    ///
    /// # Examples
    ///
    /// ```
    /// use libdepot::auth::Identity;
    ///
    /// assert!(Identity::proxy_service("library/hello").is_proxy_session("library"));
    /// assert!(Identity::robot("robot$library+scanner-1").is_proxy_session("library"));
    /// assert!(!Identity::robot("robot$library+ci").is_proxy_session("library"));
    /// ```
    pub fn is_proxy_session(&self, project: &str) -> bool {
        match self {
            Self::ProxyService { repository } => repository
                .split('/')
                .next()
                .is_some_and(|first| first == project),
            Self::Robot { name } => name
                .strip_prefix(Self::ROBOT_PREFIX)
                .and_then(|rest| rest.strip_prefix(project))
                .and_then(|rest| rest.strip_prefix('+'))
                .is_some_and(|suffix| suffix.starts_with(Self::SCANNER)),
            Self::Anonymous | Self::User { .. } => false,
        }
    }
}
