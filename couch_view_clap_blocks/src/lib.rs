//! Command line and environment configuration for a [`couch_view_client::Client`].

use std::{sync::Arc, time::Duration};

use couch_view_client::{Client, DesignDocument, HttpTransport};

/// Error parsing a `--couch-placeholder` value
#[derive(Debug, thiserror::Error)]
pub enum PlaceholderArgError {
    #[error("invalid placeholder '{0}', expected KEY=VALUE")]
    MissingSeparator(String),

    #[error("invalid placeholder '{0}', the key is empty")]
    EmptyKey(String),
}

/// Connection settings for a view client
#[derive(Clone, clap::Parser)]
pub struct ViewClientConfig {
    /// URL template of the database, e.g. `http://localhost:5984/{database}`
    ///
    /// `{name}` tokens are resolved from `--couch-placeholder` values and per-call options.
    #[clap(long = "couch-url", env = "COUCH_VIEW_URL", action)]
    pub url: String,

    /// Forward `If-None-Match` on view queries and expose response `ETag`s
    ///
    /// Leave this off for servers that reuse a database's `ETag`s after it is deleted and
    /// recreated.
    #[clap(
        long = "couch-trust-view-etags",
        env = "COUCH_VIEW_TRUST_ETAGS",
        default_value = "false",
        action
    )]
    pub trust_view_etags: bool,

    /// Timeout of every request made to the server
    #[clap(
        long = "couch-request-timeout",
        env = "COUCH_VIEW_REQUEST_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub request_timeout: Duration,

    /// Fixed placeholder values as a comma-separated list of KEY=VALUE pairs.
    ///
    /// # Example
    /// ```text
    /// --couch-placeholder "database=people,host=couch-1"
    /// ```
    #[clap(
        long = "couch-placeholder",
        env = "COUCH_VIEW_PLACEHOLDERS",
        value_delimiter = ',',
        value_parser = parse_placeholder,
        action = clap::ArgAction::Append
    )]
    pub placeholders: Vec<(String, String)>,

    /// Bearer token sent with every request
    #[clap(long = "couch-auth-token", env = "COUCH_VIEW_AUTH_TOKEN", action)]
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for ViewClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewClientConfig")
            .field("url", &self.url)
            .field("trust_view_etags", &self.trust_view_etags)
            .field("request_timeout", &self.request_timeout)
            .field("placeholders", &self.placeholders)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ViewClientConfig {
    /// Build a [`Client`] for `design` with these settings
    pub fn build_client(&self, design: DesignDocument) -> Result<Client, couch_view_client::Error> {
        let mut transport = HttpTransport::with_timeout(self.request_timeout)?;
        if let Some(token) = &self.auth_token {
            transport = transport.with_auth_token(token.clone());
        }

        let mut builder = Client::builder(self.url.clone(), design)
            .trust_view_etags(self.trust_view_etags)
            .transport(Arc::new(transport));
        for (name, value) in &self.placeholders {
            builder = builder.placeholder(name.clone(), value.clone());
        }
        builder.build()
    }
}

fn parse_placeholder(s: &str) -> Result<(String, String), PlaceholderArgError> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| PlaceholderArgError::MissingSeparator(s.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(PlaceholderArgError::EmptyKey(s.to_string()));
    }
    Ok((key.to_string(), value.trim().to_string()))
}
