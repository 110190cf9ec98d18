//! User agents advertised in `version` messages.
//!
//! Bitcoin Core and most other implementations announce themselves as
//! `/name:version/`, e.g. `/Satoshi:27.0.0/`. The crawler validates custom
//! user agents against that shape before it ever dials a peer.

use std::fmt;

/// Errors that can occur during user agent validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgentError {
    /// Not wrapped in slashes, or not exactly one `name:version` pair.
    InvalidFormat,
    /// The name component is empty.
    MissingName,
    /// The version component is empty.
    MissingVersion,
}

impl fmt::Display for UserAgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserAgentError::InvalidFormat => write!(f, "User agent must look like /name:version/"),
            UserAgentError::MissingName => write!(f, "User agent has an empty name"),
            UserAgentError::MissingVersion => write!(f, "User agent has an empty version"),
        }
    }
}

impl std::error::Error for UserAgentError {}

/// Validates the `/name:version/` user agent format.
///
/// # Example
///
/// ```
/// use nodescan_connection::user_agent::validate_bitcoin_core_format;
///
/// assert!(validate_bitcoin_core_format("/nodescan:0.1.0/").is_ok());
/// assert!(validate_bitcoin_core_format("nodescan:0.1.0").is_err());
/// assert!(validate_bitcoin_core_format("/nodescan/").is_err());
/// ```
pub fn validate_bitcoin_core_format(user_agent: &str) -> Result<(), UserAgentError> {
    let contents = user_agent
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix('/'))
        .ok_or(UserAgentError::InvalidFormat)?;

    let (name, version) = contents
        .split_once(':')
        .ok_or(UserAgentError::InvalidFormat)?;
    if version.contains(':') {
        return Err(UserAgentError::InvalidFormat);
    }

    if name.is_empty() {
        return Err(UserAgentError::MissingName);
    }
    if version.is_empty() {
        return Err(UserAgentError::MissingVersion);
    }

    Ok(())
}

/// A validated user agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserAgent(String);

impl UserAgent {
    /// Validate and wrap a user agent string.
    pub fn new(user_agent: String) -> Result<Self, UserAgentError> {
        validate_bitcoin_core_format(&user_agent)?;
        Ok(UserAgent(user_agent))
    }

    /// Build a user agent from its components.
    ///
    /// ```
    /// use nodescan_connection::UserAgent;
    ///
    /// let agent = UserAgent::from_name_version("nodescan", "0.1.0");
    /// assert_eq!(agent.as_str(), "/nodescan:0.1.0/");
    /// ```
    pub fn from_name_version(name: &str, version: &str) -> Self {
        UserAgent(format!("/{name}:{version}/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
