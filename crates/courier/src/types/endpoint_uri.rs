use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of an endpoint, e.g. `local://orders` or `rabbitmq://queue/invoices`.
///
/// Used for the `destination` and `received_at` envelope columns. The value is
/// compared as an opaque string; [`EndpointUri::parse`] only checks the shape.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointUri(String);

impl EndpointUri {
    /// Wrap a value already known to be a URI (e.g. read back from storage).
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// Parse and validate `scheme://rest`.
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let (_, rest) = split_scheme(uri)?;
        if rest.is_empty() {
            return Err(UriError {
                value: uri.to_string(),
                reason: "missing location after scheme",
            });
        }
        Ok(Self(uri.to_string()))
    }

    pub fn scheme(&self) -> &str {
        self.0.split("://").next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EndpointUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A string that does not have the expected `scheme://...` shape.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid uri '{value}': {reason}")]
pub struct UriError {
    pub value: String,
    pub reason: &'static str,
}

pub(crate) fn split_scheme(uri: &str) -> Result<(&str, &str), UriError> {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Err(UriError {
            value: uri.to_string(),
            reason: "missing '://'",
        });
    };
    let valid_scheme = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+' || c == '.');
    if !valid_scheme {
        return Err(UriError {
            value: uri.to_string(),
            reason: "invalid scheme",
        });
    }
    Ok((scheme, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_scheme_and_location() {
        let uri = EndpointUri::parse("local://orders").unwrap();
        assert_eq!(uri.scheme(), "local");
        assert_eq!(uri.as_str(), "local://orders");
    }

    #[test]
    fn parse_rejects_missing_scheme() {
        let err = EndpointUri::parse("orders").unwrap_err();
        assert!(err.to_string().contains("missing '://'"), "got: {err}");
        assert!(EndpointUri::parse("://orders").is_err());
        assert!(EndpointUri::parse("local://").is_err());
    }
}
