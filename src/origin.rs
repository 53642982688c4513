//! # Origin
//!
//! The security principal of a context: scheme, host and (non-default) port.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// A canonical `scheme://host[:port]` origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin(String);

impl Origin {
    /// The origin of a URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL has an opaque origin (e.g. `data:` URLs),
    /// since such a context can never be addressed by origin.
    pub fn of(url: &Url) -> Result<Self> {
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(Error::Validation(format!("{url} has an opaque origin")));
        }
        Ok(Self(origin.ascii_serialization()))
    }

    /// The serialized origin.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Origin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s)?;
        if url.path() != "/" || url.query().is_some() || url.fragment().is_some() {
            return Err(Error::Validation(format!("{s} is a URL, not an origin")));
        }
        Self::of(&url)
    }
}

impl TryFrom<String> for Origin {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
