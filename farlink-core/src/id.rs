//! Object identity shared across connected processes.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::{Error, Result};

pub const SEPARATOR_SYMBOL: &str = "/";

/// Identifies a single runtime, the owner of a set of objects.
///
/// Forms the first two segments of every [`ObjectId`]. Two runtimes taking
/// part in the same connection must never share an identifier; the default
/// one is derived from the host name and the process id, tests that keep
/// both endpoints in a single process construct their own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceIdentifier {
    host: String,
    process: u32,
}

impl InstanceIdentifier {
    pub fn new(host: &str, process: u32) -> Self {
        Self {
            host: host.to_string(),
            process,
        }
    }

    /// Identifier of the current process.
    pub fn local() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            host,
            process: std::process::id(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn process(&self) -> u32 {
        self.process
    }
}

impl FromStr for InstanceIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let split = s.split(SEPARATOR_SYMBOL).collect::<Vec<&str>>();
        if split.len() < 2 {
            return Err(Error::Protocol(format!(
                "failed parsing instance identifier from string: {}",
                s
            )));
        }
        let process = split[1]
            .parse()
            .map_err(|_| Error::Protocol(format!("bad process segment in identifier: {}", s)))?;
        Ok(Self {
            host: split[0].to_string(),
            process,
        })
    }
}

impl Display for InstanceIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.host, SEPARATOR_SYMBOL, self.process)
    }
}

/// Globally unique reference to a remoted object.
///
/// Shaped as `"{host}/{process}/{type_full_name}/{hash}"`. Only the first
/// two segments are ever parsed by peers; the rest is carried verbatim.
/// The id is stable for the whole lifetime of the object in its origin
/// process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(owner: &InstanceIdentifier, type_name: &str, hash: u64) -> Self {
        Self(format!(
            "{}{}{}{}{}",
            owner, SEPARATOR_SYMBOL, type_name, SEPARATOR_SYMBOL, hash
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Owning runtime, parsed out of the first two segments.
    pub fn owner(&self) -> Result<InstanceIdentifier> {
        self.0.parse()
    }

    /// Type name segment, if the id carries one.
    pub fn type_name(&self) -> Option<&str> {
        let mut split = self.0.split(SEPARATOR_SYMBOL);
        split.nth(2)
    }

    pub fn is_owned_by(&self, ident: &InstanceIdentifier) -> bool {
        let prefix = format!("{}{}", ident, SEPARATOR_SYMBOL);
        self.0.starts_with(&prefix)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.split(SEPARATOR_SYMBOL).count() < 4 {
            return Err(Error::Protocol(format!(
                "failed parsing object id from string: {}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
