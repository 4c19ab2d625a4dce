use std::convert::TryFrom;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// NAME_TOTAL_LENGTH_MAX is the maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// The registry used when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

const OFFICIAL_NAMESPACE: &str = "library";

lazy_static! {
    static ref TAG_REGEX: Regex = Regex::new(r"^[\w][\w.-]{0,127}$").unwrap();
    static ref DIGEST_REGEX: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
            .unwrap();
}

/// Reasons an image reference can fail to parse.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ParseError {
    /// The digest is not `algorithm:hex`
    DigestInvalidFormat,
    /// Repository names are lowercase only
    NameContainsUppercase,
    /// The repository name is empty
    NameEmpty,
    /// The repository name is longer than [`NAME_TOTAL_LENGTH_MAX`]
    NameTooLong,
    /// The tag contains characters outside `[A-Za-z0-9_.-]` or is too long
    TagInvalidFormat,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestInvalidFormat => write!(f, "invalid digest format"),
            ParseError::NameContainsUppercase => write!(f, "repository name must be lowercase"),
            ParseError::NameEmpty => write!(f, "repository name must have at least one component"),
            ParseError::NameTooLong => write!(
                f,
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            ),
            ParseError::TagInvalidFormat => write!(f, "invalid tag format"),
        }
    }
}

impl Error for ParseError {}

/// Reference names an image the engine should start a container from.
///
/// Short Docker Hub names are expanded the same way container CLIs do it: a
/// missing registry becomes `docker.io` and single-component repositories are
/// placed under `library/`.
///
/// # Examples
///
/// ```
/// use container_spec::Reference;
///
/// let reference: Reference = "rancher/k3s:latest".parse().unwrap();
///
/// assert_eq!("docker.io/rancher/k3s:latest", reference.whole().as_str());
/// assert_eq!("docker.io", reference.registry());
/// assert_eq!("rancher/k3s", reference.repository());
/// assert_eq!(Some("latest"), reference.tag());
/// assert_eq!(None, reference.digest());
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// registry returns the name of the registry.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// repository returns the name of the repository.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// whole returns the whole, normalized reference.
    pub fn whole(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(d);
        }
        s
    }
}

// A leading component only names a registry when it looks like a host.
fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let (rest, digest) = match s.rfind('@') {
            Some(i) => (&s[..i], Some(s[i + 1..].to_string())),
            None => (s, None),
        };
        if let Some(d) = &digest {
            if !DIGEST_REGEX.is_match(d) {
                return Err(ParseError::DigestInvalidFormat);
            }
        }

        // A colon after the last slash starts the tag; earlier colons belong
        // to a registry port.
        let last_slash = rest.rfind('/');
        let tag_start = rest
            .rfind(':')
            .filter(|c| last_slash.map(|sl| *c > sl).unwrap_or(true));
        let (name, tag) = match tag_start {
            Some(i) => (&rest[..i], Some(rest[i + 1..].to_string())),
            None => (rest, None),
        };
        if let Some(t) = &tag {
            if !TAG_REGEX.is_match(t) {
                return Err(ParseError::TagInvalidFormat);
            }
        }

        let (registry, repository) = match name.find('/') {
            Some(i) if is_registry_host(&name[..i]) => {
                (name[..i].to_string(), name[i + 1..].to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("{}/{}", OFFICIAL_NAMESPACE, repository)
        } else {
            repository
        };

        if name.is_empty() || repository.ends_with('/') || repository.split('/').any(str::is_empty)
        {
            return Err(ParseError::NameEmpty);
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::NameContainsUppercase);
        }
        if repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }

        Ok(Reference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(string: String) -> Result<Self, Self::Error> {
        TryFrom::try_from(string.as_str())
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.whole()
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.whole())
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Reference::try_from(raw).map_err(serde::de::Error::custom)
    }
}
