use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Registry assumed for references that do not name one, e.g. `nginx:latest`.
pub const DEFAULT_REGISTRY: &str = "docker.io";
/// Namespace prepended to single-segment repositories on the default registry.
pub const DEFAULT_NAMESPACE: &str = "library";

const NAME_TOTAL_LENGTH_MAX: usize = 255;

static PATH_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("path component pattern")
});

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*|\[[a-fA-F0-9:]+\])(?::[0-9]+)?$",
    )
    .expect("domain pattern")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("tag pattern"));

static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
        .expect("digest pattern")
});

/// A container image reference split into its canonical parts.
///
/// `tag` and `digest` are kept exactly as written; no implicit `latest` is ever added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingRepository(String),
    MultipleDigests(String),
    InvalidDigest(String),
    InvalidTag(String),
    InvalidRegistry(String),
    EmptyPathSegment(String),
    InvalidPathComponent(String),
    NameTooLong(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::MissingRepository(image) => {
                write!(f, "repository is missing in image {}", image)
            }
            ParseError::MultipleDigests(image) => {
                write!(f, "image {} contains more than one digest marker", image)
            }
            ParseError::InvalidDigest(digest) => write!(f, "invalid digest: {}", digest),
            ParseError::InvalidTag(tag) => write!(f, "invalid tag: {}", tag),
            ParseError::InvalidRegistry(registry) => write!(f, "invalid registry: {}", registry),
            ParseError::EmptyPathSegment(image) => {
                write!(f, "image {} contains an empty path segment", image)
            }
            ParseError::InvalidPathComponent(component) => {
                write!(f, "invalid repository path component: {}", component)
            }
            ParseError::NameTooLong(image) => write!(
                f,
                "image name {} exceeds {} characters",
                image, NAME_TOTAL_LENGTH_MAX
            ),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let (name_and_tag, digest) = match s.split_once('@') {
            Some((_, rest)) if rest.contains('@') => {
                return Err(ParseError::MultipleDigests(s.to_string()));
            }
            Some((name, digest)) => {
                if !DIGEST.is_match(digest) {
                    return Err(ParseError::InvalidDigest(digest.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A tag is a colon after the last slash, otherwise the colon belongs to a registry port
        let last_slash = name_and_tag.rfind('/');
        let (name, tag) = match name_and_tag.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&name_and_tag[..pos], Some(&name_and_tag[pos + 1..]))
            }
            _ => (name_and_tag, None),
        };
        if let Some(tag) = tag {
            if !TAG.is_match(tag) {
                return Err(ParseError::InvalidTag(tag.to_string()));
            }
        }
        if name.is_empty() {
            return Err(ParseError::MissingRepository(s.to_string()));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest)) if is_registry_host(host) => (host.to_string(), rest.to_string()),
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                DEFAULT_REGISTRY.to_string(),
                format!("{}/{}", DEFAULT_NAMESPACE, name),
            ),
        };

        if !DOMAIN.is_match(&registry) {
            return Err(ParseError::InvalidRegistry(registry));
        }
        for component in repository.split('/') {
            if component.is_empty() {
                return Err(ParseError::EmptyPathSegment(s.to_string()));
            }
            if !PATH_COMPONENT.is_match(component) {
                return Err(ParseError::InvalidPathComponent(component.to_string()));
            }
        }
        if registry.len() + 1 + repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong(s.to_string()));
        }

        Ok(Self {
            registry,
            repository,
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// Same reference served from another registry host.
    pub fn with_registry(&self, registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            ..self.clone()
        }
    }
}

/// Decides whether the first path segment of a reference names a registry.
///
/// Known limitation: a first segment containing a dot is always a host, so a
/// Docker Hub namespace such as `my.org/app` is read as registry `my.org`.
fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}
