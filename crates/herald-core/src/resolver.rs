//! Resource resolution: which resource owns a concrete document URI.
//!
//! A URI is split into origin and path segments. Candidates must share the
//! origin (scheme, host and effective port) of one of their addresses, the
//! address base path must prefix the URI path, and the remaining segments
//! must line up one to one with the resource path template.
//!
//! Among matches the most specific template wins: templates are ranked
//! segment by segment with literal segments ahead of wildcards, so the
//! earliest position where two templates differ decides.
//!
//! ```text
//! /users/123/{x}   <- tried first
//! /users/{*}/{x}
//! ```
//!
//! Relative URIs carry no origin and match any address.

use std::fmt;

use percent_encoding::percent_decode_str;

use crate::{
    error::{CoreError, Result},
    models::Resource,
    wildcard,
};

/// Normalized origin of a resource address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
    base: Vec<String>,
}

impl Origin {
    /// Parses an address such as `https://api.example.com/v1`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the address is not an absolute URL with a
    /// host.
    pub fn parse(address: &str) -> Result<Self> {
        let url = url::Url::parse(address)
            .map_err(|e| CoreError::invalid_input(format!("address `{address}`: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| CoreError::invalid_input(format!("address `{address}` has no host")))?;

        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_ascii_lowercase(),
            port: url.port_or_known_default(),
            base: segments(url.path()).map(str::to_string).collect(),
        })
    }

    fn matches(&self, scheme: &str, host: &str, port: Option<u16>) -> bool {
        self.scheme == scheme && self.host == host && self.port == port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        for segment in &self.base {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Parsed document URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteUri {
    origin: Option<(String, String, Option<u16>)>,
    segments: Vec<String>,
}

impl ConcreteUri {
    /// Parses an absolute URI or a bare path.
    pub fn parse(uri: &str) -> Self {
        match url::Url::parse(uri) {
            Ok(url) if url.host_str().is_some() => Self {
                origin: Some((
                    url.scheme().to_string(),
                    url.host_str().unwrap_or_default().to_ascii_lowercase(),
                    url.port_or_known_default(),
                )),
                segments: segments(url.path()).map(str::to_string).collect(),
            },
            _ => {
                let end = uri.find(['?', '#']).unwrap_or(uri.len());
                Self { origin: None, segments: segments(&uri[..end]).map(str::to_string).collect() }
            },
        }
    }

    /// Returns the path segments below the origin's base, if the origin
    /// applies to this URI.
    fn below<'s>(&'s self, origin: &Origin) -> Option<&'s [String]> {
        if let Some((scheme, host, port)) = &self.origin {
            if !origin.matches(scheme, host, *port) {
                return None;
            }
        }
        self.segments.strip_prefix(origin.base.as_slice())
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Picks the most specific resource matching `uri`.
///
/// Candidates keep their input order among equally specific templates.
pub fn resolve<'r, I>(candidates: I, uri: &str) -> Option<&'r Resource>
where
    I: IntoIterator<Item = &'r Resource>,
{
    let concrete = ConcreteUri::parse(uri);
    let mut matches: Vec<(Vec<bool>, &'r Resource)> = Vec::new();

    for resource in candidates {
        let template: Vec<&str> = segments(&resource.path).collect();
        let hit = resource.addresses.iter().filter_map(|a| Origin::parse(a).ok()).any(|origin| {
            concrete.below(&origin).is_some_and(|rest| {
                rest.len() == template.len()
                    && template
                        .iter()
                        .zip(rest)
                        .all(|(t, c)| wildcard::is_wildcard_segment(t) || *t == c.as_str())
            })
        });

        if hit {
            let rank = template.iter().map(|t| wildcard::is_wildcard_segment(t)).collect();
            matches.push((rank, resource));
        }
    }

    matches.sort_by(|a, b| a.0.cmp(&b.0));
    matches.into_iter().next().map(|(_, resource)| resource)
}

/// Path of `uri` relative to the first address of `resource` it sits under.
///
/// This is the string the resource path template is matched against when
/// extracting wildcard values. Segments are percent-decoded unless decoding
/// would produce a `/` or invalid UTF-8, and a trailing slash in the
/// template is mirrored. Returns `None` when no address applies.
pub fn relative_path(resource: &Resource, uri: &str) -> Option<String> {
    let concrete = ConcreteUri::parse(uri);
    let rest = resource
        .addresses
        .iter()
        .filter_map(|a| Origin::parse(a).ok())
        .find_map(|origin| concrete.below(&origin))?;

    let mut path = String::new();
    for segment in rest {
        path.push('/');
        path.push_str(&decode_segment(segment));
    }
    if path.is_empty() || (resource.path.len() > 1 && resource.path.ends_with('/')) {
        path.push('/');
    }
    Some(path)
}

fn decode_segment(segment: &str) -> std::borrow::Cow<'_, str> {
    match percent_decode_str(segment).decode_utf8() {
        Ok(decoded) if !decoded.contains('/') => decoded,
        _ => segment.into(),
    }
}

/// Conflict keys of a resource: one per address, with the path collapsed to
/// its canonical form.
///
/// Two resources conflict when they share any key.
///
/// # Errors
///
/// Returns `InvalidInput` for malformed addresses.
pub fn route_keys(resource: &Resource) -> Result<Vec<String>> {
    let path = wildcard::canonical(&resource.path);
    let path = path.trim_end_matches('/');
    resource
        .addresses
        .iter()
        .map(|address| Origin::parse(address).map(|origin| format!("{origin}{path}")))
        .collect()
}
