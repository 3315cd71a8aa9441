//! Device-ID extraction
//!
//! A device ID is an opaque per-device token that associates a query with a
//! subscription.  It travels in one of two places:
//!
//! - the TLS SNI for DoT, DoQ, and DoH: `dev42.d.example.com` matched
//!   against the configured wildcard `*.d.example.com` yields `dev42`;
//! - the DoH URL path: `/dns-query/dev42` or `/resolve/dev42`.
//!
//! Wildcard matching is strict about depth: the server name must be an
//! immediate subdomain of the wildcard suffix, so `a.b.d.example.com` does
//! not match `*.d.example.com`.
//!
//! Extraction failures are never fatal to a query.  They are typed with
//! their source (`tls server name` or `http url`), handed to the error
//! collector, and the query proceeds without a device ID.

use std::fmt;

use thiserror::Error;

use crate::config::Protocol;
use crate::server::https::{PATH_DOH, PATH_JSON};

/// Maximum length of a device ID in bytes
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Where a bad device ID was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIdSource {
    /// The TLS SNI sent in the client hello
    TlsServerName,
    /// The path of the DoH request URL
    HttpUrl,
}

impl fmt::Display for DeviceIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TlsServerName => f.write_str("tls server name"),
            Self::HttpUrl => f.write_str("http url"),
        }
    }
}

impl std::error::Error for DeviceIdSource {}

/// Error about a bad device ID or a bad device-ID carrier
///
/// Carries the source tag so the collector can distinguish SNI problems
/// from URL problems.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{source} device id check: {reason}")]
pub struct DeviceIdError {
    /// Where the bad ID was found
    pub source: DeviceIdSource,
    /// What was wrong with it
    pub reason: String,
}

impl DeviceIdError {
    /// Create a new device-ID error
    pub fn new(source: DeviceIdSource, reason: impl Into<String>) -> Self {
        Self {
            source,
            reason: reason.into(),
        }
    }
}

/// A validated device ID
///
/// The accepted grammar is 1 to [`MAX_DEVICE_ID_LEN`] ASCII alphanumerics
/// or hyphens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Validate and construct a device ID
    ///
    /// # Errors
    ///
    /// Returns the offending rule as a string when `s` is empty, too long,
    /// or contains a character outside the grammar.
    pub fn new(s: &str) -> Result<Self, String> {
        if s.is_empty() {
            return Err("device id is empty".into());
        }

        if s.len() > MAX_DEVICE_ID_LEN {
            return Err(format!(
                "device id is too long: {} bytes (max {})",
                s.len(),
                MAX_DEVICE_ID_LEN
            ));
        }

        if let Some(bad) = s.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return Err(format!("bad character {bad:?} in device id"));
        }

        Ok(Self(s.to_owned()))
    }

    /// Get the device ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check whether `name` is an immediate subdomain of `domain`
///
/// `dev1.d.example.com` is an immediate subdomain of `d.example.com`;
/// `a.dev1.d.example.com` and `d.example.com` itself are not.
#[must_use]
pub fn is_immediate_subdomain(name: &str, domain: &str) -> bool {
    if name.len() <= domain.len() + 1 || !name.ends_with(domain) {
        return false;
    }

    let label = &name[..name.len() - domain.len() - 1];
    name.as_bytes()[label.len()] == b'.' && !label.is_empty() && !label.contains('.')
}

/// Extract a device ID from the server name sent by a TLS client
///
/// `wildcards` are `*.<domain>` patterns; the prefix is assumed validated
/// by configuration parsing.  An empty server name (request made on a bare
/// IP) and a name matching no wildcard both yield `Ok(None)`.
///
/// # Errors
///
/// Returns a [`DeviceIdError`] tagged `tls server name` when a wildcard
/// matches but the first label is not a valid device ID.
pub fn device_id_from_server_name(
    cli_srv_name: &str,
    wildcards: &[String],
) -> Result<Option<DeviceId>, DeviceIdError> {
    if cli_srv_name.is_empty() {
        return Ok(None);
    }

    let matched = wildcards
        .iter()
        .map(|w| w.trim_start_matches("*."))
        .find(|domain| is_immediate_subdomain(cli_srv_name, domain));

    let Some(domain) = matched else {
        return Ok(None);
    };

    tracing::debug!(domain, server_name = cli_srv_name, "device id wildcard matched");

    let id_str = &cli_srv_name[..cli_srv_name.len() - domain.len() - 1];
    DeviceId::new(id_str)
        .map(Some)
        .map_err(|reason| DeviceIdError::new(DeviceIdSource::TlsServerName, reason))
}

/// Lexically clean a URL path
///
/// Collapses repeated slashes, resolves `.` and `..` segments, and strips
/// any trailing slash, always returning a rooted path.
#[must_use]
pub fn clean_path(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            _ => out.push(part),
        }
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    for part in &out {
        cleaned.push('/');
        cleaned.push_str(part);
    }

    if cleaned.is_empty() {
        cleaned.push('/');
    }

    cleaned
}

/// Extract a device ID from the path of a DoH request URL
///
/// The accepted shapes are `/dns-query`, `/dns-query/<id>`, and the same
/// for `/resolve`.  One segment means no device ID; two segments carry the
/// ID; anything deeper is an error.
///
/// # Errors
///
/// Returns a [`DeviceIdError`] tagged `http url` for unknown roots, extra
/// path segments, and invalid IDs.
pub fn device_id_from_doh_path(orig_path: &str) -> Result<Option<DeviceId>, DeviceIdError> {
    let cleaned = clean_path(orig_path);
    let parts: Vec<&str> = cleaned.trim_start_matches('/').split('/').collect();

    // The historical path check matches on suffix, so "query" and
    // "ns-query" are accepted as roots too.  Compatibility requires it.
    if parts[0].is_empty()
        || !PATH_DOH.ends_with(parts[0]) && !PATH_JSON.ends_with(parts[0])
    {
        return Err(DeviceIdError::new(
            DeviceIdSource::HttpUrl,
            format!("bad path {orig_path:?}"),
        ));
    }

    match parts.len() {
        1 => Ok(None),
        2 => DeviceId::new(parts[1])
            .map(Some)
            .map_err(|reason| DeviceIdError::new(DeviceIdSource::HttpUrl, reason)),
        _ => Err(DeviceIdError::new(
            DeviceIdSource::HttpUrl,
            format!("bad path {orig_path:?}: extra parts"),
        )),
    }
}

/// Extract the device ID for a query, trying the sources the transport
/// provides
///
/// For DoH the URL path is consulted first and takes precedence when it
/// produces an ID; the SNI is the fallback.  For DoT and DoQ only the SNI
/// is consulted.  Plain transports never carry a device ID.  SNI matching
/// is skipped entirely when no wildcards are configured.
///
/// # Errors
///
/// Any error has the underlying [`DeviceIdError`] type and is non-fatal
/// for the pipeline.
pub fn extract_device_id(
    proto: Protocol,
    url_path: Option<&str>,
    tls_server_name: Option<&str>,
    wildcards: &[String],
) -> Result<Option<DeviceId>, DeviceIdError> {
    if proto == Protocol::Https {
        if let Some(path) = url_path {
            if let Some(id) = device_id_from_doh_path(path)? {
                return Ok(Some(id));
            }
        }
        // Go on and check the server name as well.
    } else if proto != Protocol::Tls && proto != Protocol::Quic {
        return Ok(None);
    }

    if wildcards.is_empty() {
        return Ok(None);
    }

    device_id_from_server_name(tls_server_name.unwrap_or(""), wildcards)
}
