//! URNs and archive member names
//!
//! Every resolvable entity is named by a URN. Members of a volume are
//! stored under a percent-escaped form of their URN relative to the
//! volume's own URN.

use crate::error::{Aff4Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

pub const FILE_SCHEME: &str = "file://";
pub const AFF4_SCHEME: &str = "aff4://";

/// Globally unique name of a resolvable entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    pub fn new(value: impl Into<String>) -> Self {
        Urn(value.into())
    }

    /// A fresh `aff4://<uuid>` URN
    pub fn random() -> Self {
        Urn(format!("{}{}", AFF4_SCHEME, uuid::Uuid::new_v4()))
    }

    /// URN of a local file
    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let text = absolute.to_str().ok_or_else(|| {
            Aff4Error::InvalidParameter(format!("path is not valid UTF-8: {:?}", absolute))
        })?;
        Ok(Urn(format!("{}{}", FILE_SCHEME, text)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> Option<&str> {
        self.0.find("://").map(|idx| &self.0[..idx])
    }

    pub fn is_file(&self) -> bool {
        self.0.starts_with(FILE_SCHEME)
    }

    /// Local path of a `file://` URN
    pub fn to_path(&self) -> Option<std::path::PathBuf> {
        self.0
            .strip_prefix(FILE_SCHEME)
            .map(std::path::PathBuf::from)
    }

    /// Append a path component
    pub fn join(&self, component: &str) -> Urn {
        let base = self.0.trim_end_matches('/');
        let component = component.trim_start_matches('/');
        Urn(format!("{}/{}", base, component))
    }

    /// Path of `self` below `base`, if `self` lives under it
    pub fn relative_to(&self, base: &Urn) -> Option<&str> {
        let base = base.0.trim_end_matches('/');
        self.0
            .strip_prefix(base)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Urn {
    fn from(value: &str) -> Self {
        Urn(value.to_string())
    }
}

impl From<String> for Urn {
    fn from(value: String) -> Self {
        Urn(value)
    }
}

impl AsRef<str> for Urn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'/')
}

/// Percent-escape a name for storage in the archive
pub fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &byte in name.as_bytes() {
        if is_safe(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Reverse [`escape`]
pub fn unescape(name: &str) -> Result<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3).ok_or_else(|| {
                Aff4Error::InvalidArchive(format!("truncated escape in member name {:?}", name))
            })?;
            let byte = u8::from_str_radix(hex, 16).map_err(|_| {
                Aff4Error::InvalidArchive(format!("bad escape %{} in member name", hex))
            })?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| Aff4Error::InvalidArchive(format!("member name {:?} is not UTF-8", name)))
}

/// Archive member name for `member` inside the volume `volume`
pub fn member_name(volume: &Urn, member: &Urn) -> String {
    match member.relative_to(volume) {
        Some(relative) => escape(relative),
        None => escape(member.as_str()),
    }
}

/// URN of an archive member given its stored name
///
/// Archives written by other tools may hold names that are not valid
/// escapes, such as a bare `%`; those are used as they are.
pub fn member_urn(volume: &Urn, name: &str) -> Urn {
    let unescaped = match unescape(name) {
        Ok(unescaped) => unescaped,
        Err(e) => {
            warn!("Using member name {:?} unescaped: {}", name, e);
            name.to_string()
        }
    };
    if unescaped.contains("://") {
        Urn(unescaped)
    } else {
        volume.join(&unescaped)
    }
}
