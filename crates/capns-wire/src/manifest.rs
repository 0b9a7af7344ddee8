//! The plugin manifest: the structured document a plugin advertises during
//! the handshake, describing the capabilities it serves.
//!
//! The manifest travels as the HELLO payload (JSON bytes) and, aggregated,
//! as RELAY_NOTIFY meta. The CLI surface also derives its command list and
//! per-command argument help from it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::Bytes;
use capns_urn::CapUrn;
use serde::{Deserialize, Serialize};

/// Where a CLI invocation sources one argument from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSource {
    /// A named flag: `--name <value>`.
    Flag(String),
    /// A positional argument by index.
    Positional(u32),
    /// The process's standard input.
    Stdin,
}

impl fmt::Display for ArgSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgSource::Flag(name) => write!(f, "--{name}"),
            ArgSource::Positional(index) => write!(f, "positional {index}"),
            ArgSource::Stdin => write!(f, "stdin"),
        }
    }
}

/// One declared argument of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDecl {
    /// Declared media URN of the argument value.
    pub media_urn: CapUrn,
    #[serde(default)]
    pub required: bool,
    /// Accepted sources, in preference order.
    pub sources: Vec<ArgSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg_description: Option<String>,
}

/// The declared output of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDecl {
    pub media_urn: CapUrn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One capability declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapDecl {
    /// Canonical cap URN.
    pub urn: CapUrn,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// CLI command name.
    pub command: String,
    #[serde(default)]
    pub args: Vec<ArgDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputDecl>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Manifest validation / parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    EmptyName,
    /// Two caps share a canonical URN.
    DuplicateCap(String),
    /// Two caps share a CLI command name.
    DuplicateCommand(String),
    /// Not valid JSON, or JSON of the wrong shape.
    Json(String),
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::EmptyName => write!(f, "manifest name cannot be empty"),
            ManifestError::DuplicateCap(urn) => write!(f, "duplicate cap urn {urn:?}"),
            ManifestError::DuplicateCommand(cmd) => write!(f, "duplicate command {cmd:?}"),
            ManifestError::Json(msg) => write!(f, "manifest json: {msg}"),
        }
    }
}

impl std::error::Error for ManifestError {}

/// A plugin's declared capability set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub caps: Vec<CapDecl>,
}

impl Manifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Manifest {
            name: name.into(),
            version: version.into(),
            description: None,
            caps: Vec::new(),
        }
    }

    /// Check structural invariants: non-empty name, unique cap URNs,
    /// unique command names.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty() {
            return Err(ManifestError::EmptyName);
        }
        let mut seen_urns = BTreeSet::new();
        let mut seen_commands = BTreeSet::new();
        for cap in &self.caps {
            let canonical = cap.urn.to_string();
            if !seen_urns.insert(canonical.clone()) {
                return Err(ManifestError::DuplicateCap(canonical));
            }
            if !seen_commands.insert(cap.command.clone()) {
                return Err(ManifestError::DuplicateCommand(cap.command.clone()));
            }
        }
        Ok(())
    }

    /// Find the declaration whose URN equals `urn` canonically.
    pub fn find_cap(&self, urn: &CapUrn) -> Option<&CapDecl> {
        self.caps.iter().find(|cap| &cap.urn == urn)
    }

    /// Find the declaration for a CLI command.
    pub fn find_command(&self, command: &str) -> Option<&CapDecl> {
        self.caps.iter().find(|cap| cap.command == command)
    }

    /// JSON wire form.
    pub fn to_bytes(&self) -> Result<Bytes, ManifestError> {
        let vec =
            serde_json::to_vec(self).map_err(|e| ManifestError::Json(e.to_string()))?;
        Ok(Bytes::from(vec))
    }

    /// Parse and validate the JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Json(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Union of several manifests' caps, deduplicated by canonical URN
    /// (first occurrence wins). Used by the host to advertise the fabric's
    /// aggregate capability set.
    pub fn aggregate<'a>(
        name: impl Into<String>,
        manifests: impl IntoIterator<Item = &'a Manifest>,
    ) -> Manifest {
        let mut out = Manifest::new(name, "0");
        let mut seen = BTreeSet::new();
        for manifest in manifests {
            for cap in &manifest.caps {
                if seen.insert(cap.urn.to_string()) {
                    out.caps.push(cap.clone());
                }
            }
        }
        out
    }
}
