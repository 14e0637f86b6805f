//! Refs: addressable points in a branch's history.
//!
//! Textual grammar:
//!
//! ```text
//! HEAD                    main branch, current version
//! main | main:<v>         main branch
//! <v> | <s>..<e|HEAD>     main branch at a version / a range
//! ~<n>                    node n, HEAD implied
//! ~<n>:<v> | ~<n>:HEAD    node n at a version
//! ~<n>:<s>..<e|HEAD>      node n, version range
//! <name>[:...]            branch not yet resolved to a node id
//! ```

use crate::error::{EngineError, Result};
use crate::types::{NodeId, MAIN_NODE_ID};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Symbolic HEAD marker.
pub const HEAD: &str = "HEAD";

/// Prefix of branch identifiers that carry a node id.
pub const NODE_ID_PREFIX: char = '~';

/// Branch part of a ref.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum BranchRef {
    Main,
    Node(NodeId),
    /// A branch identifier that still has to be resolved to a node id.
    Named(String),
}

impl BranchRef {
    /// Branch of a node id; node `0` is main.
    pub fn from_node(node_id: NodeId) -> Self {
        if node_id == MAIN_NODE_ID {
            BranchRef::Main
        } else {
            BranchRef::Node(node_id)
        }
    }

    /// Node id of the branch.
    pub fn node_id(&self) -> Result<NodeId> {
        match self {
            BranchRef::Main => Ok(MAIN_NODE_ID),
            BranchRef::Node(id) => Ok(*id),
            BranchRef::Named(name) => Err(EngineError::InvalidArgument(format!(
                "Cannot parse ref that is not resolved to a node ID. Provided branch: {}",
                name
            ))),
        }
    }

    fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(EngineError::InvalidRef("empty branch identifier".into()));
        }
        if s == "main" {
            return Ok(BranchRef::Main);
        }
        if let Some(rest) = s.strip_prefix(NODE_ID_PREFIX) {
            if rest == "main" {
                return Ok(BranchRef::Main);
            }
            return parse_number::<NodeId>(rest)
                .map(BranchRef::from_node)
                .ok_or_else(|| EngineError::InvalidRef(format!("invalid node id: {}", s)));
        }
        let valid = s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid || s.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(EngineError::InvalidRef(format!("invalid branch identifier: {}", s)));
        }
        Ok(BranchRef::Named(s.to_string()))
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchRef::Main => write!(f, "main"),
            BranchRef::Node(id) => write!(f, "{}{}", NODE_ID_PREFIX, id),
            BranchRef::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Version part of a ref.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RefVersion {
    Head,
    At(u64),
    /// Start is exclusive, end inclusive; `end == None` means HEAD.
    Range { start: u64, end: Option<u64> },
}

impl RefVersion {
    fn parse(s: &str) -> Result<Self> {
        if s == HEAD {
            return Ok(RefVersion::Head);
        }
        if let Some((start, end)) = s.split_once("..") {
            let start = parse_number::<u64>(start)
                .ok_or_else(|| EngineError::InvalidRef(format!("invalid range start: {}", s)))?;
            let end = if end == HEAD {
                None
            } else {
                let end = parse_number::<u64>(end)
                    .ok_or_else(|| EngineError::InvalidRef(format!("invalid range end: {}", s)))?;
                if end < start {
                    return Err(EngineError::InvalidRef(format!(
                        "range end is before its start: {}",
                        s
                    )));
                }
                Some(end)
            };
            return Ok(RefVersion::Range { start, end });
        }
        parse_number::<u64>(s)
            .map(RefVersion::At)
            .ok_or_else(|| EngineError::InvalidRef(format!("invalid version: {}", s)))
    }
}

impl fmt::Display for RefVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefVersion::Head => write!(f, "{}", HEAD),
            RefVersion::At(v) => write!(f, "{}", v),
            RefVersion::Range { start, end: Some(end) } => write!(f, "{}..{}", start, end),
            RefVersion::Range { start, end: None } => write!(f, "{}..{}", start, HEAD),
        }
    }
}

/// A branch plus a version, HEAD, or version range. Immutable.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ref {
    branch: BranchRef,
    version: RefVersion,
}

impl Ref {
    pub fn new(branch: BranchRef, version: RefVersion) -> Self {
        Self { branch, version }
    }

    /// HEAD of the main branch.
    pub fn head() -> Self {
        Self::new(BranchRef::Main, RefVersion::Head)
    }

    /// Main branch at a version.
    pub fn main(version: u64) -> Self {
        Self::new(BranchRef::Main, RefVersion::At(version))
    }

    /// HEAD of a node.
    pub fn node_head(node_id: NodeId) -> Self {
        Self::new(BranchRef::from_node(node_id), RefVersion::Head)
    }

    /// A node at a version.
    pub fn node(node_id: NodeId, version: u64) -> Self {
        Self::new(BranchRef::from_node(node_id), RefVersion::At(version))
    }

    /// A version range on a node; `end == None` means HEAD.
    pub fn range(node_id: NodeId, start: u64, end: Option<u64>) -> Self {
        Self::new(BranchRef::from_node(node_id), RefVersion::Range { start, end })
    }

    pub fn branch(&self) -> &BranchRef {
        &self.branch
    }

    pub fn ref_version(&self) -> RefVersion {
        self.version
    }

    /// True for a HEAD ref, i.e. one that still needs resolving.
    pub fn is_head(&self) -> bool {
        self.version == RefVersion::Head
    }

    pub fn is_range(&self) -> bool {
        matches!(self.version, RefVersion::Range { .. })
    }

    /// Concrete version, `None` for HEAD and ranges.
    pub fn version(&self) -> Option<u64> {
        match self.version {
            RefVersion::At(v) => Some(v),
            _ => None,
        }
    }

    /// Concrete version or an invalid-argument error naming the ref.
    pub fn require_version(&self) -> Result<u64> {
        self.version().ok_or_else(|| {
            EngineError::InvalidArgument(format!("Ref {} does not point to a single version", self))
        })
    }

    /// Node id of the ref's branch.
    pub fn node_id(&self) -> Result<NodeId> {
        self.branch.node_id()
    }

    /// Same branch, concrete version.
    pub fn at_version(&self, version: u64) -> Self {
        Self::new(self.branch.clone(), RefVersion::At(version))
    }
}

impl FromStr for Ref {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EngineError::InvalidRef("empty ref".into()));
        }
        if s == HEAD {
            return Ok(Ref::head());
        }
        if let Some((branch, version)) = s.split_once(':') {
            return Ok(Ref::new(BranchRef::parse(branch)?, RefVersion::parse(version)?));
        }
        if s.starts_with(|c: char| c.is_ascii_digit()) {
            return Ok(Ref::new(BranchRef::Main, RefVersion::parse(s)?));
        }
        Ok(Ref::new(BranchRef::parse(s)?, RefVersion::Head))
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            RefVersion::Head => write!(f, "{}", self.branch),
            version => write!(f, "{}:{}", self.branch, version),
        }
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({})", self)
    }
}

impl TryFrom<String> for Ref {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Ref> for String {
    fn from(r: Ref) -> Self {
        r.to_string()
    }
}

/// Strict decimal parse: digits only, no sign, no whitespace.
fn parse_number<T: FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
