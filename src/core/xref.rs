//! Cross references discovered during analysis.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::address::Address;

/// Kind of control transfer an xref stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XRefType {
    /// Entry point supplied by the caller
    UserSpecified,
    ConditionalJump,
    NearJump,
    FarJump,
    NearCall,
    FarCall,
    /// Jump through a table slot
    NearIndexedJump,
}

impl XRefType {
    pub fn as_str(&self) -> &str {
        match self {
            XRefType::UserSpecified => "user",
            XRefType::ConditionalJump => "jcc",
            XRefType::NearJump => "jmp",
            XRefType::FarJump => "jmpf",
            XRefType::NearCall => "call",
            XRefType::FarCall => "callf",
            XRefType::NearIndexedJump => "jmp[]",
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, XRefType::NearCall | XRefType::FarCall)
    }

    pub fn is_jump(&self) -> bool {
        matches!(
            self,
            XRefType::ConditionalJump
                | XRefType::NearJump
                | XRefType::FarJump
                | XRefType::NearIndexedJump
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XRef {
    /// Instruction that makes the reference; `None` for seeded entries
    pub source: Option<Address>,
    /// Referenced address; `None` when it could not be resolved
    pub target: Option<Address>,
    pub kind: XRefType,
    /// Jump-table slot for indexed jumps
    pub data_location: Option<Address>,
}

impl XRef {
    pub fn new(source: Option<Address>, target: Option<Address>, kind: XRefType) -> Self {
        Self {
            source,
            target,
            kind,
            data_location: None,
        }
    }

    /// Unresolved indexed jump that still has to read `slot`.
    pub fn table_probe(source: Address, slot: Address) -> Self {
        Self {
            source: Some(source),
            target: None,
            kind: XRefType::NearIndexedJump,
            data_location: Some(slot),
        }
    }

    pub fn with_data_location(mut self, slot: Address) -> Self {
        self.data_location = Some(slot);
        self
    }

    pub fn is_table_probe(&self) -> bool {
        self.kind == XRefType::NearIndexedJump && self.target.is_none()
    }
}

impl fmt::Display for XRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |a: Option<Address>| a.map_or_else(|| "invalid".to_string(), |a| a.to_string());
        write!(
            f,
            "{} -> {} ({})",
            show(self.source),
            show(self.target),
            self.kind.as_str()
        )?;
        if let Some(slot) = self.data_location {
            write!(f, " via {}", slot)?;
        }
        Ok(())
    }
}

/// All xrefs recorded in a session, indexed by source and target.
#[derive(Debug, Clone, Default)]
pub struct XRefCollection {
    items: Vec<XRef>,
    by_source: BTreeMap<Address, Vec<usize>>,
    by_target: BTreeMap<Address, Vec<usize>>,
}

impl XRefCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, xref: XRef) {
        let index = self.items.len();
        if let Some(source) = xref.source {
            self.by_source.entry(source).or_default().push(index);
        }
        if let Some(target) = xref.target {
            self.by_target.entry(target).or_default().push(index);
        }
        self.items.push(xref);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &XRef> {
        self.items.iter()
    }

    pub fn from_address(&self, source: Address) -> Vec<&XRef> {
        self.lookup(&self.by_source, source)
    }

    pub fn to_address(&self, target: Address) -> Vec<&XRef> {
        self.lookup(&self.by_target, target)
    }

    fn lookup(&self, index: &BTreeMap<Address, Vec<usize>>, key: Address) -> Vec<&XRef> {
        index
            .get(&key)
            .map(|ids| ids.iter().map(|&i| &self.items[i]).collect())
            .unwrap_or_default()
    }

    pub fn of_kind(&self, kind: XRefType) -> impl Iterator<Item = &XRef> {
        self.items.iter().filter(move |x| x.kind == kind)
    }
}
