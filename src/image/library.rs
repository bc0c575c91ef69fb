//! Multi-segment image built from OMF object modules.
//!
//! Every SEGDEF of every module becomes one [`Segment`] with a dense global
//! index, which doubles as the segment number of logical addresses. Groups,
//! externals and symbols keep the module they came from. Externals resolve
//! through a link-time name table: module-local symbols first for local
//! externals, then the global public table, where the first definition of a
//! name wins.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::address::{Address, Location, Referent, SymbolicTarget};
use crate::core::segment::Segment;
use crate::error::{Result, ScathaError};
use crate::image::Image;

/// One object module (THEADR .. MODEND).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    /// Global segment indices, in SEGDEF order
    pub segments: Vec<usize>,
    /// Global group indices, in GRPDEF order
    pub groups: Vec<usize>,
    /// Global external indices, in EXTDEF/COMDEF order
    pub externals: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub module: usize,
    pub segments: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct External {
    pub name: String,
    pub module: usize,
    /// Declared by LEXTDEF or a local COMDEF
    pub local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub module: usize,
    pub address: Address,
    /// Defined by LPUBDEF
    pub local: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryImage {
    segments: Vec<Segment>,
    modules: Vec<Module>,
    groups: Vec<Group>,
    externals: Vec<External>,
    symbols: Vec<Symbol>,
    publics: HashMap<String, Address>,
}

impl LibraryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&mut self, name: impl Into<String>) -> usize {
        self.modules.push(Module {
            name: name.into(),
            ..Module::default()
        });
        self.modules.len() - 1
    }

    fn module_mut(&mut self, module: usize) -> Result<&mut Module> {
        self.modules.get_mut(module).ok_or(ScathaError::InvalidIndex {
            table: "module",
            index: module,
        })
    }

    /// Add a segment to `module`; returns its global index.
    pub fn add_segment(&mut self, module: usize, mut segment: Segment) -> Result<usize> {
        let index = self.segments.len();
        if index > usize::from(u16::MAX) {
            return Err(ScathaError::InvalidIndex {
                table: "segment",
                index,
            });
        }
        segment.module = Some(module);
        self.module_mut(module)?.segments.push(index);
        self.segments.push(segment);
        Ok(index)
    }

    pub fn add_group(
        &mut self,
        module: usize,
        name: impl Into<String>,
        segments: Vec<usize>,
    ) -> Result<usize> {
        if let Some(&bad) = segments.iter().find(|&&s| s >= self.segments.len()) {
            return Err(ScathaError::InvalidIndex {
                table: "segment",
                index: bad,
            });
        }
        let index = self.groups.len();
        self.module_mut(module)?.groups.push(index);
        self.groups.push(Group {
            name: name.into(),
            module,
            segments,
        });
        Ok(index)
    }

    pub fn add_external(&mut self, module: usize, name: impl Into<String>, local: bool) -> Result<u32> {
        let index = self.externals.len() as u32;
        self.module_mut(module)?.externals.push(index);
        self.externals.push(External {
            name: name.into(),
            module,
            local,
        });
        Ok(index)
    }

    /// Define a symbol. Public names enter the global name table unless a
    /// previous module already defined them.
    pub fn add_symbol(
        &mut self,
        module: usize,
        name: impl Into<String>,
        address: Address,
        local: bool,
    ) {
        let name = name.into();
        if !local {
            match self.publics.get(&name) {
                Some(existing) => tracing::debug!(
                    symbol = %name,
                    first = %existing,
                    duplicate = %address,
                    "duplicate public definition ignored"
                ),
                None => {
                    self.publics.insert(name.clone(), address);
                }
            }
        }
        self.symbols.push(Symbol {
            name,
            module,
            address,
            local,
        });
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn externals(&self) -> &[External] {
        &self.externals
    }

    pub fn all_symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn lookup_public(&self, name: &str) -> Option<Address> {
        self.publics.get(name).copied()
    }

    fn resolve_group(&self, group: &Group, displacement: u16) -> Option<Address> {
        let mut base = 0usize;
        for &index in &group.segments {
            let len = self.segments.get(index)?.len();
            let offset = usize::from(displacement);
            if offset < base + len {
                return Some(Address::new(index as u16, (offset - base) as u16));
            }
            base += len;
        }
        None
    }

    fn resolve_external(&self, external: &External) -> Option<Address> {
        if external.local {
            let found = self.symbols.iter().find(|s| {
                s.local && s.module == external.module && s.name == external.name
            });
            if let Some(symbol) = found {
                return Some(symbol.address);
            }
        }
        self.lookup_public(&external.name)
    }
}

impl Image for LibraryImage {
    fn segment_count(&self) -> usize {
        self.segments.len()
    }

    fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    fn segment_mut(&mut self, index: usize) -> Option<&mut Segment> {
        self.segments.get_mut(index)
    }

    fn locate(&self, address: Address) -> Option<Location> {
        let segment = usize::from(address.segment);
        let index = usize::from(address.offset);
        (index < self.segments.get(segment)?.len()).then_some(Location::new(segment, index))
    }

    fn address_at(&self, _anchor: Address, location: Location) -> Option<Address> {
        let segment = u16::try_from(location.segment).ok()?;
        let offset = u16::try_from(location.index).ok()?;
        Some(Address::new(segment, offset))
    }

    fn resolve(&self, target: &SymbolicTarget) -> Option<Address> {
        let base = match target.referent {
            Referent::Segment(index) => {
                self.segments.get(usize::from(index))?;
                return Some(Address::new(index, target.displacement));
            }
            Referent::Group(index) => {
                return self.resolve_group(self.groups.get(usize::from(index))?, target.displacement)
            }
            Referent::External(index) => self.resolve_external(self.externals.get(index as usize)?)?,
            Referent::Frame(_) => return None,
        };
        base.checked_add(i32::from(target.displacement))
    }

    fn segment_ordinal(&self, address: Address) -> Option<usize> {
        let index = usize::from(address.segment);
        (index < self.segments.len()).then_some(index)
    }

    fn format_address(&self, address: Address) -> String {
        match self.segments.get(usize::from(address.segment)) {
            Some(segment) => format!("{}:{:04X}", segment.name, address.offset),
            None => address.to_string(),
        }
    }

    fn referent_name(&self, referent: Referent) -> Option<String> {
        match referent {
            Referent::Segment(i) => self.segments.get(usize::from(i)).map(|s| s.name.clone()),
            Referent::Group(i) => self.groups.get(usize::from(i)).map(|g| g.name.clone()),
            Referent::External(i) => self.externals.get(i as usize).map(|e| e.name.clone()),
            Referent::Frame(frame) => Some(format!("{:04X}", frame)),
        }
    }

    fn symbols(&self) -> Vec<(Address, String)> {
        let mut out: Vec<(Address, String)> = self
            .symbols
            .iter()
            .map(|s| (s.address, s.name.clone()))
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> LibraryImage {
        let mut lib = LibraryImage::new();
        let m0 = lib.add_module("strlen");
        let text = lib
            .add_segment(m0, Segment::new("_TEXT", vec![0xC3; 0x10]).with_class("CODE"))
            .unwrap();
        let data = lib.add_segment(m0, Segment::new("_DATA", vec![0; 4])).unwrap();
        lib.add_group(m0, "DGROUP", vec![data, text]).unwrap();
        lib.add_symbol(m0, "_strlen", Address::new(text as u16, 2), false);
        lib.add_symbol(m0, "helper", Address::new(text as u16, 8), true);
        lib.add_external(m0, "helper", true).unwrap();
        lib.add_external(m0, "_missing", false).unwrap();

        let m1 = lib.add_module("main");
        let text1 = lib.add_segment(m1, Segment::new("_TEXT", vec![0x90; 4])).unwrap();
        lib.add_symbol(m1, "_strlen", Address::new(text1 as u16, 0), false);
        lib.add_external(m1, "_strlen", false).unwrap();
        lib.add_external(m1, "helper", false).unwrap();
        lib
    }

    #[test]
    fn test_externals_resolve_through_name_table() {
        let lib = library();
        let ext = |i| SymbolicTarget::new(Referent::External(i), 0);
        assert_eq!(lib.resolve(&ext(0)), Some(Address::new(0, 8)));
        assert_eq!(lib.resolve(&ext(1)), None);
        // first public definition wins
        assert_eq!(lib.resolve(&ext(2)), Some(Address::new(0, 2)));
        // module-local symbols are invisible to other modules
        assert_eq!(lib.resolve(&ext(3)), None);
        let with_disp = SymbolicTarget::new(Referent::External(2), 4);
        assert_eq!(lib.resolve(&with_disp), Some(Address::new(0, 6)));
    }

    #[test]
    fn test_group_and_segment_resolution() {
        let lib = library();
        let grp = |d| SymbolicTarget::new(Referent::Group(0), d);
        assert_eq!(lib.resolve(&grp(2)), Some(Address::new(1, 2)));
        assert_eq!(lib.resolve(&grp(6)), Some(Address::new(0, 2)));
        assert_eq!(lib.resolve(&grp(0x40)), None);
        let seg = SymbolicTarget::new(Referent::Segment(2), 1);
        assert_eq!(lib.resolve(&seg), Some(Address::new(2, 1)));
        let frame = SymbolicTarget::new(Referent::Frame(0x40), 0);
        assert_eq!(lib.resolve(&frame), None);
    }

    #[test]
    fn test_locate_and_format() {
        let lib = library();
        assert_eq!(lib.locate(Address::new(1, 3)), Some(Location::new(1, 3)));
        assert_eq!(lib.locate(Address::new(1, 4)), None);
        assert_eq!(lib.locate(Address::new(7, 0)), None);
        assert_eq!(lib.format_address(Address::new(1, 3)), "_DATA:0003");
        assert_eq!(lib.referent_name(Referent::Group(0)).as_deref(), Some("DGROUP"));
        assert_eq!(lib.segment_ordinal(Address::new(2, 0)), Some(2));
        assert_eq!(lib.segment(0).unwrap().module, Some(0));
        assert_eq!(lib.symbols().len(), 3);
        assert_eq!(lib.modules()[1].externals, vec![2, 3]);
    }

    #[test]
    fn test_group_rejects_unknown_segment() {
        let mut lib = LibraryImage::new();
        let m = lib.add_module("x");
        assert!(lib.add_group(m, "DGROUP", vec![3]).is_err());
        assert!(lib.add_segment(5, Segment::new("_TEXT", vec![])).is_err());
    }
}
