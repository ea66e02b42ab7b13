//! Symbol tables.
//!
//! [`GlobalSymbolTable`] holds addresses the host registered explicitly.
//! [`EmittedSymbols`] holds every named definition of every linked object,
//! stacked per name so the most recently published definition wins and a
//! removed object's definitions can be retracted without touching others.
//!
//! Neither table locks internally; the engine wraps both in `RwLock`s and
//! shares them with the resolver tiers.

use rustc_hash::FxHashMap;

use crate::mangle::CanonicalName;
use crate::types::{Address, CodeObjectId, ResolvedSymbol, SymbolFlags};

/// Host-provided bindings, keyed by canonical name.
#[derive(Debug, Default)]
pub struct GlobalSymbolTable {
    entries: FxHashMap<CanonicalName, Address>,
}

impl GlobalSymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a binding, returning the previous address.
    pub fn insert(&mut self, name: CanonicalName, address: Address) -> Option<Address> {
        self.entries.insert(name, address)
    }

    pub fn get(&self, name: &str) -> Option<Address> {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One object's definition of a name.
#[derive(Debug, Clone, Copy)]
struct Definition {
    object: CodeObjectId,
    symbol: ResolvedSymbol,
}

/// Definitions published by linked objects.
#[derive(Debug, Default)]
pub struct EmittedSymbols {
    /// Name -> definitions in publication order (last is newest).
    by_name: FxHashMap<CanonicalName, Vec<Definition>>,
    /// Object -> names it published, for retraction.
    by_object: FxHashMap<CodeObjectId, Vec<CanonicalName>>,
}

impl EmittedSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish all definitions of `object`.
    ///
    /// Returns the names whose previous exported definition is now shadowed
    /// by an exported definition from `object`.
    pub fn publish(
        &mut self,
        object: CodeObjectId,
        definitions: &[(CanonicalName, ResolvedSymbol)],
    ) -> Vec<CanonicalName> {
        let mut shadowed = Vec::new();
        let mut names = Vec::with_capacity(definitions.len());
        for (name, symbol) in definitions {
            let stack = self.by_name.entry(name.clone()).or_default();
            if symbol.flags.exported && stack.iter().any(|d| d.symbol.flags.exported) {
                shadowed.push(name.clone());
            }
            stack.push(Definition {
                object,
                symbol: *symbol,
            });
            names.push(name.clone());
        }
        self.by_object.entry(object).or_default().extend(names);
        shadowed
    }

    /// Remove every definition `object` published. Returns how many were
    /// removed.
    pub fn retract(&mut self, object: CodeObjectId) -> usize {
        let Some(names) = self.by_object.remove(&object) else {
            return 0;
        };
        let mut removed = 0usize;
        for name in names {
            if let Some(stack) = self.by_name.get_mut(&name) {
                let before = stack.len();
                stack.retain(|d| d.object != object);
                removed = removed.saturating_add(before.saturating_sub(stack.len()));
                if stack.is_empty() {
                    self.by_name.remove(&name);
                }
            }
        }
        removed
    }

    /// Newest definition of `name` that passes `filter`.
    pub fn lookup_with(
        &self,
        name: &str,
        filter: impl Fn(SymbolFlags) -> bool,
    ) -> Option<ResolvedSymbol> {
        self.by_name
            .get(name)?
            .iter()
            .rev()
            .find(|d| filter(d.symbol.flags))
            .map(|d| d.symbol)
    }

    /// Newest exported definition of `name`.
    pub fn lookup_exported(&self, name: &str) -> Option<ResolvedSymbol> {
        self.lookup_with(name, |flags| flags.exported)
    }

    /// Newest definition of `name`, exported or not.
    pub fn lookup_any(&self, name: &str) -> Option<ResolvedSymbol> {
        self.lookup_with(name, |_| true)
    }

    /// Number of distinct names with at least one live definition.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
