//! The per-worker known-address set (spec.md §4.6 "Address-filter
//! invariants"): union of static contract addresses, factory parent
//! addresses, and every currently discovered child. Updated in-memory the
//! instant a factory discovery lands, before the next log in the same
//! block is evaluated — so sibling children minted in one transaction are
//! never missed.

use std::collections::HashSet;

use kyomei_common::types::{AddressDescriptor, ContractConfig};

#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    addresses: HashSet<String>,
}

impl AddressFilter {
    /// Build the initial filter from a chain's configured contracts: static
    /// addresses, every address in a static list, and factory parents
    /// (children are added later as they're discovered).
    pub fn from_contracts(contracts: &[ContractConfig]) -> Self {
        let mut addresses = HashSet::new();
        for contract in contracts {
            match &contract.address {
                AddressDescriptor::Static(addr) => {
                    addresses.insert(addr.to_lowercase());
                }
                AddressDescriptor::StaticList(list) => {
                    addresses.extend(list.iter().map(|a| a.to_lowercase()));
                }
                AddressDescriptor::Factory { parent, .. } => {
                    addresses.insert(parent.to_lowercase());
                }
            }
        }
        Self { addresses }
    }

    pub fn insert(&mut self, address: &str) -> bool {
        self.addresses.insert(address.to_lowercase())
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(&address.to_lowercase())
    }

    pub fn as_vec(&self) -> Vec<String> {
        self.addresses.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}
