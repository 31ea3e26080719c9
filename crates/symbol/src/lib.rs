//! Bidirectional name/symbol table.
//!
//! Growth only happens at compile time through [`SymbolTable::get_or_create`];
//! the VM only ever reads symbols back out of instructions, never allocates
//! new ones. The resulting dense integers index directly into a class's
//! method table, giving O(1) virtual dispatch without hashing at runtime.

use std::rc::Rc;

use hashbrown::HashMap;

pub const SYMBOL_CONSTRUCTOR: u32 = 0;
pub const SYMBOL_TO_STRING: u32 = 1;
pub const SYMBOL_ITERATOR: u32 = 2;
pub const SYMBOL_HASH_CODE: u32 = 3;
pub const SYMBOL_OP_ADD: u32 = 4;
pub const SYMBOL_OP_SUB: u32 = 5;
pub const SYMBOL_OP_MUL: u32 = 6;
pub const SYMBOL_OP_DIV: u32 = 7;
pub const SYMBOL_OP_MOD: u32 = 8;
pub const SYMBOL_OP_EQ: u32 = 9;
pub const SYMBOL_OP_NE: u32 = 10;
pub const SYMBOL_OP_LT: u32 = 11;
pub const SYMBOL_OP_LE: u32 = 12;
pub const SYMBOL_OP_GT: u32 = 13;
pub const SYMBOL_OP_GE: u32 = 14;

const PREDEFINED: &[(&str, u32)] = &[
    ("constructor", SYMBOL_CONSTRUCTOR),
    ("toString", SYMBOL_TO_STRING),
    ("iterator", SYMBOL_ITERATOR),
    ("hashCode", SYMBOL_HASH_CODE),
    ("+", SYMBOL_OP_ADD),
    ("-", SYMBOL_OP_SUB),
    ("*", SYMBOL_OP_MUL),
    ("/", SYMBOL_OP_DIV),
    ("%", SYMBOL_OP_MOD),
    ("==", SYMBOL_OP_EQ),
    ("!=", SYMBOL_OP_NE),
    ("<", SYMBOL_OP_LT),
    ("<=", SYMBOL_OP_LE),
    (">", SYMBOL_OP_GT),
    (">=", SYMBOL_OP_GE),
];

#[derive(Debug)]
pub struct SymbolTable {
    by_name: HashMap<Rc<str>, u32>,
    by_symbol: Vec<Rc<str>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            by_name: HashMap::new(),
            by_symbol: Vec::new(),
        };
        for (name, expected) in PREDEFINED {
            let sym = table.get_or_create(name);
            debug_assert_eq!(sym, *expected, "predefined symbol `{name}` out of order");
        }
        table
    }

    pub fn get_or_create(&mut self, name: &str) -> u32 {
        if let Some(&sym) = self.by_name.get(name) {
            return sym;
        }
        let sym = self.by_symbol.len() as u32;
        let rc: Rc<str> = Rc::from(name);
        self.by_symbol.push(rc.clone());
        self.by_name.insert(rc, sym);
        log::trace!("symbol {sym} assigned to `{name}`");
        sym
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, symbol: u32) -> Option<&str> {
        self.by_symbol.get(symbol as usize).map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predefined_symbols_land_at_expected_indices() {
        let table = SymbolTable::new();
        assert_eq!(table.lookup("constructor"), Some(SYMBOL_CONSTRUCTOR));
        assert_eq!(table.lookup("+"), Some(SYMBOL_OP_ADD));
        assert_eq!(table.lookup(">="), Some(SYMBOL_OP_GE));
    }

    #[test]
    fn new_names_get_dense_growing_symbols() {
        let mut table = SymbolTable::new();
        let base = table.len() as u32;
        let sym = table.get_or_create("speak");
        assert_eq!(sym, base);
        let again = table.get_or_create("speak");
        assert_eq!(sym, again);
    }

    #[test]
    fn name_of_round_trips() {
        let mut table = SymbolTable::new();
        let sym = table.get_or_create("bark");
        assert_eq!(table.name_of(sym), Some("bark"));
    }
}
