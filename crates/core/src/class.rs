//! Classes and methods.
//!
//! Method lookup is O(1) given a symbol: `methods` is a dense vector indexed
//! directly by the global method symbol assigned at compile time (see
//! `xr-symbol`), growing only when `METHOD` installs a new entry.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::object::ObjHeader;
use crate::proto::Proto;
use crate::upvalue::Upvalue;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl OperatorKind {
    /// Maps a predefined operator symbol (`xr_symbol::SYMBOL_OP_*`) to its
    /// `OperatorKind`, or `None` for symbols that aren't operator overloads.
    pub fn from_symbol(symbol: u32) -> Option<OperatorKind> {
        match symbol {
            xr_symbol::SYMBOL_OP_ADD => Some(OperatorKind::Add),
            xr_symbol::SYMBOL_OP_SUB => Some(OperatorKind::Sub),
            xr_symbol::SYMBOL_OP_MUL => Some(OperatorKind::Mul),
            xr_symbol::SYMBOL_OP_DIV => Some(OperatorKind::Div),
            xr_symbol::SYMBOL_OP_MOD => Some(OperatorKind::Mod),
            xr_symbol::SYMBOL_OP_EQ => Some(OperatorKind::Eq),
            xr_symbol::SYMBOL_OP_NE => Some(OperatorKind::Ne),
            xr_symbol::SYMBOL_OP_LT => Some(OperatorKind::Lt),
            xr_symbol::SYMBOL_OP_LE => Some(OperatorKind::Le),
            xr_symbol::SYMBOL_OP_GT => Some(OperatorKind::Gt),
            xr_symbol::SYMBOL_OP_GE => Some(OperatorKind::Ge),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Method {
    pub name: Rc<str>,
    pub proto: Rc<Proto>,
    /// Captured at `METHOD`-opcode time from the closure the preceding
    /// `CLOSURE` built — carries e.g. the synthetic `super` upvalue a
    /// method compiled inside a subclass body closes over.
    pub upvalues: Vec<Rc<Upvalue>>,
    pub symbol: u32,
    pub is_static: bool,
    pub is_private: bool,
    pub is_constructor: bool,
    pub is_getter: bool,
    pub is_setter: bool,
    pub operator: Option<OperatorKind>,
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: Rc<str>,
    /// Declared type name, if any; `None` means untyped.
    pub type_name: Option<Rc<str>>,
}

#[derive(Debug)]
pub struct Class {
    pub header: ObjHeader,
    pub name: Rc<str>,
    pub superclass: RefCell<Option<Rc<Class>>>,
    pub fields: RefCell<Vec<FieldDecl>>,
    methods: RefCell<Vec<Option<Rc<Method>>>>,
    static_methods: RefCell<HashMap<u32, Rc<Method>>>,
    static_fields: RefCell<HashMap<Rc<str>, Value>>,
    private_methods: RefCell<std::collections::HashSet<u32>>,
}

impl Class {
    pub fn new(header: ObjHeader, name: Rc<str>) -> Self {
        Class {
            header,
            name,
            superclass: RefCell::new(None),
            fields: RefCell::new(Vec::new()),
            methods: RefCell::new(Vec::new()),
            static_methods: RefCell::new(HashMap::new()),
            static_fields: RefCell::new(HashMap::new()),
            private_methods: RefCell::new(std::collections::HashSet::new()),
        }
    }

    pub fn add_field(&self, decl: FieldDecl) {
        self.fields.borrow_mut().push(decl);
    }

    pub fn field_count(&self) -> usize {
        self.fields.borrow().len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.borrow().iter().position(|f| &*f.name == name)
    }

    pub fn inherit_from(&self, super_class: &Rc<Class>) {
        let inherited = super_class.fields.borrow().clone();
        let mut own = self.fields.borrow_mut();
        let mut merged = inherited;
        merged.append(&mut own);
        *own = merged;
        *self.superclass.borrow_mut() = Some(super_class.clone());
    }

    pub fn add_method(&self, method: Rc<Method>) {
        if method.is_private {
            self.private_methods.borrow_mut().insert(method.symbol);
        }
        if method.is_static {
            self.static_methods
                .borrow_mut()
                .insert(method.symbol, method);
            return;
        }
        let sym = method.symbol as usize;
        let mut methods = self.methods.borrow_mut();
        if methods.len() <= sym {
            methods.resize(sym + 1, None);
        }
        methods[sym] = Some(method);
    }

    /// Resolves a method by symbol, walking the superclass chain.
    pub fn resolve_method(self: &Rc<Self>, symbol: u32) -> Option<Rc<Method>> {
        let mut cur = Some(self.clone());
        while let Some(class) = cur {
            let methods = class.methods.borrow();
            if let Some(Some(m)) = methods.get(symbol as usize) {
                return Some(m.clone());
            }
            drop(methods);
            cur = class.superclass.borrow().clone();
        }
        None
    }

    pub fn resolve_static_method(self: &Rc<Self>, symbol: u32) -> Option<Rc<Method>> {
        let mut cur = Some(self.clone());
        while let Some(class) = cur {
            if let Some(m) = class.static_methods.borrow().get(&symbol) {
                return Some(m.clone());
            }
            cur = class.superclass.borrow().clone();
        }
        None
    }

    pub fn set_static_field(&self, name: Rc<str>, value: Value) {
        self.static_fields.borrow_mut().insert(name, value);
    }

    pub fn get_static_field(&self, name: &str) -> Option<Value> {
        self.static_fields.borrow().get(name).cloned()
    }
}
