use std::collections::hash_map::Entry;
use std::ops::Index;

use crate::HashMap;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Ident(pub u32);

#[derive(Default)]
pub struct Strings {
    ids: HashMap<String, Ident>,
    names: Vec<String>,
}

impl Strings {
    pub fn intern(&mut self, name: &str) -> Ident {
        match self.ids.entry(name.to_owned()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let ident = Ident(self.names.len() as u32);
                self.names.push(entry.key().clone());
                entry.insert(ident);
                ident
            }
        }
    }
}

impl Index<Ident> for Strings {
    type Output = str;

    fn index(&self, ident: Ident) -> &str {
        &self.names[ident.0 as usize]
    }
}

#[derive(Debug)]
pub struct Module {
    pub pos: usize,
    pub name: Ident,
    pub params: Vec<Param>,
    pub outputs: Vec<Param>,
    pub body: Vec<Stmt>,
}

/// A declaration slice `[n]` means "bus of width n", unlike slices in
/// expressions; lowering interprets the raw slice.
#[derive(Copy, Clone, Debug)]
pub struct Param {
    pub pos: usize,
    pub name: Ident,
    pub slice: Option<Slice>,
}

#[derive(Debug)]
pub struct Stmt {
    pub pos: usize,
    pub inner: StmtInner,
}

#[derive(Debug)]
pub enum StmtInner {
    Part(Part),
    Wire(Wire),
}

#[derive(Debug)]
pub struct Part {
    pub label: Option<Ident>,
    pub module: Ident,
    pub inputs: Vec<Expr>,
    pub outputs: Vec<Expr>,
}

#[derive(Debug)]
pub struct Wire {
    pub inputs: Vec<Expr>,
    pub output: Expr,
}

#[derive(Debug)]
pub struct Expr {
    pub pos: usize,
    pub kind: ExprKind,
}

#[derive(Debug)]
pub enum ExprKind {
    Name { name: Ident, slice: Option<Slice> },
    Literal(Literal),
    /// `{…}` aggregation; lowering materializes it as a synthetic wire.
    Group(Vec<Expr>),
}

#[derive(Copy, Clone, Debug)]
pub enum Literal {
    Int(u32),
    Byte(u32),
    Word(u32),
}

#[derive(Copy, Clone, Debug)]
pub struct Slice {
    pub start: usize,
    pub end: Option<usize>,
}
