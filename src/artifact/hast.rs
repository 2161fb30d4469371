//! Structural AST hash
//!
//! A hast identifies a top-level source unit across runs. It only folds
//! symbol and string content plus the shape of the tree, so two units that
//! differ only in numeric literals share a hast. The full structural digest
//! covers literals too. It is persisted next to the artifacts, so it must
//! not change between runs or builds; collisions found in memory or on disk
//! blacklist the hast.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hast(pub u64);

impl fmt::Display for Hast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Hast {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Hast)
    }
}

/// Source tree handed over by the reader
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ast {
    Nil,
    Symbol(String),
    Str(String),
    Int(i64),
    /// Bit pattern of a double
    Real(u64),
    Logical(bool),
    List(Vec<Ast>),
    /// Call node: function position followed by the arguments
    Call(Box<Ast>, Vec<Ast>),
}

impl Ast {
    pub fn sym(name: &str) -> Self {
        Ast::Symbol(name.to_string())
    }

    pub fn real(v: f64) -> Self {
        Ast::Real(v.to_bits())
    }

    pub fn call(head: Ast, args: Vec<Ast>) -> Self {
        Ast::Call(Box::new(head), args)
    }

    /// Full structural digest, literals included. Used to tell a real hast
    /// match from a collision. FNV-1a over a tagged encoding of the tree.
    pub fn digest(&self) -> u64 {
        let mut digest = Digest(FNV_OFFSET);
        digest.ast(self);
        digest.0
    }
}

struct Digest(u64);

impl Digest {
    fn bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn text(&mut self, s: &str) {
        self.bytes(&(s.len() as u64).to_le_bytes());
        self.bytes(s.as_bytes());
    }

    fn ast(&mut self, ast: &Ast) {
        match ast {
            Ast::Nil => self.bytes(&[0]),
            Ast::Symbol(s) => {
                self.bytes(&[1]);
                self.text(s);
            }
            Ast::Str(s) => {
                self.bytes(&[2]);
                self.text(s);
            }
            Ast::Int(i) => {
                self.bytes(&[3]);
                self.bytes(&i.to_le_bytes());
            }
            Ast::Real(bits) => {
                self.bytes(&[4]);
                self.bytes(&bits.to_le_bytes());
            }
            Ast::Logical(b) => self.bytes(&[5, *b as u8]),
            Ast::List(items) => {
                self.bytes(&[6]);
                self.bytes(&(items.len() as u64).to_le_bytes());
                items.iter().for_each(|item| self.ast(item));
            }
            Ast::Call(head, args) => {
                self.bytes(&[7]);
                self.bytes(&(args.len() as u64).to_le_bytes());
                self.ast(head);
                args.iter().for_each(|arg| self.ast(arg));
            }
        }
    }
}

fn fold_bytes(h: u64, s: &str) -> u64 {
    let sum = s.bytes().fold(0u64, |acc, b| acc.wrapping_add(b as u64));
    h.wrapping_mul(31).wrapping_add(sum)
}

/// Fold one cons cell: `car` followed by the remaining cells as `cdr`.
fn fold_cells<'a, I>(mut h: u64, cells: I) -> u64
where
    I: Iterator<Item = &'a Ast>,
{
    for car in cells {
        h = h.wrapping_mul(31).wrapping_add(1);
        h = fold(h, car);
        h = h.wrapping_mul(31).wrapping_add(1);
    }
    h
}

fn fold(h: u64, ast: &Ast) -> u64 {
    match ast {
        Ast::Symbol(s) | Ast::Str(s) => fold_bytes(h, s),
        Ast::List(items) => fold_cells(h, items.iter()),
        Ast::Call(head, args) => fold_cells(h, std::iter::once(head.as_ref()).chain(args.iter())),
        Ast::Nil | Ast::Int(_) | Ast::Real(_) | Ast::Logical(_) => h,
    }
}

pub fn hash_ast(ast: &Ast) -> Hast {
    Hast(fold(0, ast))
}
