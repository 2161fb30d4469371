//! Continuation IR
//!
//! A deliberately small instruction graph: just enough structure for the
//! post-deoptimization feedback repair pass to walk data dependencies,
//! see through casts and forces, and re-infer types. The optimizer proper
//! is an external collaborator and never looks at this representation.

use crate::dispatch::FunctionId;
use bitflags::bitflags;
use std::fmt;
use string_interner::{DefaultStringInterner, DefaultSymbol};

bitflags! {
    /// Lattice of runtime value types. The empty set is "void": no
    /// information, or a contradiction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeSet: u16 {
        const LOGICAL = 1 << 0;
        const INTEGER = 1 << 1;
        const REAL = 1 << 2;
        const STRING = 1 << 3;
        const LIST = 1 << 4;
        const CLOSURE = 1 << 5;
        const ENV = 1 << 6;
        const NIL = 1 << 7;
        /// Value may still be wrapped in an unevaluated promise
        const PROMISE = 1 << 8;
        const MISSING = 1 << 9;
        const UNBOUND = 1 << 10;
        /// Value may carry a class attribute
        const OBJECT = 1 << 11;

        const NUMERIC = Self::LOGICAL.bits() | Self::INTEGER.bits() | Self::REAL.bits();
        const VECTOR = Self::NUMERIC.bits() | Self::STRING.bits() | Self::LIST.bits();
        const VALUE = Self::VECTOR.bits() | Self::CLOSURE.bits() | Self::ENV.bits() | Self::NIL.bits() | Self::OBJECT.bits();
    }
}

impl TypeSet {
    pub fn void() -> Self {
        TypeSet::empty()
    }

    pub fn is_void(&self) -> bool {
        self.is_empty()
    }

    /// Type after forcing: promise and missing wrappers are gone.
    pub fn forced(self) -> Self {
        self - (TypeSet::PROMISE | TypeSet::MISSING)
    }

    /// Element type of an extraction from a vector of this type.
    pub fn element(self) -> Self {
        let scalar = self.forced() & (TypeSet::NUMERIC | TypeSet::STRING);
        if self.contains(TypeSet::LIST) {
            TypeSet::VALUE
        } else {
            scalar
        }
    }
}

impl fmt::Display for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            return write!(f, "void");
        }
        let names: Vec<&str> = self.iter_names().map(|(n, _)| n).collect();
        write!(f, "{}", names.join("|").to_lowercase())
    }
}

/// Interned variable names
pub type Symbol = DefaultSymbol;

/// Variable name table shared by a continuation and its deopt context
#[derive(Debug, Default, Clone)]
pub struct Symbols {
    interner: DefaultStringInterner,
}

impl Symbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.interner.get_or_intern(name)
    }

    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.interner.get(name)
    }

    pub fn resolve(&self, sym: Symbol) -> &str {
        self.interner.resolve(sym).unwrap_or("<unknown>")
    }
}

/// Constants appearing as operands or as observed feedback values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstValue {
    Nil,
    Logical(bool),
    Int(i64),
    /// Stored as raw bits so constants can be hashed
    Real(u64),
    Str(String),
}

impl ConstValue {
    pub fn real(v: f64) -> Self {
        ConstValue::Real(v.to_bits())
    }

    pub fn type_of(&self) -> TypeSet {
        match self {
            ConstValue::Nil => TypeSet::NIL,
            ConstValue::Logical(_) => TypeSet::LOGICAL,
            ConstValue::Int(_) => TypeSet::INTEGER,
            ConstValue::Real(_) => TypeSet::REAL,
            ConstValue::Str(_) => TypeSet::STRING,
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Nil => write!(f, "NULL"),
            ConstValue::Logical(true) => write!(f, "TRUE"),
            ConstValue::Logical(false) => write!(f, "FALSE"),
            ConstValue::Int(i) => write!(f, "{}L", i),
            ConstValue::Real(bits) => write!(f, "{}", f64::from_bits(*bits)),
            ConstValue::Str(s) => write!(f, "{:?}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub usize);

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Where a piece of feedback was recorded: a source unit and a pc in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedbackOrigin {
    pub src: FunctionId,
    pub pc: u32,
}

impl FeedbackOrigin {
    pub fn new(src: FunctionId, pc: u32) -> Self {
        Self { src, pc }
    }
}

/// Type feedback attached to an instruction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TypeFeedback {
    pub ty: TypeSet,
    /// A single observed value, when the profile saw exactly one
    pub value: Option<ConstValue>,
    pub origin: Option<FeedbackOrigin>,
}

impl TypeFeedback {
    pub fn new(ty: TypeSet) -> Self {
        Self {
            ty,
            value: None,
            origin: None,
        }
    }

    pub fn at(mut self, origin: FeedbackOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_value(mut self, value: ConstValue) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Load the n-th formal argument
    LdArg(usize),
    LdVar(Symbol),
    StVar(Symbol),
    Force,
    CastType,
    /// Create a promise; `var` is set when its expression is a plain variable
    MkArg { var: Option<Symbol> },
    Phi,
    Extract,
    Arith(ArithOp),
    Branch,
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Instr(InstrId),
    Value(ConstValue),
}

impl Operand {
    pub fn as_instr(&self) -> Option<InstrId> {
        match self {
            Operand::Instr(id) => Some(*id),
            Operand::Value(_) => None,
        }
    }
}

impl From<InstrId> for Operand {
    fn from(id: InstrId) -> Self {
        Operand::Instr(id)
    }
}

impl From<ConstValue> for Operand {
    fn from(v: ConstValue) -> Self {
        Operand::Value(v)
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Op,
    /// Statically known result type
    pub ty: TypeSet,
    pub args: Vec<Operand>,
    pub feedback: Option<TypeFeedback>,
}

impl Instruction {
    pub fn has_feedback(&self) -> bool {
        self.feedback.is_some()
    }

    /// Feedback type, void when the instruction has none
    pub fn feedback_type(&self) -> TypeSet {
        self.feedback.as_ref().map_or(TypeSet::void(), |f| f.ty)
    }

    pub fn feedback_mut(&mut self) -> &mut TypeFeedback {
        self.feedback.get_or_insert_with(TypeFeedback::default)
    }

    /// Recompute the result type from operand types given by `type_of`.
    pub fn infer_type<F>(&self, mut type_of: F) -> TypeSet
    where
        F: FnMut(&Operand) -> TypeSet,
    {
        match &self.op {
            Op::Force => self.args.first().map_or(self.ty, |a| type_of(a).forced()),
            Op::CastType => self.args.first().map_or(self.ty, |a| type_of(a) & self.ty),
            Op::Phi => self
                .args
                .iter()
                .fold(TypeSet::void(), |acc, a| acc | type_of(a)),
            Op::Extract => self.args.first().map_or(self.ty, |a| type_of(a).element()),
            Op::Arith(_) => {
                let mut joined = TypeSet::void();
                for a in &self.args {
                    let t = type_of(a).forced();
                    if t.is_void() {
                        return self.ty;
                    }
                    joined |= t;
                }
                if TypeSet::INTEGER.union(TypeSet::LOGICAL).contains(joined) {
                    TypeSet::INTEGER
                } else if TypeSet::NUMERIC.contains(joined) {
                    TypeSet::REAL
                } else {
                    self.ty
                }
            }
            _ => self.ty,
        }
    }
}

/// A compiled unit resumed after a deoptimization
#[derive(Debug, Clone)]
pub struct Continuation {
    /// Source unit this continuation was compiled from
    pub src: FunctionId,
    pub instructions: Vec<Instruction>,
    pub symbols: Symbols,
}

impl Continuation {
    pub fn new(src: FunctionId) -> Self {
        Self {
            src,
            instructions: Vec::new(),
            symbols: Symbols::new(),
        }
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn push(&mut self, op: Op, ty: TypeSet, args: Vec<Operand>) -> InstrId {
        let id = InstrId(self.instructions.len());
        self.instructions.push(Instruction {
            op,
            ty,
            args,
            feedback: None,
        });
        id
    }

    pub fn push_with_feedback(
        &mut self,
        op: Op,
        ty: TypeSet,
        args: Vec<Operand>,
        feedback: TypeFeedback,
    ) -> InstrId {
        let id = self.push(op, ty, args);
        self.instructions[id.0].feedback = Some(feedback);
        id
    }

    pub fn get(&self, id: InstrId) -> &Instruction {
        &self.instructions[id.0]
    }

    pub fn get_mut(&mut self, id: InstrId) -> &mut Instruction {
        &mut self.instructions[id.0]
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = InstrId> {
        (0..self.instructions.len()).map(InstrId)
    }

    /// Walk through `CastType` and `Force` to the producing instruction.
    pub fn follow_casts_and_force(&self, mut id: InstrId) -> InstrId {
        loop {
            let instr = self.get(id);
            match instr.op {
                Op::CastType | Op::Force => match instr.args.first().and_then(Operand::as_instr) {
                    Some(next) => id = next,
                    None => return id,
                },
                _ => return id,
            }
        }
    }

    /// Static type of an operand
    pub fn operand_type(&self, operand: &Operand) -> TypeSet {
        match operand {
            Operand::Instr(id) => self.get(*id).ty,
            Operand::Value(v) => v.type_of(),
        }
    }

    /// The variable an instruction reads, looking through casts and forces.
    /// Promises whose expression is a plain variable count as reads of it.
    pub fn loaded_variable(&self, id: InstrId) -> Option<Symbol> {
        match &self.get(self.follow_casts_and_force(id)).op {
            Op::LdVar(var) => Some(*var),
            Op::MkArg { var } => *var,
            _ => None,
        }
    }
}

impl fmt::Display for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, instr) in self.instructions.iter().enumerate() {
            let op = match &instr.op {
                Op::LdArg(n) => format!("LdArg {}", n),
                Op::LdVar(v) => format!("LdVar {}", self.symbols.resolve(*v)),
                Op::StVar(v) => format!("StVar {}", self.symbols.resolve(*v)),
                Op::MkArg { var: Some(v) } => format!("MkArg {}", self.symbols.resolve(*v)),
                other => format!("{:?}", other),
            };
            let args: Vec<String> = instr
                .args
                .iter()
                .map(|a| match a {
                    Operand::Instr(id) => id.to_string(),
                    Operand::Value(v) => v.to_string(),
                })
                .collect();
            write!(f, "%{} = {} ({}) : {}", i, op, args.join(", "), instr.ty)?;
            if let Some(fb) = &instr.feedback {
                write!(f, " <{}>", fb.ty)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forced_strips_promise() {
        let t = TypeSet::PROMISE | TypeSet::INTEGER | TypeSet::MISSING;
        assert_eq!(t.forced(), TypeSet::INTEGER);
        assert!(TypeSet::void().is_void());
    }

    #[test]
    fn test_follow_casts_and_force() {
        let mut cont = Continuation::new(FunctionId(0));
        let x = cont.intern("x");
        let ld = cont.push(Op::LdVar(x), TypeSet::VALUE | TypeSet::PROMISE, vec![]);
        let force = cont.push(Op::Force, TypeSet::VALUE, vec![ld.into()]);
        let cast = cont.push(Op::CastType, TypeSet::INTEGER, vec![force.into()]);
        assert_eq!(cont.follow_casts_and_force(cast), ld);
        assert_eq!(cont.loaded_variable(cast), Some(x));
    }

    #[test]
    fn test_infer_arith() {
        let mut cont = Continuation::new(FunctionId(0));
        let a = cont.push(Op::LdArg(0), TypeSet::INTEGER, vec![]);
        let add = cont.push(
            Op::Arith(ArithOp::Add),
            TypeSet::NUMERIC,
            vec![a.into(), ConstValue::real(1.0).into()],
        );
        let instr = cont.get(add);
        assert_eq!(instr.infer_type(|op| cont.operand_type(op)), TypeSet::REAL);

        let add_int = cont.push(
            Op::Arith(ArithOp::Add),
            TypeSet::NUMERIC,
            vec![a.into(), ConstValue::Int(1).into()],
        );
        let instr = cont.get(add_int);
        assert_eq!(instr.infer_type(|op| cont.operand_type(op)), TypeSet::INTEGER);
    }

    #[test]
    fn test_infer_phi_joins() {
        let mut cont = Continuation::new(FunctionId(0));
        let a = cont.push(Op::LdArg(0), TypeSet::INTEGER, vec![]);
        let b = cont.push(Op::LdArg(1), TypeSet::STRING, vec![]);
        let phi = cont.push(Op::Phi, TypeSet::VALUE, vec![a.into(), b.into()]);
        let instr = cont.get(phi);
        assert_eq!(
            instr.infer_type(|op| cont.operand_type(op)),
            TypeSet::INTEGER | TypeSet::STRING
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeSet::void().to_string(), "void");
        assert_eq!((TypeSet::INTEGER | TypeSet::REAL).to_string(), "integer|real");
    }
}
