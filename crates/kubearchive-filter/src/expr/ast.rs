//! Abstract syntax of the policy expression language.

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum UnaryOp {
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "-")]
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum BinaryOp {
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// A bare identifier: one of the bound variables.
    Ident(String),
    List(Vec<Expr>),
    Member {
        object: Box<Expr>,
        field: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    /// A free function call: `now()`, `timestamp(..)`, `duration(..)`,
    /// `has(..)`.
    Call {
        function: String,
        args: Vec<Expr>,
    },
    /// A method call on a receiver: `x.contains(y)`.
    Method {
        receiver: Box<Expr>,
        method: String,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}
