/// Projection mode of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Select the matching records.
    Pick,
    /// Count the matching rows.
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        }
    }
}

/// An attribute path: an attribute name optionally dotted through
/// reference hops, with optional explicit type narrowing after a hop
/// (`ref.Bar.barValue`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub segments: Vec<String>,
}

impl Path {
    pub fn text(&self) -> String {
        self.segments.join(".")
    }
}

/// A single predicate term.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// `path <op> ?`
    Cmp { path: Path, op: CmpOp },
    /// `path INRANGE ? ?`, inclusive on both ends.
    InRange { path: Path },
    /// `path TYPED TypeName`: narrows a reference to a concrete type.
    Typed { path: Path, type_name: String },
}

/// Boolean predicate tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Term(Term),
}

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub projection: Projection,
    pub type_name: String,
    pub predicate: Option<Expr>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}
