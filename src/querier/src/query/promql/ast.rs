//! Typed expression tree consumed by the evaluator
//!
//! The tree is produced by a [`QueryParser`](super::parser::QueryParser) or
//! built directly with the constructors below. Domain functions and the
//! `left_join` / `out_join` matching extensions only exist at this level.

use std::fmt;

use super::labels::{METRIC_NAME, Matcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Scalar,
    Vector,
    Matrix,
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Scalar => "scalar",
            ValueType::Vector => "vector",
            ValueType::Matrix => "matrix",
            ValueType::String => "string",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eql,
    Neq,
    Gtr,
    Lss,
    Gte,
    Lte,
    And,
    Or,
    Unless,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eql | BinaryOp::Neq | BinaryOp::Gtr | BinaryOp::Lss | BinaryOp::Gte | BinaryOp::Lte
        )
    }

    pub fn is_set_operator(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Eql => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Gtr => ">",
            BinaryOp::Lss => "<",
            BinaryOp::Gte => ">=",
            BinaryOp::Lte => "<=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Unless => "unless",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Topk,
    Bottomk,
}

impl AggregateOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Count => "count",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Topk => "topk",
            AggregateOp::Bottomk => "bottomk",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtModifier {
    Start,
    End,
    /// Unix milliseconds
    At(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    /// Always contains the `__name__` matcher when `name` is set.
    pub matchers: Vec<Matcher>,
    /// Milliseconds; positive values look into the past
    pub offset: i64,
    pub at: Option<AtModifier>,
    /// `@` timestamp resolved by [`preprocess`].
    pub timestamp: Option<i64>,
}

impl VectorSelector {
    pub fn new(name: Option<String>, mut matchers: Vec<Matcher>) -> Self {
        if let Some(name) = &name {
            if !matchers.iter().any(|m| m.name == METRIC_NAME) {
                matchers.insert(0, Matcher::equal(METRIC_NAME, name.clone()));
            }
        }
        Self {
            name,
            matchers,
            offset: 0,
            at: None,
            timestamp: None,
        }
    }

    pub fn metric(name: &str) -> Self {
        Self::new(Some(name.to_string()), Vec::new())
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn with_offset(mut self, offset_ms: i64) -> Self {
        self.offset = offset_ms;
        self
    }

    pub fn with_at(mut self, at: AtModifier) -> Self {
        self.at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
    pub selector: VectorSelector,
    /// Window length in milliseconds
    pub range: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub func: String,
    pub args: Vec<Expr>,
}

impl Call {
    /// The first argument that is a range vector, looking through parens and
    /// step-invariant wrappers.
    pub fn matrix_arg(&self) -> Option<&MatrixSelector> {
        self.args.iter().find_map(|arg| {
            let mut inner = arg.unwrap_paren();
            if let Expr::StepInvariant(wrapped) = inner {
                inner = wrapped.unwrap_paren();
            }
            match inner {
                Expr::MatrixSelector(ms) => Some(ms),
                _ => None,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchCardinality {
    #[default]
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
    LeftJoin,
    OutJoin,
}

/// Label matching behaviour of a vector-vector binary operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorMatching {
    pub card: MatchCardinality,
    /// `on(...)` when true, `ignoring(...)` otherwise
    pub on: bool,
    pub matching_labels: Vec<String>,
    /// group_left/group_right labels, or the labels a left_join promotes
    pub include: Vec<String>,
    pub include_left: Vec<String>,
    pub include_right: Vec<String>,
    /// Whether a left_join allows several right matches per left row.
    pub group_left: bool,
}

impl VectorMatching {
    pub fn on(labels: &[&str]) -> Self {
        Self {
            on: true,
            matching_labels: labels.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn ignoring(labels: &[&str]) -> Self {
        Self {
            on: false,
            matching_labels: labels.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_card(mut self, card: MatchCardinality) -> Self {
        self.card = card;
        self
    }

    pub fn with_include(mut self, labels: &[&str]) -> Self {
        self.include = labels.iter().map(|l| l.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinaryOp,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
    pub matching: VectorMatching,
    pub return_bool: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub op: AggregateOp,
    pub expr: Box<Expr>,
    pub param: Option<Box<Expr>>,
    pub grouping: Vec<String>,
    pub without: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    NumberLiteral(f64),
    StringLiteral(String),
    VectorSelector(VectorSelector),
    MatrixSelector(MatrixSelector),
    Call(Call),
    Paren(Box<Expr>),
    /// Unary minus
    Unary(Box<Expr>),
    Binary(BinaryExpr),
    Aggregate(AggregateExpr),
    StepInvariant(Box<Expr>),
}

impl Expr {
    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::NumberLiteral(_) => ValueType::Scalar,
            Expr::StringLiteral(_) => ValueType::String,
            Expr::VectorSelector(_) => ValueType::Vector,
            Expr::MatrixSelector(_) => ValueType::Matrix,
            Expr::Call(call) if call.func == "time" => ValueType::Scalar,
            Expr::Call(_) => ValueType::Vector,
            Expr::Paren(inner) | Expr::Unary(inner) | Expr::StepInvariant(inner) => {
                inner.value_type()
            }
            Expr::Binary(bin) => {
                if bin.lhs.value_type() == ValueType::Scalar
                    && bin.rhs.value_type() == ValueType::Scalar
                {
                    ValueType::Scalar
                } else {
                    ValueType::Vector
                }
            }
            Expr::Aggregate(_) => ValueType::Vector,
        }
    }

    pub fn unwrap_paren(&self) -> &Expr {
        let mut expr = self;
        while let Expr::Paren(inner) = expr {
            expr = inner;
        }
        expr
    }

    pub fn selector(selector: VectorSelector) -> Expr {
        Expr::VectorSelector(selector)
    }

    pub fn matrix(selector: VectorSelector, range_ms: i64) -> Expr {
        Expr::MatrixSelector(MatrixSelector {
            selector,
            range: range_ms,
        })
    }

    pub fn call(func: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(Call {
            func: func.to_string(),
            args,
        })
    }

    pub fn paren(expr: Expr) -> Expr {
        Expr::Paren(Box::new(expr))
    }

    pub fn negate(expr: Expr) -> Expr {
        Expr::Unary(Box::new(expr))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Self::binary_with(op, lhs, rhs, VectorMatching::default(), false)
    }

    pub fn binary_with(
        op: BinaryOp,
        lhs: Expr,
        rhs: Expr,
        matching: VectorMatching,
        return_bool: bool,
    ) -> Expr {
        Expr::Binary(BinaryExpr {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            matching,
            return_bool,
        })
    }

    pub fn aggregate(op: AggregateOp, expr: Expr, grouping: &[&str], without: bool) -> Expr {
        Expr::Aggregate(AggregateExpr {
            op,
            expr: Box::new(expr),
            param: None,
            grouping: grouping.iter().map(|g| g.to_string()).collect(),
            without,
        })
    }

    pub fn aggregate_with_param(op: AggregateOp, param: Expr, expr: Expr) -> Expr {
        Expr::Aggregate(AggregateExpr {
            op,
            expr: Box::new(expr),
            param: Some(Box::new(param)),
            grouping: Vec::new(),
            without: false,
        })
    }
}

/// Resolves `@ start()` / `@ end()` and wraps step-invariant subtrees.
pub fn preprocess(mut expr: Expr, start: i64, end: i64) -> Expr {
    resolve_at(&mut expr, start, end);
    if mark_step_invariant(&mut expr) {
        Expr::StepInvariant(Box::new(expr))
    } else {
        expr
    }
}

fn resolve_at(expr: &mut Expr, start: i64, end: i64) {
    match expr {
        Expr::VectorSelector(vs) => resolve_selector_at(vs, start, end),
        Expr::MatrixSelector(ms) => resolve_selector_at(&mut ms.selector, start, end),
        Expr::Call(call) => call.args.iter_mut().for_each(|a| resolve_at(a, start, end)),
        Expr::Paren(inner) | Expr::Unary(inner) | Expr::StepInvariant(inner) => {
            resolve_at(inner, start, end)
        }
        Expr::Binary(bin) => {
            resolve_at(&mut bin.lhs, start, end);
            resolve_at(&mut bin.rhs, start, end);
        }
        Expr::Aggregate(agg) => {
            resolve_at(&mut agg.expr, start, end);
            if let Some(param) = agg.param.as_mut() {
                resolve_at(param, start, end);
            }
        }
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) => {}
    }
}

fn resolve_selector_at(vs: &mut VectorSelector, start: i64, end: i64) {
    vs.timestamp = match vs.at {
        Some(AtModifier::Start) => Some(start),
        Some(AtModifier::End) => Some(end),
        Some(AtModifier::At(t)) => Some(t),
        None => vs.timestamp,
    };
}

fn mark_step_invariant(expr: &mut Expr) -> bool {
    match expr {
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) => true,
        Expr::VectorSelector(vs) => vs.timestamp.is_some(),
        Expr::MatrixSelector(ms) => ms.selector.timestamp.is_some(),
        Expr::Paren(inner) | Expr::Unary(inner) => mark_step_invariant(inner),
        Expr::Aggregate(agg) => mark_step_invariant(&mut agg.expr),
        Expr::Binary(bin) => {
            let lhs = mark_step_invariant(&mut bin.lhs);
            let rhs = mark_step_invariant(&mut bin.rhs);
            if lhs && rhs {
                return true;
            }
            if lhs {
                wrap_step_invariant(&mut bin.lhs);
            }
            if rhs {
                wrap_step_invariant(&mut bin.rhs);
            }
            false
        }
        Expr::Call(_) | Expr::StepInvariant(_) => false,
    }
}

fn wrap_step_invariant(expr: &mut Box<Expr>) {
    let inner = std::mem::replace(expr.as_mut(), Expr::NumberLiteral(0.0));
    **expr = Expr::StepInvariant(Box::new(inner));
}
