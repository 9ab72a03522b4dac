//! PromQL parser adapter
//!
//! Wraps the promql-parser crate and converts its AST into the engine's
//! [`Expr`]. Parsers that understand the domain functions or the join
//! extensions plug in through [`QueryParser`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use promql_parser::label::{MatchOp as ParserMatchOp, Matcher as ParserMatcher};
use promql_parser::parser::token::*;
use promql_parser::parser::{
    self, AtModifier as ParserAtModifier, Expr as ParserExpr, LabelModifier, Offset,
    VectorMatchCardinality, VectorSelector as ParserVectorSelector,
};

use super::ast::{
    AggregateExpr, AggregateOp, AtModifier, BinaryExpr, BinaryOp, Call, Expr, MatchCardinality,
    MatrixSelector, VectorMatching, VectorSelector,
};
use super::labels::{MatchOp, Matcher};
use crate::query::error::QueryError;

/// Turns query text into the engine AST.
pub trait QueryParser: Send + Sync {
    fn parse_expr(&self, query: &str) -> Result<Expr, QueryError>;

    /// Parses a `match[]` style selector such as `up{job="api"}`.
    fn parse_metric_selector(&self, selector: &str) -> Result<Vec<Matcher>, QueryError> {
        match self.parse_expr(selector)? {
            Expr::VectorSelector(vs) => Ok(vs.matchers),
            other => Err(QueryError::bad_data(format!(
                "invalid series selector {selector:?}: expected vector selector, got {}",
                other.value_type()
            ))),
        }
    }
}

/// Standard PromQL grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromqlParser;

impl QueryParser for PromqlParser {
    fn parse_expr(&self, query: &str) -> Result<Expr, QueryError> {
        let expr = parser::parse(query).map_err(QueryError::bad_data)?;
        convert(expr)
    }
}

fn convert(expr: ParserExpr) -> Result<Expr, QueryError> {
    match expr {
        ParserExpr::NumberLiteral(lit) => Ok(Expr::NumberLiteral(lit.val)),
        ParserExpr::StringLiteral(lit) => Ok(Expr::StringLiteral(lit.val)),
        ParserExpr::VectorSelector(vs) => Ok(Expr::VectorSelector(convert_selector(vs)?)),
        ParserExpr::MatrixSelector(ms) => Ok(Expr::MatrixSelector(MatrixSelector {
            selector: convert_selector(ms.vs)?,
            range: duration_ms(ms.range),
        })),
        ParserExpr::Call(call) => {
            let args = call
                .args
                .args
                .into_iter()
                .map(|arg| convert(*arg))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Call(Call {
                func: call.func.name.to_string(),
                args,
            }))
        }
        ParserExpr::Paren(paren) => Ok(Expr::Paren(Box::new(convert(*paren.expr)?))),
        ParserExpr::Unary(unary) => Ok(Expr::Unary(Box::new(convert(*unary.expr)?))),
        ParserExpr::Binary(bin) => {
            let op = convert_binary_op(bin.op.id())?;
            let return_bool = bin.return_bool();
            let mut matching = VectorMatching::default();
            if let Some(modifier) = bin.modifier {
                match modifier.matching {
                    Some(LabelModifier::Include(labels)) => {
                        matching.on = true;
                        matching.matching_labels = labels.labels;
                    }
                    Some(LabelModifier::Exclude(labels)) => {
                        matching.matching_labels = labels.labels;
                    }
                    None => {}
                }
                matching.card = match modifier.card {
                    VectorMatchCardinality::OneToOne => MatchCardinality::OneToOne,
                    VectorMatchCardinality::ManyToOne(labels) => {
                        matching.include = labels.labels;
                        MatchCardinality::ManyToOne
                    }
                    VectorMatchCardinality::OneToMany(labels) => {
                        matching.include = labels.labels;
                        MatchCardinality::OneToMany
                    }
                    VectorMatchCardinality::ManyToMany => MatchCardinality::ManyToMany,
                };
            }
            if op.is_set_operator() {
                matching.card = MatchCardinality::ManyToMany;
            }
            Ok(Expr::Binary(BinaryExpr {
                op,
                lhs: Box::new(convert(*bin.lhs)?),
                rhs: Box::new(convert(*bin.rhs)?),
                matching,
                return_bool,
            }))
        }
        ParserExpr::Aggregate(agg) => {
            let op = convert_aggregate_op(agg.op.id())?;
            let (grouping, without) = match agg.modifier {
                Some(LabelModifier::Include(labels)) => (labels.labels, false),
                Some(LabelModifier::Exclude(labels)) => (labels.labels, true),
                None => (Vec::new(), false),
            };
            let param = match agg.param {
                Some(param) => Some(Box::new(convert(*param)?)),
                None => None,
            };
            Ok(Expr::Aggregate(AggregateExpr {
                op,
                expr: Box::new(convert(*agg.expr)?),
                param,
                grouping,
                without,
            }))
        }
        ParserExpr::Subquery(_) => Err(QueryError::bad_data("subqueries are not supported")),
        ParserExpr::Extension(_) => Err(QueryError::bad_data(
            "parser extensions are not supported",
        )),
    }
}

fn convert_selector(vs: ParserVectorSelector) -> Result<VectorSelector, QueryError> {
    let matchers = vs
        .matchers
        .matchers
        .iter()
        .map(convert_matcher)
        .collect::<Result<Vec<_>, _>>()?;
    let mut selector = VectorSelector::new(vs.name, matchers);
    selector.offset = match vs.offset {
        Some(Offset::Pos(d)) => duration_ms(d),
        Some(Offset::Neg(d)) => -duration_ms(d),
        None => 0,
    };
    selector.at = match vs.at {
        Some(ParserAtModifier::Start) => Some(AtModifier::Start),
        Some(ParserAtModifier::End) => Some(AtModifier::End),
        Some(ParserAtModifier::At(t)) => Some(AtModifier::At(system_time_ms(t))),
        None => None,
    };
    Ok(selector)
}

fn convert_matcher(matcher: &ParserMatcher) -> Result<Matcher, QueryError> {
    let op = match &matcher.op {
        ParserMatchOp::Equal => MatchOp::Equal,
        ParserMatchOp::NotEqual => MatchOp::NotEqual,
        ParserMatchOp::Re(_) => MatchOp::Regex,
        ParserMatchOp::NotRe(_) => MatchOp::NotRegex,
    };
    Matcher::new(op, matcher.name.clone(), matcher.value.clone())
}

fn convert_binary_op(id: TokenId) -> Result<BinaryOp, QueryError> {
    let op = match id {
        T_ADD => BinaryOp::Add,
        T_SUB => BinaryOp::Sub,
        T_MUL => BinaryOp::Mul,
        T_DIV => BinaryOp::Div,
        T_MOD => BinaryOp::Mod,
        T_POW => BinaryOp::Pow,
        T_EQLC => BinaryOp::Eql,
        T_NEQ => BinaryOp::Neq,
        T_GTR => BinaryOp::Gtr,
        T_LSS => BinaryOp::Lss,
        T_GTE => BinaryOp::Gte,
        T_LTE => BinaryOp::Lte,
        T_LAND => BinaryOp::And,
        T_LOR => BinaryOp::Or,
        T_LUNLESS => BinaryOp::Unless,
        other => {
            return Err(QueryError::bad_data(format!(
                "unsupported binary operator {}",
                TokenType::new(other)
            )));
        }
    };
    Ok(op)
}

fn convert_aggregate_op(id: TokenId) -> Result<AggregateOp, QueryError> {
    let op = match id {
        T_SUM => AggregateOp::Sum,
        T_AVG => AggregateOp::Avg,
        T_COUNT => AggregateOp::Count,
        T_MIN => AggregateOp::Min,
        T_MAX => AggregateOp::Max,
        T_TOPK => AggregateOp::Topk,
        T_BOTTOMK => AggregateOp::Bottomk,
        other => {
            return Err(QueryError::bad_data(format!(
                "aggregation '{}' is not currently supported",
                TokenType::new(other)
            )));
        }
    };
    Ok(op)
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis() as i64
}

fn system_time_ms(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => duration_ms(d),
        Err(e) => -duration_ms(e.duration()),
    }
}
