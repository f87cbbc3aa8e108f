//! Typed inclusion predicates.
//!
//! Each account stores the rule deciding which products belong on its
//! channel as a small expression tree, serialized to JSON. The tree is
//! validated when the account is saved, so evaluation failures at sync time
//! are configuration bugs, not user input.
//!
//! The catalog's `active` flag is not a predicate field: the membership
//! evaluator always computes `predicate && product.active`, as a fixed
//! conjunctive term no account rule can leave out.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Product;

#[derive(Debug, Error)]
pub enum PredicateError {
    #[error("invalid regex `{pattern}`: {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("operator `{0}` requires a value")]
    MissingValue(&'static str),
}

/// Product fields a predicate may inspect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Sku,
    CategoryTrail,
    FamilyKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ne,
    Contains,
    Matches,
    IsSet,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Contains => "contains",
            Op::Matches => "matches",
            Op::IsSet => "is_set",
        }
    }
}

/// Inclusion rule over product attributes.
///
/// JSON shapes: `{"all": [..]}`, `{"any": [..]}`, `{"not": ..}` and the leaf
/// `{"field": "name", "op": "eq", "value": "product"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Predicate {
    All {
        all: Vec<Predicate>,
    },
    Any {
        any: Vec<Predicate>,
    },
    Not {
        not: Box<Predicate>,
    },
    Cmp {
        field: Field,
        op: Op,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
}

impl Predicate {
    /// Matches everything.
    pub fn everything() -> Self {
        Predicate::All { all: Vec::new() }
    }

    /// Walk the tree, compiling regexes and checking that operators have the
    /// values they need. Called when an account is saved.
    pub fn validate(&self) -> Result<(), PredicateError> {
        match self {
            Predicate::All { all } => all.iter().try_for_each(Predicate::validate),
            Predicate::Any { any } => any.iter().try_for_each(Predicate::validate),
            Predicate::Not { not } => not.validate(),
            Predicate::Cmp { op, value, .. } => match (op, value) {
                (Op::IsSet, _) => Ok(()),
                (Op::Matches, Some(pattern)) => match Regex::new(pattern) {
                    Ok(_) => Ok(()),
                    Err(source) => Err(PredicateError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    }),
                },
                (_, Some(_)) => Ok(()),
                (op, None) => Err(PredicateError::MissingValue(op.as_str())),
            },
        }
    }

    pub fn eval(&self, product: &Product) -> Result<bool, PredicateError> {
        match self {
            Predicate::All { all } => {
                for p in all {
                    if !p.eval(product)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any { any } => {
                for p in any {
                    if p.eval(product)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not { not } => Ok(!not.eval(product)?),
            Predicate::Cmp { field, op, value } => eval_cmp(product, *field, *op, value.as_deref()),
        }
    }
}

fn field_value<'a>(product: &'a Product, field: Field) -> Option<&'a str> {
    match field {
        Field::Name => Some(product.name.as_str()),
        Field::Sku => product.sku.as_deref(),
        Field::CategoryTrail => product.category_trail.as_deref(),
        Field::FamilyKey => product.family_key.as_deref(),
    }
}

fn eval_cmp(
    product: &Product,
    field: Field,
    op: Op,
    value: Option<&str>,
) -> Result<bool, PredicateError> {
    let actual = field_value(product, field);
    match op {
        Op::IsSet => Ok(actual.is_some_and(|v| !v.is_empty())),
        Op::Eq => {
            let wanted = value.ok_or(PredicateError::MissingValue("eq"))?;
            Ok(actual == Some(wanted))
        }
        Op::Ne => {
            let wanted = value.ok_or(PredicateError::MissingValue("ne"))?;
            Ok(actual != Some(wanted))
        }
        Op::Contains => {
            let wanted = value.ok_or(PredicateError::MissingValue("contains"))?;
            Ok(actual.is_some_and(|v| v.contains(wanted)))
        }
        Op::Matches => {
            let pattern = value.ok_or(PredicateError::MissingValue("matches"))?;
            let re = Regex::new(pattern).map_err(|source| PredicateError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;
            Ok(actual.is_some_and(|v| re.is_match(v)))
        }
    }
}
