//! Filter expression trees
//!
//! Mirrors the provider's filter grammar: leaf `filter` nodes combined with
//! `andGroup` / `orGroup` lists or wrapped in `notExpression`.

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::hash::canonical_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterExpression {
    AndGroup(FilterExpressionList),
    OrGroup(FilterExpressionList),
    NotExpression(Box<FilterExpression>),
    Filter(Filter),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterExpressionList {
    #[serde(default)]
    pub expressions: Vec<FilterExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub field_name: String,
    #[serde(flatten)]
    pub condition: FilterCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterCondition {
    StringFilter(StringFilter),
    InListFilter(InListFilter),
    NumericFilter(NumericFilter),
    BetweenFilter(BetweenFilter),
    EmptyFilter(EmptyFilter),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
    pub value: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InListFilter {
    pub values: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericFilter {
    pub operation: String,
    pub value: NumericValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetweenFilter {
    pub from_value: NumericValue,
    pub to_value: NumericValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyFilter {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NumericValue {
    Int64Value(String),
    DoubleValue(f64),
}

/// Size of an expression tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Complexity {
    pub depth: usize,
    pub nodes: usize,
}

impl FilterExpression {
    pub fn leaf(field_name: &str, condition: FilterCondition) -> Self {
        FilterExpression::Filter(Filter {
            field_name: field_name.to_string(),
            condition,
        })
    }

    pub fn and(expressions: Vec<FilterExpression>) -> Self {
        FilterExpression::AndGroup(FilterExpressionList { expressions })
    }

    pub fn or(expressions: Vec<FilterExpression>) -> Self {
        FilterExpression::OrGroup(FilterExpressionList { expressions })
    }

    pub fn not(expression: FilterExpression) -> Self {
        FilterExpression::NotExpression(Box::new(expression))
    }

    /// Measure depth and node count, stopping early once either bound is exceeded.
    ///
    /// A lone leaf has depth 1; each enclosing group or negation adds one.
    pub fn check_complexity(&self, max_depth: usize, max_nodes: usize) -> Result<Complexity> {
        let mut stack: Vec<(&FilterExpression, usize)> = vec![(self, 1)];
        let mut stats = Complexity { depth: 0, nodes: 0 };

        while let Some((node, depth)) = stack.pop() {
            stats.nodes += 1;
            stats.depth = stats.depth.max(depth);
            if stats.depth > max_depth || stats.nodes > max_nodes {
                return Err(QueryError::FilterTooComplex {
                    depth: stats.depth,
                    nodes: stats.nodes,
                    max_depth,
                    max_nodes,
                });
            }
            match node {
                FilterExpression::AndGroup(list) | FilterExpression::OrGroup(list) => {
                    stack.extend(list.expressions.iter().map(|child| (child, depth + 1)));
                }
                FilterExpression::NotExpression(inner) => stack.push((inner, depth + 1)),
                FilterExpression::Filter(_) => {}
            }
        }

        Ok(stats)
    }

    /// Depth-first list of every field name referenced by a leaf.
    pub fn field_names(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            FilterExpression::AndGroup(list) | FilterExpression::OrGroup(list) => {
                for child in &list.expressions {
                    child.collect_fields(out);
                }
            }
            FilterExpression::NotExpression(inner) => inner.collect_fields(out),
            FilterExpression::Filter(filter) => out.push(filter.field_name.as_str()),
        }
    }

    /// Structural checks that do not depend on the property schema.
    pub fn check_shape(&self) -> Result<()> {
        match self {
            FilterExpression::AndGroup(list) | FilterExpression::OrGroup(list) => {
                if list.expressions.is_empty() {
                    return Err(QueryError::validation("filter group has no expressions"));
                }
                list.expressions.iter().try_for_each(|e| e.check_shape())
            }
            FilterExpression::NotExpression(inner) => inner.check_shape(),
            FilterExpression::Filter(filter) => {
                if filter.field_name.trim().is_empty() {
                    return Err(QueryError::validation("filter is missing fieldName"));
                }
                if let FilterCondition::InListFilter(list) = &filter.condition {
                    if list.values.is_empty() {
                        return Err(QueryError::validation(format!(
                            "inListFilter on '{}' has no values",
                            filter.field_name
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Order-independent form: group members and in-list values are sorted.
    pub fn canonicalize(&self) -> FilterExpression {
        match self {
            FilterExpression::AndGroup(list) => FilterExpression::AndGroup(canonical_list(list)),
            FilterExpression::OrGroup(list) => FilterExpression::OrGroup(canonical_list(list)),
            FilterExpression::NotExpression(inner) => {
                FilterExpression::NotExpression(Box::new(inner.canonicalize()))
            }
            FilterExpression::Filter(filter) => {
                let condition = match &filter.condition {
                    FilterCondition::InListFilter(list) => {
                        let mut values = list.values.clone();
                        values.sort();
                        values.dedup();
                        FilterCondition::InListFilter(InListFilter {
                            values,
                            case_sensitive: list.case_sensitive,
                        })
                    }
                    other => other.clone(),
                };
                FilterExpression::Filter(Filter {
                    field_name: filter.field_name.clone(),
                    condition,
                })
            }
        }
    }
}

fn canonical_list(list: &FilterExpressionList) -> FilterExpressionList {
    let mut keyed: Vec<(String, FilterExpression)> = list
        .expressions
        .iter()
        .map(|child| {
            let canonical = child.canonicalize();
            let key = serde_json::to_value(&canonical)
                .map(|v| canonical_json(&v))
                .unwrap_or_default();
            (key, canonical)
        })
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    FilterExpressionList {
        expressions: keyed.into_iter().map(|(_, e)| e).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exact(field: &str, value: &str) -> FilterExpression {
        FilterExpression::leaf(
            field,
            FilterCondition::StringFilter(StringFilter {
                match_type: Some("EXACT".into()),
                value: value.into(),
                case_sensitive: false,
            }),
        )
    }

    fn nested_and(levels: usize) -> FilterExpression {
        let mut expr = exact("country", "ID");
        for _ in 0..levels {
            expr = FilterExpression::and(vec![expr]);
        }
        expr
    }

    #[test]
    fn parses_provider_grammar() {
        let expr: FilterExpression = serde_json::from_value(json!({
            "andGroup": { "expressions": [
                { "filter": { "fieldName": "country", "stringFilter": { "matchType": "EXACT", "value": "ID" } } },
                { "notExpression": { "filter": { "fieldName": "city", "inListFilter": { "values": ["Jakarta"] } } } },
                { "filter": { "fieldName": "sessions", "numericFilter": { "operation": "GREATER_THAN", "value": { "int64Value": "10" } } } }
            ]}
        }))
        .unwrap();

        assert_eq!(expr.field_names(), vec!["country", "city", "sessions"]);
        let stats = expr.check_complexity(8, 50).unwrap();
        assert_eq!(stats, Complexity { depth: 3, nodes: 5 });
    }

    #[test]
    fn nine_nested_groups_exceed_depth_eight() {
        let expr = nested_and(9);
        let err = expr.check_complexity(8, 50).unwrap_err();
        assert!(matches!(err, QueryError::FilterTooComplex { max_depth: 8, .. }));
    }

    #[test]
    fn node_count_is_bounded() {
        let expr = FilterExpression::or((0..10).map(|i| exact("city", &i.to_string())).collect());
        assert!(expr.check_complexity(8, 11).is_ok());
        assert!(matches!(
            expr.check_complexity(8, 10),
            Err(QueryError::FilterTooComplex { .. })
        ));
    }

    #[test]
    fn canonical_form_ignores_member_order() {
        let a = FilterExpression::and(vec![exact("country", "ID"), exact("city", "Bandung")]);
        let b = FilterExpression::and(vec![exact("city", "Bandung"), exact("country", "ID")]);
        assert_ne!(a, b);
        assert_eq!(a.canonicalize(), b.canonicalize());
    }

    #[test]
    fn canonical_form_sorts_in_list_values() {
        let list = |values: &[&str]| {
            FilterExpression::leaf(
                "city",
                FilterCondition::InListFilter(InListFilter {
                    values: values.iter().map(|v| v.to_string()).collect(),
                    case_sensitive: false,
                }),
            )
        };
        assert_eq!(
            list(&["b", "a", "b"]).canonicalize(),
            list(&["a", "b"]).canonicalize()
        );
    }

    #[test]
    fn empty_group_is_rejected() {
        let expr = FilterExpression::and(vec![]);
        assert!(matches!(expr.check_shape(), Err(QueryError::Validation { .. })));
    }
}
