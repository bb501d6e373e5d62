//! Condition cases: named predicates over block contents, combined left to right.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::model::{BlockId, EdgeId, is_filled};

/// Operation token that must close every case's operation list.
pub const SENTINEL: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    IsEmpty,
    IsNotEmpty,
    Contain,
    NotContain,
    GreaterThanNChars,
    LessThanNChars,
    Is,
    IsNot,
    IsList,
    IsDict,
    GreaterThanN,
    LessThanN,
}

impl FromStr for Predicate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "is_empty" => Predicate::IsEmpty,
            "is_not_empty" => Predicate::IsNotEmpty,
            "contain" => Predicate::Contain,
            "not_contain" => Predicate::NotContain,
            "greater_than_n_chars" => Predicate::GreaterThanNChars,
            "less_than_n_chars" => Predicate::LessThanNChars,
            "is" => Predicate::Is,
            "is_not" => Predicate::IsNot,
            "is_list" => Predicate::IsList,
            "is_dict" => Predicate::IsDict,
            "greater_than_n" => Predicate::GreaterThanN,
            "less_than_n" => Predicate::LessThanN,
            other => return Err(ConfigError::UnsupportedPredicate(other.to_string())),
        })
    }
}

impl Predicate {
    /// Apply to a block's content (`None` when the block is missing). Never fails.
    pub fn test(&self, content: Option<&Value>, param: &Value) -> bool {
        match self {
            Predicate::IsEmpty => content.is_none_or(|v| !is_filled(v)),
            Predicate::IsNotEmpty => content.is_some_and(is_filled),
            Predicate::Contain => content.is_some_and(|v| contains(v, param)),
            Predicate::NotContain => content.is_some_and(|v| {
                matches!(v, Value::String(_) | Value::Array(_) | Value::Object(_))
                    && !contains(v, param)
            }),
            Predicate::GreaterThanNChars => {
                matches!((content.and_then(length), as_count(param)), (Some(len), Some(n)) if len > n)
            }
            Predicate::LessThanNChars => {
                matches!((content.and_then(length), as_count(param)), (Some(len), Some(n)) if len < n)
            }
            Predicate::Is => content.is_some_and(|v| equals(v, param)),
            Predicate::IsNot => !content.is_some_and(|v| equals(v, param)),
            Predicate::IsList => content.is_some_and(Value::is_array),
            Predicate::IsDict => content.is_some_and(Value::is_object),
            Predicate::GreaterThanN => {
                matches!((content.and_then(as_number), as_number(param)), (Some(a), Some(b)) if a > b)
            }
            Predicate::LessThanN => {
                matches!((content.and_then(as_number), as_number(param)), (Some(a), Some(b)) if a < b)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    And,
    Or,
}

fn parse_ops(operations: &[String], conditions: usize) -> Result<Vec<Op>, ConfigError> {
    if conditions == 0 {
        return Err(ConfigError::EmptyCase);
    }
    if operations.len() != conditions {
        return Err(ConfigError::OperationCountMismatch {
            conditions,
            operations: operations.len(),
        });
    }
    let (last, joins) = operations
        .split_last()
        .ok_or(ConfigError::EmptyCase)?;
    if last.trim() != SENTINEL {
        return Err(ConfigError::MisplacedSentinel(last.clone()));
    }
    joins
        .iter()
        .map(|op| match op.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(Op::And),
            "or" => Ok(Op::Or),
            SENTINEL => Err(ConfigError::MisplacedSentinel(op.clone())),
            other => Err(ConfigError::UnsupportedOperator(other.to_string())),
        })
        .collect()
}

/// One predicate over one block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub block: BlockId,
    pub condition: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default = "default_operation")]
    pub operation: String,
}

fn default_operation() -> String {
    SENTINEL.to_string()
}

impl Condition {
    /// `parameters.value`, or the parameters themselves when given as a scalar.
    pub fn parameter(&self) -> &Value {
        match &self.parameters {
            Value::Object(map) => map.get("value").unwrap_or(&Value::Null),
            other => other,
        }
    }
}

/// Copy `from`'s content into `to` when the case holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub from: BlockId,
    pub to: BlockId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub then: Redirect,
}

impl Case {
    pub fn operations(&self) -> Vec<String> {
        self.conditions.iter().map(|c| c.operation.clone()).collect()
    }

    /// Checks predicates and operators without evaluating anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for condition in &self.conditions {
            condition.condition.parse::<Predicate>()?;
        }
        parse_ops(&self.operations(), self.conditions.len()).map(|_| ())
    }

    /// Returns the redirect when the case is satisfied.
    pub fn evaluate(&self, contents: &BTreeMap<BlockId, Value>) -> Result<Option<&Redirect>, ConfigError> {
        let satisfied = evaluate_case(contents, &self.conditions, &self.operations())?;
        Ok(satisfied.then_some(&self.then))
    }
}

/// Evaluate `conditions` against `contents`, folding strictly left to right with `operations`.
pub fn evaluate_case(
    contents: &BTreeMap<BlockId, Value>,
    conditions: &[Condition],
    operations: &[String],
) -> Result<bool, ConfigError> {
    let predicates = conditions
        .iter()
        .map(|c| c.condition.parse::<Predicate>())
        .collect::<Result<Vec<_>, _>>()?;
    let ops = parse_ops(operations, conditions.len())?;

    let mut results = conditions
        .iter()
        .zip(&predicates)
        .map(|(c, p)| p.test(contents.get(&c.block), c.parameter()));
    let mut acc = results.next().unwrap_or(false);
    for (op, value) in ops.iter().zip(results) {
        acc = match op {
            Op::And => acc && value,
            Op::Or => acc || value,
        };
    }
    Ok(acc)
}

/// Parse the `cases` field of a condition edge, keeping declaration order.
pub fn parse_cases(edge_id: &EdgeId, value: &Value) -> Result<Vec<(String, Case)>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidField {
        edge_id: edge_id.clone(),
        field: "cases".into(),
        message,
    };
    let entries: Vec<(String, &Value)> = match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("case_{}", i + 1), v))
            .collect(),
        Value::Null => Vec::new(),
        other => return Err(invalid(format!("expected a map of cases, got {other}"))),
    };
    entries
        .into_iter()
        .map(|(name, raw)| {
            let case: Case = serde_json::from_value(raw.clone())
                .map_err(|e| invalid(format!("case {name}: {e}")))?;
            case.validate()?;
            Ok((name, case))
        })
        .collect()
}

fn text_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn contains(content: &Value, param: &Value) -> bool {
    if param.is_null() {
        return false;
    }
    match content {
        Value::String(s) => s.contains(text_form(param).as_str()),
        Value::Array(items) => items
            .iter()
            .any(|item| item == param || (item.is_string() && text_form(item) == text_form(param))),
        Value::Object(map) => map.contains_key(text_form(param).as_str()),
        _ => false,
    }
}

fn equals(content: &Value, param: &Value) -> bool {
    content == param || text_form(content) == text_form(param)
}

fn length(content: &Value) -> Option<usize> {
    match content {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_count(value: &Value) -> Option<usize> {
    as_number(value).filter(|n| *n >= 0.0).map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(block: &str, predicate: &str, param: Value) -> Condition {
        Condition {
            block: block.into(),
            condition: predicate.into(),
            parameters: json!({ "value": param }),
            operation: SENTINEL.into(),
        }
    }

    fn ops(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    fn contents() -> BTreeMap<BlockId, Value> {
        BTreeMap::from([
            ("empty".to_string(), json!("")),
            ("word".to_string(), json!("hello world")),
            ("list".to_string(), json!(["a", 1])),
            ("map".to_string(), json!({ "k": 1 })),
            ("num".to_string(), json!("42")),
        ])
    }

    #[test]
    fn fold_is_left_to_right() {
        let c = contents();
        let a_false = cond("word", "is_empty", Value::Null);
        let b_true = cond("empty", "is_empty", Value::Null);
        let conditions = [a_false, b_true];
        assert!(!evaluate_case(&c, &conditions, &ops(&["and", "/"])).unwrap());
        assert!(evaluate_case(&c, &conditions, &ops(&["or", "/"])).unwrap());
    }

    #[test]
    fn no_precedence_between_and_and_or() {
        // (true or false) and false == false; with precedence it would be true.
        let c = contents();
        let t = cond("word", "is_not_empty", Value::Null);
        let f = cond("word", "is_empty", Value::Null);
        let conditions = [t, f.clone(), f];
        assert!(!evaluate_case(&c, &conditions, &ops(&["or", "and", "/"])).unwrap());
    }

    #[test]
    fn malformed_operations_are_config_errors() {
        let c = contents();
        let one = [cond("word", "is_empty", Value::Null)];
        let two = [one[0].clone(), one[0].clone()];
        assert!(matches!(
            evaluate_case(&c, &two, &ops(&["and"])),
            Err(ConfigError::OperationCountMismatch { conditions: 2, operations: 1 })
        ));
        assert!(matches!(
            evaluate_case(&c, &two, &ops(&["xor", "/"])),
            Err(ConfigError::UnsupportedOperator(op)) if op == "xor"
        ));
        assert!(matches!(
            evaluate_case(&c, &two, &ops(&["and", "and"])),
            Err(ConfigError::MisplacedSentinel(_))
        ));
        assert!(matches!(
            evaluate_case(&c, &two, &ops(&["/", "/"])),
            Err(ConfigError::MisplacedSentinel(_))
        ));
        assert!(matches!(
            evaluate_case(&c, &[], &[]),
            Err(ConfigError::EmptyCase)
        ));
        let bad = [cond("word", "starts_with", json!("h"))];
        assert!(matches!(
            evaluate_case(&c, &bad, &ops(&["/"])),
            Err(ConfigError::UnsupportedPredicate(_))
        ));
    }

    #[test]
    fn predicates_return_false_on_type_mismatch() {
        let c = contents();
        let check = |block: &str, predicate: &str, param: Value| {
            evaluate_case(&c, &[cond(block, predicate, param)], &ops(&["/"])).unwrap()
        };
        assert!(check("word", "contain", json!("world")));
        assert!(check("list", "contain", json!("a")));
        assert!(check("list", "contain", json!(1)));
        assert!(check("map", "contain", json!("k")));
        assert!(check("word", "not_contain", json!("xyz")));
        assert!(!check("num", "greater_than_n_chars", json!("abc")));
        assert!(check("word", "greater_than_n_chars", json!(5)));
        assert!(check("list", "less_than_n_chars", json!(3)));
        assert!(check("num", "greater_than_n", json!(41)));
        assert!(!check("word", "greater_than_n", json!(1)));
        assert!(check("num", "is", json!(42)));
        assert!(check("word", "is_not", json!("hello")));
        assert!(check("list", "is_list", Value::Null));
        assert!(check("map", "is_dict", Value::Null));
        assert!(!check("word", "is_dict", Value::Null));
        assert!(check("missing", "is_empty", Value::Null));
        assert!(!check("missing", "not_contain", json!("x")));
    }

    #[test]
    fn parse_cases_keeps_declaration_order_and_validates() {
        let raw = json!({
            "z_first": {
                "conditions": [{ "block": "b1", "condition": "is_empty", "parameters": {}, "operation": "/" }],
                "then": { "from": "b2", "to": "b3" }
            },
            "a_second": {
                "conditions": [{ "block": "b1", "condition": "is_not_empty", "parameters": {}, "operation": "/" }],
                "then": { "from": "b1", "to": "b3" }
            }
        });
        let cases = parse_cases(&"e1".to_string(), &raw).unwrap();
        let names: Vec<_> = cases.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["z_first", "a_second"]);

        let broken = json!({ "c": { "conditions": [], "then": { "from": "b1", "to": "b2" } } });
        assert!(matches!(
            parse_cases(&"e1".to_string(), &broken),
            Err(ConfigError::EmptyCase)
        ));
    }

    #[test]
    fn case_evaluate_returns_redirect_when_satisfied() {
        let c = contents();
        let case = Case {
            conditions: vec![cond("word", "contain", json!("hello"))],
            then: Redirect {
                from: "word".into(),
                to: "out".into(),
            },
        };
        assert_eq!(case.evaluate(&c).unwrap().map(|r| r.to.as_str()), Some("out"));
    }
}
