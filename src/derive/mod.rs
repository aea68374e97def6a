//! Derived registers
//!
//! The [`Evaluator`] is compiled once per device: source references are
//! resolved, derived registers are put in dependency order (cycles are
//! rejected) and formulas are parsed into an [`Expr`] tree. Each pass then
//! walks that fixed order against the device's value store.

pub mod expr;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

use crate::decode::{round_to, Value};
use crate::error::ConfigError;
use crate::register::{Derivation, Predicate, RegisterDescriptor, Sign};
use crate::store::{Status, ValueStore};

pub use expr::{Expr, ParseError};

#[derive(Debug, Clone)]
enum Rule {
    Sum(Vec<String>),
    Split {
        source: String,
        when: Predicate,
        sign: Sign,
    },
    Formula {
        sources: Vec<String>,
        /// `None` when the expression failed to parse.
        expr: Option<Expr>,
    },
    Map {
        source: String,
        table: HashMap<i64, String>,
        fallback: String,
    },
}

#[derive(Debug, Clone)]
struct Step {
    name: String,
    rule: Rule,
    precision: Option<u32>,
}

/// Result of evaluating one derived register.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value { value: Value, stale: bool },
    Unavailable,
}

#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    steps: Vec<Step>,
}

impl Evaluator {
    /// Resolve, order and parse every derived register of a device.
    pub fn compile(registers: &[RegisterDescriptor]) -> Result<Self, ConfigError> {
        let known: HashSet<&str> = registers.iter().map(|r| r.name.as_str()).collect();
        let derived: Vec<(&RegisterDescriptor, &Derivation)> = registers
            .iter()
            .filter_map(|r| r.derivation().map(|d| (r, d)))
            .collect();

        for (register, derivation) in &derived {
            for source in derivation.sources() {
                if !known.contains(source) {
                    return Err(ConfigError::UnknownSource {
                        name: register.name.clone(),
                        source_name: source.to_string(),
                    });
                }
            }
        }

        let order = topological_order(&derived)?;
        let mut steps = Vec::with_capacity(order.len());
        for index in order {
            let (register, derivation) = derived[index];
            steps.push(Step {
                name: register.name.clone(),
                rule: compile_rule(&register.name, derivation)?,
                precision: register.format.precision,
            });
        }
        Ok(Self { steps })
    }

    /// Derived register names in evaluation order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Evaluate every derived register in order, writing results to `store`.
    /// Returns the names whose entry changed.
    pub fn evaluate(&self, store: &mut ValueStore) -> Vec<String> {
        let mut changed = Vec::new();
        for step in &self.steps {
            let updated = match step.evaluate(store) {
                Outcome::Value { value, stale: false } => store.set_fresh(&step.name, value),
                Outcome::Value { value, stale: true } => store.set_stale(&step.name, value),
                Outcome::Unavailable => {
                    debug!("Derived register {} is unavailable", step.name);
                    store.mark_unavailable(&step.name)
                }
            };
            if updated {
                changed.push(step.name.clone());
            }
        }
        changed
    }
}

fn compile_rule(name: &str, derivation: &Derivation) -> Result<Rule, ConfigError> {
    Ok(match derivation {
        Derivation::Sum(sources) => Rule::Sum(sources.clone()),
        Derivation::Split { source, when, sign } => Rule::Split {
            source: source.clone(),
            when: *when,
            sign: *sign,
        },
        Derivation::Formula {
            sources,
            expression,
        } => {
            let expr = match Expr::parse(expression, sources) {
                Ok(expr) => Some(expr),
                Err(e) => {
                    warn!("Formula for {} does not parse, register stays unavailable: {}", name, e);
                    None
                }
            };
            Rule::Formula {
                sources: sources.clone(),
                expr,
            }
        }
        Derivation::Map {
            source,
            table,
            fallback,
        } => {
            let mut parsed = HashMap::with_capacity(table.len());
            for (key, label) in table {
                let number = parse_key(key).ok_or_else(|| ConfigError::InvalidMapKey {
                    name: name.to_string(),
                    key: key.clone(),
                })?;
                parsed.insert(number, label.clone());
            }
            Rule::Map {
                source: source.clone(),
                table: parsed,
                fallback: fallback.clone(),
            }
        }
    })
}

fn parse_key(key: &str) -> Option<i64> {
    let key = key.trim();
    match key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => key.parse().ok(),
    }
}

/// Kahn's algorithm over derived registers only; direct registers have no
/// incoming edges and are always ready.
fn topological_order(derived: &[(&RegisterDescriptor, &Derivation)]) -> Result<Vec<usize>, ConfigError> {
    let index: HashMap<&str, usize> = derived
        .iter()
        .enumerate()
        .map(|(i, (r, _))| (r.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; derived.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); derived.len()];
    for (i, (_, derivation)) in derived.iter().enumerate() {
        let inputs: BTreeSet<usize> = derivation
            .sources()
            .into_iter()
            .filter_map(|s| index.get(s).copied())
            .collect();
        for input in inputs {
            in_degree[i] += 1;
            dependents[input].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..derived.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(derived.len());
    while let Some(next) = ready.pop_front() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() < derived.len() {
        let mut cycle: Vec<String> = (0..derived.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| derived[i].0.name.clone())
            .collect();
        cycle.sort();
        return Err(ConfigError::DerivationCycle(cycle));
    }
    Ok(order)
}

/// Numeric input: `None` if unavailable, otherwise the value and whether it is stale.
fn numeric_input(store: &ValueStore, name: &str) -> Option<(f64, bool)> {
    match store.status(name)? {
        Status::Unavailable => None,
        status => store
            .value(name)
            .and_then(Value::as_f64)
            .map(|v| (v, status == Status::Stale)),
    }
}

impl Step {
    fn evaluate(&self, store: &ValueStore) -> Outcome {
        match &self.rule {
            Rule::Sum(sources) => {
                let mut total = 0.0;
                let mut stale = false;
                for source in sources {
                    let Some((value, is_stale)) = numeric_input(store, source) else {
                        return Outcome::Unavailable;
                    };
                    total += value;
                    stale |= is_stale;
                }
                self.number(total, stale)
            }
            Rule::Split { source, when, sign } => match numeric_input(store, source) {
                Some((value, stale)) => {
                    let picked = if when.holds(value) { value } else { 0.0 };
                    let picked = match sign {
                        Sign::Keep => picked,
                        Sign::Absolute => picked.abs(),
                    };
                    self.number(picked, stale)
                }
                None => Outcome::Unavailable,
            },
            Rule::Formula { sources, expr } => {
                let Some(expr) = expr else {
                    return Outcome::Unavailable;
                };
                let mut values = Vec::with_capacity(sources.len());
                let mut stale = false;
                for source in sources {
                    let Some((value, is_stale)) = numeric_input(store, source) else {
                        return Outcome::Unavailable;
                    };
                    values.push(value);
                    stale |= is_stale;
                }
                match expr.eval(&values) {
                    Some(result) => self.number(result, stale),
                    None => Outcome::Unavailable,
                }
            }
            Rule::Map {
                source,
                table,
                fallback,
            } => {
                let status = store.status(source);
                let key = match status {
                    Some(Status::Fresh | Status::Stale) => store.value(source).and_then(Value::as_i64),
                    _ => None,
                };
                let label = key
                    .and_then(|k| table.get(&k))
                    .unwrap_or(fallback)
                    .clone();
                Outcome::Value {
                    value: Value::Text(label),
                    stale: status == Some(Status::Stale),
                }
            }
        }
    }

    fn number(&self, value: f64, stale: bool) -> Outcome {
        if !value.is_finite() {
            return Outcome::Unavailable;
        }
        let value = match self.precision {
            Some(decimals) => round_to(value, decimals),
            None => value,
        };
        Outcome::Value {
            value: Value::Float(value),
            stale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{Bank, Encoding, Format};
    use std::collections::BTreeMap;

    fn direct(name: &str, address: u16) -> RegisterDescriptor {
        RegisterDescriptor::direct(name, address, Bank::ReadOnly, Format::new(Encoding::Int, 16))
    }

    fn sum(name: &str, sources: &[&str]) -> RegisterDescriptor {
        RegisterDescriptor::derived(name, Derivation::Sum(sources.iter().map(|s| s.to_string()).collect()))
    }

    fn formula(name: &str, sources: &[&str], expression: &str) -> RegisterDescriptor {
        RegisterDescriptor::derived(
            name,
            Derivation::Formula {
                sources: sources.iter().map(|s| s.to_string()).collect(),
                expression: expression.to_string(),
            },
        )
    }

    fn map(name: &str, source: &str, entries: &[(&str, &str)]) -> RegisterDescriptor {
        let table: BTreeMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RegisterDescriptor::derived(
            name,
            Derivation::Map {
                source: source.to_string(),
                table,
                fallback: "unknown".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_sum_with_unavailable_source_is_unavailable() {
        let registers = vec![direct("a", 0), direct("b", 1), sum("total", &["a", "b"])];
        let evaluator = Evaluator::compile(&registers).unwrap();
        let mut store = ValueStore::new(&registers);
        store.set_fresh("a", Value::Float(5.0));
        store.mark_stale("a");

        evaluator.evaluate(&mut store);
        assert_eq!(store.status("total"), Some(Status::Unavailable));

        store.set_fresh("b", Value::Int(2));
        evaluator.evaluate(&mut store);
        let total = store.get("total").unwrap();
        assert_eq!(total.value, Some(Value::Float(7.0)));
        assert_eq!(total.status, Status::Stale);
    }

    #[tokio::test]
    async fn test_value_map_lookup_and_fallback() {
        let registers = vec![
            direct("mode", 0),
            map("mode_label", "mode", &[("0x00AA", "Enabled"), ("0x0055", "Disabled")]),
        ];
        let evaluator = Evaluator::compile(&registers).unwrap();
        let mut store = ValueStore::new(&registers);

        evaluator.evaluate(&mut store);
        assert_eq!(store.value("mode_label"), Some(&Value::Text("unknown".into())));

        store.set_fresh("mode", Value::UInt(0x0055));
        evaluator.evaluate(&mut store);
        assert_eq!(store.value("mode_label"), Some(&Value::Text("Disabled".into())));
        assert_eq!(store.status("mode_label"), Some(Status::Fresh));

        store.set_fresh("mode", Value::UInt(7));
        evaluator.evaluate(&mut store);
        assert_eq!(store.value("mode_label"), Some(&Value::Text("unknown".into())));
    }

    #[tokio::test]
    async fn test_split_by_sign() {
        let registers = vec![
            direct("battery", 0),
            RegisterDescriptor::derived(
                "charge",
                Derivation::Split {
                    source: "battery".into(),
                    when: Predicate::Positive,
                    sign: Sign::Keep,
                },
            ),
            RegisterDescriptor::derived(
                "discharge",
                Derivation::Split {
                    source: "battery".into(),
                    when: Predicate::Negative,
                    sign: Sign::Absolute,
                },
            ),
        ];
        let evaluator = Evaluator::compile(&registers).unwrap();
        let mut store = ValueStore::new(&registers);
        store.set_fresh("battery", Value::Int(-1200));
        evaluator.evaluate(&mut store);
        assert_eq!(store.value("charge"), Some(&Value::Float(0.0)));
        assert_eq!(store.value("discharge"), Some(&Value::Float(1200.0)));
    }

    #[tokio::test]
    async fn test_derivations_of_derivations_run_in_order() {
        // Declared before its inputs on purpose.
        let registers = vec![
            formula("kw", &["total"], "total / 1000"),
            sum("total", &["a", "b"]),
            direct("a", 0),
            direct("b", 1),
        ];
        let evaluator = Evaluator::compile(&registers).unwrap();
        assert_eq!(evaluator.order().collect::<Vec<_>>(), vec!["total", "kw"]);

        let mut store = ValueStore::new(&registers);
        store.set_fresh("a", Value::Int(1500));
        store.set_fresh("b", Value::Int(500));
        let changed = evaluator.evaluate(&mut store);
        assert_eq!(changed, vec!["total".to_string(), "kw".to_string()]);
        assert_eq!(store.value("kw"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn test_cycles_are_rejected() {
        let self_loop = vec![sum("a", &["a"])];
        assert!(matches!(
            Evaluator::compile(&self_loop),
            Err(ConfigError::DerivationCycle(names)) if names == vec!["a".to_string()]
        ));

        let three = vec![
            direct("x", 0),
            sum("a", &["c", "x"]),
            sum("b", &["a"]),
            formula("c", &["b"], "b * 2"),
        ];
        assert!(matches!(
            Evaluator::compile(&three),
            Err(ConfigError::DerivationCycle(names)) if names.len() == 3
        ));
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        let registers = vec![direct("a", 0), sum("total", &["a", "missing"])];
        assert!(matches!(
            Evaluator::compile(&registers),
            Err(ConfigError::UnknownSource { source_name, .. }) if source_name == "missing"
        ));
    }

    #[test]
    fn test_invalid_map_key_is_rejected() {
        let registers = vec![direct("a", 0), map("label", "a", &[("zero", "off")])];
        assert!(matches!(
            Evaluator::compile(&registers),
            Err(ConfigError::InvalidMapKey { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_formula_only_affects_itself() {
        let registers = vec![
            direct("a", 0),
            formula("broken", &["a"], "a +* 2"),
            formula("ratio", &["a"], "100 / a"),
            sum("echo", &["a"]),
        ];
        let evaluator = Evaluator::compile(&registers).unwrap();
        let mut store = ValueStore::new(&registers);
        store.set_fresh("a", Value::Int(0));
        evaluator.evaluate(&mut store);

        assert_eq!(store.status("broken"), Some(Status::Unavailable));
        assert_eq!(store.status("ratio"), Some(Status::Unavailable));
        assert_eq!(store.value("echo"), Some(&Value::Float(0.0)));
    }

    #[tokio::test]
    async fn test_precision_applies_to_results() {
        let mut third = formula("third", &["a"], "a / 3");
        third.format = third.format.with_precision(2);
        let registers = vec![direct("a", 0), third];
        let evaluator = Evaluator::compile(&registers).unwrap();
        let mut store = ValueStore::new(&registers);
        store.set_fresh("a", Value::Int(1));
        evaluator.evaluate(&mut store);
        assert_eq!(store.value("third"), Some(&Value::Float(0.33)));
    }

    #[test]
    fn test_map_keys() {
        assert_eq!(parse_key("0x00AA"), Some(0xAA));
        assert_eq!(parse_key("85"), Some(85));
        assert_eq!(parse_key("-1"), Some(-1));
        assert_eq!(parse_key("on"), None);
    }
}
