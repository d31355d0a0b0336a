//! A small rule language for user-authored strategies.
//!
//! Each non-empty line is one rule, tried top to bottom:
//!
//! ```text
//! # comment
//! chance >= 0.65 => 0 1 2
//! chance >= 0.55 and remaining[1] > 0 => 1 0 2
//! else => random
//! ```
//!
//! A condition is `else` or clauses joined by `and`; a clause compares
//! `chance`, `total` (remaining steps overall) or `remaining[i]` against a
//! number. The action is a priority order of row indices, resolved with
//! [`remaining_in_order`], or `random` for a shuffled order of all rows.
//! When no rule matches the program returns `-1`.
//!
//! Programs have no loops or state, and size is capped, so evaluation is
//! bounded by the rule count.

use rand::seq::SliceRandom;

use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::sim::RowState;
use crate::strategy::{remaining_in_order, DecisionFunction};

pub const MAX_SOURCE_LEN: usize = 16 * 1024;
pub const MAX_RULES: usize = 64;
pub const MAX_CLAUSES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand {
    Chance,
    Total,
    Remaining(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cmp {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Ne,
}

impl Cmp {
    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Cmp::Ge => lhs >= rhs,
            Cmp::Gt => lhs > rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Eq => (lhs - rhs).abs() < 1e-9,
            Cmp::Ne => (lhs - rhs).abs() >= 1e-9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    operand: Operand,
    cmp: Cmp,
    value: f64,
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Order(Vec<usize>),
    Random,
}

#[derive(Debug, Clone, PartialEq)]
struct Rule {
    clauses: Vec<Clause>,
    action: Action,
}

/// Compiled rule program.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleProgram {
    rules: Vec<Rule>,
}

impl RuleProgram {
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl DecisionFunction for RuleProgram {
    fn decide(&self, rows: &[RowState], remaining: &[usize], chance: f64, _config: &SimulationConfig) -> i64 {
        let total: usize = remaining.iter().sum();
        let value_of = |operand: Operand| match operand {
            Operand::Chance => chance,
            Operand::Total => total as f64,
            Operand::Remaining(i) => remaining.get(i).copied().unwrap_or(0) as f64,
        };
        let matched = self
            .rules
            .iter()
            .find(|rule| rule.clauses.iter().all(|c| c.cmp.holds(value_of(c.operand), c.value)));
        match matched.map(|rule| &rule.action) {
            Some(Action::Order(order)) => remaining_in_order(remaining, order, -1),
            Some(Action::Random) => {
                let mut order: Vec<usize> = (0..rows.len().max(remaining.len())).collect();
                order.shuffle(&mut rand::thread_rng());
                remaining_in_order(remaining, &order, -1)
            }
            None => -1,
        }
    }
}

fn error(line: usize, message: impl Into<String>) -> SimError {
    SimError::Compilation { line, message: message.into() }
}

/// Strip the indentation shared by all non-blank lines.
pub fn normalize_indent(text: &str) -> String {
    let indent = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    if indent == 0 {
        return text.to_string();
    }
    text.lines()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn compile(source: &str) -> Result<RuleProgram> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(error(0, format!("source exceeds {} bytes", MAX_SOURCE_LEN)));
    }
    let mut rules = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if rules.len() == MAX_RULES {
            return Err(error(line_no, format!("more than {} rules", MAX_RULES)));
        }
        rules.push(parse_rule(line, line_no)?);
    }
    if rules.is_empty() {
        return Err(error(0, "program has no rules"));
    }
    Ok(RuleProgram { rules })
}

fn parse_rule(line: &str, line_no: usize) -> Result<Rule> {
    let (condition, action) = line
        .split_once("=>")
        .ok_or_else(|| error(line_no, "expected '<condition> => <action>'"))?;
    let clauses = parse_condition(condition.trim(), line_no)?;
    let action = parse_action(action.trim(), line_no)?;
    Ok(Rule { clauses, action })
}

fn parse_condition(text: &str, line_no: usize) -> Result<Vec<Clause>> {
    if text == "else" {
        return Ok(Vec::new());
    }
    if text.is_empty() {
        return Err(error(line_no, "missing condition"));
    }
    let parts: Vec<&str> = text.split(" and ").collect();
    if parts.len() > MAX_CLAUSES {
        return Err(error(line_no, format!("more than {} clauses", MAX_CLAUSES)));
    }
    parts.into_iter().map(|p| parse_clause(p.trim(), line_no)).collect()
}

fn parse_clause(text: &str, line_no: usize) -> Result<Clause> {
    // Two-character operators first so ">=" is not read as ">".
    const OPS: [(&str, Cmp); 6] = [
        (">=", Cmp::Ge),
        ("<=", Cmp::Le),
        ("==", Cmp::Eq),
        ("!=", Cmp::Ne),
        (">", Cmp::Gt),
        ("<", Cmp::Lt),
    ];
    let (lhs, cmp, rhs) = OPS
        .iter()
        .find_map(|(sym, cmp)| text.split_once(sym).map(|(l, r)| (l.trim(), *cmp, r.trim())))
        .ok_or_else(|| error(line_no, format!("no comparison in '{}'", text)))?;
    let operand = parse_operand(lhs, line_no)?;
    let value: f64 = rhs
        .parse()
        .map_err(|_| error(line_no, format!("expected a number, found '{}'", rhs)))?;
    if !value.is_finite() {
        return Err(error(line_no, "comparison value must be finite"));
    }
    Ok(Clause { operand, cmp, value })
}

fn parse_operand(text: &str, line_no: usize) -> Result<Operand> {
    match text {
        "chance" => Ok(Operand::Chance),
        "total" => Ok(Operand::Total),
        _ => {
            let index = text
                .strip_prefix("remaining[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|i| i.trim().parse::<usize>().ok())
                .ok_or_else(|| error(line_no, format!("unknown operand '{}'", text)))?;
            Ok(Operand::Remaining(index))
        }
    }
}

fn parse_action(text: &str, line_no: usize) -> Result<Action> {
    if text == "random" {
        return Ok(Action::Random);
    }
    let order = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<usize>().map_err(|_| error(line_no, format!("invalid row index '{}'", t))))
        .collect::<Result<Vec<_>>>()?;
    if order.is_empty() {
        return Err(error(line_no, "action needs at least one row index"));
    }
    Ok(Action::Order(order))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAIVE: &str = "
        chance >= 0.65 => 0 1 2
        chance >= 0.55 => 1 0 2
        else => 2 1 0
    ";

    fn decide(program: &RuleProgram, remaining: &[usize], chance: f64) -> i64 {
        let rows: Vec<RowState> = remaining.iter().map(|_| RowState::pending(1)).collect();
        program.decide(&rows, remaining, chance, &SimulationConfig::default())
    }

    #[test]
    fn test_naive_ranges_program() {
        let program = compile(&normalize_indent(NAIVE)).unwrap();
        assert_eq!(program.rule_count(), 3);
        assert_eq!(decide(&program, &[5, 5, 5], 0.75), 0);
        assert_eq!(decide(&program, &[5, 5, 5], 0.55), 1);
        assert_eq!(decide(&program, &[5, 5, 5], 0.25), 2);
        assert_eq!(decide(&program, &[0, 5, 5], 0.75), 1);
        assert_eq!(decide(&program, &[0, 0, 0], 0.75), -1);
    }

    #[test]
    fn test_and_clauses_and_comments() {
        let program = compile("remaining[2] > 3 and chance < 0.5 => 2 # dump\nelse => 0,1").unwrap();
        assert_eq!(decide(&program, &[1, 1, 4], 0.35), 2);
        assert_eq!(decide(&program, &[1, 1, 3], 0.35), 0);
        assert_eq!(decide(&program, &[1, 1, 4], 0.65), 0);
    }

    #[test]
    fn test_no_match_returns_minus_one() {
        let program = compile("total > 100 => 0").unwrap();
        assert_eq!(decide(&program, &[1, 1, 1], 0.5), -1);
    }

    #[test]
    fn test_random_picks_row_with_capacity() {
        let program = compile("else => random").unwrap();
        for _ in 0..20 {
            assert_eq!(decide(&program, &[0, 3, 0], 0.5), 1);
        }
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = compile("else => 0\nchance >> 2 => 1").unwrap_err();
        assert!(matches!(err, SimError::Compilation { line: 2, .. }));
        let err = compile("\n\nluck > 1 => 0").unwrap_err();
        assert!(matches!(err, SimError::Compilation { line: 3, .. }));
        assert!(compile("chance > 0.5 =>").is_err());
        assert!(compile("chance > 0.5").is_err());
        assert!(compile("# only a comment").is_err());
    }

    #[test]
    fn test_rule_limit() {
        let source = "else => 0\n".repeat(MAX_RULES + 1);
        assert!(matches!(compile(&source), Err(SimError::Compilation { .. })));
    }

    #[test]
    fn test_normalize_indent() {
        assert_eq!(normalize_indent("    a\n      b\n"), "a\n  b");
        assert_eq!(normalize_indent("a\n  b"), "a\n  b");
    }
}
