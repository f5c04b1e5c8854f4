use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::expression::{CompiledExpression, ExpressionError, normalize_probe};
use super::types::{
    ClassifiedConstraint, Component, Constraint, ConstraintKind, NodeBound, NodeBounds,
    RelationshipType, ValueUpdate,
};
use crate::error::{Error, Result};
use crate::simulation::Netlist;

/// How a value is moved back inside a freshly tightened bound.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BoundRepair {
    /// For `>=`: `value = min + step` and `max = span * min`.
    /// For `<=`: `value = max - step` and `min = max / span`.
    /// The repaired range always contains the repaired value.
    Heuristic { step: f64, span: f64 },
    /// Move the value onto the new bound and leave the other bound alone.
    Clamp,
}

impl Default for BoundRepair {
    fn default() -> Self {
        Self::Heuristic {
            step: 1.0,
            span: 10.0,
        }
    }
}

impl BoundRepair {
    /// `max_fixed`: the upper bound came from the user and must not move.
    fn raise_min(&self, component: &mut Component, max_fixed: bool) {
        let min = component.min_value;
        match *self {
            Self::Heuristic { step, span } => {
                component.value = min + step;
                if max_fixed {
                    // An empty range is left for the caller to reject
                    if component.max_value < component.value {
                        component.value = 0.5 * (min + component.max_value.max(min));
                    }
                } else if !(component.max_value.is_finite() && component.max_value >= component.value)
                {
                    component.max_value = (span * min).max(component.value);
                }
            }
            Self::Clamp => component.value = min,
        }
    }

    /// `min_fixed`: the lower bound came from the user and must not move.
    fn lower_max(&self, component: &mut Component, min_fixed: bool) {
        let max = component.max_value;
        match *self {
            Self::Heuristic { step, span } => {
                if !min_fixed && (component.min_value <= 0.0 || component.min_value > max) {
                    component.min_value = max / span;
                }
                component.value = max - step;
                if component.value < component.min_value {
                    component.value = 0.5 * (component.min_value.min(max) + max);
                }
            }
            Self::Clamp => component.value = max,
        }
    }
}

/// A compiled `=` constraint, re-evaluated whenever its inputs change.
#[derive(Clone, Debug)]
pub struct EqualityConstraint {
    pub target: String,
    pub constraint: Constraint,
    expression: CompiledExpression,
}

impl EqualityConstraint {
    pub fn compile(constraint: &Constraint) -> Result<Self> {
        Ok(Self {
            target: constraint.target(),
            expression: compile_right(constraint)?,
            constraint: constraint.clone(),
        })
    }

    pub fn evaluate(&self, values: &IndexMap<String, f64>) -> Result<f64> {
        evaluate_right(&self.constraint, &self.expression, values)
    }
}

/// Outcome of applying parameter constraints to a netlist.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    pub equalities: Vec<EqualityConstraint>,
    pub updates: Vec<ValueUpdate>,
}

fn compile_right(constraint: &Constraint) -> Result<CompiledExpression> {
    CompiledExpression::compile(&constraint.right)
        .map_err(|e| Error::constraint(constraint, format!("right-hand side: {}", e)))
}

fn evaluate_right(
    constraint: &Constraint,
    expression: &CompiledExpression,
    values: &IndexMap<String, f64>,
) -> Result<f64> {
    if let Some(probe) = expression
        .variables()
        .iter()
        .find(|name| normalize_probe(name).is_some())
    {
        return Err(Error::constraint(
            constraint,
            format!("'{}' is a simulated quantity and cannot bound a parameter", probe),
        ));
    }
    expression.evaluate(values).map_err(|e| match e {
        ExpressionError::UnknownName(name) => {
            Error::constraint(constraint, format!("unknown component '{}'", name))
        }
        other => Error::constraint(constraint, other.to_string()),
    })
}

/// Decide whether a constraint bounds a selected variable or a node voltage.
pub fn classify(
    constraint: &Constraint,
    variables: &[String],
    node_expressions: &[String],
) -> Result<ConstraintKind> {
    let left = constraint.target();
    if left.is_empty() {
        return Err(Error::constraint(constraint, "left-hand side is empty"));
    }
    if variables.iter().any(|v| *v == left) {
        return Ok(ConstraintKind::Parameter);
    }
    if node_expressions.iter().any(|n| *n == left) {
        return Ok(ConstraintKind::Node);
    }
    Err(Error::constraint(
        constraint,
        "left-hand side must be exactly one selected component or one node voltage",
    ))
}

/// Apply every parameter constraint to the netlist in declaration order.
pub fn apply_parameter_constraints(
    constraints: &[ClassifiedConstraint],
    netlist: &mut Netlist,
    policy: BoundRepair,
) -> Result<Resolution> {
    let mut resolution = Resolution::default();
    // Bounds present before resolution or set by a constraint are never widened
    let mut fixed_min: IndexSet<String> = IndexSet::new();
    let mut fixed_max: IndexSet<String> = IndexSet::new();
    for component in netlist.components() {
        if component.min_value != 0.0 {
            fixed_min.insert(component.name.clone());
        }
        if component.max_value.is_finite() {
            fixed_max.insert(component.name.clone());
        }
    }

    for classified in constraints {
        if classified.kind != ConstraintKind::Parameter {
            continue;
        }
        let constraint = &classified.constraint;
        let target = constraint.target();
        let expression = compile_right(constraint)?;
        let bound = evaluate_right(constraint, &expression, &netlist.values())?;

        let component = netlist
            .component_mut(&target)
            .ok_or_else(|| Error::constraint(constraint, format!("no component named '{}'", target)))?;
        let before = component.value;

        match constraint.operator {
            RelationshipType::GreaterThanOrEqual => {
                component.min_value = component.min_value.max(bound);
                if component.value < component.min_value {
                    policy.raise_min(component, fixed_max.contains(&component.name));
                }
                fixed_min.insert(component.name.clone());
            }
            RelationshipType::LessThanOrEqual => {
                component.max_value = component.max_value.min(bound);
                if component.value > component.max_value {
                    policy.lower_max(component, fixed_min.contains(&component.name));
                }
                fixed_max.insert(component.name.clone());
            }
            RelationshipType::Equals => {
                component.value = bound;
                component.is_variable = false;
                resolution.equalities.push(EqualityConstraint {
                    target: target.clone(),
                    constraint: constraint.clone(),
                    expression,
                });
            }
        }

        if component.value != before || constraint.operator == RelationshipType::Equals {
            info!(
                "{}: {} -> {} (range [{}, {}])",
                constraint, before, component.value, component.min_value, component.max_value
            );
            record(&mut resolution.updates, &target, component.value);
        }
    }

    if let Some(bad) = netlist
        .variable_components()
        .find(|c| c.min_value > c.max_value)
    {
        return Err(Error::constraint(
            &bad.name,
            format!("empty range: min {} exceeds max {}", bad.min_value, bad.max_value),
        ));
    }

    Ok(resolution)
}

/// Re-evaluate `=` constraints against current netlist values, in order.
pub fn propagate_equalities(
    equalities: &[EqualityConstraint],
    netlist: &mut Netlist,
) -> Result<Vec<ValueUpdate>> {
    let mut values = netlist.values();
    let mut updates = Vec::with_capacity(equalities.len());
    for equality in equalities {
        let value = equality.evaluate(&values)?;
        netlist.set_value(&equality.target, value)?;
        values.insert(equality.target.clone(), value);
        updates.push(ValueUpdate::new(equality.target.clone(), value));
    }
    Ok(updates)
}

fn record(updates: &mut Vec<ValueUpdate>, name: &str, value: f64) {
    match updates.iter_mut().find(|u| u.name == name) {
        Some(existing) => existing.value = value,
        None => updates.push(ValueUpdate::new(name, value)),
    }
}

/// Merge node constraints into per-node voltage bounds.
pub fn build_node_bounds(constraints: &[ClassifiedConstraint]) -> Result<NodeBounds> {
    let mut bounds = NodeBounds::new();
    let constants = IndexMap::new();

    for classified in constraints {
        if classified.kind != ConstraintKind::Node {
            continue;
        }
        let constraint = &classified.constraint;
        if constraint.operator == RelationshipType::Equals {
            debug!("{}: equality on a node voltage does not bound the solve", constraint);
            continue;
        }

        let expression = compile_right(constraint)?;
        let limit = evaluate_right(constraint, &expression, &constants)?;
        let entry: &mut NodeBound = bounds.entry(constraint.target()).or_default();
        match constraint.operator {
            RelationshipType::GreaterThanOrEqual => {
                entry.lower = Some(entry.lower.map_or(limit, |lo| lo.max(limit)));
            }
            RelationshipType::LessThanOrEqual => {
                entry.upper = Some(entry.upper.map_or(limit, |hi| hi.min(limit)));
            }
            RelationshipType::Equals => {}
        }
    }

    Ok(bounds)
}

/// Report whether the `=` constraints form a dependency cycle.
///
/// Edges run from every name referenced on the right to the left-hand side.
/// Three-colour depth-first search driven by an explicit stack.
pub fn detect_cycle<'a>(constraints: impl IntoIterator<Item = &'a Constraint>) -> Result<bool> {
    let mut graph: IndexMap<String, Vec<usize>> = IndexMap::new();

    for constraint in constraints {
        if constraint.operator != RelationshipType::Equals {
            continue;
        }
        let expression = compile_right(constraint)?;
        let target = vertex(&mut graph, &constraint.target());
        for source in expression.variables() {
            let source = vertex(&mut graph, source);
            if let Some((_, edges)) = graph.get_index_mut(source) {
                edges.push(target);
            }
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let mut colour = vec![Colour::White; graph.len()];
    for root in 0..graph.len() {
        if colour[root] != Colour::White {
            continue;
        }
        colour[root] = Colour::Grey;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

        while let Some(top) = stack.len().checked_sub(1) {
            let (current, next) = stack[top];
            let edge = graph
                .get_index(current)
                .and_then(|(_, edges)| edges.get(next))
                .copied();
            match edge {
                Some(neighbour) => {
                    stack[top].1 += 1;
                    match colour[neighbour] {
                        Colour::Grey => {
                            debug!(
                                "dependency cycle through '{}'",
                                graph.get_index(neighbour).map_or("", |(k, _)| k.as_str())
                            );
                            return Ok(true);
                        }
                        Colour::White => {
                            colour[neighbour] = Colour::Grey;
                            stack.push((neighbour, 0));
                        }
                        Colour::Black => {}
                    }
                }
                None => {
                    colour[current] = Colour::Black;
                    stack.pop();
                }
            }
        }
    }

    Ok(false)
}

fn vertex(graph: &mut IndexMap<String, Vec<usize>>, name: &str) -> usize {
    match graph.get_index_of(name) {
        Some(idx) => idx,
        None => graph.insert_full(name.to_string(), Vec::new()).0,
    }
}

/// Ordered, validated constraint list.
///
/// Every edit is classified and cycle-checked against the would-be list;
/// a rejected edit leaves the set untouched.
#[derive(Clone, Debug, Default)]
pub struct ConstraintSet {
    variables: Vec<String>,
    node_expressions: Vec<String>,
    constraints: Vec<ClassifiedConstraint>,
}

impl ConstraintSet {
    pub fn new(variables: Vec<String>, node_expressions: Vec<String>) -> Self {
        Self {
            variables,
            node_expressions,
            constraints: Vec::new(),
        }
    }

    pub fn for_netlist(netlist: &Netlist) -> Self {
        Self::new(netlist.variable_names(), netlist.node_expressions())
    }

    pub fn constraints(&self) -> &[ClassifiedConstraint] {
        &self.constraints
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().map(|c| &c.constraint)
    }

    /// Node expressions that carry a constraint, in first-use order.
    pub fn constrained_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = Vec::new();
        for c in &self.constraints {
            let target = c.constraint.target();
            if c.kind == ConstraintKind::Node && !nodes.contains(&target) {
                nodes.push(target);
            }
        }
        nodes
    }

    fn check(&self, constraint: &Constraint, replacing: Option<usize>) -> Result<ClassifiedConstraint> {
        let kind = classify(constraint, &self.variables, &self.node_expressions)?;
        compile_right(constraint)?;

        let proposed = self
            .constraints
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != replacing)
            .map(|(_, c)| &c.constraint)
            .chain(std::iter::once(constraint));
        if detect_cycle(proposed)? {
            return Err(Error::constraint(constraint, "creates a cyclic dependency"));
        }

        Ok(ClassifiedConstraint {
            constraint: constraint.clone(),
            kind,
        })
    }

    pub fn add(&mut self, constraint: Constraint) -> Result<()> {
        let classified = self.check(&constraint, None)?;
        self.constraints.push(classified);
        Ok(())
    }

    pub fn replace(&mut self, index: usize, constraint: Constraint) -> Result<()> {
        if index >= self.constraints.len() {
            return Err(Error::constraint(&constraint, format!("no constraint at index {}", index)));
        }
        let classified = self.check(&constraint, Some(index))?;
        self.constraints[index] = classified;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Option<Constraint> {
        if index < self.constraints.len() {
            Some(self.constraints.remove(index).constraint)
        } else {
            None
        }
    }

    /// Validate and append every entry of an interchange file.
    pub fn load_json(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let incoming: Vec<Constraint> = serde_json::from_str(&text)?;

        let mut staged = self.clone();
        for constraint in incoming {
            staged.add(constraint)?;
        }
        info!("loaded {} constraint(s) from {}", staged.len() - self.len(), path.display());
        *self = staged;
        Ok(())
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let list: Vec<&Constraint> = self.iter().collect();
        let text = serde_json::to_string_pretty(&list)?;
        std::fs::write(path, text).map_err(|e| Error::io(path, e))
    }
}
