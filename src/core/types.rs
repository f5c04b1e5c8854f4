use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::expression::normalize_probe;

// ===== ENUMS =====

/// Tunable element classes. Other element letters only contribute nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Resistor,
    Inductor,
    Capacitor,
}

impl ComponentKind {
    pub fn from_designator(first: char) -> Option<Self> {
        match first.to_ascii_uppercase() {
            'R' => Some(Self::Resistor),
            'L' => Some(Self::Inductor),
            'C' => Some(Self::Capacitor),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipType {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "<=")]
    LessThanOrEqual,
}

impl RelationshipType {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Equals => "=",
            Self::GreaterThanOrEqual => ">=",
            Self::LessThanOrEqual => "<=",
        }
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Which namespace a constraint's left-hand side lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintKind {
    Parameter,
    Node,
}

// ===== CORE DATA TYPES =====

#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    pub name: String,
    pub kind: ComponentKind,
    /// SI base units
    pub value: f64,
    pub is_variable: bool,
    pub min_value: f64,
    pub max_value: f64,
}

impl Component {
    pub fn new(name: impl Into<String>, kind: ComponentKind, value: f64) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            is_variable: false,
            min_value: 0.0,
            max_value: f64::INFINITY,
        }
    }

    pub fn clamp(&mut self) {
        if self.min_value <= self.max_value {
            self.value = self.value.clamp(self.min_value, self.max_value);
        }
    }

    pub fn is_within_bounds(&self) -> bool {
        self.value >= self.min_value && self.value <= self.max_value
    }
}

/// A user-authored relation `left operator right`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Constraint {
    pub left: String,
    pub operator: RelationshipType,
    pub right: String,
}

impl Constraint {
    pub fn new(left: impl Into<String>, operator: RelationshipType, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            operator,
            right: right.into(),
        }
    }

    pub fn equals(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::new(left, RelationshipType::Equals, right)
    }

    pub fn at_least(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::new(left, RelationshipType::GreaterThanOrEqual, right)
    }

    pub fn at_most(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::new(left, RelationshipType::LessThanOrEqual, right)
    }

    /// Left-hand side with node probes normalized to `V(node)`.
    pub fn target(&self) -> String {
        let left = self.left.trim();
        normalize_probe(left).unwrap_or_else(|| left.to_string())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left.trim(), self.operator, self.right.trim())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassifiedConstraint {
    pub constraint: Constraint,
    pub kind: ConstraintKind,
}

/// One entry of the explicit value diff handed to `Netlist::patch`.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueUpdate {
    pub name: String,
    pub value: f64,
}

impl ValueUpdate {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Lower/upper voltage bound for one probed node.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct NodeBound {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl NodeBound {
    pub fn admits(&self, sample: f64) -> bool {
        self.lower.is_none_or(|lo| sample >= lo) && self.upper.is_none_or(|hi| sample <= hi)
    }
}

/// Node expression (`V(name)`) to its bound, in declaration order.
pub type NodeBounds = IndexMap<String, NodeBound>;

/// Solver termination tolerances.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    pub xtol: f64,
    pub gtol: f64,
    pub ftol: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            xtol: 1e-12,
            gtol: 1e-12,
            ftol: 1e-12,
        }
    }
}
