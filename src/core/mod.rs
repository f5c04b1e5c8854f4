pub mod constraints;
pub mod expression;
pub mod types;
pub mod units;

pub use constraints::{
    BoundRepair, ConstraintSet, EqualityConstraint, Resolution, apply_parameter_constraints,
    build_node_bounds, classify, detect_cycle, propagate_equalities,
};
pub use expression::{CompiledExpression, ExpressionError, VariableContext, normalize_probe};
pub use types::*;
pub use units::{format_value, parse_value};
