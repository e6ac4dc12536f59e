//! Experiment model
//!
//! An experiment is immutable for the duration of one serve operation. The
//! broker, the selector and every sampler read it; nothing here mutates it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    AssignmentValue, Assignments, ConstraintKind, ExperimentId, ExperimentType, MetricStrategy,
    ValidationError,
};

// ============================================================================
// PARAMETERS
// ============================================================================

/// Domain of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Double { min: f64, max: f64 },
    Int { min: i64, max: i64 },
    Categorical { values: Vec<String> },
}

/// Prior belief over a numeric parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prior {
    Normal { mean: f64, scale: f64 },
    Beta { shape_a: f64, shape_b: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    /// Conditional name -> values under which this parameter is active.
    #[serde(default)]
    pub conditions: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub prior: Option<Prior>,
    /// Explicit grid values (numeric parameters only).
    #[serde(default)]
    pub grid: Option<Vec<f64>>,
}

impl Parameter {
    fn with_kind(name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            conditions: BTreeMap::new(),
            prior: None,
            grid: None,
        }
    }

    pub fn double(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self::with_kind(name, ParameterKind::Double { min, max })
    }

    pub fn int(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self::with_kind(name, ParameterKind::Int { min, max })
    }

    pub fn categorical(name: impl Into<String>, values: &[&str]) -> Self {
        Self::with_kind(
            name,
            ParameterKind::Categorical {
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        )
    }

    /// Only active when `conditional` takes one of `values`.
    pub fn with_condition(mut self, conditional: impl Into<String>, values: &[&str]) -> Self {
        self.conditions.insert(
            conditional.into(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_prior(mut self, prior: Prior) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn with_grid(mut self, values: Vec<f64>) -> Self {
        self.grid = Some(values);
        self
    }

    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, ParameterKind::Categorical { .. })
    }

    /// Whether the conditional values in `assignments` activate this parameter.
    pub fn is_active(&self, assignments: &Assignments) -> bool {
        self.conditions.iter().all(|(conditional, allowed)| {
            assignments
                .get(conditional)
                .and_then(AssignmentValue::as_categorical)
                .is_some_and(|value| allowed.iter().any(|a| a == value))
        })
    }

    fn validate_value(&self, value: &AssignmentValue) -> Result<(), ValidationError> {
        match (&self.kind, value) {
            (ParameterKind::Double { min, max }, AssignmentValue::Double(v)) => {
                check_bounds(&self.name, *v, *min, *max)?;
                self.check_grid(*v)
            }
            (ParameterKind::Int { min, max }, AssignmentValue::Int(v)) => {
                check_bounds(&self.name, *v as f64, *min as f64, *max as f64)?;
                self.check_grid(*v as f64)
            }
            (ParameterKind::Categorical { values }, AssignmentValue::Categorical(v)) => {
                if values.iter().any(|allowed| allowed == v) {
                    Ok(())
                } else {
                    Err(ValidationError::NotInDomain {
                        name: self.name.clone(),
                        value: v.clone(),
                    })
                }
            }
            (ParameterKind::Double { .. }, _) => Err(ValidationError::TypeMismatch {
                name: self.name.clone(),
                expected: "double",
            }),
            (ParameterKind::Int { .. }, _) => Err(ValidationError::TypeMismatch {
                name: self.name.clone(),
                expected: "int",
            }),
            (ParameterKind::Categorical { .. }, _) => Err(ValidationError::TypeMismatch {
                name: self.name.clone(),
                expected: "categorical",
            }),
        }
    }

    fn check_grid(&self, value: f64) -> Result<(), ValidationError> {
        match &self.grid {
            Some(grid) if !grid.iter().any(|g| *g == value) => Err(ValidationError::NotInDomain {
                name: self.name.clone(),
                value: value.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn check_bounds(name: &str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if value.is_nan() || value < min || value > max {
        return Err(ValidationError::OutOfBounds {
            name: name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

// ============================================================================
// EXPERIMENT PARTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub strategy: MetricStrategy,
}

/// A cheaper-to-evaluate proxy of the full objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConstraint {
    /// (parameter name, weight)
    pub terms: Vec<(String, f64)>,
    pub threshold: f64,
    pub kind: ConstraintKind,
}

/// A categorical switch that gates other parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    pub name: String,
    pub values: Vec<String>,
}

// ============================================================================
// EXPERIMENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: ExperimentId,
    pub experiment_type: ExperimentType,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub observation_budget: Option<u32>,
    pub parallel_bandwidth: u32,
    #[serde(default)]
    pub linear_constraints: Vec<LinearConstraint>,
    #[serde(default)]
    pub conditionals: Vec<Conditional>,
    #[serde(default)]
    pub development: bool,
    /// Route the low-discrepancy phase through the alternate scoring path.
    #[serde(default)]
    pub prefers_alternate_scoring: bool,
}

impl Experiment {
    pub fn new(experiment_id: ExperimentId, experiment_type: ExperimentType) -> Self {
        Self {
            experiment_id,
            experiment_type,
            parameters: Vec::new(),
            metrics: Vec::new(),
            tasks: Vec::new(),
            observation_budget: None,
            parallel_bandwidth: 1,
            linear_constraints: Vec::new(),
            conditionals: Vec::new(),
            development: false,
            prefers_alternate_scoring: false,
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, strategy: MetricStrategy) -> Self {
        self.metrics.push(Metric {
            name: name.into(),
            strategy,
        });
        self
    }

    pub fn with_conditional(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.conditionals.push(Conditional {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn with_linear_constraint(mut self, constraint: LinearConstraint) -> Self {
        self.linear_constraints.push(constraint);
        self
    }

    pub fn with_development(mut self, development: bool) -> Self {
        self.development = development;
        self
    }

    pub fn with_parallel_bandwidth(mut self, parallel_bandwidth: u32) -> Self {
        self.parallel_bandwidth = parallel_bandwidth;
        self
    }

    pub fn with_observation_budget(mut self, budget: u32) -> Self {
        self.observation_budget = Some(budget);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn conditional(&self, name: &str) -> Option<&Conditional> {
        self.conditionals.iter().find(|c| c.name == name)
    }

    /// Number of parameters.
    pub fn dimension(&self) -> usize {
        self.parameters.len()
    }

    /// Conflict replacement is allowed for every experiment that is neither
    /// grid-typed nor in development mode.
    pub fn permits_conflict_replacement(&self) -> bool {
        self.experiment_type != ExperimentType::Grid && !self.development
    }

    pub fn has_non_categorical_parameters(&self) -> bool {
        self.parameters.iter().any(|p| !p.is_categorical())
    }

    pub fn uses_priors(&self) -> bool {
        self.parameters.iter().any(|p| p.prior.is_some())
    }

    pub fn has_linear_constraints(&self) -> bool {
        !self.linear_constraints.is_empty()
    }

    pub fn has_conditionals(&self) -> bool {
        !self.conditionals.is_empty()
    }

    /// A search experiment only looks for feasible points: every metric is a
    /// constraint metric.
    pub fn is_search(&self) -> bool {
        !self.metrics.is_empty()
            && self
                .metrics
                .iter()
                .all(|m| m.strategy == MetricStrategy::Constraint)
    }

    /// Re-check an assignment vector against the experiment's current
    /// definition: conditionals, active parameters, domains, and linear
    /// constraints.
    pub fn validate_assignments(&self, assignments: &Assignments) -> Result<(), ValidationError> {
        for conditional in &self.conditionals {
            let value = assignments.get(&conditional.name).ok_or_else(|| {
                ValidationError::MissingParameter {
                    name: conditional.name.clone(),
                }
            })?;
            let value = value
                .as_categorical()
                .ok_or_else(|| ValidationError::TypeMismatch {
                    name: conditional.name.clone(),
                    expected: "categorical",
                })?;
            if !conditional.values.iter().any(|v| v == value) {
                return Err(ValidationError::NotInDomain {
                    name: conditional.name.clone(),
                    value: value.to_string(),
                });
            }
        }

        for parameter in &self.parameters {
            let active = parameter.is_active(assignments);
            match (active, assignments.get(&parameter.name)) {
                (true, Some(value)) => parameter.validate_value(value)?,
                (true, None) => {
                    return Err(ValidationError::MissingParameter {
                        name: parameter.name.clone(),
                    })
                }
                (false, Some(_)) => {
                    return Err(ValidationError::InactiveParameter {
                        name: parameter.name.clone(),
                    })
                }
                (false, None) => {}
            }
        }

        if let Some(unknown) = assignments
            .names()
            .find(|name| self.parameter(name).is_none() && self.conditional(name).is_none())
        {
            return Err(ValidationError::UnknownParameter {
                name: unknown.clone(),
            });
        }

        for (index, constraint) in self.linear_constraints.iter().enumerate() {
            let mut lhs = 0.0;
            let mut applicable = true;
            for (name, weight) in &constraint.terms {
                match assignments.get(name).and_then(AssignmentValue::as_f64) {
                    Some(value) => lhs += weight * value,
                    None => {
                        applicable = false;
                        break;
                    }
                }
            }
            if !applicable {
                continue;
            }
            let satisfied = match constraint.kind {
                ConstraintKind::GreaterThan => lhs >= constraint.threshold,
                ConstraintKind::LessThan => lhs <= constraint.threshold,
            };
            if !satisfied {
                return Err(ValidationError::ConstraintViolated {
                    index,
                    lhs,
                    threshold: constraint.threshold,
                });
            }
        }

        Ok(())
    }
}
