//! Execution planning: the ordered list of layers with their dependencies.

use crate::error::{EngineError, EngineResult};

/// How a layer depends on earlier work.
///
/// The target is part of the variant, so an unplaced residual ("target −1")
/// cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerDependency {
    /// No prerequisite; executable immediately.
    None,
    /// Requires the plan's previous entry.
    Sequential,
    /// Skip connection adding the target layer's output.
    Residual { target: usize },
    /// Attention over the target layer's output.
    Attention { target: usize },
}

impl LayerDependency {
    /// The referenced plan index, for residual/attention kinds.
    #[must_use]
    pub fn target(&self) -> Option<usize> {
        match self {
            LayerDependency::Residual { target } | LayerDependency::Attention { target } => {
                Some(*target)
            }
            LayerDependency::None | LayerDependency::Sequential => None,
        }
    }
}

/// One entry of the execution plan.
#[derive(Debug)]
pub struct ExecLayer {
    /// Model layer this entry executes.
    pub id: u32,
    /// Dependency of this entry.
    pub dependency: LayerDependency,
    /// Bytes of activation output the layer produces.
    pub output_bytes: usize,
    /// Address of the pool-owned output buffer, when allocated.
    pub(crate) output_addr: Option<usize>,
    /// Whether this entry ran in the current pass.
    pub executed: bool,
    /// Whether a later entry still reads this entry's output.
    pub output_needed: bool,
}

impl ExecLayer {
    fn new(id: u32, dependency: LayerDependency, output_bytes: usize) -> Self {
        Self {
            id,
            dependency,
            output_bytes,
            output_addr: None,
            executed: false,
            output_needed: false,
        }
    }

    /// Whether this entry currently holds an output buffer.
    #[must_use]
    pub fn has_output(&self) -> bool {
        self.output_addr.is_some()
    }
}

/// Ordered list of exec layers.
#[derive(Debug, Default)]
pub struct ExecutionPlan {
    layers: Vec<ExecLayer>,
}

impl ExecutionPlan {
    /// Empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer, validating residual/attention targets against the
    /// current plan length.
    pub fn push_layer(
        &mut self,
        id: u32,
        dependency: LayerDependency,
        output_bytes: usize,
    ) -> EngineResult<usize> {
        if let Some(target) = dependency.target() {
            if target >= self.layers.len() {
                return Err(EngineError::bad_plan(format!(
                    "layer {id}: dependency target {target} outside plan of {}",
                    self.layers.len()
                )));
            }
        }
        self.layers.push(ExecLayer::new(id, dependency, output_bytes));
        Ok(self.layers.len() - 1)
    }

    /// Number of plan entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the plan has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Entry at `index`.
    pub fn layer(&self, index: usize) -> EngineResult<&ExecLayer> {
        self.layers.get(index).ok_or_else(|| {
            EngineError::bad_plan(format!(
                "layer index {index} outside plan of {}",
                self.layers.len()
            ))
        })
    }

    /// All entries, in plan order.
    #[must_use]
    pub fn layers(&self) -> &[ExecLayer] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [ExecLayer] {
        &mut self.layers
    }

    /// A dependency is satisfied when its prerequisite has executed.
    pub(crate) fn dependency_satisfied(&self, index: usize) -> bool {
        match self.layers[index].dependency {
            LayerDependency::None => true,
            LayerDependency::Sequential => index == 0 || self.layers[index - 1].executed,
            LayerDependency::Residual { target } | LayerDependency::Attention { target } => {
                self.layers[target].executed
            }
        }
    }

    /// First unexecuted entry whose dependency is satisfied.
    pub(crate) fn next_executable(&self) -> Option<usize> {
        (0..self.layers.len())
            .find(|&i| !self.layers[i].executed && self.dependency_satisfied(i))
    }

    /// Whether any still-unexecuted entry reads `index`'s output: a
    /// residual/attention pointing at it, or the directly following entry
    /// running sequentially.
    pub(crate) fn has_future_consumer(&self, index: usize) -> bool {
        self.layers.iter().enumerate().any(|(j, layer)| {
            if layer.executed {
                return false;
            }
            match layer.dependency {
                LayerDependency::Sequential => j == index + 1,
                LayerDependency::Residual { target } | LayerDependency::Attention { target } => {
                    target == index
                }
                LayerDependency::None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_plan(n: usize) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new();
        for i in 0..n {
            let dep = if i == 0 {
                LayerDependency::None
            } else {
                LayerDependency::Sequential
            };
            plan.push_layer(i as u32, dep, 1024).unwrap();
        }
        plan
    }

    #[test]
    fn residual_target_must_precede() {
        let mut plan = linear_plan(3);
        plan.push_layer(3, LayerDependency::Residual { target: 1 }, 512)
            .unwrap();
        let err = plan
            .push_layer(4, LayerDependency::Residual { target: 9 }, 512)
            .unwrap_err();
        assert!(matches!(err, EngineError::BadPlan { .. }));
        // Self-reference is also out of range at append time.
        let err = plan
            .push_layer(5, LayerDependency::Attention { target: 4 }, 512)
            .unwrap_err();
        assert!(matches!(err, EngineError::BadPlan { .. }));
    }

    #[test]
    fn sequential_chain_unlocks_in_order() {
        let mut plan = linear_plan(3);
        assert_eq!(plan.next_executable(), Some(0));
        plan.layers_mut()[0].executed = true;
        assert_eq!(plan.next_executable(), Some(1));
        plan.layers_mut()[1].executed = true;
        plan.layers_mut()[2].executed = true;
        assert_eq!(plan.next_executable(), None);
    }

    #[test]
    fn residual_waits_for_target() {
        let mut plan = ExecutionPlan::new();
        plan.push_layer(0, LayerDependency::None, 64).unwrap();
        plan.push_layer(1, LayerDependency::None, 64).unwrap();
        plan.push_layer(2, LayerDependency::Residual { target: 1 }, 64)
            .unwrap();
        plan.layers_mut()[0].executed = true;
        // Layer 2's target (1) is unexecuted, so layer 1 is next.
        assert!(!plan.dependency_satisfied(2));
        assert_eq!(plan.next_executable(), Some(1));
    }

    #[test]
    fn future_consumers_pin_outputs() {
        let mut plan = ExecutionPlan::new();
        plan.push_layer(0, LayerDependency::None, 64).unwrap();
        plan.push_layer(1, LayerDependency::Sequential, 64).unwrap();
        plan.push_layer(2, LayerDependency::Residual { target: 0 }, 64)
            .unwrap();
        plan.layers_mut()[0].executed = true;
        // Layer 0 feeds both layer 1 (sequential) and layer 2 (residual).
        assert!(plan.has_future_consumer(0));
        plan.layers_mut()[1].executed = true;
        assert!(plan.has_future_consumer(0), "residual still pending");
        plan.layers_mut()[2].executed = true;
        assert!(!plan.has_future_consumer(0));
    }
}
