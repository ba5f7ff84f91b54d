use burn::{nn::loss::Reduction, prelude::*};

/// Negative log-likelihood loss over log-probabilities.
///
/// Pairs with a model ending in `log_softmax`: `NLL(log_softmax(x))` is the
/// cross entropy of the logits `x`.
#[derive(Clone, Debug, Default)]
pub struct NllLoss;

impl NllLoss {
    /// Create the loss.
    pub fn new() -> Self {
        Self
    }

    /// Compute the loss with the given reduction.
    ///
    /// # Shapes
    ///   - log_probs: [batch_size, num_classes]
    ///   - targets: [batch_size]
    ///   - output: [1]
    pub fn forward<B: Backend>(
        &self,
        log_probs: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
        reduction: Reduction,
    ) -> Tensor<B, 1> {
        let losses = self.forward_no_reduction(log_probs, targets);

        match reduction {
            Reduction::Sum => losses.sum(),
            _ => losses.mean(),
        }
    }

    /// Compute the loss of every item of the batch.
    ///
    /// # Shapes
    ///   - log_probs: [batch_size, num_classes]
    ///   - targets: [batch_size]
    ///   - output: [batch_size]
    pub fn forward_no_reduction<B: Backend>(
        &self,
        log_probs: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> Tensor<B, 1> {
        let [batch_size, _] = log_probs.dims();
        let indices = targets.reshape([batch_size, 1]);

        log_probs.gather(1, indices).reshape([batch_size]).neg()
    }
}

/// Number of rows whose arg-max matches the target class.
pub fn correct_predictions<B: Backend>(
    log_probs: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> usize {
    let [batch_size, _] = log_probs.dims();
    let predictions = log_probs.argmax(1).reshape([batch_size]);

    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}
