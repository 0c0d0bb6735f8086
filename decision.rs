use crate::config::OutputActivation;
use crate::models::{ClassificationResult, OutputProbabilities};

/// Argmax with a confidence floor.
///
/// The first index wins exact ties and non-finite scores are skipped. A winner
/// scoring strictly below `threshold`, or one without a label, yields
/// [`ClassificationResult::Other`].
pub fn decide(probs: &OutputProbabilities, labels: &[String], threshold: f32) -> ClassificationResult {
    let Some((index, score)) = argmax(probs.as_slice()) else {
        return ClassificationResult::Other { score: 0.0 };
    };
    if score < threshold {
        return ClassificationResult::Other { score };
    }
    match labels.get(index) {
        Some(label) => ClassificationResult::Labeled {
            index,
            label: label.clone(),
            score,
        },
        None => {
            log::warn!(
                "Winning class {index} has no label ({} labels known)",
                labels.len()
            );
            ClassificationResult::Other { score }
        }
    }
}

pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, v) in values.iter().copied().enumerate() {
        if !v.is_finite() {
            continue;
        }
        match best {
            Some((_, current)) if v <= current => {}
            _ => best = Some((idx, v)),
        }
    }
    best
}

/// Turns raw model outputs into scores. Softmax is computed in place and
/// shifted by the largest finite value so large logits cannot overflow.
pub fn activate(probs: OutputProbabilities, activation: OutputActivation) -> OutputProbabilities {
    match activation {
        OutputActivation::Identity => probs,
        OutputActivation::Softmax => {
            let mut scores = probs.into_vec();
            softmax_in_place(&mut scores);
            OutputProbabilities::new(scores)
        }
    }
}

fn softmax_in_place(scores: &mut [f32]) {
    let Some((_, peak)) = argmax(scores) else {
        scores.iter_mut().for_each(|v| *v = 0.0);
        return;
    };
    let mut total = 0.0f32;
    for v in scores.iter_mut() {
        *v = if v.is_finite() { (*v - peak).exp() } else { 0.0 };
        total += *v;
    }
    if !(total.is_finite() && total > 0.0) {
        scores.iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    scores.iter_mut().for_each(|v| *v /= total);
}
