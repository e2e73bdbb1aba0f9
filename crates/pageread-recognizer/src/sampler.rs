//! Token sampling: repetition penalty, temperature, top-k, top-p.

use rand::Rng;

/// Sampling knobs threaded through from `RecognitionOptions`.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self { temperature: 0.0, top_p: 1.0, top_k: 0, repetition_penalty: 1.0 }
    }
}

/// Applies the repetition penalty over the last 20 distinct history
/// tokens: multiplies by `penalty` when the logit is negative, divides
/// when non-negative. The sign-dependent branch is intentional — it
/// pushes negative logits further negative and positive logits down,
/// rather than uniformly discouraging repeats.
fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let mut seen = std::collections::HashSet::new();
    for &token in history.iter().rev() {
        if seen.len() >= 20 {
            break;
        }
        if !seen.insert(token) {
            continue;
        }
        let idx = token as usize;
        if idx >= logits.len() {
            continue;
        }
        if logits[idx] < 0.0 {
            logits[idx] *= penalty;
        } else {
            logits[idx] /= penalty;
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&x| x / sum).collect()
}

/// Samples the next token id from raw logits, given generation history
/// for the repetition penalty. `temperature == 0.0` is greedy argmax.
pub fn sample(logits: &[f32], history: &[u32], params: &SamplingParams, rng: &mut impl Rng) -> u32 {
    let mut logits = logits.to_vec();
    apply_repetition_penalty(&mut logits, history, params.repetition_penalty);

    if params.temperature <= 0.0 {
        return argmax(&logits);
    }

    let scaled: Vec<f32> = logits.iter().map(|&x| x / params.temperature).collect();
    let mut ranked: Vec<usize> = (0..scaled.len()).collect();
    ranked.sort_by(|&a, &b| scaled[b].partial_cmp(&scaled[a]).unwrap());

    let top_k = if params.top_k == 0 { ranked.len() } else { params.top_k.min(ranked.len()) };
    let mut candidates: Vec<usize> = ranked.into_iter().take(top_k).collect();

    let candidate_logits: Vec<f32> = candidates.iter().map(|&i| scaled[i]).collect();
    let probs = softmax(&candidate_logits);

    if params.top_p < 1.0 {
        let mut cumulative = 0.0f32;
        let mut cutoff = candidates.len();
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if cumulative >= params.top_p {
                cutoff = i + 1;
                break;
            }
        }
        candidates.truncate(cutoff.max(1));
    }

    let candidate_logits: Vec<f32> = candidates.iter().map(|&i| scaled[i]).collect();
    let probs = softmax(&candidate_logits);

    let draw: f32 = rng.gen_range(0.0..1.0);
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if draw <= cumulative {
            return candidates[i] as u32;
        }
    }
    *candidates.last().unwrap() as u32
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn greedy_picks_argmax_regardless_of_seed() {
        let logits = vec![0.1, 5.0, 0.2, -1.0];
        let params = SamplingParams::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        assert_eq!(sample(&logits, &[], &params, &mut rng), 1);
    }

    #[test]
    fn repetition_penalty_pushes_negative_logit_further_down() {
        let mut logits = vec![-1.0, 2.0];
        apply_repetition_penalty(&mut logits, &[0], 2.0);
        assert_eq!(logits[0], -2.0);
    }

    #[test]
    fn repetition_penalty_divides_positive_logit() {
        let mut logits = vec![-1.0, 2.0];
        apply_repetition_penalty(&mut logits, &[1], 2.0);
        assert_eq!(logits[1], 1.0);
    }

    #[test]
    fn top_k_restricts_candidate_pool() {
        let logits = vec![0.0, 0.0, 0.0, 10.0];
        let params = SamplingParams { temperature: 1.0, top_p: 1.0, top_k: 1, repetition_penalty: 1.0 };
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert_eq!(sample(&logits, &[], &params, &mut rng), 3);
    }
}
