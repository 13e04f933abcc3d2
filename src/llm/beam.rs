use std::cmp::Ordering;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::error::InferenceError;
use crate::llm::models::Seq2SeqModel;

#[derive(Debug, Clone)]
pub struct BeamSearchParams {
    pub num_beams: usize,
    /// Upper bound on the decoder sequence, decoder start token included.
    pub max_length: usize,
    /// Stop as soon as `num_beams` hypotheses have emitted the end token.
    pub early_stopping: bool,
    pub length_penalty: f64,
}

impl BeamSearchParams {
    pub fn new(num_beams: usize, max_length: usize) -> Self {
        Self {
            num_beams,
            max_length,
            early_stopping: true,
            length_penalty: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    score: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f64,
    beam: usize,
    token: u32,
}

/// Finished hypotheses, capped at `num_beams` best by normalized score.
struct Hypotheses {
    capacity: usize,
    length_penalty: f64,
    early_stopping: bool,
    entries: Vec<(f64, Vec<u32>)>,
}

impl Hypotheses {
    fn new(params: &BeamSearchParams) -> Self {
        Self {
            capacity: params.num_beams,
            length_penalty: params.length_penalty,
            early_stopping: params.early_stopping,
            entries: Vec::with_capacity(params.num_beams + 1),
        }
    }

    fn normalize(&self, sum_logprobs: f64, generated_len: usize) -> f64 {
        sum_logprobs / (generated_len.max(1) as f64).powf(self.length_penalty)
    }

    fn worst(&self) -> Option<f64> {
        self.entries.iter().map(|(s, _)| *s).min_by(|a, b| a.total_cmp(b))
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f64, generated_len: usize) {
        let score = self.normalize(sum_logprobs, generated_len);
        if self.entries.len() < self.capacity || self.worst().is_some_and(|w| score > w) {
            self.entries.push((score, tokens));
            if self.entries.len() > self.capacity {
                if let Some(idx) = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0))
                    .map(|(i, _)| i)
                {
                    self.entries.remove(idx);
                }
            }
        }
    }

    fn is_done(&self, best_running: f64, cur_len: usize) -> bool {
        if self.entries.len() < self.capacity {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        // Can any running beam still beat the worst finished hypothesis?
        self.worst()
            .is_some_and(|w| w >= self.normalize(best_running, cur_len))
    }

    fn best(self) -> Option<Vec<u32>> {
        self.entries
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, tokens)| tokens)
    }
}

/// Beam-search decoding over an already encoded prompt.
///
/// Returns the generated token ids without the decoder start token and
/// without the end token.
pub fn beam_search(
    model: &mut dyn Seq2SeqModel,
    encoder_output: &Tensor,
    params: &BeamSearchParams,
) -> Result<Vec<u32>, InferenceError> {
    if params.num_beams == 0 {
        return Err(InferenceError::InvalidParams("num_beams must be at least 1".into()));
    }

    let eos = model.eos_token_id();
    let device = encoder_output.device().clone();
    let width = 2 * params.num_beams;

    // Only one live beam on the first step, so the start token is not
    // expanded num_beams times into identical hypotheses.
    let mut beams = vec![Beam {
        tokens: vec![model.decoder_start_token_id()],
        score: 0.0,
    }];
    let mut finished = Hypotheses::new(params);
    let mut done = false;

    while !beams.is_empty() && beams[0].tokens.len() < params.max_length {
        let cur_len = beams[0].tokens.len();
        let batch = beams.len();

        let flat: Vec<u32> = beams.iter().flat_map(|b| b.tokens.iter().copied()).collect();
        let decoder_input = Tensor::from_vec(flat, (batch, cur_len), &device)?;
        let encoder_batch = if batch == 1 {
            encoder_output.clone()
        } else {
            encoder_output.repeat((batch, 1, 1))?
        };

        let logits = model.decode(&decoder_input, &encoder_batch)?;
        let log_probs = log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?.to_vec2::<f32>()?;

        let mut candidates: Vec<Candidate> = log_probs
            .iter()
            .enumerate()
            .flat_map(|(beam, row)| {
                let base = beams[beam].score;
                row.iter().enumerate().map(move |(token, lp)| Candidate {
                    score: base + *lp as f64,
                    beam,
                    token: token as u32,
                })
            })
            .collect();
        top_k(&mut candidates, width);

        let mut next = Vec::with_capacity(params.num_beams);
        for (rank, cand) in candidates.iter().enumerate() {
            if cand.token == eos {
                // An end token outside the top num_beams ranks does not
                // close a hypothesis.
                if rank >= params.num_beams {
                    continue;
                }
                let tokens = beams[cand.beam].tokens[1..].to_vec();
                finished.add(tokens, cand.score, cur_len);
            } else {
                let mut tokens = beams[cand.beam].tokens.clone();
                tokens.push(cand.token);
                next.push(Beam {
                    tokens,
                    score: cand.score,
                });
            }
            if next.len() == params.num_beams {
                break;
            }
        }

        beams = next;
        let best_running = beams.first().map_or(f64::NEG_INFINITY, |b| b.score);
        if finished.is_done(best_running, cur_len + 1) {
            done = true;
            break;
        }
    }

    if !done {
        for beam in &beams {
            let generated = beam.tokens.len() - 1;
            finished.add(beam.tokens[1..].to_vec(), beam.score, generated);
        }
    }

    Ok(finished.best().unwrap_or_default())
}

/// Keeps the `k` highest-scoring candidates, sorted best first.
fn top_k(candidates: &mut Vec<Candidate>, k: usize) {
    let by_score = |a: &Candidate, b: &Candidate| -> Ordering { b.score.total_cmp(&a.score) };
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k, by_score);
        candidates.truncate(k);
    }
    candidates.sort_by(by_score);
}
