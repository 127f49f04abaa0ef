//! Synthetic classification data and batching.
//!
//! Each class gets a random template vector; samples are the template plus
//! uniform noise. Seeded, so two calls with the same arguments agree.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// In-memory dataset of `(features, label)` rows.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<f32>,
    labels: Vec<u32>,
    input_dim: usize,
}

/// Clustered data: `samples` rows of `input_dim` features over `num_classes`.
pub fn synthetic_classification(
    samples: usize,
    input_dim: usize,
    num_classes: usize,
    seed: u64,
) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let spread = 2.0 * num_classes as f32;
    let templates: Vec<f32> = (0..num_classes * input_dim)
        .map(|_| spread * rng.gen::<f32>())
        .collect();

    let mut inputs = Vec::with_capacity(samples * input_dim);
    let mut labels = Vec::with_capacity(samples);
    for _ in 0..samples {
        let y = rng.gen_range(0..num_classes);
        let template = &templates[y * input_dim..(y + 1) * input_dim];
        inputs.extend(template.iter().map(|t| t + rng.gen_range(-1.0f32..1.0)));
        labels.push(y as u32);
    }

    Dataset {
        inputs,
        labels,
        input_dim,
    }
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Consecutive batches; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = (&[f32], &[u32])> + '_ {
        let batch_size = batch_size.max(1);
        self.inputs
            .chunks(batch_size * self.input_dim)
            .zip(self.labels.chunks(batch_size))
    }

    /// The whole dataset as one batch.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        batch_to_tensors(&self.inputs, &self.labels, self.input_dim, device)
    }
}

/// Raw batch → `(inputs [B, D], labels [B])` tensors.
pub fn batch_to_tensors(
    inputs: &[f32],
    labels: &[u32],
    input_dim: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let batch = labels.len();
    let x = Tensor::from_vec(inputs.to_vec(), (batch, input_dim), device)?;
    let y = Tensor::from_vec(labels.to_vec(), batch, device)?;
    Ok((x, y))
}
