//! CLI for training the small BNN classifier on synthetic data.

use std::io::Write;
use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::{loss, VarBuilder, VarMap};
use clap::Parser;

use lowbit_core::{binary_distribution, Variable};
use lowbit_optim::{Bop, Optimizer};
use lowbit_train::{
    accuracy, batch_to_tensors, binarize_kernels, bnn_optimizer, load_optimizer,
    synthetic_classification, SmallBnn, Trainer, TrainerConfig,
};

#[derive(Parser, Debug)]
#[command(name = "lowbit-train", about = "Train a binarized classifier with Bop")]
struct Args {
    /// Optimizer `{class_name, config}` JSON saved by an earlier run. Without
    /// it, Bop trains the binary kernels and Adam the rest.
    #[arg(long)]
    optimizer_config: Option<PathBuf>,
    #[arg(long, default_value = "checkpoints")]
    output_dir: PathBuf,
    #[arg(long, default_value = "1000")]
    samples: usize,
    #[arg(long, default_value = "10")]
    input_dim: usize,
    #[arg(long, default_value = "20")]
    hidden_dim: usize,
    #[arg(long, default_value = "2")]
    num_classes: usize,
    #[arg(long, default_value = "16")]
    batch_size: usize,
    #[arg(long, default_value = "5")]
    epochs: usize,
    #[arg(long, default_value = "1337")]
    seed: u64,
    #[arg(long, default_value = "1e-7")]
    threshold: f64,
    #[arg(long, default_value = "1e-2")]
    gamma: f64,
    #[arg(long, default_value = "1e-2")]
    lr: f64,
    #[arg(long, default_value = "0.0")]
    grad_clip_max_norm: f64,
    #[arg(long, default_value = "50")]
    log_every: usize,
    #[arg(long, default_value = "0")]
    debug_every: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let loaded = match &args.optimizer_config {
        Some(path) => load_optimizer(path, None)?,
        None => None,
    };
    let optimizer: Box<dyn Optimizer> = match loaded {
        Some(optimizer) => optimizer,
        None => Box::new(bnn_optimizer(args.threshold, args.gamma, args.lr)),
    };

    let device = Device::cuda_if_available(0)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = SmallBnn::new(vb, args.input_dim, args.hidden_dim, args.num_classes)?;
    let vars = Variable::from_varmap(&varmap);
    let binary = binarize_kernels(&vars)?;
    eprintln!("{} variables, {binary} binary kernels", vars.len());

    let trainer_config = TrainerConfig {
        grad_clip_max_norm: args.grad_clip_max_norm,
        log_every: args.log_every,
        debug_every: args.debug_every,
        output_dir: args.output_dir.clone(),
    };
    let mut trainer = Trainer::new(vars, optimizer, trainer_config);

    let dataset = synthetic_classification(
        args.samples,
        args.input_dim,
        args.num_classes,
        args.seed,
    );
    let (all_x, all_y) = dataset.to_tensors(&device)?;

    std::fs::create_dir_all(&args.output_dir)?;
    let mut metrics_file = std::fs::File::create(args.output_dir.join("metrics.csv"))?;
    writeln!(metrics_file, "epoch,mean_loss,accuracy")?;

    for epoch in 0..args.epochs {
        let mut loss_sum = 0.0f32;
        let mut batches = 0usize;
        for (x, y) in dataset.batches(args.batch_size) {
            let (x, y) = batch_to_tensors(x, y, args.input_dim, &device)?;
            let l = loss::cross_entropy(&model.forward(&x)?, &y)?;
            let metrics = trainer.step(&l)?;
            loss_sum += metrics.loss;
            batches += 1;
        }

        let mean_loss = loss_sum / batches.max(1) as f32;
        let acc = accuracy(&model.forward(&all_x)?, &all_y)?;
        writeln!(metrics_file, "{epoch},{mean_loss:.6},{acc:.4}")?;
        tracing::info!(
            epoch,
            mean_loss = format!("{mean_loss:.4}"),
            accuracy = format!("{acc:.4}"),
            "epoch done"
        );
    }

    for var in trainer.vars().iter().filter(|v| Bop::is_binary_variable(v)) {
        let (neg, pos) = binary_distribution(var.as_tensor())?;
        tracing::info!(variable = var.name(), neg, pos, "binary kernel distribution");
    }

    let path = trainer.save_optimizer_config()?;
    eprintln!(
        "Done. {} steps, optimizer config saved to {}",
        trainer.global_step,
        path.display()
    );
    Ok(())
}
