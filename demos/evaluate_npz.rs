/// Evaluate a feed-forward model over a list of .npz records
///
/// Usage: evaluate_npz <file-list> <model.json> [eval.json]
///
/// Each line of the file list names one .npz record. The model's input field
/// is always read; output fields are read too when the first record has them,
/// and are then reported as ground truth.
use std::env;
use std::path::PathBuf;

use anyhow::Context;
use streameval::data::{BatchProvider, Sources, Supplier};
use streameval::{CandleBackend, EvalConfig, Evaluator, ModelConfig, SequentialModel};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 2 {
        anyhow::bail!("usage: evaluate_npz <file-list> <model.json> [eval.json]");
    }
    let file_list = PathBuf::from(&args[0]);

    let model_config = ModelConfig::from_file(&args[1])
        .with_context(|| format!("reading model config {}", args[1]))?;
    let eval_config = match args.get(2) {
        Some(path) => EvalConfig::from_file(path)
            .with_context(|| format!("reading eval config {}", path))?,
        None => EvalConfig::default(),
    };
    log::info!("Model configuration: {:#?}", model_config);
    log::info!("Evaluation configuration: {:#?}", eval_config);

    // Read truth fields only if the records carry them
    let input = model_config.input.clone();
    let outputs = model_config.output_names();
    let mut with_truth = vec![input.as_str()];
    with_truth.extend(outputs.iter().map(String::as_str));

    let supplier = match Supplier::from_file_list(&file_list, &with_truth) {
        Ok(supplier) => supplier,
        Err(e) => {
            log::info!("No ground truth in records ({}); evaluating inputs only", e);
            Supplier::from_file_list(&file_list, &[input.as_str()])?
        }
    };

    log::info!("Supplier loaded:");
    log::info!("  - Sources: {}", supplier.keys().join(", "));

    let sources = supplier.into_sources(Sources::All)?;
    let mut provider = BatchProvider::from_config(sources, &eval_config)?;

    // Device setup - Try CUDA first, fallback to CPU
    let backend = CandleBackend::cuda_if_available()?;
    log::info!("Using device: {:?}", backend.device());

    let model = SequentialModel::new(model_config, backend)?;
    let mut evaluator = Evaluator::from_config(model, &eval_config)?;

    let (predicted, truth) = evaluator.evaluate(&mut provider)?;

    log::info!("=== Evaluation Complete ===");
    let mut names: Vec<&String> = predicted.keys().collect();
    names.sort();
    for name in names {
        let values = &predicted[name];
        log::info!("  - {}: shape {:?}", name, values.shape());

        if let Some(expected) = truth.as_ref().and_then(|t| t.get(name)) {
            if expected.shape() == values.shape() && !values.is_empty() {
                let mae = (values - expected).mapv(f32::abs).mean().unwrap_or(0.0);
                log::info!("    mean absolute error: {:.6}", mae);
            }
        }
    }

    Ok(())
}
