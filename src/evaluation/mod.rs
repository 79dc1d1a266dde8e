/// Evaluation: run a compiled model over every batch of a provider
use crate::config::EvalConfig;
use crate::data::Provider;
use crate::models::{Backend, Model};
use crate::utils::{batch_len, leading_dim, Outputs};
use crate::{EvalError, Result};

pub mod accumulator;

pub use accumulator::{
    accumulator_for, GrowingAccumulator, PreallocatedAccumulator, ResultAccumulator, Rows,
};

/// Compiled handle type of a model's backend
pub type CompiledOf<M> = <<M as Model>::Backend as Backend<M>>::Compiled;

/// Predictions and, when the provider carries it, matching ground truth
pub type Evaluation = (Outputs, Option<Outputs>);

/// Per-batch callback: `(predicted, truth)`
pub type Callback<'a> = dyn FnMut(&Outputs, Option<&Outputs>) -> Result<()> + 'a;

/// Runs trained models over streamed data.
///
/// Owns the model and its compiled handle. The handle is produced once and
/// reused by every pass until `compile(true, ..)` replaces it.
pub struct Evaluator<M: Model> {
    model: M,
    compiled: Option<CompiledOf<M>>,
    log_every: usize,
}

impl<M: Model> Evaluator<M> {
    /// Create an evaluator for `model`
    pub fn new(model: M) -> Self {
        Self {
            model,
            compiled: None,
            log_every: EvalConfig::default().log_every,
        }
    }

    /// Create an evaluator using run settings
    pub fn from_config(model: M, config: &EvalConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(model).with_log_every(config.log_every))
    }

    /// Log progress every `log_every` batches
    pub fn with_log_every(mut self, log_every: usize) -> Self {
        self.log_every = log_every.max(1);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    pub fn compiled(&self) -> Option<&CompiledOf<M>> {
        self.compiled.as_ref()
    }

    /// Compile the model for its backend.
    ///
    /// Does nothing when already compiled, unless `recompile` is set. A model
    /// that was never built is built here, after seeing `with_provider`.
    /// Afterwards every source the model needs is added to `with_provider`.
    pub fn compile(
        &mut self,
        recompile: bool,
        with_provider: Option<&mut dyn Provider>,
    ) -> Result<()> {
        if self.compiled.is_some() && !recompile {
            return Ok(());
        }

        if !self.model.is_built() {
            log::warn!(
                "This model has never been built before. Building it now, but models \
                 should be built before they are compiled so that problems in the \
                 model definition surface early."
            );
            if let Some(provider) = with_provider.as_deref() {
                self.model.register_provider(provider)?;
            }
            self.model.build()?;
        }

        let compiled = self.model.backend().compile(&self.model)?;
        self.compiled = Some(compiled);
        log::debug!("Model compiled");

        if let Some(provider) = with_provider {
            for (name, source) in self.model.data_sources() {
                log::debug!("Adding model source '{}' to the provider", name);
                provider.add_source(&name, source)?;
            }
        }

        Ok(())
    }

    /// Evaluate the model on every batch of `provider`.
    ///
    /// Returns one array per model output with one row per record, in
    /// provider order. Ground truth is returned when the first batch carries
    /// every output name as a key; otherwise it is `None`. Any failure aborts
    /// the pass without a partial result.
    pub fn evaluate(&mut self, provider: &mut dyn Provider) -> Result<Evaluation> {
        Ok(self.run(provider, None)?.unwrap_or_default())
    }

    /// Evaluate the model, handing each batch's outputs to `callback` instead
    /// of keeping them.
    ///
    /// Nothing is accumulated and ground truth is never assembled in this
    /// mode, so the callback always sees `None` for truth. An error returned
    /// by the callback aborts the pass.
    pub fn evaluate_with_callback<F>(
        &mut self,
        provider: &mut dyn Provider,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(&Outputs, Option<&Outputs>) -> Result<()>,
    {
        let callback: &mut Callback<'_> = &mut callback;
        self.run(provider, Some(callback)).map(|_| ())
    }

    fn run(
        &mut self,
        provider: &mut dyn Provider,
        mut callback: Option<&mut Callback<'_>>,
    ) -> Result<Option<Evaluation>> {
        self.compile(false, Some(&mut *provider))?;

        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| EvalError::Model("model is not compiled".to_string()))?;
        let model = &self.model;

        let total = provider.len();
        match total {
            Some(n) => log::info!("Evaluating {} records", n),
            None => log::info!("Evaluating an unknown number of records"),
        }

        let mut result: Option<Box<dyn ResultAccumulator>> = None;
        let mut truth: Option<Box<dyn ResultAccumulator>> = None;
        let mut has_truth: Option<bool> = None;
        let mut n_entries = 0usize;
        let mut n_batches = 0usize;

        for batch in provider.batches()? {
            let mut batch = batch?;
            let evaluated = model.backend().evaluate(model, &batch, compiled)?;
            let batch_size = batch_len(&batch)?;

            // Decided on the first batch and kept for the whole pass, even if
            // later batches would say otherwise.
            let has_truth = *has_truth
                .get_or_insert_with(|| model.outputs().iter().all(|k| batch.contains_key(k)));

            match callback.as_deref_mut() {
                Some(callback) => callback(&evaluated, None)?,
                None => {
                    for (key, value) in &evaluated {
                        let n = leading_dim(value)?;
                        if n != batch_size {
                            return Err(EvalError::Shape(format!(
                                "backend returned {} rows of '{}' for a batch of {}",
                                n, key, batch_size
                            )));
                        }
                    }
                    absorb(&mut result, total, n_entries, evaluated.into_iter().collect())?;

                    if has_truth {
                        let rows = model
                            .outputs()
                            .iter()
                            .map(|k| {
                                let value = batch.remove(k).ok_or_else(|| {
                                    EvalError::Shape(format!(
                                        "ground truth '{}' missing from batch {}",
                                        k, n_batches
                                    ))
                                })?;
                                Ok((k.clone(), value))
                            })
                            .collect::<Result<Rows>>()?;
                        absorb(&mut truth, total, n_entries, rows)?;
                    }
                }
            }

            n_entries += batch_size;
            n_batches += 1;

            log::debug!("Batch {}: {} records", n_batches, batch_size);
            if n_batches % self.log_every == 0 {
                match total {
                    Some(n) => log::info!("Evaluated {}/{} records", n_entries, n),
                    None => log::info!("Evaluated {} records", n_entries),
                }
            }
        }

        log::info!(
            "Evaluation complete: {} records in {} batches",
            n_entries,
            n_batches
        );

        if callback.is_some() {
            return Ok(None);
        }

        let predicted = result.unwrap_or_else(|| accumulator_for(total)).finalize()?;
        let truth = truth.map(|acc| acc.finalize()).transpose()?;

        Ok(Some((predicted, truth)))
    }
}

/// Merge `rows` into `slot`, creating the accumulator on first use
fn absorb(
    slot: &mut Option<Box<dyn ResultAccumulator>>,
    total: Option<usize>,
    offset: usize,
    rows: Rows,
) -> Result<()> {
    if slot.is_none() {
        let mut accumulator = accumulator_for(total);
        accumulator.initialize(&rows)?;
        *slot = Some(accumulator);
    }

    match slot.as_mut() {
        Some(accumulator) => accumulator.absorb(offset, rows),
        None => Ok(()),
    }
}
