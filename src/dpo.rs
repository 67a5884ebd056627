//! Preference-pair data and DPO training over LoRA adapters

use crate::chat::{ChatModel, ExamTokenizer};
use crate::model::GptModel;
use crate::prompt::{dpo_prompt, medical_few_shot_history};
use anyhow::{bail, Context, Result};
use candle_core::{Device, IndexOp, ModuleT, Tensor, Var, D};
use candle_nn::ops::log_softmax;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};
use std::fs::{read_to_string, File};
use std::io::Write;
use std::path::Path;
use std::rc::Rc;
use tqdm::tqdm;

/// A prompt with an accepted and a rejected response.
///
/// The wire format matches the preference JSON produced by
/// [`generate_preference_dataset`]; `response_accepted` and `instruction` are
/// accepted as legacy spellings on input.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    #[serde(alias = "instruction")]
    pub question: String,
    #[serde(rename = "response_chosen", alias = "response_accepted")]
    pub chosen: String,
    #[serde(rename = "response_rejected")]
    pub rejected: String,
}

/// A reference instruction/response pair used to source accepted responses.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceExample {
    pub question: String,
    pub response: String,
}

pub fn load_reference_data<P: AsRef<Path>>(path: P) -> Result<Vec<ReferenceExample>> {
    let json_str = read_to_string(path.as_ref())
        .with_context(|| format!("Unable to read {}", path.as_ref().display()))?;
    Ok(serde_json::from_str(&json_str)?)
}

/// Loads preference records from a `.json` array or a `.jsonl` file.
pub fn load_preference_data<P: AsRef<Path>>(path: P) -> Result<Vec<PreferenceRecord>> {
    let json_str = read_to_string(path.as_ref())
        .with_context(|| format!("Unable to read {}", path.as_ref().display()))?;
    if path.as_ref().extension().is_some_and(|ext| ext == "jsonl") {
        json_str
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    } else {
        Ok(serde_json::from_str(&json_str)?)
    }
}

/// Builds preference pairs by sampling the target model for rejected
/// responses, with the accepted responses taken from the reference dataset.
///
/// Each pair is appended to `jsonl_path` as soon as it is generated, so a
/// partial run still leaves usable data; the full array is written to
/// `json_path` at the end.
pub fn generate_preference_dataset<M: ChatModel>(
    model: &mut M,
    reference: &[ReferenceExample],
    jsonl_path: impl AsRef<Path>,
    json_path: impl AsRef<Path>,
    limit: Option<usize>,
) -> Result<Vec<PreferenceRecord>> {
    let history = medical_few_shot_history();
    let take = limit.unwrap_or(reference.len()).min(reference.len());
    let mut jsonl_file = File::create(jsonl_path.as_ref())
        .with_context(|| format!("Unable to create {}", jsonl_path.as_ref().display()))?;

    let mut records = Vec::with_capacity(take);
    for example in tqdm(reference.iter().take(take)) {
        let (rejected, _history) = model.chat(&example.question, &history)?;
        let record = PreferenceRecord {
            question: example.question.clone(),
            chosen: example.response.clone(),
            rejected,
        };
        writeln!(jsonl_file, "{}", serde_json::to_string(&record)?)?;
        records.push(record);
    }

    println!(
        "Saving preference data to {:?}",
        json_path.as_ref().to_str()
    );
    let json_file = File::create(json_path.as_ref())
        .with_context(|| format!("Unable to create {}", json_path.as_ref().display()))?;
    serde_json::to_writer_pretty(json_file, &records)?;
    Ok(records)
}

/// Drops records whose prompt+response token length would overflow the
/// training window: a record is kept iff both prompt+chosen and
/// prompt+rejected have token counts in `(0, full_max_length]`.
///
/// Returns the surviving records and the number dropped.
pub fn filter_preference_records(
    records: Vec<PreferenceRecord>,
    tokenizer: &ExamTokenizer,
    full_max_length: usize,
) -> Result<(Vec<PreferenceRecord>, usize)> {
    let mut kept = Vec::with_capacity(records.len());
    let mut dropped = 0_usize;
    for record in records {
        let prompt = dpo_prompt(&record.question);
        let chosen_len = tokenizer.count_tokens(&format!("{}{}", prompt, record.chosen))?;
        let rejected_len = tokenizer.count_tokens(&format!("{}{}", prompt, record.rejected))?;
        let in_window = |len: usize| len > 0 && len <= full_max_length;
        if in_window(chosen_len) && in_window(rejected_len) {
            kept.push(record);
        } else {
            dropped += 1;
        }
    }
    Ok((kept, dropped))
}

/// A tokenized preference record: prompt length plus the full
/// prompt+response token sequences for both sides.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedPreferenceExample {
    prompt_len: usize,
    chosen: Vec<u32>,
    rejected: Vec<u32>,
}

impl EncodedPreferenceExample {
    pub fn from_record(record: &PreferenceRecord, tokenizer: &ExamTokenizer) -> Result<Self> {
        let prompt = dpo_prompt(&record.question);
        let prompt_tokens = tokenizer.encode(&prompt)?;
        let chosen = tokenizer.encode(&format!("{}{}", prompt, record.chosen))?;
        let rejected = tokenizer.encode(&format!("{}{}", prompt, record.rejected))?;
        Ok(Self {
            prompt_len: prompt_tokens.len(),
            chosen,
            rejected,
        })
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }
}

pub struct PreferenceDataset_ {
    data: Vec<PreferenceRecord>,
    encoded: Vec<EncodedPreferenceExample>,
}

/// An encoded preference dataset.
///
/// Wraps `PreferenceDataset_` behind an `Rc` so cloning into a batcher is
/// cheap.
#[derive(Clone)]
pub struct PreferenceDataset(Rc<PreferenceDataset_>);

impl AsRef<PreferenceDataset> for PreferenceDataset {
    fn as_ref(&self) -> &PreferenceDataset {
        self
    }
}

impl std::ops::Deref for PreferenceDataset {
    type Target = PreferenceDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PreferenceDataset {
    pub fn new(data: Vec<PreferenceRecord>, tokenizer: &ExamTokenizer) -> Result<Self> {
        let encoded = data
            .iter()
            .map(|record| EncodedPreferenceExample::from_record(record, tokenizer))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(Rc::new(PreferenceDataset_ { data, encoded })))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Vec<PreferenceRecord> {
        &self.data
    }

    pub fn get_item_at_index(&self, idx: usize) -> Result<&EncodedPreferenceExample> {
        self.encoded
            .get(idx)
            .with_context(|| format!("index {} out of bounds", idx))
    }
}

/// One collated training batch. Masks select the response tokens of the
/// shifted targets, so padding and prompt positions contribute nothing to
/// the sequence log-probabilities.
pub struct PreferenceBatch {
    pub chosen_ids: Tensor,
    pub chosen_mask: Tensor,
    pub rejected_ids: Tensor,
    pub rejected_mask: Tensor,
}

#[derive(Clone, Debug)]
pub struct PreferenceCollator {
    pad_token_id: u32,
    allowed_max_length: Option<usize>,
    device: Device,
}

impl Default for PreferenceCollator {
    fn default() -> Self {
        Self::new()
    }
}

impl PreferenceCollator {
    pub fn new() -> Self {
        Self {
            pad_token_id: 0,
            allowed_max_length: None,
            device: Device::Cpu,
        }
    }

    pub fn pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn allowed_max_length(mut self, allowed_max_length: Option<usize>) -> Self {
        self.allowed_max_length = allowed_max_length;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn collate(&self, batch: Vec<&EncodedPreferenceExample>) -> candle_core::Result<PreferenceBatch> {
        let chosen: Vec<(&[u32], usize)> = batch
            .iter()
            .map(|ex| (ex.chosen.as_slice(), ex.prompt_len))
            .collect();
        let rejected: Vec<(&[u32], usize)> = batch
            .iter()
            .map(|ex| (ex.rejected.as_slice(), ex.prompt_len))
            .collect();
        let (chosen_ids, chosen_mask) = self.pad_side(&chosen)?;
        let (rejected_ids, rejected_mask) = self.pad_side(&rejected)?;
        Ok(PreferenceBatch {
            chosen_ids,
            chosen_mask,
            rejected_ids,
            rejected_mask,
        })
    }

    fn pad_side(&self, sequences: &[(&[u32], usize)]) -> candle_core::Result<(Tensor, Tensor)> {
        let batch_max = sequences
            .iter()
            .map(|(ids, _)| {
                let len = ids.len();
                self.allowed_max_length.map_or(len, |max| len.min(max))
            })
            .max()
            .unwrap_or(0)
            .max(2);

        let mut id_buf = Vec::with_capacity(sequences.len() * batch_max);
        let mut mask_buf = Vec::with_capacity(sequences.len() * (batch_max - 1));
        for (ids, prompt_len) in sequences {
            let truncated = &ids[..ids.len().min(batch_max)];
            let seq_len = truncated.len();
            let prompt_len = (*prompt_len).min(seq_len);

            id_buf.extend_from_slice(truncated);
            id_buf.extend(std::iter::repeat(self.pad_token_id).take(batch_max - seq_len));

            // target position j holds token j+1 of the sequence
            mask_buf.extend((0..batch_max - 1).map(|j| {
                let target = j + 1;
                if target >= prompt_len && target < seq_len {
                    1f32
                } else {
                    0f32
                }
            }));
        }

        let ids = Tensor::from_vec(id_buf, (sequences.len(), batch_max), &self.device)?;
        let mask = Tensor::from_vec(mask_buf, (sequences.len(), batch_max - 1), &self.device)?;
        Ok((ids, mask))
    }
}

/// A data loader generating collated preference batches.
pub struct PreferenceDataLoader {
    dataset: PreferenceDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    collator: PreferenceCollator,
}

impl PreferenceDataLoader {
    pub fn new(
        dataset: PreferenceDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        collator: PreferenceCollator,
    ) -> Self {
        Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            collator,
        }
    }

    pub fn dataset(&self) -> &PreferenceDataset {
        &self.dataset
    }

    pub fn batcher(&self) -> PreferenceBatcher {
        let mut remaining_indices = (0..self.dataset.len()).rev().collect::<Vec<_>>();
        if self.shuffle {
            remaining_indices.shuffle(&mut thread_rng());
        }
        PreferenceBatcher {
            dataset: self.dataset.clone(),
            collator: self.collator.clone(),
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            remaining_indices,
        }
    }

    /// The number of batches one pass yields.
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            self.dataset.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct PreferenceBatcher {
    dataset: PreferenceDataset,
    collator: PreferenceCollator,
    batch_size: usize,
    drop_last: bool,
    remaining_indices: Vec<usize>,
}

impl Iterator for PreferenceBatcher {
    type Item = candle_core::Result<PreferenceBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining_indices.is_empty() {
            return None;
        }
        if self.remaining_indices.len() < self.batch_size && self.drop_last {
            self.remaining_indices.clear();
            return None;
        }
        let mut examples = Vec::with_capacity(self.batch_size);
        while examples.len() < self.batch_size {
            match self.remaining_indices.pop() {
                Some(idx) => examples.push(&self.dataset.encoded[idx]),
                None => break,
            }
        }
        Some(self.collator.collate(examples))
    }
}

/// Summed response log-probabilities per sequence, `[batch]`.
pub fn batch_log_probs(
    model: &GptModel,
    input_ids: &Tensor,
    response_mask: &Tensor,
    train: bool,
) -> candle_core::Result<Tensor> {
    let logits = model.forward_t(input_ids, train)?;
    let (_b, seq_len, _vocab_size) = logits.dims3()?;
    let log_probs = log_softmax(&logits.i((.., ..seq_len - 1, ..))?.contiguous()?, D::Minus1)?;
    let targets = input_ids.i((.., 1..))?.contiguous()?;
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let mask = response_mask.to_dtype(picked.dtype())?;
    (picked * mask)?.sum(D::Minus1)
}

/// The DPO objective: `-log sigmoid(beta * ((pi_c - pi_r) - (ref_c - ref_r)))`
/// averaged over the batch.
pub fn dpo_loss(
    policy_chosen: &Tensor,
    policy_rejected: &Tensor,
    reference_chosen: &Tensor,
    reference_rejected: &Tensor,
    beta: f64,
) -> candle_core::Result<Tensor> {
    let margin = ((policy_chosen - policy_rejected)? - (reference_chosen - reference_rejected)?)?;
    let z = (margin * beta)?;
    // -log sigmoid(z) == ln(1 + exp(-z))
    (z.neg()?.exp()? + 1.0)?.log()?.mean_all()
}

/// DPO hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct DpoTrainConfig {
    pub beta: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_steps: usize,
    pub eval_steps: usize,
    pub logging_steps: usize,
    pub batch_size: usize,
    pub max_source_length: usize,
    pub max_target_length: usize,
}

impl Default for DpoTrainConfig {
    fn default() -> Self {
        Self {
            beta: 0.1,
            learning_rate: 5e-4,
            weight_decay: 0.05,
            max_steps: 200,
            eval_steps: 50,
            logging_steps: 1,
            batch_size: 4,
            max_source_length: 256,
            max_target_length: 256,
        }
    }
}

impl DpoTrainConfig {
    /// The training window: records beyond this combined token length are
    /// filtered out before training.
    pub fn full_max_length(&self) -> usize {
        self.max_source_length + self.max_target_length
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DpoMetrics {
    pub steps: usize,
    pub train_loss_final: f32,
    pub train_loss_mean: f32,
    pub val_loss: Option<f32>,
    pub train_samples: usize,
    pub dropped_records: usize,
}

/// Runs DPO over the policy's trainable variables (the LoRA adapters), with
/// the frozen `reference` model providing the baseline log-probabilities.
pub fn train_dpo(
    policy: &GptModel,
    reference: &GptModel,
    trainable: Vec<Var>,
    train_loader: &PreferenceDataLoader,
    val_loader: Option<&PreferenceDataLoader>,
    cfg: &DpoTrainConfig,
) -> Result<DpoMetrics> {
    if trainable.is_empty() {
        bail!("no trainable parameters; inject LoRA adapters before training");
    }
    let mut optimizer = AdamW::new(
        trainable,
        ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: cfg.weight_decay,
            ..Default::default()
        },
    )?;

    let mut losses = Vec::with_capacity(cfg.max_steps);
    let mut step = 0_usize;
    'training: loop {
        let mut yielded = false;
        for batch in train_loader.batcher() {
            yielded = true;
            let batch = batch?;
            let policy_chosen =
                batch_log_probs(policy, &batch.chosen_ids, &batch.chosen_mask, true)?;
            let policy_rejected =
                batch_log_probs(policy, &batch.rejected_ids, &batch.rejected_mask, true)?;
            let reference_chosen =
                batch_log_probs(reference, &batch.chosen_ids, &batch.chosen_mask, false)?.detach();
            let reference_rejected =
                batch_log_probs(reference, &batch.rejected_ids, &batch.rejected_mask, false)?
                    .detach();

            let loss = dpo_loss(
                &policy_chosen,
                &policy_rejected,
                &reference_chosen,
                &reference_rejected,
                cfg.beta,
            )?;
            optimizer.backward_step(&loss)?;

            let loss_value = loss.to_scalar::<f32>()?;
            losses.push(loss_value);
            step += 1;
            if cfg.logging_steps > 0 && step % cfg.logging_steps == 0 {
                println!("step {}/{}: dpo loss {:.4}", step, cfg.max_steps, loss_value);
            }
            if let Some(loader) = val_loader {
                if cfg.eval_steps > 0 && step % cfg.eval_steps == 0 {
                    let val_loss = evaluate_dpo(policy, reference, loader, cfg.beta)?;
                    println!("step {}/{}: val loss {:.4}", step, cfg.max_steps, val_loss);
                }
            }
            if step >= cfg.max_steps {
                break 'training;
            }
        }
        if !yielded {
            bail!("training loader produced no batches; lower the batch size or add data");
        }
    }

    let val_loss = match val_loader {
        Some(loader) => Some(evaluate_dpo(policy, reference, loader, cfg.beta)?),
        None => None,
    };
    let train_loss_mean = losses.iter().sum::<f32>() / losses.len().max(1) as f32;
    Ok(DpoMetrics {
        steps: step,
        train_loss_final: losses.last().copied().unwrap_or(f32::NAN),
        train_loss_mean,
        val_loss,
        train_samples: train_loader.dataset().len(),
        dropped_records: 0,
    })
}

/// Mean DPO loss over a validation loader, without gradient updates.
pub fn evaluate_dpo(
    policy: &GptModel,
    reference: &GptModel,
    loader: &PreferenceDataLoader,
    beta: f64,
) -> Result<f32> {
    let mut total = 0f32;
    let mut batches = 0_usize;
    for batch in loader.batcher() {
        let batch = batch?;
        let policy_chosen =
            batch_log_probs(policy, &batch.chosen_ids, &batch.chosen_mask, false)?.detach();
        let policy_rejected =
            batch_log_probs(policy, &batch.rejected_ids, &batch.rejected_mask, false)?.detach();
        let reference_chosen =
            batch_log_probs(reference, &batch.chosen_ids, &batch.chosen_mask, false)?.detach();
        let reference_rejected =
            batch_log_probs(reference, &batch.rejected_ids, &batch.rejected_mask, false)?.detach();
        let loss = dpo_loss(
            &policy_chosen,
            &policy_rejected,
            &reference_chosen,
            &reference_rejected,
            beta,
        )?;
        total += loss.to_scalar::<f32>()?;
        batches += 1;
    }
    if batches == 0 {
        bail!("validation loader produced no batches");
    }
    Ok(total / batches as f32)
}
