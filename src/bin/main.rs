use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand};
use exam_eval_rs::chat::{ChatModel, ExamTokenizer, GptChatModel, StubChatModel};
use exam_eval_rs::dpo::{
    filter_preference_records, generate_preference_dataset, load_preference_data,
    load_reference_data, train_dpo, DpoTrainConfig, PreferenceCollator, PreferenceDataLoader,
    PreferenceDataset,
};
use exam_eval_rs::eval::{
    print_accuracy_table, submission_entry, Evaluator, RunDir, ACCURACY_FILENAME,
    RAW_TEXTS_FILENAME, SUBMISSION_FILENAME,
};
use exam_eval_rs::exam::{
    choice_set, download_and_unzip_exam_data, load_exam_csv, load_subject_mapping,
    subject_csv_path, Split, EXAM_DATA_URL,
};
use exam_eval_rs::lora::LoraConfig;
use exam_eval_rs::model::{download_pretrained, GptModel, ModelConfig};
use exam_eval_rs::prompt::MEDICAL_SYSTEM_PROMPT;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

/// CLI
#[derive(Debug, Parser)]
#[command(name = "exam-eval-rs")]
#[command(about = "Evaluate causal LMs on Chinese multiple-choice exams and tune them with DPO.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Evaluate on the validation split and report accuracy
    Eval(EvalArgs),
    /// Predict on the test split and write a submission file
    Test(TestArgs),
    /// Build preference pairs by sampling rejected responses from the model
    GenPreference(GenPreferenceArgs),
    /// Preference-tune LoRA adapters with DPO
    DpoTrain(DpoTrainArgs),
    /// Download and unpack the exam benchmark data
    DownloadData(DownloadDataArgs),
}

#[derive(Debug, Args)]
struct ModelArgs {
    /// Model preset: base | medium
    #[arg(long, default_value = "base")]
    preset: String,
    /// Local safetensors checkpoint to load
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// HuggingFace hub model id to fetch the checkpoint from instead
    #[arg(long)]
    model_id: Option<String>,
    /// Checkpoint filename within the hub repo
    #[arg(long, default_value = "model.safetensors")]
    weights_file: String,
    /// HuggingFace tokenizer.json; defaults to the GPT-2 BPE
    #[arg(long)]
    tokenizer: Option<PathBuf>,
    /// LoRA adapter checkpoint to load on top of the base weights
    #[arg(long)]
    lora_path: Option<PathBuf>,
    #[arg(long, default_value = "cpu")]
    device: String,
    #[arg(long, default_value = "f32")]
    dtype: String,
    #[arg(long, default_value_t = 256)]
    max_new_tokens: usize,
}

impl ModelArgs {
    fn device(&self) -> Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            cuda if cuda.starts_with("cuda") => {
                let ordinal = cuda
                    .split(':')
                    .nth(1)
                    .map(str::parse::<usize>)
                    .transpose()
                    .with_context(|| format!("Invalid device string '{}'", self.device))?
                    .unwrap_or(0);
                Ok(Device::new_cuda(ordinal)?)
            }
            other => bail!("Unknown device '{}'; expected 'cpu' or 'cuda:<n>'", other),
        }
    }

    fn dtype(&self) -> Result<DType> {
        match self.dtype.as_str() {
            "f32" => Ok(DType::F32),
            "f16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            other => bail!("Unknown dtype '{}'; expected f32, f16 or bf16", other),
        }
    }

    fn config(&self) -> Result<ModelConfig> {
        match self.preset.as_str() {
            "base" => Ok(ModelConfig::base()),
            "medium" => Ok(ModelConfig::medium()),
            other => bail!("Unknown preset '{}'; expected 'base' or 'medium'", other),
        }
    }

    fn tokenizer(&self) -> Result<ExamTokenizer> {
        match &self.tokenizer {
            Some(path) => ExamTokenizer::from_file(path),
            None => ExamTokenizer::gpt2(),
        }
    }

    fn build_model(&self) -> Result<(VarMap, GptModel)> {
        let device = self.device()?;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, self.dtype()?, &device);
        let model = GptModel::new(self.config()?, vb.pp("model"))?;

        if let Some(model_id) = &self.model_id {
            let weights = download_pretrained(model_id, &self.weights_file)?;
            varmap.load(weights)?;
        } else if let Some(checkpoint) = &self.checkpoint {
            varmap
                .load(checkpoint)
                .with_context(|| format!("Unable to load {}", checkpoint.display()))?;
        } else {
            println!("No checkpoint given; using randomly initialized weights");
        }
        Ok((varmap, model))
    }

    fn build_chat_model(&self) -> Result<GptChatModel> {
        let (_varmap, mut model) = self.build_model()?;
        if let Some(lora_path) = &self.lora_path {
            let mut lora_varmap = VarMap::new();
            let lora_vb = VarBuilder::from_varmap(&lora_varmap, self.dtype()?, &self.device()?);
            model.add_lora(&LoraConfig::default(), lora_vb.pp("model"))?;
            lora_varmap
                .load(lora_path)
                .with_context(|| format!("Unable to load {}", lora_path.display()))?;
        }
        Ok(GptChatModel::new(model, self.tokenizer()?, self.device()?)
            .max_new_tokens(self.max_new_tokens))
    }
}

#[derive(Debug, Args)]
struct EvalArgs {
    #[command(flatten)]
    model: ModelArgs,
    /// Number of few-shot exemplars taken from the dev split
    #[arg(long, short = 'k', default_value_t = 5)]
    ntrain: usize,
    #[arg(long)]
    few_shot: bool,
    /// Chain-of-thought prompting
    #[arg(long)]
    cot: bool,
    /// Subject key, or 'all' for every subject in the mapping file
    #[arg(long, short = 's', default_value = "operating_system")]
    subject: String,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
    #[arg(long, default_value = "subject_mapping.json")]
    subject_mapping: PathBuf,
    /// Name used for the run directory
    #[arg(long, default_value = "model")]
    model_name: String,
    /// Use a fixed-response stub instead of loading weights
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct TestArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[arg(long, short = 'k', default_value_t = 5)]
    ntrain: usize,
    #[arg(long)]
    few_shot: bool,
    #[arg(long)]
    cot: bool,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
    #[arg(long, default_value = "subject_mapping.json")]
    subject_mapping: PathBuf,
    #[arg(long, default_value = "model")]
    model_name: String,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct GenPreferenceArgs {
    #[command(flatten)]
    model: ModelArgs,
    /// Reference instruction/response JSON supplying the accepted responses
    #[arg(long)]
    reference_file: PathBuf,
    #[arg(long, default_value = "data/preference")]
    out_dir: PathBuf,
    /// Only process the first N reference examples
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DpoTrainArgs {
    #[command(flatten)]
    model: ModelArgs,
    #[arg(long)]
    train_file: PathBuf,
    #[arg(long)]
    validation_file: Option<PathBuf>,
    #[arg(long, default_value = "outputs-dpo")]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 0.1)]
    beta: f64,
    #[arg(long, default_value_t = 5e-4)]
    learning_rate: f64,
    #[arg(long, default_value_t = 0.05)]
    weight_decay: f64,
    #[arg(long, default_value_t = 200)]
    max_steps: usize,
    #[arg(long, default_value_t = 50)]
    eval_steps: usize,
    #[arg(long, default_value_t = 1)]
    logging_steps: usize,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    /// Max prompt token length
    #[arg(long, default_value_t = 256)]
    max_source_length: usize,
    /// Max response token length
    #[arg(long, default_value_t = 256)]
    max_target_length: usize,
    #[arg(long, default_value_t = 8)]
    lora_rank: usize,
    #[arg(long, default_value_t = 16.0)]
    lora_alpha: f64,
    #[arg(long, default_value_t = 0.05)]
    lora_dropout: f32,
}

#[derive(Debug, Args)]
struct DownloadDataArgs {
    #[arg(long, default_value = EXAM_DATA_URL)]
    url: String,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Eval(args) => run_eval(args),
        Commands::Test(args) => run_test(args),
        Commands::GenPreference(args) => run_gen_preference(args),
        Commands::DpoTrain(args) => run_dpo_train(args),
        Commands::DownloadData(args) => download_and_unzip_exam_data(&args.url, &args.data_dir),
    }
}

/// Resolves the subject list to (key, display name) pairs, falling back to
/// the key itself when the mapping file has no entry.
fn resolve_subjects(subject: &str, mapping_path: &Path) -> Result<Vec<(String, String)>> {
    if subject == "all" {
        let mapping = load_subject_mapping(mapping_path)?;
        Ok(mapping
            .into_iter()
            .map(|(key, names)| (key, names.chinese().to_string()))
            .collect())
    } else {
        let display = load_subject_mapping(mapping_path)
            .ok()
            .and_then(|mapping| {
                mapping
                    .into_iter()
                    .find(|(key, _)| key == subject)
                    .map(|(_, names)| names.chinese().to_string())
            })
            .unwrap_or_else(|| subject.to_string());
        Ok(vec![(subject.to_string(), display)])
    }
}

fn run_eval(args: EvalArgs) -> Result<()> {
    let subjects = resolve_subjects(&args.subject, &args.subject_mapping)?;
    let run_dir = RunDir::create(&args.logs_dir, &args.model_name)?;
    if args.dry_run {
        let mut model = StubChatModel::new("答案：A");
        eval_subjects(&mut model, &args, &subjects, &run_dir)
    } else {
        let mut model = args.model.build_chat_model()?;
        eval_subjects(&mut model, &args, &subjects, &run_dir)
    }
}

fn eval_subjects<M: ChatModel>(
    model: &mut M,
    args: &EvalArgs,
    subjects: &[(String, String)],
    run_dir: &RunDir,
) -> Result<()> {
    let mut summary_rows = Vec::new();
    let mut summary = serde_json::Map::new();
    for (subject, display) in subjects {
        println!("{}", subject);
        let val = load_exam_csv(subject_csv_path(&args.data_dir, Split::Val, subject))?;
        let dev = if args.few_shot {
            load_exam_csv(subject_csv_path(&args.data_dir, Split::Dev, subject))?
        } else {
            Vec::new()
        };
        let evaluator = Evaluator::new(choice_set(&val), args.ntrain, args.few_shot, args.cot);
        let outcome = evaluator.run_subject(model, display, &val, &dev)?;
        match outcome.accuracy {
            Some(accuracy) => {
                println!("Acc: {}", accuracy);
                summary.insert(subject.clone(), serde_json::Value::from(accuracy));
                summary_rows.push((subject.clone(), accuracy));
            }
            None => println!("No ground-truth answers in the val split for {}", subject),
        }
    }
    run_dir.write_json(ACCURACY_FILENAME, &summary)?;
    print_accuracy_table(&summary_rows);
    println!("Results saved to {}", run_dir.path().display());
    Ok(())
}

fn run_test(args: TestArgs) -> Result<()> {
    let subjects = resolve_subjects("all", &args.subject_mapping)?;
    let run_dir = RunDir::create(&args.logs_dir, &args.model_name)?;
    if args.dry_run {
        let mut model = StubChatModel::new("答案：A");
        test_subjects(&mut model, &args, &subjects, &run_dir)
    } else {
        let mut model = args.model.build_chat_model()?;
        test_subjects(&mut model, &args, &subjects, &run_dir)
    }
}

fn test_subjects<M: ChatModel>(
    model: &mut M,
    args: &TestArgs,
    subjects: &[(String, String)],
    run_dir: &RunDir,
) -> Result<()> {
    let mut submission = serde_json::Map::new();
    let mut raw_texts = serde_json::Map::new();
    for (subject, display) in subjects {
        println!("{}", subject);
        let test = load_exam_csv(subject_csv_path(&args.data_dir, Split::Test, subject))?;
        let dev = if args.few_shot {
            load_exam_csv(subject_csv_path(&args.data_dir, Split::Dev, subject))?
        } else {
            Vec::new()
        };
        let evaluator = Evaluator::new(choice_set(&test), args.ntrain, args.few_shot, args.cot);
        let outcome = evaluator.run_subject(model, display, &test, &dev)?;
        submission.insert(
            subject.clone(),
            serde_json::Value::Object(submission_entry(&outcome.predictions)),
        );
        raw_texts.insert(subject.clone(), serde_json::Value::from(outcome.raw_texts));
    }
    run_dir.write_json(SUBMISSION_FILENAME, &submission)?;
    run_dir.write_json(RAW_TEXTS_FILENAME, &raw_texts)?;
    println!("Results saved to {}", run_dir.path().display());
    Ok(())
}

fn run_gen_preference(args: GenPreferenceArgs) -> Result<()> {
    let reference = load_reference_data(&args.reference_file)?;
    println!("Number of reference entries: {}", reference.len());
    create_dir_all(&args.out_dir)?;
    let jsonl_path = args.out_dir.join("preference_pairs.jsonl");
    let json_path = args.out_dir.join("preference_pairs.json");

    if args.dry_run {
        let mut model = StubChatModel::new("答案：A。\n解释：略。");
        generate_preference_dataset(&mut model, &reference, jsonl_path, json_path, args.limit)?;
    } else {
        let mut model = args
            .model
            .build_chat_model()?
            .system_prompt(Some(MEDICAL_SYSTEM_PROMPT.to_string()));
        generate_preference_dataset(&mut model, &reference, jsonl_path, json_path, args.limit)?;
    }
    Ok(())
}

fn run_dpo_train(args: DpoTrainArgs) -> Result<()> {
    let device = args.model.device()?;
    let dtype = args.model.dtype()?;
    let tokenizer = args.model.tokenizer()?;
    let cfg = DpoTrainConfig {
        beta: args.beta,
        learning_rate: args.learning_rate,
        weight_decay: args.weight_decay,
        max_steps: args.max_steps,
        eval_steps: args.eval_steps,
        logging_steps: args.logging_steps,
        batch_size: args.batch_size,
        max_source_length: args.max_source_length,
        max_target_length: args.max_target_length,
    };

    let records = load_preference_data(&args.train_file)?;
    let (kept, dropped) = filter_preference_records(records, &tokenizer, cfg.full_max_length())?;
    if kept.is_empty() {
        bail!("no training records left after length filtering");
    }
    println!("Num train samples: {} ({} dropped)", kept.len(), dropped);
    let train_dataset = PreferenceDataset::new(kept, &tokenizer)?;

    let pad_token_id = tokenizer.eot_id().unwrap_or(0);
    let collator = PreferenceCollator::new()
        .pad_token_id(pad_token_id)
        .allowed_max_length(Some(cfg.full_max_length()))
        .device(device.clone());
    let train_loader =
        PreferenceDataLoader::new(train_dataset, cfg.batch_size, true, true, collator.clone());

    let val_loader = match &args.validation_file {
        Some(path) => {
            let records = load_preference_data(path)?;
            let (kept, val_dropped) =
                filter_preference_records(records, &tokenizer, cfg.full_max_length())?;
            println!("Num eval samples: {} ({} dropped)", kept.len(), val_dropped);
            if kept.is_empty() {
                None
            } else {
                let dataset = PreferenceDataset::new(kept, &tokenizer)?;
                Some(PreferenceDataLoader::new(
                    dataset,
                    cfg.batch_size,
                    false,
                    false,
                    collator.clone(),
                ))
            }
        }
        None => None,
    };

    let (_policy_varmap, mut policy) = args.model.build_model()?;
    let lora_cfg = LoraConfig {
        rank: args.lora_rank,
        alpha: args.lora_alpha,
        dropout: args.lora_dropout,
    };
    let lora_varmap = VarMap::new();
    let lora_vb = VarBuilder::from_varmap(&lora_varmap, dtype, &device);
    policy.add_lora(&lora_cfg, lora_vb.pp("model"))?;
    println!(
        "trainable params: {} adapter tensors",
        lora_varmap.all_vars().len()
    );

    let (_reference_varmap, reference) = args.model.build_model()?;

    let mut metrics = train_dpo(
        &policy,
        &reference,
        lora_varmap.all_vars(),
        &train_loader,
        val_loader.as_ref(),
        &cfg,
    )?;
    metrics.dropped_records = dropped;

    create_dir_all(&args.output_dir)?;
    let adapter_path = args.output_dir.join("dpo_lora.safetensors");
    lora_varmap.save(&adapter_path)?;
    let metrics_file = File::create(args.output_dir.join("metrics.json"))?;
    serde_json::to_writer_pretty(metrics_file, &metrics)?;
    println!("Saving model checkpoint to {}", args.output_dir.display());
    Ok(())
}
