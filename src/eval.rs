//! Exam evaluation loop and run artifacts

use crate::chat::ChatModel;
use crate::exam::ExamQuestion;
use crate::extract::extract_answer;
use crate::prompt::{ExamPromptFormatter, PromptFormatter};
use anyhow::Context;
use chrono::Local;
use comfy_table::Table;
use serde::Serialize;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use tqdm::tqdm;

pub const SUBMISSION_FILENAME: &str = "submission_file.json";
pub const RAW_TEXTS_FILENAME: &str = "raw_texts.json";
pub const ACCURACY_FILENAME: &str = "accuracy_summary.json";

/// Drives one subject at a time through the prompt -> chat -> extract loop.
pub struct Evaluator {
    choices: Vec<char>,
    k: usize,
    few_shot: bool,
    formatter: ExamPromptFormatter,
}

/// Per-subject outcome: one prediction and one raw response per question,
/// plus exact accuracy when every row carried a ground-truth answer.
#[derive(Debug, Clone)]
pub struct SubjectOutcome {
    pub predictions: Vec<String>,
    pub raw_texts: Vec<String>,
    pub accuracy: Option<f64>,
}

impl Evaluator {
    pub fn new(choices: Vec<char>, k: usize, few_shot: bool, cot: bool) -> Self {
        Self {
            choices,
            k,
            few_shot,
            formatter: ExamPromptFormatter::new(cot),
        }
    }

    pub fn choices(&self) -> &[char] {
        &self.choices
    }

    /// Runs every question of a subject through the model.
    ///
    /// `dev` supplies few-shot exemplars and is ignored unless few-shot mode
    /// is on; at most `k` exemplars are used.
    pub fn run_subject<M: ChatModel>(
        &self,
        model: &mut M,
        subject: &str,
        questions: &[ExamQuestion],
        dev: &[ExamQuestion],
    ) -> anyhow::Result<SubjectOutcome> {
        let shots: &[ExamQuestion] = if self.few_shot {
            &dev[..self.k.min(dev.len())]
        } else {
            &[]
        };

        let mut predictions = Vec::with_capacity(questions.len());
        let mut raw_texts = Vec::with_capacity(questions.len());
        let mut correct = 0_usize;
        let mut graded = 0_usize;
        for question in tqdm(questions.iter()) {
            let prompt = self.formatter.build_prompt(subject, question, shots);
            let (response, _history) = model.chat(&prompt, &[])?;
            let predicted = extract_answer(&response, &self.choices);
            if let Some(answer) = question.answer {
                graded += 1;
                if predicted.matches(answer) {
                    correct += 1;
                }
            }
            predictions.push(predicted.to_string());
            raw_texts.push(response);
        }

        let accuracy = (graded == questions.len() && graded > 0)
            .then(|| correct as f64 / graded as f64);
        Ok(SubjectOutcome {
            predictions,
            raw_texts,
            accuracy,
        })
    }
}

/// A timestamped output directory, `<root>/<model>_<YYYY-MM-DD_HH-MM-SS>`.
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    pub fn create<P: AsRef<Path>>(root: P, model_name: &str) -> anyhow::Result<Self> {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = root.as_ref().join(format!("{}_{}", model_name, stamp));
        create_dir_all(&path)
            .with_context(|| format!("Unable to create run dir {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_json<T: Serialize>(&self, filename: &str, value: &T) -> anyhow::Result<()> {
        let path = self.path.join(filename);
        let file = File::create(&path)
            .with_context(|| format!("Unable to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, value)?;
        Ok(())
    }
}

/// Submission rows for one subject: `{"0": "A", "1": "C", ...}` in question
/// order.
pub fn submission_entry(predictions: &[String]) -> serde_json::Map<String, serde_json::Value> {
    predictions
        .iter()
        .enumerate()
        .map(|(ix, prediction)| (ix.to_string(), serde_json::Value::String(prediction.clone())))
        .collect()
}

/// Prints per-subject accuracies plus the overall mean.
pub fn print_accuracy_table(rows: &[(String, f64)]) {
    let mut table = Table::new();
    table.set_header(vec!["subject", "accuracy"]);
    for (subject, accuracy) in rows {
        table.add_row(vec![subject.clone(), format!("{:.4}", accuracy)]);
    }
    if !rows.is_empty() {
        let mean = rows.iter().map(|(_, acc)| acc).sum::<f64>() / rows.len() as f64;
        table.add_row(vec!["average".to_string(), format!("{:.4}", mean)]);
    }
    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::StubChatModel;
    use crate::exam::{choice_set, ExamQuestion};
    use rstest::*;
    use std::fs::read_to_string;
    use tempfile::tempdir;

    #[fixture]
    fn two_questions() -> Vec<ExamQuestion> {
        vec![
            ExamQuestion::new("第一题", &["甲", "乙", "丙", "丁"], Some('A')),
            ExamQuestion::new("第二题", &["甲", "乙", "丙", "丁"], Some('B')),
        ]
    }

    #[rstest]
    fn test_accuracy_is_exact_ratio(two_questions: Vec<ExamQuestion>) -> anyhow::Result<()> {
        let mut model = StubChatModel::new("答案：A");
        let evaluator = Evaluator::new(choice_set(&two_questions), 5, false, false);

        let outcome = evaluator.run_subject(&mut model, "测试", &two_questions, &[])?;

        // one of two is correct
        assert_eq!(outcome.accuracy, Some(0.5));
        assert_eq!(outcome.predictions, vec!["A".to_string(), "A".to_string()]);
        Ok(())
    }

    #[rstest]
    fn test_unparseable_output_degrades_to_unknown(
        two_questions: Vec<ExamQuestion>,
    ) -> anyhow::Result<()> {
        let mut model = StubChatModel::new("说不好。");
        let evaluator = Evaluator::new(choice_set(&two_questions), 5, false, false);

        let outcome = evaluator.run_subject(&mut model, "测试", &two_questions, &[])?;

        assert_eq!(outcome.accuracy, Some(0.0));
        assert!(outcome.predictions.iter().all(|p| p == "unknown"));
        Ok(())
    }

    #[rstest]
    fn test_no_ground_truth_means_no_accuracy() -> anyhow::Result<()> {
        let questions = vec![ExamQuestion::new("题", &["甲", "乙"], None)];
        let mut model = StubChatModel::new("答案：B");
        let evaluator = Evaluator::new(choice_set(&questions), 5, false, false);

        let outcome = evaluator.run_subject(&mut model, "测试", &questions, &[])?;

        assert_eq!(outcome.accuracy, None);
        assert_eq!(outcome.predictions, vec!["B".to_string()]);
        Ok(())
    }

    #[rstest]
    fn test_submission_entry_keys_are_string_indices() {
        let entry = submission_entry(&["A".to_string(), "unknown".to_string()]);
        let keys: Vec<&String> = entry.keys().collect();
        assert_eq!(keys, vec!["0", "1"]);
        assert_eq!(entry["1"], serde_json::Value::String("unknown".to_string()));
    }

    #[rstest]
    fn test_end_to_end_submission_file(two_questions: Vec<ExamQuestion>) -> anyhow::Result<()> {
        let mut model = StubChatModel::new("答案：C");
        let evaluator = Evaluator::new(choice_set(&two_questions), 5, false, false);
        let outcome = evaluator.run_subject(&mut model, "操作系统", &two_questions, &[])?;

        let root = tempdir()?;
        let run_dir = RunDir::create(root.path(), "stub")?;
        let mut submission = serde_json::Map::new();
        submission.insert(
            "operating_system".to_string(),
            serde_json::Value::Object(submission_entry(&outcome.predictions)),
        );
        run_dir.write_json(SUBMISSION_FILENAME, &submission)?;

        let written = read_to_string(run_dir.path().join(SUBMISSION_FILENAME))?;
        let parsed: serde_json::Value = serde_json::from_str(&written)?;
        let subject = parsed["operating_system"].as_object().unwrap();
        assert_eq!(subject.len(), 2);
        assert_eq!(subject["0"], "C");
        assert_eq!(subject["1"], "C");
        Ok(())
    }

    #[rstest]
    fn test_run_dir_name_contains_model_name() -> anyhow::Result<()> {
        let root = tempdir()?;
        let run_dir = RunDir::create(root.path(), "baichuan")?;
        let name = run_dir.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("baichuan_"));
        assert!(run_dir.path().is_dir());
        Ok(())
    }
}
