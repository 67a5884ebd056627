//! Exam question records and tabular loading

use anyhow::Context;
use bytes::Bytes;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, NoneAsEmptyString};
use std::fs::{create_dir_all, read_to_string, remove_file, File};
use std::io;
use std::path::{Path, PathBuf};

/// Column headers holding the labeled options of a question, in order.
pub const OPTION_COLUMNS: [&str; 5] = ["A", "B", "C", "D", "E"];

pub const EXAM_DATA_URL: &str =
    "https://huggingface.co/datasets/ceval/ceval-exam/resolve/main/ceval-exam.zip";
pub const SUBJECT_MAPPING_FILENAME: &str = "subject_mapping.json";

/// Returns the choice letter for an option position (0 -> 'A', 1 -> 'B', ...).
pub fn choice_letter(index: usize) -> char {
    (b'A' + index as u8) as char
}

/// The recognized choice letters for a set of questions.
///
/// Sized by the widest question, so a subject file mixing four- and
/// five-option rows is recognized as a five-choice subject.
pub fn choice_set(questions: &[ExamQuestion]) -> Vec<char> {
    let widest = questions.iter().map(|q| q.options.len()).max().unwrap_or(0);
    (0..widest).map(choice_letter).collect()
}

/// A single multiple-choice question.
///
/// `answer` is present only on dev/val rows; test rows carry none.
#[serde_as]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamQuestion {
    pub question: String,
    pub options: Vec<String>,
    pub answer: Option<char>,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    pub explanation: Option<String>,
}

impl ExamQuestion {
    pub fn new(question: &str, options: &[&str], answer: Option<char>) -> Self {
        Self {
            question: question.to_string(),
            options: options.iter().map(|o| o.to_string()).collect(),
            answer,
            explanation: None,
        }
    }
}

/// The benchmark splits and their on-disk layout (`dev/<subject>_dev.csv` etc.)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Dev,
    Val,
    Test,
}

impl Split {
    pub fn name(&self) -> &'static str {
        match self {
            Split::Dev => "dev",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

pub fn subject_csv_path<P: AsRef<Path>>(data_dir: P, split: Split, subject: &str) -> PathBuf {
    data_dir
        .as_ref()
        .join(split.name())
        .join(format!("{}_{}.csv", subject, split.name()))
}

/// Loads one subject split from CSV.
///
/// Expected headers: `question`, `A`..`E` (`E` optional), and optionally
/// `answer` and `explanation`. Any other columns (e.g. `id`) are ignored.
pub fn load_exam_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<ExamQuestion>> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.as_ref().to_path_buf()))
        .with_context(|| format!("Unable to open {}", path.as_ref().display()))?
        .finish()
        .with_context(|| format!("Unable to read {}", path.as_ref().display()))?;

    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let question_col = df.column("question")?.str()?;
    let mut option_cols = Vec::new();
    for col_name in OPTION_COLUMNS.iter() {
        if names.iter().any(|n| n == col_name) {
            option_cols.push(df.column(col_name)?.str()?);
        }
    }
    let answer_col = if names.iter().any(|n| n == "answer") {
        Some(df.column("answer")?.str()?)
    } else {
        None
    };
    let explanation_col = if names.iter().any(|n| n == "explanation") {
        Some(df.column("explanation")?.str()?)
    } else {
        None
    };

    let mut questions = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        let question = question_col.get(idx).unwrap_or_default().to_string();
        let options: Vec<String> = option_cols
            .iter()
            .filter_map(|col| col.get(idx))
            .filter(|o| !o.trim().is_empty())
            .map(|o| o.to_string())
            .collect();
        let answer = answer_col
            .and_then(|col| col.get(idx))
            .and_then(|a| a.trim().chars().next())
            .map(|c| c.to_ascii_uppercase());
        let explanation = explanation_col
            .and_then(|col| col.get(idx))
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(|e| e.to_string());
        questions.push(ExamQuestion {
            question,
            options,
            answer,
            explanation,
        });
    }
    Ok(questions)
}

/// Subject display names: (english, chinese, category).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectNames(pub String, pub String, pub String);

impl SubjectNames {
    pub fn english(&self) -> &str {
        &self.0
    }

    pub fn chinese(&self) -> &str {
        &self.1
    }

    pub fn category(&self) -> &str {
        &self.2
    }
}

/// Loads `subject_mapping.json`, preserving the file's subject order.
pub fn load_subject_mapping<P: AsRef<Path>>(
    path: P,
) -> anyhow::Result<Vec<(String, SubjectNames)>> {
    let json_str = read_to_string(path.as_ref())
        .with_context(|| format!("Unable to read {}", path.as_ref().display()))?;
    let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&json_str)?;
    map.into_iter()
        .map(|(subject, names)| Ok((subject, serde_json::from_value(names)?)))
        .collect()
}

/// Downloads the benchmark zip and unpacks it under `data_dir`.
pub fn download_and_unzip_exam_data<P: AsRef<Path>>(url: &str, data_dir: P) -> anyhow::Result<()> {
    create_dir_all(data_dir.as_ref())?;

    // download zip file
    let resp = reqwest::blocking::get(url)?;
    let content: Bytes = resp.bytes()?;
    let zip_path = data_dir.as_ref().join("exam-data.zip");
    let mut out = File::create(&zip_path)?;
    io::copy(&mut content.as_ref(), &mut out)?;

    unzip_into(&zip_path, data_dir.as_ref())?;
    remove_file(zip_path)?;
    Ok(())
}

/// Helper function to unzip an archive using `zip::ZipArchive`
fn unzip_into(zip_path: &Path, data_dir: &Path) -> anyhow::Result<()> {
    let file = File::open(zip_path)?;
    let mut archive = ::zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let outpath = match file.enclosed_name() {
            Some(path) => data_dir.join(path),
            None => continue,
        };

        if file.is_dir() {
            create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                if !parent.exists() {
                    create_dir_all(parent)?;
                }
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut file, &mut outfile)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[fixture]
    fn subject_csv() -> String {
        "id,question,A,B,C,D,answer,explanation\n\
         0,下列选项中属于操作系统的是,Excel,Linux,Chrome,Word,B,Linux是操作系统。\n\
         1,进程和程序的区别在于,静态性,动态性,并发性,独立性,B,\n"
            .to_string()
    }

    #[rstest]
    fn test_load_exam_csv(subject_csv: String) -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("operating_system_val.csv");
        let mut file = File::create(&path)?;
        file.write_all(subject_csv.as_bytes())?;

        let questions = load_exam_csv(&path)?;

        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].options.len(), 4);
        assert_eq!(questions[0].answer, Some('B'));
        assert_eq!(
            questions[0].explanation.as_deref(),
            Some("Linux是操作系统。")
        );
        assert_eq!(questions[1].explanation, None);
        Ok(())
    }

    #[rstest]
    fn test_load_exam_csv_without_answers() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("operating_system_test.csv");
        let mut file = File::create(&path)?;
        file.write_all("id,question,A,B,C,D,E\n0,题目,甲,乙,丙,丁,戊\n".as_bytes())?;

        let questions = load_exam_csv(&path)?;

        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].options.len(), 5);
        assert_eq!(questions[0].answer, None);
        Ok(())
    }

    #[rstest]
    fn test_choice_set() {
        let questions = vec![
            ExamQuestion::new("q1", &["a", "b", "c", "d"], Some('A')),
            ExamQuestion::new("q2", &["a", "b", "c", "d", "e"], Some('E')),
        ];
        assert_eq!(choice_set(&questions), vec!['A', 'B', 'C', 'D', 'E']);
    }

    #[rstest]
    fn test_subject_csv_path() {
        let path = subject_csv_path("data", Split::Dev, "clinical_medicine");
        assert_eq!(
            path,
            PathBuf::from("data/dev/clinical_medicine_dev.csv")
        );
    }

    #[rstest]
    fn test_load_subject_mapping_preserves_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(SUBJECT_MAPPING_FILENAME);
        let mut file = File::create(&path)?;
        file.write_all(
            r#"{
  "operating_system": ["Operating System", "操作系统", "STEM"],
  "clinical_medicine": ["Clinical Medicine", "临床医学", "Other"]
}"#
            .as_bytes(),
        )?;

        let mapping = load_subject_mapping(&path)?;

        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping[0].0, "operating_system");
        assert_eq!(mapping[0].1.chinese(), "操作系统");
        assert_eq!(mapping[1].1.english(), "Clinical Medicine");
        Ok(())
    }
}
