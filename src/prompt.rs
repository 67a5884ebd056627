//! Prompt construction for exam evaluation and preference tuning

use crate::chat::ChatTurn;
use crate::exam::{choice_letter, ExamQuestion};
use itertools::Itertools;

/// Fixed instruction given to chat models answering medical single-choice
/// questions. Used both when generating preference pairs and as an optional
/// system prompt during evaluation.
pub const MEDICAL_SYSTEM_PROMPT: &str = "你是一位医疗行业专家，请回答下列问题，注意是单选题，\
只需要返回一个最合适的选项。注意，结果只有两行，第一行只需要返回答案的英文选项\
(注意只需要返回一个最合适的答案)，第二行进行简要的解释。输出格式限制为：“答案：”，“解释：”。\n\
注意，题目是单选题，若有多个合适的答案，只返回最准确的即可。";

/// The trait at the prompt-formatting seam.
pub trait PromptFormatter {
    /// Renders a single question; `include_answer` appends the correct letter
    /// (and explanation when chain-of-thought is on), as done for few-shot
    /// exemplars.
    fn format_example(&self, question: &ExamQuestion, include_answer: bool) -> String;

    /// Renders the full prompt: subject header, few-shot exemplars, then the
    /// target question ending at the answer marker.
    fn build_prompt(&self, subject: &str, target: &ExamQuestion, few_shot: &[ExamQuestion])
        -> String;
}

/// Formatter for Chinese multiple-choice exam questions.
#[derive(Debug, Default, Clone)]
pub struct ExamPromptFormatter {
    pub cot: bool,
}

impl ExamPromptFormatter {
    pub fn new(cot: bool) -> Self {
        Self { cot }
    }
}

impl PromptFormatter for ExamPromptFormatter {
    fn format_example(&self, question: &ExamQuestion, include_answer: bool) -> String {
        let options = question
            .options
            .iter()
            .enumerate()
            .map(|(ix, option)| format!("{}. {}", choice_letter(ix), option))
            .join("\n");
        let mut text = format!("{}\n{}\n答案：", question.question, options);

        if include_answer {
            let letter = question
                .answer
                .map(|a| a.to_string())
                .unwrap_or_default();
            match (&question.explanation, self.cot) {
                (Some(explanation), true) => {
                    text.push_str(&format!(
                        "让我们一步一步思考，\n{}\n所以答案是{}。",
                        explanation, letter
                    ));
                }
                _ => text.push_str(&letter),
            }
        } else if self.cot {
            text.push_str("让我们一步一步思考，");
        }
        text
    }

    fn build_prompt(
        &self,
        subject: &str,
        target: &ExamQuestion,
        few_shot: &[ExamQuestion],
    ) -> String {
        let header = format!(
            "以下是中国关于{}考试的单项选择题，请选出其中的正确答案。",
            subject
        );
        let mut parts = vec![header];
        parts.extend(
            few_shot
                .iter()
                .map(|question| self.format_example(question, true)),
        );
        parts.push(self.format_example(target, false));
        parts.iter().join("\n\n")
    }
}

/// Prompt template for DPO preference records.
pub fn dpo_prompt(question: &str) -> String {
    format!("Question: {}\n\nAnswer: ", question)
}

/// Canned few-shot turns priming a chat model to answer medical single-choice
/// questions in the `答案：`/`解释：` format.
pub fn medical_few_shot_history() -> Vec<ChatTurn> {
    vec![
        ChatTurn {
            user: "上消化道出血可单纯表现为呕血或黑便，也可两者兼有，这取决于:\n\
                   A 原发病\nB 出血部位\nC 出血量\nD 在胃内停留时间\nE 以上均非"
                .to_string(),
            assistant: "答案：C。\n解释：上消化道出血表现为呕血还是便血主要取决于出血的速度和\
                        出血量的多少（C对），而出血部位（B错）高低、原发病部位（A错）是相对次要的。\
                        血液在胃内停留的时间（D错）主要决定呕血或黑便的颜色深浅。"
                .to_string(),
        },
        ChatTurn {
            user: "夜间阵发性呼吸困难，可见于:\nA 急性脑血管疾病\nB 癔病\n\
                   C 急性感染所致的毒血症\nD 慢性阻塞性肺气肿\nE 左心功能不全"
                .to_string(),
            assistant: "答案：E。\n解释：夜间阵发性呼吸困难是心源性呼吸困难，可见于左心功能不全\
                        （E对）。急性脑血管疾病（A错）可发生神经性呼吸困难；癔病（B错）可发生\
                        精神性呼吸困难；急性感染所致的毒血症（C错）可发生中毒性呼吸困难；\
                        慢性阻塞性肺气肿（D错）可发生呼气性呼吸困难。"
                .to_string(),
        },
        ChatTurn {
            user: "嘶哑样咳嗽，可见于:\nA 急性喉炎\nB 声带疾患\nC 百日咳\nD 胸膜炎\nE 支气管扩张"
                .to_string(),
            assistant: "答案：A。\n解释：嘶哑样咳嗽可见于急性喉炎（A对），由于声带炎症或肿瘤压迫\
                        喉返神经所致。百日咳（C错）表现为鸡鸣样咳嗽。胸膜炎（D错）患者咳嗽声音低微\
                        或无力。支气管扩张（E错）表现为咳嗽伴大量浓痰。"
                .to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn dev_question() -> ExamQuestion {
        let mut question = ExamQuestion::new(
            "下列选项中属于操作系统的是____。",
            &["Excel", "Linux", "Chrome", "Word"],
            Some('B'),
        );
        question.explanation = Some("Linux是一个开源操作系统内核。".to_string());
        question
    }

    #[fixture]
    fn target_question() -> ExamQuestion {
        ExamQuestion::new(
            "进程与程序的根本区别是____。",
            &["静态性", "动态性", "并发性", "独立性"],
            None,
        )
    }

    #[rstest]
    fn test_format_example_with_answer(dev_question: ExamQuestion) {
        let formatter = ExamPromptFormatter::new(false);
        let text = formatter.format_example(&dev_question, true);

        let expected = "下列选项中属于操作系统的是____。\n\
                        A. Excel\nB. Linux\nC. Chrome\nD. Word\n答案：B";
        assert_eq!(text, expected);
    }

    #[rstest]
    fn test_format_example_cot_appends_explanation(dev_question: ExamQuestion) {
        let formatter = ExamPromptFormatter::new(true);
        let text = formatter.format_example(&dev_question, true);

        assert!(text.contains("答案：让我们一步一步思考，"));
        assert!(text.contains("Linux是一个开源操作系统内核。"));
        assert!(text.ends_with("所以答案是B。"));
    }

    #[rstest]
    fn test_build_prompt_few_shot(dev_question: ExamQuestion, target_question: ExamQuestion) {
        let formatter = ExamPromptFormatter::new(false);
        let few_shot = vec![dev_question];
        let prompt = formatter.build_prompt("操作系统", &target_question, &few_shot);

        assert!(prompt.starts_with("以下是中国关于操作系统考试的单项选择题，请选出其中的正确答案。"));
        assert!(prompt.contains("答案：B"));
        assert!(prompt.ends_with("答案："));
        // exemplar comes before the target
        let exemplar_pos = prompt.find("下列选项中属于操作系统的是").unwrap();
        let target_pos = prompt.find("进程与程序的根本区别是").unwrap();
        assert!(exemplar_pos < target_pos);
    }

    #[rstest]
    fn test_build_prompt_cot_lead_in(target_question: ExamQuestion) {
        let formatter = ExamPromptFormatter::new(true);
        let prompt = formatter.build_prompt("操作系统", &target_question, &[]);

        assert!(prompt.ends_with("答案：让我们一步一步思考，"));
    }

    #[rstest]
    fn test_dpo_prompt() {
        assert_eq!(
            dpo_prompt("什么是高血压？"),
            "Question: 什么是高血压？\n\nAnswer: "
        );
    }

    #[rstest]
    fn test_medical_few_shot_history_format() {
        let history = medical_few_shot_history();
        assert_eq!(history.len(), 3);
        for turn in history {
            assert!(turn.assistant.starts_with("答案："));
        }
    }
}
