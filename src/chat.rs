//! Chat-model seam: tokenization, history handling, and generation

use crate::model::{generate_text, GptModel};
use candle_core::{Device, Tensor};
use tiktoken_rs::{get_bpe_from_model, CoreBPE};

pub const EOT_TOKEN: &str = "<|endoftext|>";

/// One user/assistant exchange in a conversation history.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
}

/// The model seam every evaluator and data generator talks through: send a
/// prompt with optional history, get back the response and the updated
/// history.
pub trait ChatModel {
    fn chat(&mut self, prompt: &str, history: &[ChatTurn]) -> anyhow::Result<(String, Vec<ChatTurn>)>;
}

/// Tokenizer seam over the GPT-2 BPE and HuggingFace tokenizer files.
pub enum ExamTokenizer {
    Tiktoken(CoreBPE),
    Hf(Box<tokenizers::Tokenizer>),
}

impl ExamTokenizer {
    pub fn gpt2() -> anyhow::Result<Self> {
        Ok(Self::Tiktoken(get_bpe_from_model("gpt2")?))
    }

    /// Loads a `tokenizer.json` file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(anyhow::Error::msg)?;
        Ok(Self::Hf(Box::new(tokenizer)))
    }

    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        match self {
            Self::Tiktoken(bpe) => Ok(bpe.encode_with_special_tokens(text)),
            Self::Hf(tokenizer) => Ok(tokenizer
                .encode(text, false)
                .map_err(anyhow::Error::msg)?
                .get_ids()
                .to_vec()),
        }
    }

    pub fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        match self {
            Self::Tiktoken(bpe) => bpe.decode(ids.to_vec()),
            Self::Hf(tokenizer) => tokenizer.decode(ids, true).map_err(anyhow::Error::msg),
        }
    }

    pub fn count_tokens(&self, text: &str) -> anyhow::Result<usize> {
        Ok(self.encode(text)?.len())
    }

    /// The end-of-text token id, when the vocabulary has one.
    pub fn eot_id(&self) -> Option<u32> {
        match self {
            Self::Tiktoken(bpe) => bpe.encode_with_special_tokens(EOT_TOKEN).first().copied(),
            Self::Hf(tokenizer) => tokenizer.token_to_id(EOT_TOKEN),
        }
    }
}

/// A candle-backed chat model: flattens the history and prompt into one
/// context, greedy-decodes, and returns the newly generated text.
pub struct GptChatModel {
    model: GptModel,
    tokenizer: ExamTokenizer,
    device: Device,
    system_prompt: Option<String>,
    max_new_tokens: usize,
    eos_id: Option<u32>,
}

impl GptChatModel {
    pub fn new(model: GptModel, tokenizer: ExamTokenizer, device: Device) -> Self {
        let eos_id = tokenizer.eot_id();
        Self {
            model,
            tokenizer,
            device,
            system_prompt: None,
            max_new_tokens: 256,
            eos_id,
        }
    }

    pub fn system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn model(&self) -> &GptModel {
        &self.model
    }

    pub fn tokenizer(&self) -> &ExamTokenizer {
        &self.tokenizer
    }

    fn render(&self, prompt: &str, history: &[ChatTurn]) -> String {
        let mut text = String::new();
        if let Some(system) = &self.system_prompt {
            text.push_str(system);
            text.push_str("\n\n");
        }
        for turn in history {
            text.push_str(&turn.user);
            text.push('\n');
            text.push_str(&turn.assistant);
            text.push_str("\n\n");
        }
        text.push_str(prompt);
        text
    }
}

impl ChatModel for GptChatModel {
    fn chat(&mut self, prompt: &str, history: &[ChatTurn]) -> anyhow::Result<(String, Vec<ChatTurn>)> {
        let context_size = self.model.config().context_length;
        let full_text = self.render(prompt, history);
        let mut ids = self.tokenizer.encode(&full_text)?;

        // leave room for the continuation, dropping the oldest context first
        let keep = context_size.saturating_sub(self.max_new_tokens).max(1);
        if ids.len() > keep {
            ids = ids[ids.len() - keep..].to_vec();
        }
        let prompt_len = ids.len();

        let input = Tensor::from_vec(ids, (1, prompt_len), &self.device)?;
        let output = generate_text(
            &self.model,
            input,
            self.max_new_tokens,
            context_size,
            self.eos_id,
        )?;
        let output_ids = output.squeeze(0)?.to_vec1::<u32>()?;
        let response = self
            .tokenizer
            .decode(&output_ids[prompt_len..])?
            .trim()
            .to_string();

        let mut new_history = history.to_vec();
        new_history.push(ChatTurn {
            user: prompt.to_string(),
            assistant: response.clone(),
        });
        Ok((response, new_history))
    }
}

/// A model stub returning a fixed response. Backs `--dry-run` and the tests
/// that exercise evaluation plumbing without weights.
#[derive(Debug, Clone)]
pub struct StubChatModel {
    response: String,
}

impl StubChatModel {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
        }
    }
}

impl ChatModel for StubChatModel {
    fn chat(&mut self, prompt: &str, history: &[ChatTurn]) -> anyhow::Result<(String, Vec<ChatTurn>)> {
        let mut new_history = history.to_vec();
        new_history.push(ChatTurn {
            user: prompt.to_string(),
            assistant: self.response.clone(),
        });
        Ok((self.response.clone(), new_history))
    }
}
