//! Chat prompt formatting
//!
//! Renders role-tagged messages into the raw prompt strings the instruct
//! models were trained on. `continue_final_message` leaves the last
//! (assistant) message open so the model continues it, which is how the
//! steering prompts end in `"Answer:"` rather than a fresh assistant turn.

use serde::{Deserialize, Serialize};

use crate::model::ModelArchitecture;

/// Date stamp the Llama 3.1 template writes into its system header
const LLAMA3_KNOWLEDGE_CUTOFF: &str = "December 2023";
const LLAMA3_TODAY: &str = "26 Jul 2024";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Prompt template family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFormat {
    /// `<|start_header_id|>role<|end_header_id|>` turns (Llama 3.x Instruct)
    Llama3,
    /// `<start_of_turn>user` / `<start_of_turn>model` turns (Gemma 2)
    Gemma,
    /// Message contents joined by newlines (base models)
    Plain,
}

impl ChatFormat {
    /// Pick the template for a model: instruct/chat/`-it` checkpoints get
    /// their architecture's template, everything else is plain text.
    pub fn for_model(architecture: ModelArchitecture, model_id: &str) -> Self {
        let lower = model_id.to_lowercase();
        let is_chat = lower.contains("instruct") || lower.contains("chat") || lower.ends_with("-it");
        match (architecture, is_chat) {
            (ModelArchitecture::Llama, true) => ChatFormat::Llama3,
            (ModelArchitecture::Gemma2, true) => ChatFormat::Gemma,
            _ => ChatFormat::Plain,
        }
    }

    /// Render messages into a prompt.
    ///
    /// With `continue_final_message`, the rendering stops right after the
    /// trimmed content of the last message. Otherwise, with
    /// `add_generation_prompt`, an empty assistant header is appended.
    pub fn render(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
        continue_final_message: bool,
    ) -> String {
        let rendered = match self {
            ChatFormat::Llama3 => render_llama3(messages, add_generation_prompt),
            ChatFormat::Gemma => render_gemma(messages, add_generation_prompt),
            ChatFormat::Plain => render_plain(messages),
        };

        if !continue_final_message {
            return rendered;
        }
        match messages.last() {
            Some(last) => {
                let tail = last.content.trim();
                match rendered.rfind(tail) {
                    Some(idx) if !tail.is_empty() => rendered[..idx + tail.len()].to_string(),
                    _ => rendered,
                }
            }
            None => rendered,
        }
    }

    /// Render a single user prompt followed by the generation header.
    pub fn prompt(&self, user: &str) -> String {
        self.render(&[ChatMessage::user(user)], true, false)
    }

    /// Marker after which the assistant's reply starts in a rendered prompt
    pub fn assistant_marker(&self) -> Option<&'static str> {
        match self {
            ChatFormat::Llama3 => Some("<|start_header_id|>assistant<|end_header_id|>\n\n"),
            ChatFormat::Gemma => Some("<start_of_turn>model\n"),
            ChatFormat::Plain => None,
        }
    }

    /// End-of-turn marker stripped from generated replies
    pub fn end_of_turn(&self) -> Option<&'static str> {
        match self {
            ChatFormat::Llama3 => Some("<|eot_id|>"),
            ChatFormat::Gemma => Some("<end_of_turn>"),
            ChatFormat::Plain => None,
        }
    }
}

fn render_llama3(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut out = String::from("<|begin_of_text|>");

    let (system, rest) = match messages.first() {
        Some(m) if m.role == Role::System => (m.content.trim(), &messages[1..]),
        _ => ("", messages),
    };
    out.push_str("<|start_header_id|>system<|end_header_id|>\n\n");
    out.push_str(&format!(
        "Cutting Knowledge Date: {LLAMA3_KNOWLEDGE_CUTOFF}\nToday Date: {LLAMA3_TODAY}\n\n"
    ));
    out.push_str(system);
    out.push_str("<|eot_id|>");

    for m in rest {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push_str(&format!(
            "<|start_header_id|>{role}<|end_header_id|>\n\n{}<|eot_id|>",
            m.content.trim()
        ));
    }

    if add_generation_prompt {
        out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    }
    out
}

fn render_gemma(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut out = String::from("<bos>");

    // No system role: fold it into the first user turn
    let (system, rest) = match messages.first() {
        Some(m) if m.role == Role::System => (Some(m.content.trim()), &messages[1..]),
        _ => (None, messages),
    };

    for (i, m) in rest.iter().enumerate() {
        let role = match m.role {
            Role::Assistant => "model",
            Role::User | Role::System => "user",
        };
        let content = match system {
            Some(sys) if i == 0 && m.role == Role::User => format!("{sys}\n\n{}", m.content.trim()),
            _ => m.content.trim().to_string(),
        };
        out.push_str(&format!("<start_of_turn>{role}\n{content}<end_of_turn>\n"));
    }

    if add_generation_prompt {
        out.push_str("<start_of_turn>model\n");
    }
    out
}

fn render_plain(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The question/answer framing used by the steering experiments.
pub fn question_messages(input: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::user(format!("{input} Question: ?")),
        ChatMessage::assistant("Answer: "),
    ]
}

/// Render the steering prompt for `input`, ending inside the assistant turn.
pub fn format_question(format: ChatFormat, input: &str) -> String {
    format.render(&question_messages(input), false, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llama3_question_prompt() {
        let prompt = format_question(ChatFormat::Llama3, "The ball was passed to");
        assert_eq!(
            prompt,
            "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n\
             Cutting Knowledge Date: December 2023\nToday Date: 26 Jul 2024\n\n<|eot_id|>\
             <|start_header_id|>user<|end_header_id|>\n\nThe ball was passed to Question: ?<|eot_id|>\
             <|start_header_id|>assistant<|end_header_id|>\n\nAnswer:"
        );
    }

    #[test]
    fn test_llama3_generation_prompt() {
        let prompt = ChatFormat::Llama3.prompt("hi");
        assert!(prompt.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert!(prompt.contains("<|start_header_id|>user<|end_header_id|>\n\nhi<|eot_id|>"));
    }

    #[test]
    fn test_gemma_question_prompt() {
        let prompt = format_question(ChatFormat::Gemma, "Water is");
        assert_eq!(
            prompt,
            "<bos><start_of_turn>user\nWater is Question: ?<end_of_turn>\n<start_of_turn>model\nAnswer:"
        );
    }

    #[test]
    fn test_gemma_folds_system_into_user() {
        let messages = [ChatMessage::system("Be brief."), ChatMessage::user("Hello")];
        let prompt = ChatFormat::Gemma.render(&messages, true, false);
        assert_eq!(
            prompt,
            "<bos><start_of_turn>user\nBe brief.\n\nHello<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn test_plain_format() {
        let prompt = format_question(ChatFormat::Plain, "Sky is");
        assert_eq!(prompt, "Sky is Question: ?\nAnswer:");
    }

    #[test]
    fn test_format_selection() {
        assert_eq!(
            ChatFormat::for_model(ModelArchitecture::Llama, "meta-llama/Llama-3.1-8B-Instruct"),
            ChatFormat::Llama3
        );
        assert_eq!(
            ChatFormat::for_model(ModelArchitecture::Gemma2, "google/gemma-2-2b-it"),
            ChatFormat::Gemma
        );
        assert_eq!(
            ChatFormat::for_model(ModelArchitecture::Gemma2, "google/gemma-2-2b"),
            ChatFormat::Plain
        );
    }
}
