//! Terminal prompts

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use strata_config::ContextSelector;

use crate::Result;

/// Reads operator answers line by line
///
/// One reader serves a whole session: a buffered reader dropped after a
/// single answer would discard any input typed ahead of the next question.
pub struct Prompter {
    input: Mutex<Box<dyn AsyncBufRead + Send + Unpin>>,
}

impl Prompter {
    /// Prompter over the process's standard input
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    /// Prompter over any buffered reader
    pub fn from_reader(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self {
            input: Mutex::new(Box::new(reader)),
        }
    }

    /// Print `question` and read one trimmed line; end of input reads as empty
    async fn ask(&self, question: &str) -> std::io::Result<String> {
        let mut input = self.input.lock().await;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(question.as_bytes()).await?;
        stdout.flush().await?;

        let mut line = String::new();
        input.read_line(&mut line).await?;
        Ok(line.trim().to_string())
    }

    /// Ask a yes/no question, defaulting to no
    pub async fn confirm(&self, question: &str) -> Result<bool> {
        let answer = self.ask(&format!("{question} [y/N] ")).await?;
        Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
    }
}

/// Match a reply against numbered `options`: a 1-based index or an exact name
pub fn parse_choice(input: &str, options: &[String]) -> Option<String> {
    let input = input.trim();
    if let Ok(index) = input.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| options.get(i))
            .cloned();
    }
    options.iter().find(|o| o.as_str() == input).cloned()
}

/// Asks the operator which context backs an unmapped cluster reference
pub struct PromptContextSelector {
    prompter: Arc<Prompter>,
}

impl PromptContextSelector {
    pub fn new(prompter: Arc<Prompter>) -> Self {
        Self { prompter }
    }
}

#[async_trait]
impl ContextSelector for PromptContextSelector {
    async fn select(&self, reference: &str, contexts: &[String]) -> strata_common::Result<String> {
        if contexts.is_empty() {
            return Err(strata_common::Error::unknown_cluster(reference));
        }

        println!("Cluster reference '{reference}' has no kubeconfig context.");
        for (i, context) in contexts.iter().enumerate() {
            println!("  {}) {}", i + 1, context);
        }

        let answer = self
            .prompter
            .ask("Select a context: ")
            .await
            .map_err(|e| strata_common::Error::internal_with_context("prompt", e.to_string()))?;
        parse_choice(&answer, contexts).ok_or_else(|| {
            strata_common::Error::validation_for_field(
                "context",
                format!("'{answer}' is not one of the listed contexts"),
            )
        })
    }
}
