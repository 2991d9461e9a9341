//! Operator confirmation.

use std::cell::RefCell;

use inquire::Confirm;

use crate::error::{DeployError, Result};

/// Asks the operator a yes/no question.
pub trait Confirmer {
    fn confirm(&self, question: &str, help: &str, default: bool) -> Result<bool>;
}

/// Interactive terminal prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquireConfirmer;

impl Confirmer for InquireConfirmer {
    fn confirm(&self, question: &str, help: &str, default: bool) -> Result<bool> {
        let mut prompt = Confirm::new(question).with_default(default);
        if !help.is_empty() {
            prompt = prompt.with_help_message(help);
        }
        prompt
            .prompt()
            .map_err(|e| DeployError::Cancelled(format!("prompt cancelled: {e}")))
    }
}

/// Answers every question the same way; used for `--yes` and in tests.
#[derive(Debug, Default)]
pub struct FixedConfirmer {
    answer: bool,
    asked: RefCell<Vec<String>>,
}

impl FixedConfirmer {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: RefCell::default(),
        }
    }

    /// Questions asked so far.
    pub fn asked(&self) -> Vec<String> {
        self.asked.borrow().clone()
    }
}

impl Confirmer for FixedConfirmer {
    fn confirm(&self, question: &str, _help: &str, _default: bool) -> Result<bool> {
        log::debug!("auto-answering `{question}` with {}", self.answer);
        self.asked.borrow_mut().push(question.to_string());
        Ok(self.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_confirmer_records_questions() {
        let confirmer = FixedConfirmer::new(false);
        assert!(!confirmer.confirm("Remove rkos?", "", true).unwrap());
        assert_eq!(confirmer.asked(), vec!["Remove rkos?".to_string()]);
    }
}
