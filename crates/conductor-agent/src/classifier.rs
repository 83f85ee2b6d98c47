//! Request classification: SIMPLE (answer in one shot) or COMPLEX (plan it).

use std::sync::Arc;

use crate::error::Result;
use crate::llm::Oracle;
use crate::state::{StateUpdate, WorkflowState};

pub struct Classifier {
    oracle: Arc<dyn Oracle>,
}

impl Classifier {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self { oracle }
    }

    pub async fn classify(&self, state: &WorkflowState) -> Result<StateUpdate> {
        let request = state.latest_request();
        let answer = self.oracle.complete(&build_prompt(request)).await?;
        let is_complex = parse_verdict(&answer);
        tracing::info!(is_complex, "request classified");
        Ok(StateUpdate::new().classified(is_complex))
    }
}

fn build_prompt(request: &str) -> String {
    format!(
        "Classify the following request as SIMPLE or COMPLEX.\n\n\
         Request: \"{request}\"\n\n\
         A SIMPLE request can be answered directly in a single response.\n\
         A COMPLEX request needs several steps, research, planning or data from \
         specialized workers.\n\n\
         Respond with only SIMPLE or COMPLEX."
    )
}

/// Anything other than a bare "COMPLEX" counts as simple.
fn parse_verdict(answer: &str) -> bool {
    let word: String = answer
        .trim()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();
    word.trim().eq_ignore_ascii_case("complex")
}
