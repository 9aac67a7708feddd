//! Prompt refinement and encoding.

use ndarray::{Array4, Axis};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::models::{PromptEmbedding, PromptRefiner, TextEncoder};

/// Encodes prompts, running refiners on positive prompts first.
pub struct Prompter<'a> {
    encoder: &'a dyn TextEncoder,
    refiners: &'a [Box<dyn PromptRefiner>],
}

impl<'a> Prompter<'a> {
    /// Creates a prompter over `encoder` and `refiners`.
    pub fn new(encoder: &'a dyn TextEncoder, refiners: &'a [Box<dyn PromptRefiner>]) -> Self {
        Self { encoder, refiners }
    }

    /// Runs every refiner over `prompt`, in order.
    pub fn refine(&self, prompt: &str) -> Result<String> {
        let mut refined = prompt.to_string();
        for refiner in self.refiners {
            refined = refiner.refine(&refined)?;
        }
        if refined != prompt {
            debug!(original = prompt, refined = %refined, "Prompt refined");
        }
        Ok(refined)
    }

    /// Encodes `prompt`. Negative prompts skip refinement.
    pub fn encode_prompt(
        &self,
        prompt: &str,
        positive: bool,
        sequence_length: usize,
    ) -> Result<PromptEmbedding> {
        let embedding = if positive {
            self.encoder.encode(&self.refine(prompt)?, sequence_length)?
        } else {
            self.encoder.encode(prompt, sequence_length)?
        };
        if embedding.prompt_emb.dim().1 != sequence_length {
            return Err(PipelineError::shape_mismatch(
                "prompt embedding",
                embedding.prompt_emb.shape(),
                &[embedding.prompt_emb.dim().0, sequence_length, embedding.prompt_emb.dim().2],
            ));
        }
        Ok(embedding)
    }

    /// Encodes each entity prompt and stacks them to `(1, n, sequence_length, dim)`.
    pub fn encode_entity_prompts<S: AsRef<str>>(
        &self,
        prompts: &[S],
        sequence_length: usize,
    ) -> Result<Array4<f32>> {
        let embeddings = prompts
            .iter()
            .map(|p| self.encode_prompt(p.as_ref(), true, sequence_length))
            .collect::<Result<Vec<_>>>()?;
        let views: Vec<_> = embeddings.iter().map(|e| e.prompt_emb.view()).collect();
        Ok(ndarray::stack(Axis(1), &views)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTextEncoder, SuffixRefiner};

    #[test]
    fn refiners_apply_to_positive_prompts_only() {
        let encoder = MockTextEncoder::new();
        let refiners: Vec<Box<dyn PromptRefiner>> = vec![Box::new(SuffixRefiner(", detailed"))];
        let prompter = Prompter::new(&encoder, &refiners);

        prompter.encode_prompt("a fox", true, 8).unwrap();
        prompter.encode_prompt("blurry", false, 8).unwrap();
        assert_eq!(encoder.prompts(), vec!["a fox, detailed".to_string(), "blurry".to_string()]);
    }

    #[test]
    fn refiners_chain_in_order() {
        let encoder = MockTextEncoder::new();
        let refiners: Vec<Box<dyn PromptRefiner>> =
            vec![Box::new(SuffixRefiner(" one")), Box::new(SuffixRefiner(" two"))];
        let prompter = Prompter::new(&encoder, &refiners);
        assert_eq!(prompter.refine("x").unwrap(), "x one two");
    }

    #[test]
    fn entity_prompts_stack() {
        let encoder = MockTextEncoder::new();
        let prompter = Prompter::new(&encoder, &[]);
        let stacked = prompter.encode_entity_prompts(&["a", "bb", "ccc"], 8).unwrap();
        assert_eq!(stacked.dim().0, 1);
        assert_eq!(stacked.dim().1, 3);
        assert_eq!(stacked.dim().2, 8);
        assert_eq!(encoder.calls(), 3);
    }
}
