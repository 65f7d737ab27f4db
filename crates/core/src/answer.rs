use crate::packer::PackedContext;
use crate::GenerationError;
use async_trait::async_trait;

pub const NO_EVIDENCE_ANSWER: &str =
    "I don't have enough information in the indexed documents to answer this question.";

/// Turns packed evidence into answer text. Implementations are expected to
/// cite pages with `[Document: <file>, Page <n>]` markers.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, query: &str, context: &PackedContext) -> Result<String, GenerationError>;
}

/// Labels every packed passage with its source page, for prompt-based
/// generators.
pub fn format_context(context: &PackedContext) -> String {
    context
        .passages
        .iter()
        .enumerate()
        .map(|(position, passage)| {
            let title = if passage.section_title.is_empty() {
                String::new()
            } else {
                format!(" - Section: {}", passage.section_title)
            };
            format!(
                "[Source {}: {}, Page {}]{title}\n{}",
                position + 1,
                passage.filename,
                passage.page_number,
                passage.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Answers with the leading sentence of the strongest passage on each
/// cited page, each followed by its inline citation marker.
#[derive(Debug, Clone)]
pub struct ExtractiveAnswerGenerator {
    pub max_sentences: usize,
}

impl Default for ExtractiveAnswerGenerator {
    fn default() -> Self {
        Self { max_sentences: 3 }
    }
}

#[async_trait]
impl AnswerGenerator for ExtractiveAnswerGenerator {
    async fn generate(&self, _query: &str, context: &PackedContext) -> Result<String, GenerationError> {
        let mut sentences = Vec::new();
        for citation in context.citations.iter().take(self.max_sentences) {
            let lead = context
                .passages
                .iter()
                .find(|passage| {
                    passage.document_id == citation.document_id
                        && passage.page_number == citation.page_number
                })
                .map(|passage| leading_sentence(&passage.text))
                .filter(|sentence| !sentence.is_empty());
            if let Some(sentence) = lead {
                sentences.push(format!(
                    "{sentence} [Document: {}, Page {}]",
                    citation.filename, citation.page_number
                ));
            }
        }

        if sentences.is_empty() {
            Ok(NO_EVIDENCE_ANSWER.to_string())
        } else {
            Ok(sentences.join(" "))
        }
    }
}

fn leading_sentence(text: &str) -> String {
    let text = text.trim();
    let end = text
        .char_indices()
        .find(|(_, ch)| matches!(ch, '.' | '!' | '?'))
        .map(|(index, ch)| index + ch.len_utf8())
        .unwrap_or(text.len());
    text[..end].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::audit_inline_citations;
    use crate::models::Citation;
    use crate::packer::PackedPassage;

    fn context() -> PackedContext {
        let passage = |node: &str, page: u32, text: &str| PackedPassage {
            node_id: node.to_string(),
            document_id: "manual".to_string(),
            filename: "manual.pdf".to_string(),
            page_number: page,
            section_title: "2.1 Operating Limits".to_string(),
            text: text.to_string(),
            relevance: 0.9,
            token_cost: 10,
        };
        let citation = |page: u32, node: &str| Citation {
            document_id: "manual".to_string(),
            filename: "manual.pdf".to_string(),
            page_number: page,
            node_count: 1,
            node_ids: vec![node.to_string()],
            score: 0.9,
            high_integrity: false,
            anchor_resolved: false,
            section_title: String::new(),
            snippet: String::new(),
            token_cost: 10,
        };
        PackedContext {
            citations: vec![citation(2, "n1"), citation(5, "n2")],
            passages: vec![
                passage("n1", 2, "Maximum pressure is 200 bar. Never exceed it."),
                passage("n2", 5, "Inspect seals monthly"),
            ],
            total_tokens: 20,
            skipped_over_budget: 0,
        }
    }

    #[tokio::test]
    async fn extractive_answer_cites_every_sentence() {
        let context = context();
        let answer = ExtractiveAnswerGenerator::default()
            .generate("max pressure", &context)
            .await
            .expect("answer");

        assert_eq!(
            answer,
            "Maximum pressure is 200 bar. [Document: manual.pdf, Page 2] \
             Inspect seals monthly [Document: manual.pdf, Page 5]"
        );
        assert_eq!(audit_inline_citations(&answer, &context.citations).ratio, 1.0);
    }

    #[tokio::test]
    async fn empty_context_has_no_evidence() {
        let answer = ExtractiveAnswerGenerator::default()
            .generate("anything", &PackedContext::default())
            .await
            .expect("answer");
        assert_eq!(answer, NO_EVIDENCE_ANSWER);
    }

    #[test]
    fn context_block_labels_sources() {
        let formatted = format_context(&context());
        assert!(formatted.starts_with("[Source 1: manual.pdf, Page 2] - Section: 2.1 Operating Limits\n"));
        assert!(formatted.contains("\n\n---\n\n[Source 2: manual.pdf, Page 5]"));
    }
}
