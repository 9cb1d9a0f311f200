//! Prompt construction and response validation
//!
//! Classifies queries by keyword heuristics, selects a per-class template,
//! formats retrieved context into numbered document sections, and appends
//! safety guidelines and response-format instructions. Generated responses
//! are validated for safety patterns, context adherence and quality.

use crate::pipeline::RagContext;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Query classification for template selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    General,
    Factual,
    Analytical,
    Comparative,
    Summarization,
    Creative,
}

/// Safety guideline strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    #[default]
    Standard,
    Conservative,
    Permissive,
}

/// Requested response shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    BulletPoints,
    NumberedList,
    Table,
    Json,
    Summary,
}

/// Validation outcome for a generated response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Warning,
    Error,
}

const BASE_TEMPLATE: &str = "You are a retrieval assistant that provides accurate, helpful and contextually relevant answers based on the provided documents.\n\nContext Information:\n{context}\n\nUser Question: {query}\n\nInstructions:\n- Use only the information from the provided context\n- If the context doesn't contain enough information, say so clearly\n- Cite specific sources when possible\n- Provide a comprehensive but concise answer\n- Maintain a helpful and professional tone\n\nAnswer:";

const FACTUAL_TEMPLATE: &str = "You are a factual information assistant. Provide precise, accurate answers based on the provided documents.\n\nContext Information:\n{context}\n\nFactual Question: {query}\n\nInstructions:\n- Provide specific facts and data from the context\n- Include exact numbers, dates, names and details when available\n- If information is missing or unclear, state this explicitly\n- Cite the specific source documents for each fact\n- Avoid speculation beyond the provided facts\n\nAnswer:";

const ANALYTICAL_TEMPLATE: &str = "You are an analytical assistant. Analyze the provided information and offer insights.\n\nContext Information:\n{context}\n\nAnalytical Question: {query}\n\nInstructions:\n- Analyze patterns, trends and relationships in the data\n- Provide logical reasoning and conclusions\n- Consider multiple perspectives from the context\n- Support your analysis with specific evidence from the context\n- Acknowledge limitations or gaps in the analysis\n\nAnswer:";

const COMPARATIVE_TEMPLATE: &str = "You are a comparative analysis assistant. Compare and contrast information from the provided documents.\n\nContext Information:\n{context}\n\nComparative Question: {query}\n\nInstructions:\n- Identify similarities and differences clearly\n- Use a structured format for comparisons\n- Provide specific examples from the context\n- Highlight key distinctions and implications\n- Maintain objectivity in comparisons\n\nAnswer:";

const SUMMARIZATION_TEMPLATE: &str = "You are a summarization assistant. Create concise, comprehensive summaries of the provided information.\n\nContext Information:\n{context}\n\nSummarization Request: {query}\n\nInstructions:\n- Create a well-structured summary covering key points\n- Maintain the most important information\n- Use clear, concise language\n- Include main themes and conclusions\n- Ensure the summary is complete but not overly detailed\n\nAnswer:";

const CREATIVE_TEMPLATE: &str = "You are a creative assistant. Provide innovative insights and creative solutions based on the provided information.\n\nContext Information:\n{context}\n\nCreative Request: {query}\n\nInstructions:\n- Use the context as inspiration for creative thinking\n- Generate innovative ideas and solutions\n- Think broadly while staying relevant\n- Explain the reasoning behind creative suggestions\n- Maintain appropriateness and usefulness\n\nAnswer:";

const FALLBACK_TEMPLATE: &str = "You are a helpful assistant. The user has asked a question, but no relevant context was found in the available documents.\n\nQuestion: {query}\n\nInstructions:\n- Provide a helpful response based on your general knowledge\n- Clearly state that you don't have access to specific document information\n- Offer general guidance or suggestions if appropriate\n- Encourage the user to rephrase or ask about available topics\n\nAnswer:";

const STANDARD_GUIDELINES: [&str; 5] = [
    "Avoid harmful, dangerous, or illegal content",
    "Respect privacy and confidentiality",
    "Provide accurate information only",
    "Maintain professional and respectful tone",
    "Avoid bias and discrimination",
];

const CONSERVATIVE_GUIDELINES: [&str; 5] = [
    "Strictly avoid any potentially harmful content",
    "Be extra cautious with medical, legal, or financial advice",
    "Require explicit disclaimers for sensitive topics",
    "Prioritize safety over completeness",
    "Avoid controversial or polarizing topics",
];

const PERMISSIVE_GUIDELINES: [&str; 5] = [
    "Allow broader range of topics and discussions",
    "Provide more detailed and comprehensive responses",
    "Include more creative and exploratory content",
    "Maintain basic safety standards",
    "Allow for more nuanced discussions",
];

const GENERIC_PHRASES: [&str; 4] = [
    "i don't have enough information",
    "i cannot answer",
    "i don't know",
    "no information available",
];

const STOPWORDS: [&str; 48] = [
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "is", "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "may", "might", "can", "this", "that", "these", "those", "i",
    "you", "he", "she", "it", "we", "they", "me", "him", "her", "them",
];

fn harmful_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"how to (harm|hurt|kill|injure)",
            r"illegal (activities|methods|procedures)",
            r"dangerous (chemicals|substances|methods)",
            r"hack(ing|er)",
            r"exploit(ing|s)",
            r"bypass(ing)? (security|protection)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\w+\b").unwrap())
}

/// Prompt engineering engine
#[derive(Default)]
pub struct PromptEngine;

impl PromptEngine {
    pub fn new() -> Self {
        Self
    }

    /// Classify a query by keyword heuristics, first match wins
    pub fn classify_query(&self, query: &str) -> QueryType {
        let q = query.to_lowercase();
        let contains_any = |words: &[&str]| words.iter().any(|w| q.contains(w));

        if contains_any(&[
            "what is", "when", "where", "who", "how many", "how much", "facts", "data",
        ]) {
            return QueryType::Factual;
        }
        if contains_any(&[
            "analyze",
            "explain",
            "why",
            "how does",
            "what causes",
            "implications",
            "trends",
            "analysis",
        ]) {
            return QueryType::Analytical;
        }
        if contains_any(&[
            "compare", "difference", "similar", "versus", "vs", "contrast", "better", "worse",
        ]) {
            return QueryType::Comparative;
        }
        if contains_any(&[
            "summarize",
            "summary",
            "overview",
            "brief",
            "key points",
            "main points",
        ]) {
            return QueryType::Summarization;
        }
        if contains_any(&[
            "creative",
            "innovative",
            "ideas",
            "suggestions",
            "brainstorm",
            "imagine",
        ]) {
            return QueryType::Creative;
        }

        QueryType::General
    }

    fn template_for(&self, query_type: QueryType, has_context: bool) -> &'static str {
        if !has_context {
            return FALLBACK_TEMPLATE;
        }
        match query_type {
            QueryType::Factual => FACTUAL_TEMPLATE,
            QueryType::Analytical => ANALYTICAL_TEMPLATE,
            QueryType::Comparative => COMPARATIVE_TEMPLATE,
            QueryType::Summarization => SUMMARIZATION_TEMPLATE,
            QueryType::Creative => CREATIVE_TEMPLATE,
            QueryType::General => BASE_TEMPLATE,
        }
    }

    /// Build the full prompt for a query and its assembled context
    pub fn create_prompt(
        &self,
        query: &str,
        query_type: Option<QueryType>,
        context: &RagContext,
        safety_level: SafetyLevel,
        response_format: Option<ResponseFormat>,
    ) -> String {
        let query_type = query_type.unwrap_or_else(|| self.classify_query(query));
        let template = self.template_for(query_type, !context.assembled_context.is_empty());

        let formatted_context = self.format_context(context);
        let mut prompt = template
            .replace("{context}", &formatted_context)
            .replace("{query}", query);

        let guidelines = match safety_level {
            SafetyLevel::Standard => &STANDARD_GUIDELINES,
            SafetyLevel::Conservative => &CONSERVATIVE_GUIDELINES,
            SafetyLevel::Permissive => &PERMISSIVE_GUIDELINES,
        };
        prompt.push_str("\n\nSafety Guidelines:\n");
        for guideline in guidelines {
            prompt.push_str("- ");
            prompt.push_str(guideline);
            prompt.push('\n');
        }

        if let Some(format) = response_format {
            let instruction = match format {
                ResponseFormat::Text => "Provide a natural, flowing text response.",
                ResponseFormat::BulletPoints => {
                    "Organize your response as a list of bullet points for clarity."
                }
                ResponseFormat::NumberedList => {
                    "Present your response as a numbered list for structured information."
                }
                ResponseFormat::Table => {
                    "Format your response as a table when comparing multiple items or data points."
                }
                ResponseFormat::Json => "Provide your response in JSON format for structured data.",
                ResponseFormat::Summary => {
                    "Provide a concise summary with key points highlighted."
                }
            };
            prompt.push_str("\nResponse Format: ");
            prompt.push_str(instruction);
        }

        prompt
    }

    /// Rewrite the assembled context into numbered document sections with
    /// relevance scores
    pub fn format_context(&self, context: &RagContext) -> String {
        if context.assembled_context.is_empty() {
            return "No relevant context available.".to_string();
        }

        let sections: Vec<&str> = context.assembled_context.split("Source:").collect();
        let mut formatted = Vec::new();

        for (i, section) in sections.iter().skip(1).enumerate() {
            let mut lines = section.trim().lines();
            let source_file = lines.next().unwrap_or("").trim();
            let chunk_index = lines.next().unwrap_or("").trim();
            let content = lines.collect::<Vec<_>>().join("\n");

            let relevance = context
                .relevance_scores
                .get(i)
                .map(|score| format!(" (Relevance: {score:.3})"))
                .unwrap_or_default();

            formatted.push(format!(
                "Document {}: {}{}\nChunk: {}\nContent: {}\n",
                i + 1,
                source_file,
                relevance,
                chunk_index,
                content.trim()
            ));
        }

        formatted.join("\n")
    }

    /// Validate a response: safety regexes, context adherence and quality.
    /// Returns the status and a safety score in [0, 1].
    pub fn validate_response(
        &self,
        response: &str,
        _query: &str,
        context: &RagContext,
    ) -> (ValidationStatus, f32) {
        let mut status = ValidationStatus::Valid;
        let mut score = 1.0f32;

        let response_lower = response.to_lowercase();
        let safety_hits = harmful_patterns()
            .iter()
            .filter(|p| p.is_match(&response_lower))
            .count();
        if safety_hits > 0 {
            status = ValidationStatus::Warning;
            score = (score - 0.1 * safety_hits as f32).max(0.5);
        }

        if !context.assembled_context.is_empty()
            && !self.shares_content_words(response, &context.assembled_context)
        {
            status = ValidationStatus::Warning;
            score = (score - 0.2).max(0.7).min(score);
        }

        let quality_issues = self.quality_issues(response);
        if quality_issues > 0 {
            status = ValidationStatus::Warning;
            score = (score - 0.1 * quality_issues as f32).max(0.6).min(score);
        }

        (status, score.clamp(0.0, 1.0))
    }

    fn shares_content_words(&self, response: &str, context: &str) -> bool {
        let stopwords: HashSet<&str> = STOPWORDS.iter().copied().collect();

        let words_of = |text: &str| -> HashSet<String> {
            let lower = text.to_lowercase();
            word_re()
                .find_iter(&lower)
                .map(|m| m.as_str().to_string())
                .filter(|w| !stopwords.contains(w.as_str()))
                .collect()
        };

        let context_words = words_of(context);
        let response_words = words_of(response);
        response_words.intersection(&context_words).next().is_some()
    }

    fn quality_issues(&self, response: &str) -> usize {
        let mut issues = 0;
        let trimmed = response.trim();

        if trimmed.len() < 20 {
            issues += 1;
        }

        let lower = trimmed.to_lowercase();
        if trimmed.len() < 100 && GENERIC_PHRASES.iter().any(|p| lower.contains(p)) {
            issues += 1;
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PromptEngine {
        PromptEngine::new()
    }

    fn context_with(assembled: &str, scores: Vec<f32>) -> RagContext {
        RagContext {
            query: "test".to_string(),
            retrieved: Vec::new(),
            assembled_context: assembled.to_string(),
            context_length: assembled.len(),
            source_files: Vec::new(),
            relevance_scores: scores,
        }
    }

    #[test]
    fn test_classification_precedence() {
        let e = engine();
        assert_eq!(e.classify_query("What is a vector store?"), QueryType::Factual);
        assert_eq!(
            e.classify_query("Explain how the chunker works"),
            QueryType::Analytical
        );
        assert_eq!(
            e.classify_query("Compare qdrant and faiss"),
            QueryType::Comparative
        );
        assert_eq!(
            e.classify_query("Give me a summary of the report"),
            QueryType::Summarization
        );
        assert_eq!(
            e.classify_query("Brainstorm some improvements"),
            QueryType::Creative
        );
        assert_eq!(e.classify_query("Tell me about dogs"), QueryType::General);
    }

    #[test]
    fn test_factual_wins_over_analytical() {
        // "what is" (factual) appears before "why" would be checked
        let e = engine();
        assert_eq!(
            e.classify_query("What is the reason why this happens?"),
            QueryType::Factual
        );
    }

    #[test]
    fn test_prompt_contains_query_and_context() {
        let e = engine();
        let context = context_with("Source: a.txt\n0\nRust is fast.\n", vec![0.91]);
        let prompt = e.create_prompt(
            "What is Rust?",
            None,
            &context,
            SafetyLevel::Standard,
            None,
        );

        assert!(prompt.contains("What is Rust?"));
        assert!(prompt.contains("Document 1: a.txt (Relevance: 0.910)"));
        assert!(prompt.contains("Safety Guidelines:"));
        assert!(prompt.contains("Avoid harmful"));
    }

    #[test]
    fn test_fallback_template_without_context() {
        let e = engine();
        let context = context_with("", vec![]);
        let prompt = e.create_prompt("Anything?", None, &context, SafetyLevel::Standard, None);
        assert!(prompt.contains("no relevant context was found"));
    }

    #[test]
    fn test_conservative_guidelines() {
        let e = engine();
        let context = context_with("Source: a.txt\n0\nSome text.\n", vec![0.9]);
        let prompt = e.create_prompt(
            "q",
            None,
            &context,
            SafetyLevel::Conservative,
            Some(ResponseFormat::BulletPoints),
        );
        assert!(prompt.contains("medical, legal, or financial"));
        assert!(prompt.contains("Response Format:"));
        assert!(prompt.contains("bullet points"));
    }

    #[test]
    fn test_format_context_sections() {
        let e = engine();
        let context = context_with(
            "Source: a.txt\n0\nFirst chunk text.\n\nSource: b.txt\n2\nSecond chunk text.\n",
            vec![0.95, 0.80],
        );
        let formatted = e.format_context(&context);

        assert!(formatted.contains("Document 1: a.txt (Relevance: 0.950)"));
        assert!(formatted.contains("Document 2: b.txt (Relevance: 0.800)"));
        assert!(formatted.contains("Chunk: 2"));
        assert!(formatted.contains("Content: Second chunk text."));
    }

    #[test]
    fn test_validation_valid_response() {
        let e = engine();
        let context = context_with("Source: a.txt\n0\nRust compiles to native machine code.\n", vec![0.9]);
        let (status, score) = e.validate_response(
            "Rust compiles directly to native machine code, which makes it fast.",
            "Is Rust fast?",
            &context,
        );
        assert_eq!(status, ValidationStatus::Valid);
        assert!(score >= 0.9);
    }

    #[test]
    fn test_validation_flags_harmful_pattern() {
        let e = engine();
        let context = context_with("", vec![]);
        let (status, score) = e.validate_response(
            "Here is a guide to hacking the mainframe and bypassing security measures today.",
            "q",
            &context,
        );
        assert_eq!(status, ValidationStatus::Warning);
        assert!(score < 1.0);
        assert!(score >= 0.5);
    }

    #[test]
    fn test_validation_context_adherence() {
        let e = engine();
        let context = context_with(
            "Source: a.txt\n0\nPhotosynthesis converts sunlight into chemical energy.\n",
            vec![0.9],
        );
        let (status, score) = e.validate_response(
            "Bananas ripen faster inside sealed paper bags overnight.",
            "q",
            &context,
        );
        assert_eq!(status, ValidationStatus::Warning);
        assert!(score <= 0.8);
    }

    #[test]
    fn test_validation_short_response() {
        let e = engine();
        let context = context_with("", vec![]);
        let (status, score) = e.validate_response("Too short.", "q", &context);
        assert_eq!(status, ValidationStatus::Warning);
        assert!(score < 1.0);
    }

    #[test]
    fn test_validation_generic_phrase_in_short_response() {
        let e = engine();
        let context = context_with("", vec![]);
        let (status, _) = e.validate_response("I don't know anything about that topic.", "q", &context);
        assert_eq!(status, ValidationStatus::Warning);
    }

    #[test]
    fn test_safety_score_bounds() {
        let e = engine();
        let context = context_with("Source: a.txt\n0\nSome entirely unrelated corpus text.\n", vec![0.9]);
        let (_, score) = e.validate_response(
            "hacking exploiting bypassing security now",
            "q",
            &context,
        );
        assert!((0.0..=1.0).contains(&score));
    }
}
