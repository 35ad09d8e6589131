use std::{collections::HashSet, sync::Arc};

use common::{
    error::AppError,
    storage::types::text_chunk::TextChunk,
    utils::{
        config::AppConfig,
        hashing::{entity_key, relation_pair},
        limiter::Priority,
        llm::{ChatTurn, CompletionRequest, LlmService},
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::utils::llm_instructions::{
    extraction_prompt, gleaning_prompt, COMPLETION_DELIMITER, EXTRACTION_SYSTEM_MESSAGE,
    RECORD_DELIMITER, TUPLE_DELIMITER,
};

pub const EXTRACT_CACHE_MODE: &str = "extract";
pub const UNKNOWN_ENTITY_TYPE: &str = "UNKNOWN";
const ENTITY_FIELDS: usize = 4;
const RELATION_FIELDS: usize = 5;
const DEFAULT_STRENGTH: f32 = 1.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
}

impl ExtractedEntity {
    pub fn key(&self) -> String {
        entity_key(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedRelation {
    pub source: String,
    pub target: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub strength: f32,
}

impl ExtractedRelation {
    pub fn pair(&self) -> (String, String) {
        relation_pair(&self.source, &self.target)
    }
}

/// Records parsed from one or more model replies for a single chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParsedRecords {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

impl ParsedRecords {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }

    /// Appends records whose identity is not present yet; returns how many
    /// were added.
    pub fn absorb(&mut self, other: ParsedRecords) -> usize {
        let mut known_entities: HashSet<String> =
            self.entities.iter().map(ExtractedEntity::key).collect();
        let mut known_relations: HashSet<(String, String)> =
            self.relations.iter().map(ExtractedRelation::pair).collect();
        let mut added = 0;
        for entity in other.entities {
            if known_entities.insert(entity.key()) {
                self.entities.push(entity);
                added += 1;
            }
        }
        for relation in other.relations {
            if known_relations.insert(relation.pair()) {
                self.relations.push(relation);
                added += 1;
            }
        }
        added
    }
}

/// Extraction result for one chunk, persisted so deletion can rebuild
/// entities from the evidence that remains.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkExtraction {
    pub chunk_id: String,
    pub full_doc_id: String,
    pub file_path: String,
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

impl ChunkExtraction {
    pub fn new(chunk: &TextChunk, records: ParsedRecords) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            full_doc_id: chunk.full_doc_id.clone(),
            file_path: chunk.file_path.clone(),
            entities: records.entities,
            relations: records.relations,
        }
    }
}

fn clean_field(field: &str) -> String {
    field
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_string()
}

fn normalize_type(raw: &str) -> String {
    let cleaned = clean_field(raw);
    if cleaned.is_empty() {
        return UNKNOWN_ENTITY_TYPE.to_string();
    }
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

fn record_body(record: &str) -> &str {
    let record = record.trim();
    match (record.find('('), record.rfind(')')) {
        (Some(open), Some(close)) if open < close => record.get(open + 1..close).unwrap_or(record),
        _ => record,
    }
}

/// Parses a delimited extraction reply. Records with too few fields, blank
/// names, or identical endpoints are skipped. A reply that does not use the
/// record format at all is a parsing error.
pub fn parse_extraction(raw: &str) -> Result<ParsedRecords, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(ParsedRecords::default());
    }
    if !trimmed.contains(TUPLE_DELIMITER) && !trimmed.contains(COMPLETION_DELIMITER) {
        return Err(AppError::LLMParsing(
            "reply contains no delimited records".into(),
        ));
    }

    let body = trimmed.split(COMPLETION_DELIMITER).next().unwrap_or(trimmed);
    let mut parsed = ParsedRecords::default();

    for record in body
        .split(RECORD_DELIMITER)
        .flat_map(|part| part.split('\n'))
        .map(record_body)
        .filter(|record| record.contains(TUPLE_DELIMITER))
    {
        let fields: Vec<String> = record.split(TUPLE_DELIMITER).map(clean_field).collect();
        let Some(tag) = fields.first().map(|tag| tag.to_lowercase()) else {
            continue;
        };
        match tag.as_str() {
            "entity" if fields.len() >= ENTITY_FIELDS => {
                let name = fields[1].clone();
                if entity_key(&name).is_empty() {
                    continue;
                }
                parsed.entities.push(ExtractedEntity {
                    name,
                    entity_type: normalize_type(&fields[2]),
                    description: fields[3].clone(),
                });
            }
            "relationship" | "relation" if fields.len() >= RELATION_FIELDS => {
                let (source, target) = (fields[1].clone(), fields[2].clone());
                let (src_key, tgt_key) = relation_pair(&source, &target);
                if src_key.is_empty() || tgt_key.is_empty() || src_key == tgt_key {
                    continue;
                }
                let keywords = fields[4]
                    .split(',')
                    .map(str::trim)
                    .filter(|keyword| !keyword.is_empty())
                    .map(str::to_string)
                    .collect();
                let strength = fields
                    .get(5)
                    .and_then(|value| value.parse::<f32>().ok())
                    .filter(|value| value.is_finite() && *value > 0.0)
                    .unwrap_or(DEFAULT_STRENGTH);
                parsed.relations.push(ExtractedRelation {
                    source,
                    target,
                    description: fields[3].clone(),
                    keywords,
                    strength,
                });
            }
            _ => {
                debug!(%tag, fields = fields.len(), "discarding malformed extraction record");
            }
        }
    }

    Ok(parsed)
}

/// Bounded sequence of gleaning passes. Yields the pass number until the
/// budget is spent or a pass reports no new records.
#[derive(Debug, Clone)]
pub struct Gleaning {
    max_passes: usize,
    performed: usize,
    exhausted: bool,
}

impl Gleaning {
    pub fn new(max_passes: usize) -> Self {
        Self {
            max_passes,
            performed: 0,
            exhausted: false,
        }
    }

    pub fn record(&mut self, new_records: usize) {
        if new_records == 0 {
            self.exhausted = true;
        }
    }

    pub fn performed(&self) -> usize {
        self.performed
    }
}

impl Iterator for Gleaning {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted || self.performed >= self.max_passes {
            return None;
        }
        self.performed += 1;
        Some(self.performed)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub entity_types: Vec<String>,
    pub language: String,
    pub max_gleaning: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

impl ExtractionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            entity_types: config.entity_types.clone(),
            language: config.summary_language.clone(),
            max_gleaning: config.max_gleaning,
        }
    }
}

pub struct Extractor {
    llm: Arc<LlmService>,
    config: ExtractionConfig,
}

impl Extractor {
    pub fn new(llm: Arc<LlmService>, config: ExtractionConfig) -> Self {
        Self { llm, config }
    }

    fn parse_or_empty(chunk_id: &str, reply: &str) -> ParsedRecords {
        match parse_extraction(reply) {
            Ok(records) => records,
            Err(err) => {
                warn!(%chunk_id, error = %err, "unparseable extraction reply; treating as empty");
                ParsedRecords::default()
            }
        }
    }

    /// Extracts entities and relations from one chunk. Model errors that
    /// survive retries are returned; unparseable replies are not.
    #[instrument(level = "debug", skip_all, fields(chunk_id = %chunk.id))]
    pub async fn extract(&self, chunk: &TextChunk) -> Result<ChunkExtraction, AppError> {
        let prompt = extraction_prompt(&self.config.entity_types, &self.config.language, &chunk.content);
        let request = CompletionRequest::new(prompt.clone())
            .with_system(EXTRACTION_SYSTEM_MESSAGE)
            .with_priority(Priority::Low);
        let reply = self.llm.complete_cached(EXTRACT_CACHE_MODE, &request).await?;
        let mut records = Self::parse_or_empty(&chunk.id, &reply);
        let mut history = vec![ChatTurn::user(prompt), ChatTurn::assistant(reply)];

        let mut gleaning = Gleaning::new(self.config.max_gleaning);
        while let Some(pass) = gleaning.next() {
            let follow_up = gleaning_prompt();
            let request = CompletionRequest::new(follow_up.clone())
                .with_system(EXTRACTION_SYSTEM_MESSAGE)
                .with_history(history.clone())
                .with_priority(Priority::Low);
            let reply = self.llm.complete_cached(EXTRACT_CACHE_MODE, &request).await?;
            let added = records.absorb(Self::parse_or_empty(&chunk.id, &reply));
            debug!(chunk_id = %chunk.id, pass, added, "gleaning pass finished");
            gleaning.record(added);
            history.push(ChatTurn::user(follow_up));
            history.push(ChatTurn::assistant(reply));
        }

        debug!(
            chunk_id = %chunk.id,
            entities = records.entities.len(),
            relations = records.relations.len(),
            gleaning_passes = gleaning.performed(),
            "chunk extraction finished"
        );
        Ok(ChunkExtraction::new(chunk, records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        storage::memory::MemoryKvStore,
        utils::{limiter::PriorityLimiter, llm::ScriptedLanguageModel, retry::RetryPolicy},
    };

    const ALICE_REPLY: &str = r#"("entity"<|>Alice<|>person<|>Alice is the CEO of Acme.)##
("entity"<|>Acme<|>organization<|>Acme is a company led by Alice.)##
("relationship"<|>Alice<|>Acme<|>Alice is CEO of Acme.<|>leadership, CEO of<|>9)##
<|COMPLETE|>"#;

    fn chunk(content: &str) -> TextChunk {
        TextChunk::new("doc-1".into(), content.into(), 8, 0, "notes.txt".into())
    }

    fn extractor(model: Arc<ScriptedLanguageModel>, max_gleaning: usize) -> Extractor {
        let llm = LlmService::new(model, PriorityLimiter::new(2), RetryPolicy::none())
            .with_cache(Arc::new(MemoryKvStore::new("cache")));
        Extractor::new(
            Arc::new(llm),
            ExtractionConfig {
                max_gleaning,
                ..ExtractionConfig::default()
            },
        )
    }

    #[test]
    fn parses_entities_and_relations() {
        let parsed = parse_extraction(ALICE_REPLY).expect("parse");
        assert_eq!(parsed.entities.len(), 2);
        assert_eq!(parsed.entities[0].name, "Alice");
        assert_eq!(parsed.entities[0].entity_type, "PERSON");
        assert_eq!(parsed.relations.len(), 1);
        let relation = &parsed.relations[0];
        assert_eq!(relation.keywords, vec!["leadership", "CEO of"]);
        assert!((relation.strength - 9.0).abs() < f32::EPSILON);
    }

    #[test]
    fn short_records_and_self_loops_are_dropped() {
        let reply = r#"("entity"<|>Alice<|>person)##
("relationship"<|>Alice<|>Acme<|>missing keywords)##
("relationship"<|>Acme<|> acme <|>self<|>loop)##
("entity"<|>Widget<|>product<|>A device.)<|COMPLETE|>"#;
        let parsed = parse_extraction(reply).expect("parse");
        assert_eq!(parsed.entities.len(), 1);
        assert_eq!(parsed.entities[0].name, "Widget");
        assert!(parsed.relations.is_empty());
    }

    #[test]
    fn missing_strength_defaults_to_one() {
        let reply = r#"("relationship"<|>Acme<|>Widget<|>Acme uses Widget.<|>usage)<|COMPLETE|>"#;
        let parsed = parse_extraction(reply).expect("parse");
        assert!((parsed.relations[0].strength - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn prose_replies_are_parse_errors() {
        assert!(matches!(
            parse_extraction("I could not find anything."),
            Err(AppError::LLMParsing(_))
        ));
    }

    #[test]
    fn gleaning_stops_at_budget_or_on_empty_pass() {
        let mut bounded = Gleaning::new(2);
        assert_eq!(bounded.next(), Some(1));
        bounded.record(3);
        assert_eq!(bounded.next(), Some(2));
        bounded.record(1);
        assert_eq!(bounded.next(), None);

        let mut early = Gleaning::new(5);
        assert_eq!(early.next(), Some(1));
        early.record(0);
        assert_eq!(early.next(), None);
        assert_eq!(early.performed(), 1);
    }

    #[tokio::test]
    async fn one_gleaning_pass_means_at_most_two_calls() {
        let model = Arc::new(ScriptedLanguageModel::new(|request| {
            if request.history.is_empty() {
                Ok(ALICE_REPLY.to_string())
            } else {
                Ok(r#"("entity"<|>Widget<|>product<|>A tool used by Acme.)<|COMPLETE|>"#.into())
            }
        }));
        let extractor = extractor(model.clone(), 1);

        let extraction = extractor
            .extract(&chunk("Alice is CEO of Acme. Acme uses Widget."))
            .await
            .expect("extract");

        assert_eq!(model.calls(), 2);
        assert_eq!(extraction.entities.len(), 3);
        assert_eq!(extraction.full_doc_id, "doc-1");
        let requests = model.requests();
        assert!(requests.iter().all(|r| r.priority == Priority::Low));
        assert_eq!(requests[1].history.len(), 2);
    }

    #[tokio::test]
    async fn malformed_reply_degrades_to_empty_extraction() {
        let model = Arc::new(ScriptedLanguageModel::new(|_| Ok("no idea".to_string())));
        let extractor = extractor(model.clone(), 3);

        let extraction = extractor.extract(&chunk("Some text")).await.expect("extract");

        assert!(extraction.entities.is_empty());
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn repeated_extraction_is_served_from_cache() {
        let model = Arc::new(ScriptedLanguageModel::new(|_| Ok(ALICE_REPLY.to_string())));
        let extractor = extractor(model.clone(), 0);
        let chunk = chunk("Alice is CEO of Acme.");

        extractor.extract(&chunk).await.expect("first");
        extractor.extract(&chunk).await.expect("second");

        assert_eq!(model.calls(), 1);
    }
}
