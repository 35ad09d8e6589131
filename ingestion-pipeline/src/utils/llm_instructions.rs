pub const TUPLE_DELIMITER: &str = "<|>";
pub const RECORD_DELIMITER: &str = "##";
pub const COMPLETION_DELIMITER: &str = "<|COMPLETE|>";

pub static EXTRACTION_SYSTEM_MESSAGE: &str = r#"You are a knowledge graph specialist. You read a passage of text and record the entities it mentions and the relationships between them, nothing more. Never invent facts that the passage does not state."#;

/// Fills the extraction template for one chunk.
pub fn extraction_prompt(entity_types: &[String], language: &str, input_text: &str) -> String {
    format!(
        r#"-Goal-
Given a text passage and a list of entity types, identify all entities of those types in the passage and all relationships among the identified entities.

-Steps-
1. Identify all entities. For each entity, extract:
- entity_name: name of the entity, capitalized as in the text
- entity_type: one of [{types}]
- entity_description: comprehensive description of the entity's attributes and activities
Format each entity as ("entity"{t}<entity_name>{t}<entity_type>{t}<entity_description>)

2. From the entities of step 1, identify all pairs (source_entity, target_entity) that are clearly related to each other. For each pair, extract:
- source_entity: name of the source entity, as identified in step 1
- target_entity: name of the target entity, as identified in step 1
- relationship_description: why the two entities are related
- relationship_keywords: one or more high-level keywords summarizing the relationship, comma separated
- relationship_strength: a number between 1 and 10 indicating the strength of the relationship
Format each relationship as ("relationship"{t}<source_entity>{t}<target_entity>{t}<relationship_description>{t}<relationship_keywords>{t}<relationship_strength>)

3. Write descriptions in {language}. Return all records as a single list using **{r}** as the list delimiter.

4. When finished, output {c}

-Real Data-
Entity_types: [{types}]
Text:
{input_text}

Output:"#,
        types = entity_types.join(", "),
        t = TUPLE_DELIMITER,
        r = RECORD_DELIMITER,
        c = COMPLETION_DELIMITER,
    )
}

/// Follow-up turn asking for records the previous answer missed.
pub fn gleaning_prompt() -> String {
    format!(
        "MANY entities and relationships were missed in the last extraction. \
         Add only the missing ones below using the same format. \
         Do not repeat records already listed. End with {COMPLETION_DELIMITER}"
    )
}

pub static SUMMARY_SYSTEM_MESSAGE: &str = "You merge fragments of evidence about a single subject into one consistent description.";

pub fn summary_prompt(kind: &str, name: &str, language: &str, descriptions: &[String]) -> String {
    let listing = descriptions
        .iter()
        .map(|description| format!("- {description}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Write a single comprehensive summary of the {kind} "{name}" from the descriptions below.
Include every distinct fact. Resolve contradictions into one coherent statement.
Write in the third person, in {language}, and mention the name so the summary stands alone.

Descriptions:
{listing}

Summary:"#
    )
}
