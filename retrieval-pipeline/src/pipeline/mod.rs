mod config;
mod fusion;
mod stages;
mod state;

pub use config::{ChunkSource, QueryMode, QueryParam, RetrievalTuning};
pub use fusion::{round_robin, truncate_by_tokens};
pub use stages::QueryContext;
pub(crate) use state::{received, Answered, Bypassed, ContextBuilt, QueryMachine};

use std::time::{Duration, Instant};

use common::error::AppError;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Keywords,
    Search,
    Truncate,
    MergeChunks,
    BuildContext,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStageTimings {
    pub keywords_ms: u64,
    pub search_ms: u64,
    pub truncate_ms: u64,
    pub merge_chunks_ms: u64,
    pub build_context_ms: u64,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        let millis = duration_millis(duration);
        let slot = match kind {
            StageKind::Keywords => &mut self.keywords_ms,
            StageKind::Search => &mut self.search_ms,
            StageKind::Truncate => &mut self.truncate_ms,
            StageKind::MergeChunks => &mut self.merge_chunks_ms,
            StageKind::BuildContext => &mut self.build_context_ms,
        };
        *slot = slot.saturating_add(millis);
    }

    pub fn total_ms(&self) -> u64 {
        self.keywords_ms
            + self.search_ms
            + self.truncate_ms
            + self.merge_chunks_ms
            + self.build_context_ms
    }
}

/// Runs keyword extraction, search, truncation, chunk merging and context
/// assembly. The returned machine is ready to be marked answered.
pub async fn run_pipeline(
    ctx: &mut QueryContext<'_>,
) -> Result<QueryMachine<(), ContextBuilt>, AppError> {
    let query_chars = ctx.query.chars().count();
    let preview: String = ctx.query.chars().take(120).collect::<String>().replace('\n', " ");
    info!(
        mode = %ctx.param.mode,
        query_chars,
        preview_truncated = query_chars > preview.chars().count(),
        preview = %preview,
        "starting query pipeline"
    );

    drive_pipeline(ctx).await.map_err(|err| ctx.abort(err))
}

async fn drive_pipeline(
    ctx: &mut QueryContext<'_>,
) -> Result<QueryMachine<(), ContextBuilt>, AppError> {
    let machine = received();

    let stage_start = Instant::now();
    let machine = stages::extract_query_keywords(machine, ctx).await?;
    ctx.stage_timings.record(StageKind::Keywords, stage_start.elapsed());

    let stage_start = Instant::now();
    let machine = stages::retrieve(machine, ctx).await?;
    ctx.stage_timings.record(StageKind::Search, stage_start.elapsed());

    let stage_start = Instant::now();
    let machine = stages::truncate(machine, ctx)?;
    ctx.stage_timings.record(StageKind::Truncate, stage_start.elapsed());

    let stage_start = Instant::now();
    let machine = stages::merge_chunks(machine, ctx).await?;
    ctx.stage_timings.record(StageKind::MergeChunks, stage_start.elapsed());

    let stage_start = Instant::now();
    let machine = stages::build_context(machine, ctx).await?;
    ctx.stage_timings.record(StageKind::BuildContext, stage_start.elapsed());

    let timings = &ctx.stage_timings;
    info!(
        mode = %ctx.param.mode,
        total_ms = timings.total_ms(),
        keywords_ms = timings.keywords_ms,
        search_ms = timings.search_ms,
        truncate_ms = timings.truncate_ms,
        merge_chunks_ms = timings.merge_chunks_ms,
        build_context_ms = timings.build_context_ms,
        "query pipeline finished"
    );
    Ok(machine)
}

/// Marks a pipeline run as answered once generation has been dispatched.
pub(crate) fn mark_answered(
    machine: QueryMachine<(), ContextBuilt>,
) -> Result<QueryMachine<(), Answered>, AppError> {
    machine.answer().map_err(|(_, guard)| {
        AppError::InternalError(format!("invalid query pipeline transition during answer: {guard:?}"))
    })
}

/// Bypass skips every retrieval stage.
pub(crate) fn bypass() -> Result<QueryMachine<(), Bypassed>, AppError> {
    received().bypass().map_err(|(_, guard)| {
        AppError::InternalError(format!("invalid query pipeline transition during bypass: {guard:?}"))
    })
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests;
