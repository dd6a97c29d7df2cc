//! Orchestrator — the `query()` sequencing state machine. Drives a single
//! incoming question through classification, retrieval, generation, and
//! reply assembly as a sequence of discrete named stages, branching
//! between the casual/state-query/state-set/action/RAG outcomes.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;
use tracing::{debug, warn};

use rag_analyzer::{AnalyzerContext, QueryAnalyzer};
use rag_cache::{query_result_cache_key, TtlCache};
use rag_completion::client::CompletionError;
use rag_completion::rerank::RerankClient;
use rag_completion::CompletionClient;
use rag_core::config::RagConfig;
use rag_core::error::{CoreError, Result};
use rag_core::types::{ConversationMessage, Memory, MemoryType, Message, Role, StateValue};
use rag_embedding::EmbeddingClient;
use rag_protocol::query::{ClassifyIntentResponse, MetricsResponse, QueryOutcome, QueryParams, QueryResult, SourceMemory, Timing};
use rag_retrieval::{find_documents_by_reference, should_search_documents, HybridRetriever, Reranker};
use rag_state::action_parser::{is_information_question, should_execute};
use rag_state::{handle_state_query, handle_state_set, ActionKind, ActionParser, ItemTracker, ParsedAction, StateLedger, WriteContext};
use rag_store::facade::HttpStoreFacade;
use rag_store::{SearchFilters, StoreFacade};
use rag_tools::{run_tool_loop, ToolContext, ToolRegistry};

use crate::context::build_context;

const DOC_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(8);
const MEMORY_RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(5);
const GENERATION_TIMEOUT: Duration = Duration::from_secs(30);
const MEMORY_CANDIDATES: usize = 10;
const CASUAL_MAX_TOKENS: u32 = 150;
const MEMORY_PREVIEW_CHARS: usize = 120;

pub struct Orchestrator {
    config: RagConfig,
    store: Arc<dyn StoreFacade>,
    embedder: Arc<EmbeddingClient>,
    completion: Arc<CompletionClient>,
    analyzer: QueryAnalyzer,
    retriever: HybridRetriever,
    reranker: Reranker,
    ledger: StateLedger,
    items: ItemTracker,
    action_parser: ActionParser,
    tools: ToolRegistry,
    local_db: Mutex<Connection>,
    query_cache: TtlCache<String, QueryOutcome>,
    started_at: Instant,
    queries_total: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: RagConfig) -> Result<Self> {
        let store: Arc<dyn StoreFacade> = Arc::new(HttpStoreFacade::new(
            config.stores.vector_base_url.clone(),
            config.stores.vector_api_key.clone(),
            config.stores.graph_base_url.clone(),
            config.stores.graph_api_key.clone(),
        ));
        let embedder = Arc::new(EmbeddingClient::new(
            config.embedding.base_url.clone(),
            config.embedding.api_key.clone(),
            config.embedding.dimension,
            config.embedding.batch_size,
        ));

        if let Some(parent) = Path::new(&config.stores.local_db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let local_conn = Connection::open(&config.stores.local_db_path)?;
        let ledger_conn = Connection::open(&config.stores.local_db_path)?;
        let items_conn = Connection::open(&config.stores.local_db_path)?;

        let tools_dir = Path::new(&config.stores.local_db_path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));

        Self::assemble(config, store, embedder, local_conn, ledger_conn, items_conn, tools_dir)
    }

    fn assemble(
        config: RagConfig,
        store: Arc<dyn StoreFacade>,
        embedder: Arc<EmbeddingClient>,
        local_conn: Connection,
        ledger_conn: Connection,
        items_conn: Connection,
        tools_dir: std::path::PathBuf,
    ) -> Result<Self> {
        rag_store::sqlite::init_db(&local_conn)?;

        let completion = CompletionClient::new(config.completion.base_url.clone(), config.completion.api_key.clone(), config.completion.model.clone());

        let analyzer = QueryAnalyzer::new(completion.clone());
        let action_parser = ActionParser::new(completion.clone());
        let ledger = StateLedger::new(ledger_conn)?;
        let items = ItemTracker::new(items_conn, completion.clone())?;

        let rerank_client = RerankClient::new(config.completion.rerank_base_url.clone());
        let reranker = Reranker::new(rerank_client);

        let completion_arc = Arc::new(completion);
        let retriever = HybridRetriever::new(store.clone(), embedder.clone(), completion_arc.clone(), config.retrieval.mmr_lambda);

        let tools = ToolRegistry::new(tools_dir, "tools.json")?;

        let query_cache = TtlCache::new("query_result_cache", Duration::from_secs(config.cache.ttl_seconds), config.cache.max_size);

        Ok(Self {
            config,
            store,
            embedder,
            completion: completion_arc,
            analyzer,
            retriever,
            reranker,
            ledger,
            items,
            action_parser,
            tools,
            local_db: Mutex::new(local_conn),
            query_cache,
            started_at: Instant::now(),
            queries_total: AtomicU64::new(0),
        })
    }

    #[cfg(test)]
    fn test_harness(store: Arc<dyn StoreFacade>) -> Self {
        let config = RagConfig::default();
        let embedder = Arc::new(EmbeddingClient::new("http://unused.invalid", None, 8, 4));
        let local_conn = Connection::open_in_memory().unwrap();
        let ledger_conn = Connection::open_in_memory().unwrap();
        let items_conn = Connection::open_in_memory().unwrap();
        let tools_dir = std::env::temp_dir().join(format!("rag-orchestrator-test-{:p}", &store));
        std::fs::create_dir_all(&tools_dir).unwrap();
        Self::assemble(config, store, embedder, local_conn, ledger_conn, items_conn, tools_dir).unwrap()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn queries_total(&self) -> u64 {
        self.queries_total.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> MetricsResponse {
        let mut cache_hits = std::collections::HashMap::new();
        let mut cache_misses = std::collections::HashMap::new();
        cache_hits.insert("query_result_cache".to_string(), self.query_cache.hits.load(Ordering::Relaxed));
        cache_misses.insert("query_result_cache".to_string(), self.query_cache.misses.load(Ordering::Relaxed));
        MetricsResponse { uptime_seconds: self.uptime_seconds(), queries_total: self.queries_total(), cache_hits, cache_misses }
    }

    /// Backs both `POST /classify_intent` and `POST /route_message` (the
    /// two companion endpoints return the same classification shape;
    /// spec §6 doesn't distinguish their payloads).
    pub async fn classify_intent(&self, message: &str) -> ClassifyIntentResponse {
        let ctx = AnalyzerContext::default();
        let result = self.analyzer.classify(message, &ctx).await;
        ClassifyIntentResponse {
            intent: enum_to_snake(&result.intent),
            routing: enum_to_snake(&result.routing),
            confidence: result.confidence,
            needs_rag: result.needs_rag,
            needs_tools: result.needs_tools,
            needs_memory: result.needs_memory,
        }
    }

    pub fn add_conversation(&self, msg: &ConversationMessage) -> Result<i64> {
        let conn = self.local_db.lock().unwrap();
        rag_store::sqlite::insert_conversation(&conn, msg).map_err(CoreError::from)
    }

    pub fn get_conversation(&self, user_id: &str, channel_id: Option<&str>, limit: usize) -> Result<Vec<ConversationMessage>> {
        let conn = self.local_db.lock().unwrap();
        rag_store::sqlite::get_conversation(&conn, user_id, channel_id, limit).map_err(CoreError::from)
    }

    pub fn get_recent_conversation(&self, user_id: &str, channel_id: Option<&str>) -> Result<Option<ConversationMessage>> {
        let conn = self.local_db.lock().unwrap();
        rag_store::sqlite::get_recent_conversation(&conn, user_id, channel_id).map_err(CoreError::from)
    }

    pub fn conversation_stats(&self, user_id: &str) -> Result<(u64, Vec<String>, Option<String>, Option<String>)> {
        let conn = self.local_db.lock().unwrap();
        rag_store::sqlite::conversation_stats(&conn, user_id).map_err(CoreError::from)
    }

    pub fn clear_conversation(&self, user_id: &str, channel_id: Option<&str>) -> Result<u64> {
        let conn = self.local_db.lock().unwrap();
        rag_store::sqlite::clear_conversation(&conn, user_id, channel_id).map_err(CoreError::from)
    }

    pub fn get_relevant_conversations(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<(ConversationMessage, f32)>> {
        let conn = self.local_db.lock().unwrap();
        rag_store::sqlite::get_relevant_conversations(&conn, user_id, query, k).map_err(CoreError::from)
    }

    /// The single entry point for a `query` wire call. Sequencing follows
    /// spec §4.15: short-circuits for state and action first, then casual
    /// chat, then full retrieval-augmented generation.
    pub async fn query(&self, params: QueryParams) -> Result<QueryResult> {
        let total_start = Instant::now();
        let question = params.question.trim().to_string();
        if question.is_empty() {
            return Err(CoreError::InvalidInput("question must not be empty".to_string()));
        }
        self.queries_total.fetch_add(1, Ordering::Relaxed);

        // Steps 3-4: state short-circuits — cheap and deterministic, so
        // they run before any model call.
        if let Some(answer) = handle_state_query(
            &question,
            params.user_id.as_deref(),
            params.mentioned_user_id.as_deref(),
            &self.ledger,
            &self.items,
        )
        .await?
        {
            let timing = Timing { total_ms: elapsed_ms(total_start), ..Default::default() };
            return Ok(QueryOutcome::StateAnswer { answer, timing }.into_wire(params.question));
        }
        if let Some(answer) = handle_state_set(&question, params.user_id.as_deref(), params.mentioned_user_id.as_deref(), &self.ledger).await? {
            let timing = Timing { total_ms: elapsed_ms(total_start), ..Default::default() };
            return Ok(QueryOutcome::StateAnswer { answer, timing }.into_wire(params.question));
        }

        // Step 5: classify early so routing decisions below can reuse it.
        let prior_turn = match &params.user_id {
            Some(uid) => self.get_recent_conversation(uid, params.channel_id.as_deref()).unwrap_or(None),
            None => None,
        };
        let analyzer_ctx = AnalyzerContext {
            has_attachments: false,
            is_mentioned: params.mentioned_user_id.is_some(),
            recent_messages: Vec::new(),
            previous_question: prior_turn.as_ref().map(|c| c.question.clone()),
            previous_answer: prior_turn.as_ref().map(|c| c.answer.clone()),
        };
        let analysis = self.analyzer.classify(&question, &analyzer_ctx).await;

        // Step 6: resolve any document references the analyzer surfaced.
        let has_explicit_doc_filter = params.doc_id.is_some() || params.doc_filename.is_some();
        let mut forced_rag = false;
        if !analysis.document_references.is_empty() && !has_explicit_doc_filter {
            let all_docs = self.store.get_all_documents().await;
            let resolved = find_documents_by_reference(&analysis.document_references, &all_docs);
            if !resolved.is_empty() {
                forced_rag = true;
            }
        }

        // Step 7: action parsing — gated behind the information-question
        // safety net regardless of what the model says.
        if !is_information_question(&question) {
            let asking_user = params.user_id.as_deref().unwrap_or("unknown");
            let parsed = self.action_parser.parse_action(&question, asking_user, params.mentioned_user_id.as_deref()).await;
            if should_execute(&parsed) {
                match self.execute_action(&parsed, params.user_id.as_deref()).await {
                    Ok(answer) => {
                        let timing = Timing { total_ms: elapsed_ms(total_start), ..Default::default() };
                        return Ok(QueryOutcome::ActionConfirmation { answer, timing }.into_wire(params.question));
                    }
                    Err(e) if e.degrades_silently() => {
                        warn!(error = %e, "action execution degraded, falling through to RAG");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Step 8: casual chat — quick, no evidence gathering.
        if analysis.is_casual && !forced_rag {
            let answer = self.casual_reply(&question).await?;
            let timing = Timing { total_ms: elapsed_ms(total_start), ..Default::default() };
            return Ok(QueryOutcome::Casual { answer, timing }.into_wire(params.question));
        }

        let prior_ctx_hash = prior_turn.as_ref().map(|c| format!("{:x}", hash_prior_turn(&c.question, &c.answer)));
        let cache_key = query_result_cache_key(
            &question,
            params.channel_id.as_deref(),
            params.doc_id.as_deref().or(params.doc_filename.as_deref()),
            prior_ctx_hash.as_deref(),
        );
        if self.config.cache.enabled {
            if let Some(cached) = self.query_cache.get(&cache_key) {
                debug!(%cache_key, "query result cache hit");
                return Ok(cached.into_wire(params.question));
            }
        }

        self.run_rag(params, question, analysis, prior_turn, total_start, cache_key).await
    }

    async fn run_rag(
        &self,
        params: QueryParams,
        question: String,
        analysis: rag_analyzer::AnalysisResult,
        prior_turn: Option<ConversationMessage>,
        total_start: Instant,
        cache_key: String,
    ) -> Result<QueryResult> {
        let retrieval_start = Instant::now();

        let filters = SearchFilters { doc_id: params.doc_id.clone(), doc_filename: params.doc_filename.clone() };
        let targets_specific_doc = params.doc_id.is_some() || params.doc_filename.is_some();
        let should_search = should_search_documents(&question, targets_specific_doc);
        let use_memory = params.use_memory && params.channel_id.is_some() && !targets_specific_doc;

        let doc_future = async {
            if should_search && params.use_shared_docs {
                self.retriever
                    .retrieve(&question, analysis.complexity, params.top_k, &filters, params.use_query_expansion, params.use_temporal_weighting)
                    .await
            } else {
                Vec::new()
            }
        };
        let memory_future = async {
            if use_memory {
                self.gather_memories(params.channel_id.as_deref().unwrap(), &question)
            } else {
                Vec::new()
            }
        };

        let (doc_result, mem_result) = tokio::join!(
            tokio::time::timeout(DOC_RETRIEVAL_TIMEOUT, doc_future),
            tokio::time::timeout(MEMORY_RETRIEVAL_TIMEOUT, memory_future),
        );
        let candidates = doc_result.unwrap_or_else(|_| {
            warn!("document retrieval timed out, degrading to no documents");
            Vec::new()
        });
        let mut memories = mem_result.unwrap_or_else(|_| {
            warn!("memory retrieval timed out, degrading to no memories");
            Vec::new()
        });
        if params.use_temporal_weighting {
            apply_memory_decay(&mut memories, self.config.retrieval.decay_days, Utc::now());
        }

        // Cross-encoder re-ranking runs after retrieval's own internal MMR pass.
        let chunks = self.reranker.rerank(&question, candidates, params.top_k).await;

        let retrieval_ms = elapsed_ms(retrieval_start);

        let prior_turn_text = prior_turn.as_ref().map(|c| format!("Q: {}\nA: {}", c.question, c.answer));
        let assembled = build_context(prior_turn_text.as_deref(), &memories, &chunks, params.max_context_tokens);

        let generation_start = Instant::now();
        let (answer, tool_calls) = self.generate(&question, &assembled.text, &params, &analysis).await?;
        let generation_ms = elapsed_ms(generation_start);

        self.persist_exchange(&params, &question, &answer);

        let mut seen_docs = std::collections::HashSet::new();
        let source_documents: Vec<String> = chunks.iter().filter(|c| seen_docs.insert(c.file_name.clone())).map(|c| c.file_name.clone()).collect();
        let source_memories: Vec<SourceMemory> = memories
            .iter()
            .map(|m| SourceMemory { memory_type: m.memory_type.to_string(), preview: preview(&m.content, MEMORY_PREVIEW_CHARS) })
            .collect();

        let timing = Timing { retrieval_ms, generation_ms, total_ms: elapsed_ms(total_start) };
        let outcome = QueryOutcome::RagAnswer {
            answer,
            context_chunks: assembled.chunks_used,
            memories_used: assembled.memories_used,
            source_documents,
            source_memories,
            routing: enum_to_snake(&analysis.routing),
            tool_calls,
            timing,
        };

        if self.config.cache.enabled && outcome_is_side_effect_free(&outcome) {
            self.query_cache.insert(cache_key, outcome.clone());
        }

        Ok(outcome.into_wire(params.question))
    }

    async fn generate(
        &self,
        question: &str,
        context: &str,
        params: &QueryParams,
        analysis: &rag_analyzer::AnalysisResult,
    ) -> Result<(String, Vec<rag_protocol::query::ToolCallRecord>)> {
        let system_prompt = build_system_prompt(context);
        let messages = vec![Message { role: Role::System, content: system_prompt }, Message { role: Role::User, content: question.to_string() }];

        let has_documents = !context.is_empty();
        let result = if has_documents || !analysis.needs_tools {
            tokio::time::timeout(GENERATION_TIMEOUT, self.completion.complete(&messages, params.temperature, params.max_tokens))
                .await
                .map_err(|_| generation_timeout())?
                .map(|text| (text, Vec::new()))
                .map_err(completion_to_core_error)
        } else {
            let tool_ctx = ToolContext { user_id: params.user_id.clone(), channel_id: params.channel_id.clone() };
            tokio::time::timeout(GENERATION_TIMEOUT, run_tool_loop(&self.completion, &self.tools, messages, params.temperature, params.max_tokens, &tool_ctx))
                .await
                .map_err(|_| generation_timeout())?
                .map_err(completion_to_core_error)
        };
        result
    }

    fn gather_memories(&self, channel_id: &str, question: &str) -> Vec<Memory> {
        let conn = self.local_db.lock().unwrap();
        let mut combined = rag_store::sqlite::search_memories_lexical(&conn, channel_id, question, MEMORY_CANDIDATES).unwrap_or_default();
        if combined.len() < MEMORY_CANDIDATES / 2 {
            let recent = rag_store::sqlite::recent_memories(&conn, channel_id, MEMORY_CANDIDATES).unwrap_or_default();
            for m in recent {
                if !combined.iter().any(|existing| existing.id == m.id) {
                    combined.push(m);
                }
            }
        }
        combined
    }

    fn persist_exchange(&self, params: &QueryParams, question: &str, answer: &str) {
        let conn = self.local_db.lock().unwrap();
        if let Some(user_id) = &params.user_id {
            let msg = ConversationMessage {
                id: 0,
                user_id: user_id.clone(),
                channel_id: params.channel_id.clone(),
                question: question.to_string(),
                answer: answer.to_string(),
                embedding: None,
                created_at: Utc::now(),
            };
            if let Err(e) = rag_store::sqlite::insert_conversation(&conn, &msg) {
                warn!(error = %e, "failed to persist conversation turn");
            }
        }
        if let Some(channel_id) = &params.channel_id {
            let memory = Memory {
                id: 0,
                channel_id: channel_id.clone(),
                content: format!("Q: {question}\nA: {answer}"),
                embedding: None,
                memory_type: MemoryType::BotResponse,
                user_id: params.user_id.clone(),
                username: None,
                mentioned_user_id: params.mentioned_user_id.clone(),
                created_at: Utc::now(),
                importance: 0.5,
            };
            if let Err(e) = rag_store::sqlite::insert_memory(&conn, &memory) {
                warn!(error = %e, "failed to persist memory");
            }
        }
    }

    async fn casual_reply(&self, question: &str) -> Result<String> {
        let messages = vec![
            Message { role: Role::System, content: "You are a helpful, friendly assistant. Keep casual replies short and warm.".to_string() },
            Message { role: Role::User, content: question.to_string() },
        ];
        self.completion.complete(&messages, 0.7, CASUAL_MAX_TOKENS).await.map_err(completion_to_core_error)
    }

    /// Parsed-action execution, gated by `should_execute` at the call
    /// site. Currency keys route through the ledger's numeric/transfer
    /// path; everything else routes through the item tracker, matching
    /// the split `rag-state::handlers` already makes for state queries.
    async fn execute_action(&self, action: &ParsedAction, asking_user_id: Option<&str>) -> Result<String> {
        let actor = asking_user_id.unwrap_or("unknown").to_string();
        let item_name = action.item_name.clone().unwrap_or_else(|| "gold".to_string());
        let ctx = WriteContext::new(actor.clone(), None, format!("parsed action: {:?}", action.action));

        let normalized = self.items.understand_item(&item_name).await?;
        let is_currency = normalized.item_type == "currency";

        let self_target = || asking_user_id.map(|u| u.to_string());

        match action.action {
            ActionKind::Set => {
                let target = action.dest_user_id.clone().or_else(self_target).ok_or_else(no_target_err)?;
                if is_currency {
                    self.ledger.set(&target, &normalized.canonical_name, StateValue::Number(action.quantity), &ctx)?;
                } else {
                    self.items.track_item(&target, &normalized.canonical_name, &normalized.item_type, action.quantity - current_quantity(&self.items, &target, &normalized.canonical_name)?)?;
                }
                Ok(format!("Set {} {} for <@{}>.", fmt_qty(action.quantity), normalized.canonical_name, target))
            }
            ActionKind::Add => {
                let target = action.dest_user_id.clone().or_else(self_target).ok_or_else(no_target_err)?;
                let total = if is_currency {
                    self.ledger.increment(&target, &normalized.canonical_name, action.quantity, &ctx)?
                } else {
                    self.items.track_item(&target, &normalized.canonical_name, &normalized.item_type, action.quantity)?
                };
                Ok(format!("<@{target}> now has {} {}.", fmt_qty(total), normalized.canonical_name))
            }
            ActionKind::Remove | ActionKind::Take => {
                let target = action.dest_user_id.clone().or_else(self_target).ok_or_else(no_target_err)?;
                let total = if is_currency {
                    self.ledger.increment(&target, &normalized.canonical_name, -action.quantity, &ctx)?
                } else {
                    self.items.track_item(&target, &normalized.canonical_name, &normalized.item_type, -action.quantity)?
                };
                Ok(format!("<@{target}> now has {} {}.", fmt_qty(total), normalized.canonical_name))
            }
            ActionKind::Give | ActionKind::Transfer | ActionKind::Send => {
                let from = action.source_user_id.clone().or_else(self_target).ok_or_else(no_target_err)?;
                let to = action.dest_user_id.clone().ok_or_else(no_target_err)?;
                if is_currency {
                    let (left, arrived) = self.ledger.transfer(&from, &to, &normalized.canonical_name, action.quantity, &ctx)?;
                    Ok(format!(
                        "<@{from}> sent {} {} to <@{to}>. <@{from}> now has {}, <@{to}> now has {}.",
                        fmt_qty(action.quantity),
                        normalized.canonical_name,
                        fmt_qty(left),
                        fmt_qty(arrived)
                    ))
                } else {
                    self.items.transfer_item(&normalized.canonical_name, &from, &to, action.quantity).await?;
                    Ok(format!("<@{from}> sent {} {} to <@{to}>.", fmt_qty(action.quantity), normalized.canonical_name))
                }
            }
            ActionKind::Query | ActionKind::Unknown => Err(CoreError::InvalidInput("non-executable action reached execute_action".to_string())),
        }
    }
}

fn no_target_err() -> CoreError {
    CoreError::InvalidInput("could not resolve a target user for this action".to_string())
}

fn current_quantity(items: &ItemTracker, owner_id: &str, canonical_name: &str) -> Result<f64> {
    Ok(items
        .get_user_items(owner_id)?
        .into_iter()
        .find(|i| i.canonical_name == canonical_name)
        .map(|i| i.quantity)
        .unwrap_or(0.0))
}

fn fmt_qty(q: f64) -> String {
    if q.fract().abs() < f64::EPSILON {
        format!("{}", q as i64)
    } else {
        format!("{q:.2}")
    }
}

fn build_system_prompt(context: &str) -> String {
    if context.is_empty() {
        "You are a helpful assistant. No relevant context was found for this question; answer from general knowledge and say so if you're unsure.".to_string()
    } else {
        format!(
            "You are a helpful assistant. Use the following context to answer the user's question. \
             If the context doesn't contain the answer, say so rather than guessing.\n\nContext:\n{context}"
        )
    }
}

/// Flat 1.05 boost for documents uploaded within 24h already lives inside
/// `HybridRetriever::retrieve`. Memories get a separate, decaying boost
/// here since they aren't scored by that pipeline at all.
fn apply_memory_decay(memories: &mut [Memory], decay_days: i64, now: chrono::DateTime<Utc>) {
    let decay_days = decay_days.max(1) as f32;
    for m in memories.iter_mut() {
        let age_days = (now - m.created_at).num_seconds() as f32 / 86_400.0;
        let boost = 1.0 + 0.2 * (1.0 - age_days / decay_days).max(0.0);
        m.importance = (m.importance * boost).min(1.0);
    }
}

fn outcome_is_side_effect_free(outcome: &QueryOutcome) -> bool {
    match outcome {
        QueryOutcome::RagAnswer { tool_calls, .. } => tool_calls.is_empty(),
        _ => true,
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let truncated: String = text.chars().take(max_chars).collect();
    if truncated.chars().count() < text.chars().count() {
        format!("{truncated}...")
    } else {
        truncated
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn enum_to_snake<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_else(|| "unknown".to_string())
}

fn completion_to_core_error(e: CompletionError) -> CoreError {
    match e {
        CompletionError::Timeout => CoreError::Timeout { ms: GENERATION_TIMEOUT.as_millis() as u64, what: "completion request".to_string() },
        other => CoreError::BackendUnavailable(other.to_string()),
    }
}

/// Cheap non-cryptographic digest of the prior turn so the cache key
/// changes whenever the conversational context the analyzer would see
/// changes (spec invariant: "cache keys include ... prior-turn context
/// hash").
fn hash_prior_turn(question: &str, answer: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    question.hash(&mut hasher);
    answer.hash(&mut hasher);
    hasher.finish()
}

fn generation_timeout() -> CoreError {
    CoreError::Timeout { ms: GENERATION_TIMEOUT.as_millis() as u64, what: "generation".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rag_core::types::{Chunk, ChunkId, DocId, Document, ScoredChunk};
    use rag_store::SearchFilters as Filters;

    #[derive(Default)]
    struct FakeStore {
        chunks: Vec<ScoredChunk>,
    }

    #[async_trait]
    impl StoreFacade for FakeStore {
        async fn vector_search(&self, _query_embedding: &[f32], _k: usize, _filters: &Filters) -> Vec<ScoredChunk> {
            self.chunks.clone()
        }

        async fn lexical_search(&self, _query: &str, _k: usize, _filters: &Filters) -> Vec<ScoredChunk> {
            self.chunks.clone()
        }

        async fn hybrid_search(&self, _query: &str, _query_embedding: &[f32], _k: usize, _filters: &Filters, _dense_weight: f32, _lexical_weight: f32) -> Vec<ScoredChunk> {
            self.chunks.clone()
        }

        async fn get_all_documents(&self) -> Vec<Document> {
            Vec::new()
        }

        async fn get_chunks(&self, _doc_id: &DocId) -> Vec<Chunk> {
            Vec::new()
        }

        async fn delete_document(&self, _doc_id: &DocId) -> rag_core::error::Result<()> {
            Ok(())
        }
    }

    fn harness() -> Orchestrator {
        Orchestrator::test_harness(Arc::new(FakeStore::default()))
    }

    fn base_params(question: &str) -> QueryParams {
        QueryParams {
            question: question.to_string(),
            top_k: 5,
            temperature: 0.7,
            max_tokens: 200,
            max_context_tokens: 500,
            user_id: Some("u1".to_string()),
            channel_id: Some("c1".to_string()),
            use_memory: true,
            use_shared_docs: true,
            use_hybrid_search: true,
            use_query_expansion: true,
            use_temporal_weighting: true,
            doc_id: None,
            doc_filename: None,
            mentioned_user_id: None,
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let orch = harness();
        let err = orch.query(base_params("   ")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn state_query_short_circuits_before_any_generation() {
        let orch = harness();
        let ctx = WriteContext::new("setup", None, "seed balance");
        orch.ledger.set("u1", "gold", StateValue::Number(42.0), &ctx).unwrap();

        let result = orch.query(base_params("how much gold do I have?")).await.unwrap();
        assert!(result.is_state_query);
        assert!(result.answer.contains("42"));
    }

    #[tokio::test]
    async fn action_give_transfers_currency_between_users() {
        let orch = harness();
        let ctx = WriteContext::new("setup", None, "seed balance");
        orch.ledger.set("<@1>", "gold", StateValue::Number(100.0), &ctx).unwrap();

        let mut params = base_params("give 10 gold to <@2>");
        params.user_id = Some("<@1>".to_string());
        let result = orch.query(params).await.unwrap();
        assert!(result.action_processed, "expected an action confirmation, got: {result:?}");

        let remaining = orch.ledger.get("<@1>", "gold", StateValue::Number(0.0)).unwrap();
        assert_eq!(remaining.as_number(), Some(90.0));
        let arrived = orch.ledger.get("<@2>", "gold", StateValue::Number(0.0)).unwrap();
        assert_eq!(arrived.as_number(), Some(10.0));
    }

    #[tokio::test]
    async fn casual_greeting_is_fast_pathed() {
        let orch = harness();
        let result = orch.query(base_params("hello")).await.unwrap();
        assert!(result.is_casual_conversation);
        assert_eq!(result.service_routing, "chat");
    }

    #[tokio::test]
    async fn state_set_short_circuits() {
        let orch = harness();
        let result = orch.query(base_params("set my gold to 500")).await.unwrap();
        assert!(result.is_state_query);
        let stored = orch.ledger.get("u1", "gold", StateValue::Number(0.0)).unwrap();
        assert_eq!(stored.as_number(), Some(500.0));
    }
}
