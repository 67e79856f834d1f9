//! The guest-facing AI concierge: one streamed question/answer exchange.
//!
//! An exchange moves `Idle → Retrieving → Composing → Streaming →
//! Persisting → Done`, or ends in `Errored` from any of those. The user
//! turn is stored before the completion call; the assistant turn after the
//! stream ends. Dropping the returned stream drops the upstream completion
//! and stores nothing further.

use crate::db::models::{ConversationTurn, Guide, Role};
use crate::db::Database;
use crate::llm::{ChatMessage, ChatRequest, CompletionProvider};
use crate::retrieval::{HybridScorer, RankedChunk};
use crate::vector_store::VectorStore;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Chunks kept for the prompt after ranking.
    pub top_k: usize,
    /// Nearest neighbours fetched before ranking.
    pub candidate_pool: usize,
    /// Vector similarity below which a candidate is discarded.
    pub min_similarity: f32,
    pub history_turns: usize,
    pub model: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_pool: 20,
            min_similarity: 0.3,
            history_turns: 10,
            model: "gpt-4o-mini".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Idle,
    Retrieving,
    Composing,
    Streaming,
    Persisting,
    Done,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatErrorCode {
    RetrievalError,
    CompletionError,
    PersistenceError,
}

impl ChatErrorCode {
    pub fn message(self) -> &'static str {
        match self {
            ChatErrorCode::RetrievalError => "안내 정보를 불러오지 못했습니다. 잠시 후 다시 시도해 주세요.",
            ChatErrorCode::CompletionError => "답변을 생성하지 못했습니다. 잠시 후 다시 시도해 주세요.",
            ChatErrorCode::PersistenceError => "대화를 저장하지 못했습니다. 잠시 후 다시 시도해 주세요.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatEvent {
    Message {
        chunk: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        message_id: String,
        session_id: String,
        referenced_block_ids: Vec<String>,
    },
    Error {
        code: ChatErrorCode,
        message: String,
    },
}

impl ChatEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Message { .. } => "message",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Error { .. } => "error",
        }
    }

    /// The upstream detail stays in the log; guests get a fixed message.
    fn error(code: ChatErrorCode) -> Self {
        ChatEvent::Error {
            code,
            message: code.message().to_string(),
        }
    }
}

/// Time-based grouping key for a conversation; not a secret.
pub fn new_session_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{millis}_{}", &random[..8])
}

fn persona(guide: &Guide) -> String {
    let name = guide.accommodation_name.as_deref().unwrap_or(&guide.title);
    let mut prompt = format!(
        "당신은 '{name}' 숙소의 AI 컨시어지입니다. 게스트에게 항상 존댓말로 친절하고 정확하게 답변하세요.\n\
         아래 제공된 숙소 안내 정보에 근거해서만 답변하고, 정보가 없거나 확실하지 않으면 추측하지 말고 \
         호스트에게 직접 문의하도록 안내하세요."
    );
    if let Some(instructions) = guide.ai_instructions.as_deref().map(str::trim) {
        if !instructions.is_empty() {
            prompt.push_str("\n\n호스트 지침:\n");
            prompt.push_str(instructions);
        }
    }
    prompt
}

fn context_message(chunks: &[RankedChunk]) -> String {
    if chunks.is_empty() {
        return "숙소 안내 정보: (관련 정보 없음)".to_string();
    }
    let body: Vec<&str> = chunks.iter().map(|c| c.chunk.content.as_str()).collect();
    format!("숙소 안내 정보:\n\n{}", body.join("\n\n---\n\n"))
}

fn referenced_block_ids(chunks: &[RankedChunk]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in chunks.iter().filter_map(|c| c.chunk.block_id.as_ref()) {
        if !ids.contains(id) {
            ids.push(id.clone());
        }
    }
    ids
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    db: Arc<Database>,
    vector_store: VectorStore,
    scorer: Arc<HybridScorer>,
    completion: Arc<dyn CompletionProvider>,
    settings: ChatSettings,
}

impl ChatOrchestrator {
    pub fn new(
        db: Arc<Database>,
        vector_store: VectorStore,
        scorer: HybridScorer,
        completion: Arc<dyn CompletionProvider>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            db,
            vector_store,
            scorer: Arc::new(scorer),
            completion,
            settings,
        }
    }

    /// Prompt context for `query`: nearest neighbours above the similarity
    /// floor, ranked by hybrid score, cut to `top_k`.
    pub async fn retrieve(
        &self,
        guide_id: &str,
        query: &str,
    ) -> Result<Vec<RankedChunk>, crate::vector_store::VectorStoreError> {
        let vector = self.vector_store.embed_query(query).await?;
        let candidates: Vec<_> = self
            .vector_store
            .search(guide_id, &vector, self.settings.candidate_pool)?
            .into_iter()
            .filter(|c| c.similarity >= self.settings.min_similarity)
            .collect();
        let mut ranked = self.scorer.rank(query, candidates);
        ranked.truncate(self.settings.top_k);
        Ok(ranked)
    }

    pub fn history(&self, guide_id: &str, session_id: &str) -> Result<Vec<ConversationTurn>, crate::db::DbError> {
        self.db.session_turns(guide_id, session_id)
    }

    /// Runs one exchange against `guide`, which the caller has already
    /// checked is published with the concierge enabled.
    pub fn stream_chat(
        &self,
        guide: Guide,
        message: String,
        session_id: Option<String>,
    ) -> BoxStream<'static, ChatEvent> {
        let this = self.clone();
        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(new_session_id);

        let stream = async_stream::stream! {
            let guide_id = guide.id.clone();
            let mut state = ChatState::Idle;
            let mut advance = |next: ChatState| {
                tracing::debug!(guide_id = %guide_id, session_id = %session_id, from = ?state, to = ?next, "chat state");
                state = next;
            };

            advance(ChatState::Retrieving);
            let context = match this.retrieve(&guide.id, &message).await {
                Ok(context) => context,
                Err(e) => {
                    advance(ChatState::Errored);
                    tracing::warn!(guide_id = %guide.id, error = %e, "chat retrieval failed");
                    yield ChatEvent::error(ChatErrorCode::RetrievalError);
                    return;
                }
            };
            let history = match this.db.recent_turns(&guide.id, &session_id, this.settings.history_turns) {
                Ok(history) => history,
                Err(e) => {
                    advance(ChatState::Errored);
                    tracing::warn!(guide_id = %guide.id, error = %e, "chat history read failed");
                    yield ChatEvent::error(ChatErrorCode::RetrievalError);
                    return;
                }
            };
            let referenced = referenced_block_ids(&context);

            advance(ChatState::Composing);
            let mut messages = vec![
                ChatMessage::system(persona(&guide)),
                ChatMessage::system(context_message(&context)),
            ];
            messages.extend(history.into_iter().map(|turn| match turn.role {
                Role::User => ChatMessage::user(turn.content),
                Role::Assistant => ChatMessage::assistant(turn.content),
            }));
            messages.push(ChatMessage::user(message.clone()));

            if let Err(e) = this.db.append_turn(&guide.id, &session_id, Role::User, &message, None) {
                advance(ChatState::Errored);
                tracing::error!(guide_id = %guide.id, error = %e, "failed to store user turn");
                yield ChatEvent::error(ChatErrorCode::PersistenceError);
                return;
            }

            advance(ChatState::Streaming);
            let request = ChatRequest {
                messages,
                model: this.settings.model.clone(),
                stream: true,
            };
            let mut deltas = match this.completion.chat_stream(&request).await {
                Ok(deltas) => deltas,
                Err(e) => {
                    advance(ChatState::Errored);
                    tracing::warn!(guide_id = %guide.id, error = %e, "completion request failed");
                    yield ChatEvent::error(ChatErrorCode::CompletionError);
                    return;
                }
            };

            let mut answer = String::new();
            while let Some(delta) = deltas.next().await {
                match delta {
                    Ok(chunk) => {
                        answer.push_str(&chunk);
                        yield ChatEvent::Message { chunk };
                    }
                    Err(e) => {
                        advance(ChatState::Errored);
                        tracing::warn!(guide_id = %guide.id, error = %e, streamed = answer.len(), "completion stream failed");
                        if !answer.is_empty() {
                            let metadata = json!({
                                "referencedBlockIds": referenced,
                                "truncated": true,
                                "errorCode": ChatErrorCode::CompletionError,
                            });
                            if let Err(e) = this.db.append_turn(&guide.id, &session_id, Role::Assistant, &answer, Some(&metadata)) {
                                tracing::error!(guide_id = %guide.id, error = %e, "failed to store truncated answer");
                            }
                        }
                        yield ChatEvent::error(ChatErrorCode::CompletionError);
                        return;
                    }
                }
            }
            drop(deltas);

            advance(ChatState::Persisting);
            let metadata = json!({ "referencedBlockIds": referenced });
            let turn = match this.db.append_turn(&guide.id, &session_id, Role::Assistant, &answer, Some(&metadata)) {
                Ok(turn) => turn,
                Err(e) => {
                    advance(ChatState::Errored);
                    tracing::error!(guide_id = %guide.id, error = %e, "failed to store assistant turn");
                    yield ChatEvent::error(ChatErrorCode::PersistenceError);
                    return;
                }
            };

            advance(ChatState::Done);
            tracing::info!(guide_id = %guide.id, session_id = %session_id, referenced = referenced.len(), "chat answered");
            yield ChatEvent::Done {
                message_id: turn.id,
                session_id: session_id.clone(),
                referenced_block_ids: referenced,
            };
        };

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guide::{BlockInput, CreateGuide, GuideService};
    use crate::license::LicenseService;
    use crate::llm::MessageRole;
    use crate::testing::{FakeCompletion, FakeEmbedder};
    use serde_json::json;

    struct Fixture {
        db: Arc<Database>,
        guide: Guide,
        quick_info_id: String,
    }

    async fn fixture(embedder: FakeEmbedder) -> (Fixture, VectorStore) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = VectorStore::new(db.clone(), Arc::new(embedder));
        let licenses = LicenseService::new(db.clone());
        let guides = GuideService::new(db.clone(), store.clone(), licenses.clone());

        licenses.activate("host", "ROOMY-M123-ABCD-EF01").unwrap();
        let guide = guides
            .create_guide(
                "host",
                &CreateGuide {
                    title: "Ocean House".into(),
                    accommodation_name: Some("오션하우스".into()),
                    slug: None,
                },
            )
            .unwrap();
        let saved = guides
            .replace_blocks(
                "host",
                &guide.id,
                vec![
                    BlockInput {
                        id: None,
                        block_type: "quick_info".into(),
                        content: json!({ "checkIn": "15:00", "checkOut": "11:00" }),
                        is_visible: true,
                    },
                    BlockInput {
                        id: None,
                        block_type: "notice".into(),
                        content: json!({ "body": "수영장 운영 09:00-18:00" }),
                        is_visible: true,
                    },
                ],
            )
            .await
            .unwrap();
        let guide = guides.toggle_publish("host", &guide.id, true).unwrap();
        (
            Fixture {
                db,
                guide,
                quick_info_id: saved.blocks[0].id.clone(),
            },
            store,
        )
    }

    fn embedder() -> FakeEmbedder {
        FakeEmbedder::new(4).with_rule("체크인", [1.0, 0.0, 0.0, 0.0])
    }

    fn orchestrator(f: &Fixture, store: VectorStore, completion: &FakeCompletion) -> ChatOrchestrator {
        ChatOrchestrator::new(
            f.db.clone(),
            store,
            HybridScorer::default(),
            Arc::new(completion.clone()),
            ChatSettings::default(),
        )
    }

    #[test]
    fn session_ids_are_prefixed_and_distinct() {
        let a = new_session_id();
        let b = new_session_id();
        assert!(a.starts_with("session_"));
        assert_eq!(a.rsplit('_').next().unwrap().len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn events_serialize_for_the_wire() {
        let done = ChatEvent::Done {
            message_id: "m".into(),
            session_id: "s".into(),
            referenced_block_ids: vec!["b".into()],
        };
        assert_eq!(done.name(), "done");
        assert_eq!(
            serde_json::to_value(&done).unwrap(),
            json!({ "messageId": "m", "sessionId": "s", "referencedBlockIds": ["b"] })
        );
        let err = ChatEvent::error(ChatErrorCode::RetrievalError);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({
                "code": "RETRIEVAL_ERROR",
                "message": ChatErrorCode::RetrievalError.message(),
            })
        );
    }

    #[tokio::test]
    async fn check_in_question_is_answered_from_quick_info() {
        let (f, store) = fixture(embedder()).await;
        let completion = FakeCompletion::new(["체크인은 ", "15:00", "입니다."]);
        let chat = orchestrator(&f, store, &completion);

        let events: Vec<ChatEvent> = chat
            .stream_chat(f.guide.clone(), "체크인 시간이 언제예요?".into(), Some("s1".into()))
            .collect()
            .await;

        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ChatEvent::Message { chunk: "체크인은 ".into() });
        let ChatEvent::Done { session_id, referenced_block_ids, message_id } = &events[3] else {
            panic!("expected done, got {:?}", events[3]);
        };
        assert_eq!(session_id, "s1");
        assert_eq!(referenced_block_ids, &vec![f.quick_info_id.clone()]);

        let request = &completion.requests()[0];
        assert_eq!(request.messages[0].role, MessageRole::System);
        assert!(request.messages[0].content.contains("오션하우스"));
        assert!(request.messages[1].content.contains("체크인: 15:00"));
        assert!(!request.messages[1].content.contains("수영장"));
        assert_eq!(request.messages.last().unwrap().content, "체크인 시간이 언제예요?");

        let turns = f.db.session_turns(&f.guide.id, "s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].id, *message_id);
        assert_eq!(turns[1].content, "체크인은 15:00입니다.");
        assert_eq!(
            turns[1].metadata,
            Some(json!({ "referencedBlockIds": [f.quick_info_id] }))
        );
    }

    #[tokio::test]
    async fn history_is_replayed_in_order() {
        let (f, store) = fixture(embedder()).await;
        let completion = FakeCompletion::new(["네."]);
        let chat = orchestrator(&f, store, &completion);

        for question in ["체크인 시간이요?", "체크아웃은요?"] {
            let _: Vec<_> = chat
                .stream_chat(f.guide.clone(), question.into(), Some("s1".into()))
                .collect()
                .await;
        }

        let second = &completion.requests()[1];
        let replay: Vec<(&MessageRole, &str)> = second.messages[2..]
            .iter()
            .map(|m| (&m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            replay,
            vec![
                (&MessageRole::User, "체크인 시간이요?"),
                (&MessageRole::Assistant, "네."),
                (&MessageRole::User, "체크아웃은요?"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_session_gets_generated_one() {
        let (f, store) = fixture(embedder()).await;
        let chat = orchestrator(&f, store, &FakeCompletion::new(["ok"]));
        let events: Vec<ChatEvent> = chat
            .stream_chat(f.guide.clone(), "안녕하세요".into(), None)
            .collect()
            .await;
        let Some(ChatEvent::Done { session_id, .. }) = events.last() else {
            panic!("expected done");
        };
        assert!(session_id.starts_with("session_"));
        assert_eq!(f.db.session_turns(&f.guide.id, session_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retrieval_failure_stops_before_anything_is_stored() {
        let (f, _) = fixture(embedder()).await;
        let broken = VectorStore::new(f.db.clone(), Arc::new(FakeEmbedder::new(4).failing()));
        let completion = FakeCompletion::new(["never"]);
        let chat = orchestrator(&f, broken, &completion);

        let events: Vec<ChatEvent> = chat
            .stream_chat(f.guide.clone(), "체크인?".into(), Some("s1".into()))
            .collect()
            .await;
        let [ChatEvent::Error { code: ChatErrorCode::RetrievalError, message }] = events.as_slice() else {
            panic!("expected a retrieval error, got {events:?}");
        };
        assert_eq!(message, ChatErrorCode::RetrievalError.message());
        assert!(!message.contains("503"));
        assert!(!message.contains("unavailable"));
        assert!(completion.requests().is_empty());
        assert!(f.db.session_turns(&f.guide.id, "s1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_refusal_keeps_only_the_user_turn() {
        let (f, store) = fixture(embedder()).await;
        let chat = orchestrator(&f, store, &FakeCompletion::new(["x"]).refusing());

        let events: Vec<ChatEvent> = chat
            .stream_chat(f.guide.clone(), "체크인?".into(), Some("s1".into()))
            .collect()
            .await;
        assert!(matches!(
            events.as_slice(),
            [ChatEvent::Error { code: ChatErrorCode::CompletionError, .. }]
        ));
        let turns = f.db.session_turns(&f.guide.id, "s1").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn mid_stream_failure_stores_truncated_answer() {
        let (f, store) = fixture(embedder()).await;
        let completion = FakeCompletion::new(["체크인은 ", "15시", "입니다"]).failing_after(2);
        let chat = orchestrator(&f, store, &completion);

        let events: Vec<ChatEvent> = chat
            .stream_chat(f.guide.clone(), "체크인?".into(), Some("s1".into()))
            .collect()
            .await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], ChatEvent::Error { code: ChatErrorCode::CompletionError, .. }));

        let turns = f.db.session_turns(&f.guide.id, "s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "체크인은 15시");
        let metadata = turns[1].metadata.as_ref().unwrap();
        assert_eq!(metadata["truncated"], json!(true));
        assert_eq!(metadata["errorCode"], json!("COMPLETION_ERROR"));
        assert_eq!(metadata["referencedBlockIds"], json!([f.quick_info_id]));
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_upstream_consumption() {
        let (f, store) = fixture(embedder()).await;
        let completion = FakeCompletion::new(["a", "b", "c", "d", "e"]);
        let chat = orchestrator(&f, store, &completion);

        let mut events = chat.stream_chat(f.guide.clone(), "체크인?".into(), Some("s1".into()));
        let first = events.next().await.unwrap();
        assert_eq!(first, ChatEvent::Message { chunk: "a".into() });
        drop(events);

        assert_eq!(completion.pulled(), 1);
        let turns = f.db.session_turns(&f.guide.id, "s1").unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn host_instructions_extend_the_persona() {
        let (mut f, store) = fixture(embedder()).await;
        f.guide.ai_instructions = Some("반려동물 동반은 불가합니다.".into());
        let completion = FakeCompletion::new(["ok"]);
        let chat = orchestrator(&f, store, &completion);
        let _: Vec<_> = chat
            .stream_chat(f.guide.clone(), "강아지 데려가도 되나요?".into(), None)
            .collect()
            .await;
        assert!(completion.requests()[0].messages[0]
            .content
            .contains("반려동물 동반은 불가합니다."));
    }
}
