//! Request dispatch pipeline
//!
//! Fixed order per request: cache lookup → account selection → upstream call
//! through the invoker → cache store (complete responses) or chunk-by-chunk
//! translation (streams). Streams are never cached.
//!
//! An account is selected per attempt, so a retry after a 429 lands on the
//! next eligible account instead of the one that was just benched.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::now_millis;
use copilot_pool::{AccountStatus, Pool, Strategy};
use futures_util::{Stream, StreamExt, stream};
use response_cache::{CacheEntry, CacheStats, ResponseCache, cache_key};
use tracing::{debug, warn};
use translate::StreamTranslator;
use translate::sse::{OPENAI_DONE, anthropic_frame, openai_error_frame, openai_frame};
use upstream::{
    ChatBackend, ChatCompletionRequest, ChatCompletionResponse, ChunkStream, EmbeddingsRequest,
    EmbeddingsResponse, Invoker, UpstreamError,
};

use crate::error::DispatchError;
use crate::metrics;

/// Result of a chat dispatch.
pub enum ChatOutcome {
    /// Complete upstream response; `cached` when served without calling upstream.
    Complete {
        response: ChatCompletionResponse,
        cached: bool,
    },
    /// Live upstream chunks, to be translated as they arrive.
    Stream(ChunkStream),
}

/// Composes the pool, cache, and invoker around one upstream backend.
pub struct Dispatcher {
    backend: Arc<dyn ChatBackend>,
    pool: Arc<Pool>,
    cache: Option<Arc<ResponseCache>>,
    invoker: Invoker,
    strategy: Strategy,
    rate_limit_cooldown: Duration,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        pool: Arc<Pool>,
        cache: Option<Arc<ResponseCache>>,
        invoker: Invoker,
        strategy: Strategy,
        rate_limit_cooldown: Duration,
    ) -> Self {
        Self {
            backend,
            pool,
            cache,
            invoker,
            strategy,
            rate_limit_cooldown,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Chat completion, streaming or not per `request.stream`.
    pub async fn dispatch_chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatOutcome, DispatchError> {
        let backend = &self.backend;

        if request.stream {
            let chunks = self
                .call(move |token| async move { backend.chat_stream(&token, request).await })
                .await?;
            return Ok(ChatOutcome::Stream(chunks));
        }

        let key = match &self.cache {
            Some(_) => Some(
                cache_key(request, None).map_err(|e| DispatchError::InvalidRequest(e.to_string()))?,
            ),
            None => None,
        };

        if let (Some(cache), Some(key)) = (&self.cache, &key)
            && let Some(entry) = cache.get(key).await
        {
            debug!(key, model = %entry.model, hits = entry.hits, "serving cached response");
            match serde_json::from_value::<ChatCompletionResponse>(entry.response) {
                Ok(response) => {
                    return Ok(ChatOutcome::Complete {
                        response,
                        cached: true,
                    });
                }
                Err(e) => {
                    warn!(key, error = %e, "cached response unreadable, discarding entry");
                    cache.delete(key).await;
                }
            }
        }

        let response = self
            .call(move |token| async move { backend.chat(&token, request).await })
            .await?;

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            match serde_json::to_value(&response) {
                Ok(value) => {
                    let usage = response.usage.unwrap_or_default();
                    cache
                        .put(CacheEntry::new(
                            key,
                            value,
                            response.model.clone(),
                            usage.prompt_tokens,
                            usage.completion_tokens,
                        ))
                        .await;
                }
                Err(e) => warn!(error = %e, "response not cacheable"),
            }
        }

        Ok(ChatOutcome::Complete {
            response,
            cached: false,
        })
    }

    pub async fn dispatch_embeddings(
        &self,
        request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, DispatchError> {
        let backend = &self.backend;
        self.call(move |token| async move { backend.embeddings(&token, request).await })
            .await
    }

    /// Run `f` under the invoker, selecting an account for every attempt and
    /// reporting each attempt's outcome back to the pool.
    ///
    /// Pool errors travel as `Ok(Err(_))` so the invoker never retries them.
    async fn call<T, F, Fut>(&self, f: F) -> Result<T, DispatchError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = upstream::Result<T>>,
    {
        let f = &f;
        let outcome = self
            .invoker
            .invoke(move |attempt| async move {
                let account = match self.pool.select(self.strategy).await {
                    Ok(account) => account,
                    Err(e) => return Ok(Err(e)),
                };
                debug!(attempt, account_id = %account.id, "calling upstream");
                match f(account.access_token.expose().clone()).await {
                    Ok(value) => {
                        self.pool.report_success(&account.id).await;
                        Ok(Ok(value))
                    }
                    Err(e) => {
                        self.report_failure(&account.id, &e).await;
                        Err(e)
                    }
                }
            })
            .await;

        let error = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => DispatchError::from(e),
            Err(e) => DispatchError::from(e),
        };
        metrics::record_upstream_error(error.metric_label());
        warn!(error = %error, "dispatch failed");
        Err(error)
    }

    async fn report_failure(&self, account_id: &str, error: &UpstreamError) {
        match error {
            UpstreamError::Rejected {
                status: 429,
                retry_after,
                ..
            } => {
                let bench = retry_after.unwrap_or(self.rate_limit_cooldown);
                let reset_at = now_millis() + bench.as_millis() as u64;
                self.pool.report_rate_limited(account_id, reset_at).await;
            }
            other => self.pool.report_error(account_id, &other.to_string()).await,
        }
    }

    pub async fn cache_stats(&self) -> Option<CacheStats> {
        match &self.cache {
            Some(cache) => Some(cache.stats().await),
            None => None,
        }
    }

    /// Drop every cache entry. Returns how many were removed.
    pub async fn cache_clear(&self) -> usize {
        match &self.cache {
            Some(cache) => cache.clear().await,
            None => 0,
        }
    }

    pub async fn cache_delete(&self, key: &str) -> bool {
        match &self.cache {
            Some(cache) => cache.delete(key).await,
            None => false,
        }
    }

    pub async fn pool_status(&self) -> serde_json::Value {
        self.pool.health().await
    }

    pub async fn pool_accounts_status(&self) -> Vec<AccountStatus> {
        self.pool.accounts_status().await
    }
}

/// Translate upstream chunks into Anthropic SSE frames as they arrive.
///
/// A broken upstream stream ends with a single `error` event; a stream that
/// ends without a finish reason is completed with `end_turn`.
pub fn anthropic_event_stream(
    chunks: ChunkStream,
    model: &str,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let translator = StreamTranslator::new(model);
    stream::unfold(
        (chunks, translator, false),
        |(mut chunks, mut translator, done)| async move {
            if done {
                return None;
            }
            loop {
                let events = match chunks.next().await {
                    Some(Ok(chunk)) => translator.push(&chunk),
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream stream failed mid-response");
                        translator.fail()
                    }
                    None => translator.finish(),
                };
                let done = translator.is_finished();

                let mut frames = String::new();
                for event in &events {
                    match anthropic_frame(event) {
                        Ok(frame) => frames.push_str(&frame),
                        Err(e) => warn!(error = %e, event = event.event_type(), "dropping unencodable event"),
                    }
                }
                if !frames.is_empty() {
                    return Some((Ok(Bytes::from(frames)), (chunks, translator, done)));
                }
                if done {
                    return None;
                }
            }
        },
    )
}

/// Forward upstream chunks unchanged as OpenAI SSE frames, then `[DONE]`.
pub fn openai_event_stream(
    chunks: ChunkStream,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    stream::unfold(Some(chunks), |state| async move {
        let mut chunks = state?;
        let frame = match chunks.next().await {
            Some(Ok(chunk)) => match openai_frame(&chunk) {
                Ok(frame) => return Some((Ok(Bytes::from(frame)), Some(chunks))),
                Err(e) => {
                    warn!(error = %e, "failed to encode chunk");
                    openai_error_frame("failed to encode upstream chunk")
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "upstream stream failed mid-response");
                openai_error_frame("upstream stream terminated unexpectedly")
            }
            None => OPENAI_DONE.to_string(),
        };
        Some((Ok(Bytes::from(frame)), None))
    })
}
