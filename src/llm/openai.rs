use super::{ChatMessage, ChatRequest, DeltaStream, LlmError};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAiStreamResponse {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

/// What one line of the SSE body means for the delta stream.
#[derive(Debug, PartialEq)]
pub(crate) enum StreamLine {
    Delta(String),
    /// Final delta (possibly empty) followed by end of stream.
    Finish(String),
    Done,
    Skip,
}

pub(crate) fn parse_stream_line(line: &str) -> StreamLine {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return StreamLine::Skip;
    };
    if data == "[DONE]" {
        return StreamLine::Done;
    }
    match serde_json::from_str::<OpenAiStreamResponse>(data) {
        Ok(parsed) => match parsed.choices.into_iter().next() {
            Some(choice) => {
                let content = choice.delta.content.unwrap_or_default();
                if choice.finish_reason.is_some() {
                    StreamLine::Finish(content)
                } else if content.is_empty() {
                    StreamLine::Skip
                } else {
                    StreamLine::Delta(content)
                }
            }
            None => StreamLine::Skip,
        },
        Err(e) => {
            tracing::trace!(error = %e, "skipping unparseable stream line");
            StreamLine::Skip
        }
    }
}

pub async fn chat_stream(
    client: &Client,
    config: &OpenAiConfig,
    request: &ChatRequest,
) -> Result<DeltaStream, LlmError> {
    let body = OpenAiRequest {
        model: &request.model,
        messages: &request.messages,
        stream: true,
    };

    let mut req = client
        .post(format!("{}/chat/completions", config.base_url.trim_end_matches('/')))
        .header("Content-Type", "application/json")
        .json(&body);

    if !config.api_key.is_empty() {
        req = req.header("Authorization", format!("Bearer {}", config.api_key));
    }

    let resp = req.send().await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    let mut bytes = resp.bytes_stream();
    let stream = async_stream::stream! {
        // Bytes, not String: a multi-byte character may straddle two network chunks.
        let mut buffer: Vec<u8> = Vec::new();
        'read: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(LlmError::Http(e));
                    break 'read;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_stream_line(line.trim()) {
                    StreamLine::Delta(text) => yield Ok(text),
                    StreamLine::Finish(text) => {
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                        break 'read;
                    }
                    StreamLine::Done => break 'read,
                    StreamLine::Skip => {}
                }
            }
        }
    };

    Ok(Box::pin(stream))
}
