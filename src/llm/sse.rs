//! Incremental `text/event-stream` decoding for model responses.

use crate::error::LlmError;

use super::{ModelEvent, ModelStream};

/// Pull every complete `data:` payload out of `buffer`, leaving any trailing
/// partial event in place for the next chunk.
pub(crate) fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

/// Move the longest valid UTF-8 prefix of `pending` into `buffer`. A
/// character split across chunks stays in `pending` until it is complete.
pub(crate) fn decode_utf8(pending: &mut Vec<u8>, buffer: &mut String) {
    let valid = match std::str::from_utf8(pending) {
        Ok(text) => text.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        // Invalid bytes, not a split character.
        Err(_) => pending.len(),
    };
    let bytes: Vec<u8> = pending.drain(..valid).collect();
    // CRLF framing is normalised so the "\n\n" split holds.
    buffer.push_str(&String::from_utf8_lossy(&bytes).replace("\r\n", "\n"));
}

/// Turn a streaming HTTP response into model events. `parse` sees each
/// payload in order and may keep state across calls.
pub(crate) fn event_stream<F>(response: reqwest::Response, mut parse: F) -> ModelStream
where
    F: FnMut(&str) -> Vec<Result<ModelEvent, LlmError>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut pending = Vec::new();
        let mut buffer = String::new();

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    decode_utf8(&mut pending, &mut buffer);
                    for data in drain_data_lines(&mut buffer) {
                        for event in parse(&data) {
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    buffer.push_str(&String::from_utf8_lossy(&pending));
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for data in drain_data_lines(&mut buffer) {
                            for event in parse(&data) {
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(LlmError::Http(e));
                    break;
                }
            }
        }
    };

    Box::pin(stream)
}
