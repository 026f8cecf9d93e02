// jobd watch: follow a job's SSE stream

use std::io::{self, Write};

use futures_util::StreamExt;
use reqwest::Client;

use super::{base_url, error_from_response, handle_request_error};
use crate::models::{GetJobStreamResponse, TerminalEvent, TerminalEventKind};

/// One parsed SSE event block.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Split every complete event block off the front of `buffer`.
pub fn drain_sse_events(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos + 2).collect();

        let mut event = String::new();
        let mut data = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim_start().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if event.is_empty() && data.is_empty() {
            // comment or keepalive
            continue;
        }
        events.push(SseEvent {
            event,
            data: data.join("\n"),
        });
    }
    events
}

fn print_terminal_event(out: &mut impl Write, event: &TerminalEvent) -> io::Result<()> {
    match &event.kind {
        TerminalEventKind::Raw { data, .. } => write!(out, "{}", data),
        TerminalEventKind::Status { status, msg, .. } => writeln!(out, "[{}] {}", status, msg),
        TerminalEventKind::Line { msg, .. } => writeln!(out, "{}", msg),
    }
}

/// jobd watch
pub async fn cmd_watch(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/{}/stream", base_url(host, port), job);
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    follow_job_stream(response).await
}

/// Print state changes and output until the job completes.
async fn follow_job_stream(response: reqwest::Response) -> anyhow::Result<()> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut stdout = io::stdout();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| anyhow::anyhow!("SSE stream error: {}", e))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        for sse in drain_sse_events(&mut buffer) {
            let msg: GetJobStreamResponse = match serde_json::from_str(&sse.data) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("Skipping unparseable {} event: {}", sse.event, e);
                    continue;
                }
            };

            match msg {
                GetJobStreamResponse::Open => {}
                GetJobStreamResponse::State {
                    current, canceling, ..
                } => {
                    if canceling {
                        eprintln!("--- {} (canceling) ---", current);
                    } else {
                        eprintln!("--- {} ---", current);
                    }
                }
                GetJobStreamResponse::Terminal { events, .. } => {
                    for event in &events {
                        print_terminal_event(&mut stdout, event)?;
                    }
                    stdout.flush()?;
                }
                GetJobStreamResponse::Complete { error, result } => {
                    if let Some(error) = error {
                        anyhow::bail!("Job failed: {}", error);
                    }
                    match result {
                        Some(result) => eprintln!("--- Job finished: {} ---", result),
                        None => eprintln!("--- Job finished ---"),
                    }
                    return Ok(());
                }
            }
        }
    }

    anyhow::bail!("Stream ended before the job completed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_sse_events_splits_blocks() {
        let mut buffer =
            "event: open\ndata: {\"type\":\"open\"}\n\n:keepalive\n\nevent: state\ndata: {}\n\nevent: par"
                .to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "open");
        assert_eq!(events[0].data, r#"{"type":"open"}"#);
        assert_eq!(events[1].event, "state");
        // the incomplete block stays buffered
        assert_eq!(buffer, "event: par");
    }

    #[test]
    fn test_drain_sse_events_joins_multiline_data() {
        let mut buffer = "event: terminal\ndata: a\ndata: b\n\n".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events[0].data, "a\nb");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_open_event_parses() {
        let mut buffer = "event: open\ndata: {\"type\":\"open\"}\n\n".to_string();
        let events = drain_sse_events(&mut buffer);
        let msg: GetJobStreamResponse = serde_json::from_str(&events[0].data).expect("parse");
        assert_eq!(msg, GetJobStreamResponse::Open);
    }

    #[test]
    fn test_print_terminal_event() {
        let mut out = Vec::new();
        print_terminal_event(&mut out, &TerminalEvent::line("hello")).expect("write");
        print_terminal_event(&mut out, &TerminalEvent::raw("raw", false)).expect("write");
        assert_eq!(String::from_utf8(out).expect("utf8"), "hello\nraw");
    }
}
