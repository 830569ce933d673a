use anyhow::{Result, anyhow};
use console::style;
use reqwest::Method;
use tokio_stream::StreamExt;

use super::GlobalFlags;
use super::client::ApiClient;
use crate::core::terminal::print_info;

/// Streams `/api/logs` until the server goes away or Ctrl+C.
pub async fn follow_logs(flags: &GlobalFlags) -> Result<()> {
    let client = ApiClient::from_flags(flags).await?;
    let resp = client
        .request(Method::GET, "/api/logs")
        .send()
        .await
        .map_err(|e| anyhow!("Could not reach orchestrator at {} - {}", client.base_url(), e))?;
    if !resp.status().is_success() {
        return Err(anyhow!("log stream refused with status {}", resp.status()));
    }

    print_info(&format!(
        "Following logs from {} - press {} to stop.",
        client.base_url(),
        style("Ctrl+C").bold().yellow()
    ));

    let mut stream = resp.bytes_stream();
    let mut pending = String::new();
    while let Some(chunk) = stream.next().await {
        pending.push_str(&String::from_utf8_lossy(&chunk?));
        while let Some(pos) = pending.find('\n') {
            let line: String = pending.drain(..=pos).collect();
            if let Some(text) = parse_sse_line(&line) {
                println!("{}", text);
            }
        }
    }
    Ok(())
}

/// The payload of an SSE `data:` line; everything else (events, keep-alives) is dropped.
fn parse_sse_line(line: &str) -> Option<&str> {
    let payload = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    (!payload.is_empty()).then_some(payload)
}

#[cfg(test)]
mod tests {
    use super::parse_sse_line;

    #[test]
    fn only_data_lines_are_printed() {
        assert_eq!(
            parse_sse_line("data: INFO Job claimed job_id=j1\n"),
            Some("INFO Job claimed job_id=j1")
        );
        assert_eq!(parse_sse_line("data:x"), Some("x"));
        assert_eq!(parse_sse_line(": keep-alive\n"), None);
        assert_eq!(parse_sse_line("event: lagged"), None);
        assert_eq!(parse_sse_line("data: \n"), None);
    }
}
