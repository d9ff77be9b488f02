use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::download::command::{collection_listing_invocation, title_invocation, ToolInvocation};
use crate::download::parse::extract_error_message;
use crate::error::{EngineError, Result};
use crate::utils::os;

/// One entry of a flat collection listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMember {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Parse the `--flat-playlist --dump-json` output: one JSON object per line.
/// Lines that are not objects, or carry no usable URL, are skipped.
pub fn parse_collection_listing(stdout: &str) -> Vec<CollectionMember> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("skipping listing line ({e}): {line}");
                None
            }
        })
        .filter_map(|v| {
            let text = |key: &str| {
                v.get(key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            let url = text("url").or_else(|| text("webpage_url"))?;
            let id = text("id").unwrap_or_default();
            let title = text("title").unwrap_or_else(|| id.clone());
            Some(CollectionMember { id, title, url })
        })
        .collect()
}

struct Captured {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Short-lived helper runs of the downloader: collection listings and titles.
#[derive(Debug, Clone)]
pub struct MetadataResolver {
    tool: String,
}

impl MetadataResolver {
    pub fn new(tool: impl Into<String>) -> Self {
        MetadataResolver { tool: tool.into() }
    }

    async fn capture(&self, inv: &ToolInvocation) -> std::io::Result<Captured> {
        tracing::debug!("metadata: {inv}");
        let out = os::command(&inv.program).args(&inv.args).output().await?;
        Ok(Captured {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    /// Enumerate the members of a collection, in listing order.
    pub async fn list_collection(&self, url: &str) -> Result<Vec<CollectionMember>> {
        let fail = |message: String| EngineError::MetadataFetch {
            url: url.to_string(),
            message,
        };

        let out = self
            .capture(&collection_listing_invocation(&self.tool, url))
            .await
            .map_err(|e| fail(format!("failed to launch {}: {e}", self.tool)))?;

        // a partially failing listing still yields whatever members were printed
        let members = parse_collection_listing(&out.stdout);
        if members.is_empty() {
            let message = extract_error_message(out.stderr.lines())
                .unwrap_or_else(|| "no entries found in playlist".to_string());
            tracing::warn!("playlist listing failed for {url}: {message}");
            return Err(fail(message));
        }
        if !out.success {
            tracing::warn!(
                "playlist listing for {url} exited unsuccessfully; using {} entries",
                members.len()
            );
        }
        Ok(members)
    }

    /// Resolve the human-readable title of a single item.
    pub async fn fetch_title(&self, url: &str) -> Result<String> {
        let fail = |message: String| EngineError::TitleFetch {
            url: url.to_string(),
            message,
        };

        let out = self
            .capture(&title_invocation(&self.tool, url))
            .await
            .map_err(|e| fail(format!("failed to launch {}: {e}", self.tool)))?;

        let title = out
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string);

        match title {
            Some(t) if out.success => Ok(t),
            _ => Err(fail(
                extract_error_message(out.stderr.lines())
                    .unwrap_or_else(|| "could not determine title".to_string()),
            )),
        }
    }
}
