//! Result materialization
//!
//! Persists HTML replies and attached files to a content store keyed by the
//! query id, and derives the ledger summary (count, found, preview). Paths
//! are deterministic per query, so re-materializing overwrites in place.

use crate::bots::DetectionRules;
use crate::collector::CollectedReply;
use crate::errors::{LookupError, Result};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Node};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Html,
    File,
}

impl ArtifactKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "html" => Some(ArtifactKind::Html),
            "file" => Some(ArtifactKind::File),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Html => "html",
            ArtifactKind::File => "file",
        }
    }
}

/// Addressable storage for artifacts. Keys are store-relative paths.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write (or overwrite) an artifact, returning its key
    async fn put(&self, query_id: Uuid, kind: ArtifactKind, name: &str, bytes: &[u8])
        -> Result<String>;

    /// Read an artifact; `None` when the key does not exist
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Filesystem content store rooted at a directory
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key, refusing anything that could leave the root
    fn resolve(&self, key: &str) -> Option<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        safe.then(|| self.root.join(relative))
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment.bin".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Sanitized name not yet used by this materialization; collisions get a
/// numeric suffix (`dump.csv`, `dump-2.csv`, ...)
fn unique_file_name(name: &str, taken: &mut HashSet<String>) -> String {
    let base = sanitize_file_name(name);
    let mut candidate = base.clone();
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, n, ext),
            _ => format!("{}-{}", base, n),
        };
        n += 1;
    }
    candidate
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        query_id: Uuid,
        kind: ArtifactKind,
        name: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let key = match kind {
            ArtifactKind::Html => format!("{}/result.html", query_id),
            ArtifactKind::File => format!("{}/files/{}", query_id, sanitize_file_name(name)),
        };
        let path = self.root.join(&key);
        let parent = path
            .parent()
            .ok_or_else(|| LookupError::MaterializationError(format!("bad key {}", key)))?;
        fs::create_dir_all(parent).await?;

        // Write-then-rename so readers never see a partial artifact
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.tmp", file_name));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!(key = %key, bytes = bytes.len(), "Artifact stored");
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.resolve(key) else {
            return Ok(None);
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Content type served for an artifact key
pub fn content_type_for(key: &str) -> String {
    let mime = mime_guess::from_path(key).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

const HIDDEN: &[&str] = &["head", "script", "style", "noscript", "template"];

const BLOCKS: &[&str] = &[
    "br", "p", "div", "tr", "ul", "ol", "table", "section", "article", "h1", "h2", "h3", "h4",
    "h5", "h6",
];

fn push_text(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if HIDDEN.contains(&name) {
        return;
    }

    let block = BLOCKS.contains(&name);
    match name {
        "li" => out.push_str("\n- "),
        "td" | "th" => out.push(' '),
        _ if block => out.push('\n'),
        _ => {}
    }

    for child in element.children() {
        if let Some(child) = ElementRef::wrap(child) {
            push_text(child, out);
        } else if let Node::Text(text) = child.value() {
            out.push_str(text);
        }
    }

    if block || name == "li" {
        out.push('\n');
    }
}

/// Plain-text rendering of an HTML document, one block per line.
/// List items are rendered as `- item` so entry patterns can count them.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut out = String::with_capacity(html.len() / 2);
    push_text(document.root_element(), &mut out);

    out.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn looks_like_html(text: &str) -> bool {
    let lower = text.trim_start().to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Stored artifact and its content digest
#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    pub key: String,
    pub kind: ArtifactKind,
    pub bytes: usize,
    pub sha256: String,
}

/// Ledger-facing summary of a materialized reply
#[derive(Debug, Clone, Serialize)]
pub struct Materialized {
    pub html_path: Option<String>,
    pub file_path: Option<String>,
    pub preview: String,
    pub result_count: i32,
    pub found: bool,
    pub artifacts: Vec<StoredArtifact>,
}

impl Materialized {
    /// Summary computed from the reply alone, used when storage failed
    pub fn unstored(reply: &CollectedReply, rules: &DetectionRules, preview_limit: usize) -> Self {
        let text = reply.joined_text();
        let (result_count, found) = summarize(reply, rules, &text);
        Self {
            html_path: None,
            file_path: None,
            preview: truncate_chars(&text, preview_limit),
            result_count,
            found,
            artifacts: Vec::new(),
        }
    }
}

fn summarize(reply: &CollectedReply, rules: &DetectionRules, text: &str) -> (i32, bool) {
    let mut count = rules.count_entries(text);
    let has_content = !text.trim().is_empty() || !reply.attachments.is_empty();
    if count == 0 && has_content && !reply.not_found && !rules.is_not_found(text) {
        count = 1;
    }
    let count = i32::try_from(count).unwrap_or(i32::MAX);
    (count, count > 0)
}

pub struct ResultMaterializer {
    store: Arc<dyn ArtifactStore>,
    preview_limit: usize,
}

impl ResultMaterializer {
    pub fn new(store: Arc<dyn ArtifactStore>, preview_limit: usize) -> Self {
        Self {
            store,
            preview_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn preview_limit(&self) -> usize {
        self.preview_limit
    }

    async fn put(
        &self,
        query_id: Uuid,
        kind: ArtifactKind,
        name: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact> {
        let key = self.store.put(query_id, kind, name, bytes).await?;
        Ok(StoredArtifact {
            key,
            kind,
            bytes: bytes.len(),
            sha256: hex::encode(Sha256::digest(bytes)),
        })
    }

    #[instrument(skip(self, reply, rules))]
    pub async fn materialize(
        &self,
        query_id: Uuid,
        reply: &CollectedReply,
        rules: &DetectionRules,
    ) -> Result<Materialized> {
        let mut artifacts = Vec::new();
        let mut taken = HashSet::new();
        let mut html_path = None;
        let mut file_path = None;
        let mut html_text = String::new();

        let inline_html = reply
            .result_texts
            .iter()
            .find(|t| looks_like_html(&t.text))
            .map(|t| t.text.as_bytes());

        for attachment in &reply.attachments {
            if attachment.is_html() && html_path.is_none() {
                let stored = self
                    .put(query_id, ArtifactKind::Html, &attachment.file_name, &attachment.bytes)
                    .await?;
                html_text = html_to_text(&String::from_utf8_lossy(&attachment.bytes));
                html_path = Some(stored.key.clone());
                artifacts.push(stored);
            } else {
                let name = unique_file_name(&attachment.file_name, &mut taken);
                let stored = self
                    .put(query_id, ArtifactKind::File, &name, &attachment.bytes)
                    .await?;
                if file_path.is_none() {
                    file_path = Some(stored.key.clone());
                }
                artifacts.push(stored);
            }
        }

        if let (None, Some(bytes)) = (&html_path, inline_html) {
            let stored = self
                .put(query_id, ArtifactKind::Html, "result.html", bytes)
                .await?;
            html_text = html_to_text(&String::from_utf8_lossy(bytes));
            html_path = Some(stored.key.clone());
            artifacts.push(stored);
        }

        let plain: Vec<String> = reply
            .result_texts
            .iter()
            .filter(|t| !looks_like_html(&t.text))
            .map(|t| t.text.clone())
            .collect();
        let mut text = plain.join("\n\n");
        if !html_text.is_empty() {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&html_text);
        }

        let (result_count, found) = summarize(reply, rules, &text);
        let preview = if text.trim().is_empty() {
            reply
                .attachments
                .iter()
                .map(|a| format!("[{}]", a.file_name))
                .collect::<Vec<_>>()
                .join(" ")
        } else {
            text
        };

        Ok(Materialized {
            html_path,
            file_path,
            preview: truncate_chars(&preview, self.preview_limit),
            result_count,
            found,
            artifacts,
        })
    }

    pub async fn open(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bots::BotRegistry;
    use crate::collector::ReplyText;
    use crate::session::Attachment;
    use intelforge_common::AppConfig;

    fn rules() -> DetectionRules {
        BotRegistry::from_config(&AppConfig::default().bots)
            .unwrap()
            .resolve(None)
            .unwrap()
            .rules
            .clone()
    }

    fn html_reply(body: &str) -> CollectedReply {
        CollectedReply {
            attachments: vec![Attachment {
                file_name: "report.html".into(),
                mime_type: "text/html".into(),
                bytes: body.as_bytes().to_vec(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_html_to_text_lists() {
        let text = html_to_text(
            "<html><head><style>p{}</style></head><body><h1>Leaks &amp; more</h1>\
             <ul><li>Leak A</li><li>Leak B</li></ul><script>x()</script></body></html>",
        );
        assert_eq!(text, "Leaks & more\n- Leak A\n- Leak B");
    }

    #[test]
    fn test_html_to_text_decodes_entities() {
        let text = html_to_text("<p>Caf&#233; &#x27;ok&#x27; &lt;3&nbsp;days</p><p>next</p>tail");
        assert_eq!(text, "Café 'ok' <3 days\nnext\ntail");
    }

    #[test]
    fn test_unique_file_names() {
        let mut taken = HashSet::new();
        assert_eq!(unique_file_name("dump.csv", &mut taken), "dump.csv");
        assert_eq!(unique_file_name("dump.csv", &mut taken), "dump-2.csv");
        assert_eq!(unique_file_name("dump?.csv", &mut taken), "dump_.csv");
        assert_eq!(unique_file_name("dump.csv", &mut taken), "dump-3.csv");
        assert_eq!(unique_file_name("...", &mut taken), "attachment.bin");
        assert_eq!(unique_file_name("", &mut taken), "attachment-2.bin");
    }

    #[tokio::test]
    async fn test_colliding_attachments_are_both_kept() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = ResultMaterializer::new(Arc::new(FsArtifactStore::new(dir.path())), 500);
        let id = Uuid::new_v4();
        let file = |bytes: &[u8]| Attachment {
            file_name: "leak dump.csv".into(),
            mime_type: "text/csv".into(),
            bytes: bytes.to_vec(),
        };
        let reply = CollectedReply {
            attachments: vec![file(b"first"), file(b"second")],
            ..Default::default()
        };

        let result = materializer.materialize(id, &reply, &rules()).await.unwrap();

        let keys: Vec<&str> = result.artifacts.iter().map(|a| a.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                format!("{}/files/leak_dump.csv", id),
                format!("{}/files/leak_dump-2.csv", id),
            ]
        );
        assert_eq!(materializer.open(keys[1]).await.unwrap().unwrap(), b"second");
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("..."), "attachment.bin");
        assert_eq!(sanitize_file_name("dump 2024.csv"), "dump_2024.csv");
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("ééé", 2), "éé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }

    #[tokio::test]
    async fn test_html_attachment_counts_entries() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = ResultMaterializer::new(Arc::new(FsArtifactStore::new(dir.path())), 500);
        let id = Uuid::new_v4();

        let result = materializer
            .materialize(id, &html_reply("<ul><li>a</li><li>b</li></ul>"), &rules())
            .await
            .unwrap();

        assert_eq!(result.result_count, 2);
        assert!(result.found);
        assert_eq!(result.html_path.as_deref(), Some(format!("{}/result.html", id).as_str()));
        assert!(dir.path().join(id.to_string()).join("result.html").exists());
        assert_eq!(result.artifacts[0].sha256.len(), 64);
    }

    #[tokio::test]
    async fn test_not_found_text_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = ResultMaterializer::new(Arc::new(FsArtifactStore::new(dir.path())), 500);
        let reply = CollectedReply {
            not_found: true,
            ..Default::default()
        };

        let result = materializer.materialize(Uuid::new_v4(), &reply, &rules()).await.unwrap();
        assert_eq!(result.result_count, 0);
        assert!(!result.found);
        assert!(result.html_path.is_none());
    }

    #[tokio::test]
    async fn test_preview_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = ResultMaterializer::new(Arc::new(FsArtifactStore::new(dir.path())), 16);
        let reply = CollectedReply {
            result_texts: vec![ReplyText {
                message_id: 1,
                text: format!("Results:\n{}", "1. entry\n".repeat(50)),
            }],
            ..Default::default()
        };

        let result = materializer.materialize(Uuid::new_v4(), &reply, &rules()).await.unwrap();
        assert_eq!(result.preview.chars().count(), 16);
        assert_eq!(result.result_count, 50);
    }

    #[tokio::test]
    async fn test_rematerialize_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = ResultMaterializer::new(Arc::new(FsArtifactStore::new(dir.path())), 500);
        let id = Uuid::new_v4();
        let reply = html_reply("<p>same</p>");

        let first = materializer.materialize(id, &reply, &rules()).await.unwrap();
        let second = materializer.materialize(id, &reply, &rules()).await.unwrap();

        assert_eq!(first.html_path, second.html_path);
        assert_eq!(first.artifacts[0].sha256, second.artifacts[0].sha256);
        let entries = std::fs::read_dir(dir.path().join(id.to_string())).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert!(store.get("../secret").await.unwrap().is_none());
        assert!(store.get("/etc/passwd").await.unwrap().is_none());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("x/result.html"), "text/html; charset=utf-8");
        assert_eq!(content_type_for("x/files/a.PDF"), "application/pdf");
        assert_eq!(content_type_for("x/files/blob"), "application/octet-stream");
        assert_eq!(content_type_for("x/files/a.csv"), "text/csv; charset=utf-8");
    }
}
