//! Manifest-file work source
//!
//! Two formats are accepted: JSON Lines, one object per line, and CSV with a
//! header row. Field names may use either the item/owner vocabulary or the
//! portal's ad/advertiser one, in snake or camel case.

use crate::{CaptureError, EnumerationFilter, EnumerationOrder, Enumerator, WorkItem};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

const ITEM_ID_KEYS: [&str; 4] = ["item_id", "ad_id", "itemId", "adId"];
const ITEM_URL_KEYS: [&str; 4] = ["item_url", "ad_url", "itemUrl", "adUrl"];
const OWNER_ID_KEYS: [&str; 4] = ["owner_id", "advertiser_id", "ownerId", "advertiserId"];

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(alias = "ad_id", alias = "itemId", alias = "adId")]
    item_id: Option<String>,
    #[serde(alias = "ad_url", alias = "itemUrl", alias = "adUrl")]
    item_url: Option<String>,
    #[serde(alias = "advertiser_id", alias = "ownerId", alias = "advertiserId")]
    owner_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    JsonLines,
    Csv,
}

impl ManifestFormat {
    /// `.csv` files are CSV, anything else is read as JSON Lines.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ManifestFormat::Csv,
            _ => ManifestFormat::JsonLines,
        }
    }
}

fn required(value: Option<String>, field: &str, line: usize) -> Result<String, CaptureError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CaptureError::Manifest(format!("line {line}: missing {field}"))),
    }
}

fn entry_to_item(entry: ManifestEntry, line: usize) -> Result<WorkItem, CaptureError> {
    Ok(WorkItem {
        item_id: required(entry.item_id, "item_id", line)?,
        item_url: required(entry.item_url, "item_url", line)?,
        owner_id: required(entry.owner_id, "owner_id", line)?,
    })
}

pub fn parse_jsonl(text: &str) -> Result<Vec<WorkItem>, CaptureError> {
    let mut items = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let entry: ManifestEntry = serde_json::from_str(raw)
            .map_err(|e| CaptureError::Manifest(format!("line {line}: {e}")))?;
        items.push(entry_to_item(entry, line)?);
    }
    Ok(items)
}

/// Split one CSV record, honouring double-quoted fields with `""` escapes.
fn split_csv_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut current)),
            (c, _) => current.push(c),
        }
    }
    fields.push(current);
    fields.into_iter().map(|f| f.trim().to_string()).collect()
}

fn column(header: &[String], keys: &[&str]) -> Option<usize> {
    header.iter().position(|h| keys.contains(&h.as_str()))
}

pub fn parse_csv(text: &str) -> Result<Vec<WorkItem>, CaptureError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Ok(Vec::new());
    };
    let header = split_csv_record(header.trim_start_matches('\u{feff}'));

    let missing = |field: &str| CaptureError::Manifest(format!("header has no {field} column"));
    let id_col = column(&header, &ITEM_ID_KEYS).ok_or_else(|| missing("item_id"))?;
    let url_col = column(&header, &ITEM_URL_KEYS).ok_or_else(|| missing("item_url"))?;
    let owner_col = column(&header, &OWNER_ID_KEYS).ok_or_else(|| missing("owner_id"))?;

    let mut items = Vec::new();
    for (idx, raw) in lines {
        let record = split_csv_record(raw);
        let get = |col: usize| record.get(col).cloned();
        let entry = ManifestEntry {
            item_id: get(id_col),
            item_url: get(url_col),
            owner_id: get(owner_col),
        };
        items.push(entry_to_item(entry, idx + 1)?);
    }
    Ok(items)
}

pub fn parse_manifest(text: &str, format: ManifestFormat) -> Result<Vec<WorkItem>, CaptureError> {
    match format {
        ManifestFormat::JsonLines => parse_jsonl(text),
        ManifestFormat::Csv => parse_csv(text),
    }
}

/// Work items read from a manifest file. The file is parsed up front so a
/// malformed entry fails the run before any capture starts.
pub struct ManifestEnumerator {
    items: Vec<WorkItem>,
}

impl ManifestEnumerator {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self { items }
    }

    pub async fn from_path(path: &Path) -> Result<Self, CaptureError> {
        let text = tokio::fs::read_to_string(path).await?;
        let items = parse_manifest(&text, ManifestFormat::from_path(path))?;
        info!(path = %path.display(), items = items.len(), "Loaded manifest");
        Ok(Self::new(items))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl Enumerator for ManifestEnumerator {
    /// Manifests carry no insertion times, so date bounds and the
    /// insertion-time orders leave file order unchanged.
    async fn stream(
        &self,
        filter: &EnumerationFilter,
    ) -> Result<BoxStream<'static, Result<WorkItem, CaptureError>>, CaptureError> {
        let mut items = self.items.clone();
        if filter.order == EnumerationOrder::OwnerAsc {
            items.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
        }
        if let Some(limit) = filter.limit {
            items.truncate(limit);
        }
        Ok(stream::iter(items.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn jsonl_accepts_every_vocabulary() {
        let text = r#"
{"item_id": "CR1", "item_url": "https://x/CR1", "owner_id": "AR1"}
{"ad_id": "CR2", "ad_url": "https://x/CR2", "advertiser_id": "AR2"}

{"adId": "CR3", "adUrl": "https://x/CR3", "advertiserId": "AR3", "extra": 1}
"#;
        let items = parse_jsonl(text).unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["CR1", "CR2", "CR3"]);
        assert_eq!(items[2].owner_id, "AR3");
    }

    #[test]
    fn jsonl_missing_field_names_the_line() {
        let text = "{\"item_id\": \"CR1\", \"item_url\": \"https://x\", \"owner_id\": \"AR1\"}\n{\"item_id\": \"CR2\", \"item_url\": \"https://x\"}";
        let err = parse_jsonl(text).unwrap_err();
        assert!(matches!(err, CaptureError::Manifest(ref m) if m.contains("line 2") && m.contains("owner_id")));
    }

    #[test]
    fn csv_with_quoted_fields() {
        let text = "advertiser_id,ad_id,ad_url\nAR1,CR1,\"https://x/?a=1,b=2\"\n\nAR2,CR2,https://x/CR2\n";
        let items = parse_csv(text).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_url, "https://x/?a=1,b=2");
        assert_eq!(items[1].item_id, "CR2");
        assert_eq!(items[1].owner_id, "AR2");
    }

    #[test]
    fn csv_empty_cell_is_an_error() {
        let text = "item_id,item_url,owner_id\nCR1,,AR1\n";
        assert!(parse_csv(text).is_err());
        assert!(parse_csv("item_id,owner_id\nCR1,AR1\n").is_err());
    }

    #[test]
    fn format_by_extension() {
        assert_eq!(ManifestFormat::from_path(Path::new("batch.CSV")), ManifestFormat::Csv);
        assert_eq!(ManifestFormat::from_path(Path::new("batch.jsonl")), ManifestFormat::JsonLines);
    }

    #[tokio::test]
    async fn enumerator_applies_limit_and_owner_order() {
        let enumerator = ManifestEnumerator::new(vec![
            WorkItem::new("CR1", "https://x/1", "AR9"),
            WorkItem::new("CR2", "https://x/2", "AR1"),
            WorkItem::new("CR3", "https://x/3", "AR5"),
        ]);
        let filter = EnumerationFilter {
            limit: Some(2),
            order: EnumerationOrder::OwnerAsc,
            ..Default::default()
        };
        let items: Vec<WorkItem> = enumerator.stream(&filter).await.unwrap().try_collect().await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, vec!["CR2", "CR3"]);
    }

    #[tokio::test]
    async fn reads_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.jsonl");
        tokio::fs::write(&path, "{\"item_id\":\"CR1\",\"item_url\":\"https://x\",\"owner_id\":\"AR1\"}\n")
            .await
            .unwrap();
        let enumerator = ManifestEnumerator::from_path(&path).await.unwrap();
        assert_eq!(enumerator.len(), 1);
    }
}
