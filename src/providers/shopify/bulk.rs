//! Shopify product bulk export: submit, poll, stream-download, stream-parse.
//!
//! The export file is newline-delimited JSON. Each line is one node tagged
//! by its gid: a parent product, or a child (variant, image, inventory
//! level) pointing at its parent through `__parentId`. Shopify guarantees
//! parents precede their children in export order; that precondition is
//! checked here — a child with an unknown parent is counted as an orphan,
//! logged, and skipped without interrupting the parse.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::reconcile::{decimal_minor, v_i64, v_str};
use crate::sync::error::SyncError;

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_POLL_ATTEMPTS: u32 = 120;
/// A prior export newer than this is reused instead of re-running the job.
pub const EXPORT_MAX_AGE: Duration = Duration::from_secs(2 * 60 * 60);

/// Bulk query covering products with their variants, images, and inventory
/// levels. Connections unroll into child lines in the export file.
pub const PRODUCTS_BULK_QUERY: &str = r#"{
  products {
    edges {
      node {
        id
        title
        vendor
        status
        variants {
          edges {
            node {
              id
              sku
              price
              inventoryItem {
                inventoryLevels {
                  edges {
                    node {
                      id
                      available
                    }
                  }
                }
              }
            }
          }
        }
        images {
          edges {
            node {
              id
              url
            }
          }
        }
      }
    }
  }
}"#;

/// One export line, classified by gid type.
#[derive(Debug)]
pub enum BulkLine {
    Product {
        id: String,
        title: Option<String>,
        vendor: Option<String>,
        status: Option<String>,
    },
    Variant {
        id: String,
        parent_id: String,
        sku: Option<String>,
        price_minor: Option<i64>,
    },
    Image {
        parent_id: String,
        url: Option<String>,
    },
    InventoryLevel {
        parent_id: String,
        available: Option<i64>,
    },
    Unknown {
        gid: String,
    },
}

fn gid_type(gid: &str) -> Option<&str> {
    // gid://shopify/ProductVariant/123 → "ProductVariant"
    gid.strip_prefix("gid://shopify/")?.split('/').next()
}

/// Classify one parsed export line.
pub fn classify_line(v: &Value) -> Result<BulkLine, SyncError> {
    let gid = v_str(v, "id")
        .ok_or_else(|| SyncError::ProviderData("export line without id".into()))?
        .to_string();
    let parent = v_str(v, "__parentId").map(|s| s.to_string());

    match gid_type(&gid) {
        Some("Product") => Ok(BulkLine::Product {
            id: gid,
            title: v_str(v, "title").map(String::from),
            vendor: v_str(v, "vendor").map(String::from),
            status: v_str(v, "status").map(String::from),
        }),
        Some("ProductVariant") => {
            let parent_id = parent.ok_or_else(|| {
                SyncError::ProviderData(format!("variant {gid} without __parentId"))
            })?;
            Ok(BulkLine::Variant {
                id: gid,
                parent_id,
                sku: v_str(v, "sku").map(String::from),
                price_minor: v_str(v, "price").and_then(decimal_minor),
            })
        }
        Some("ProductImage") | Some("MediaImage") => {
            let parent_id = parent.ok_or_else(|| {
                SyncError::ProviderData(format!("image {gid} without __parentId"))
            })?;
            Ok(BulkLine::Image {
                parent_id,
                url: v_str(v, "url").map(String::from),
            })
        }
        Some("InventoryLevel") => {
            let parent_id = parent.ok_or_else(|| {
                SyncError::ProviderData("inventory level without __parentId".into())
            })?;
            Ok(BulkLine::InventoryLevel {
                parent_id,
                available: v_i64(v, "available"),
            })
        }
        _ => Ok(BulkLine::Unknown { gid }),
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssembledVariant {
    pub variant_id: String,
    pub sku: Option<String>,
    pub price_minor: Option<i64>,
    pub quantity: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct AssembledProduct {
    pub product_id: String,
    pub title: Option<String>,
    pub vendor: Option<String>,
    pub status: Option<String>,
    /// Allow-list verdict; irrelevant parents are kept through the parse and
    /// skipped at reconciliation.
    pub relevant: bool,
    pub variants: Vec<AssembledVariant>,
    pub image_urls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct BulkCatalog {
    pub products: Vec<AssembledProduct>,
    pub lines: usize,
    pub orphans: usize,
    pub unknown: usize,
    pub malformed: usize,
}

/// Incremental assembler exploiting parent-precedes-child ordering.
#[derive(Default)]
pub struct BulkAssembler {
    order: Vec<String>,
    products: HashMap<String, AssembledProduct>,
    variant_parent: HashMap<String, String>,
    catalog_stats: BulkCatalog,
    allowed_vendors: Option<HashSet<String>>,
}

impl BulkAssembler {
    pub fn new(allowed_vendors: Option<HashSet<String>>) -> Self {
        Self {
            allowed_vendors,
            ..Default::default()
        }
    }

    pub fn push_raw(&mut self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        self.catalog_stats.lines += 1;
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                self.catalog_stats.malformed += 1;
                warn!(error = %e, "skipping unparseable export line");
                return;
            }
        };
        match classify_line(&parsed) {
            Ok(line) => self.push(line),
            Err(e) => {
                self.catalog_stats.malformed += 1;
                warn!(error = %e, "skipping malformed export line");
            }
        }
    }

    pub fn push(&mut self, line: BulkLine) {
        match line {
            BulkLine::Product {
                id,
                title,
                vendor,
                status,
            } => {
                let relevant = match (&self.allowed_vendors, &vendor) {
                    (None, _) => true,
                    (Some(allow), Some(v)) => allow.contains(v),
                    (Some(_), None) => false,
                };
                self.order.push(id.clone());
                self.products.insert(
                    id.clone(),
                    AssembledProduct {
                        product_id: id,
                        title,
                        vendor,
                        status,
                        relevant,
                        variants: Vec::new(),
                        image_urls: Vec::new(),
                    },
                );
            }
            BulkLine::Variant {
                id,
                parent_id,
                sku,
                price_minor,
            } => match self.products.get_mut(&parent_id) {
                Some(p) => {
                    self.variant_parent.insert(id.clone(), parent_id);
                    p.variants.push(AssembledVariant {
                        variant_id: id,
                        sku,
                        price_minor,
                        quantity: None,
                    });
                }
                None => {
                    self.catalog_stats.orphans += 1;
                    warn!(variant = %id, parent = %parent_id, "export child precedes its parent; skipping");
                }
            },
            BulkLine::Image { parent_id, url } => match self.products.get_mut(&parent_id) {
                Some(p) => {
                    if let Some(url) = url {
                        p.image_urls.push(url);
                    }
                }
                None => {
                    self.catalog_stats.orphans += 1;
                    warn!(parent = %parent_id, "image precedes its parent product; skipping");
                }
            },
            BulkLine::InventoryLevel {
                parent_id,
                available,
            } => {
                // Inventory levels hang off the variant, one hop from the
                // product; resolve through the variant→product map.
                let resolved = self.variant_parent.get(&parent_id).cloned();
                match resolved.and_then(|pid| self.products.get_mut(&pid)) {
                    Some(p) => {
                        if let Some(var) =
                            p.variants.iter_mut().find(|v| v.variant_id == parent_id)
                        {
                            if let Some(avail) = available {
                                let add = avail as i32;
                                var.quantity = Some(var.quantity.unwrap_or(0) + add);
                            }
                        }
                    }
                    None => {
                        self.catalog_stats.orphans += 1;
                        warn!(parent = %parent_id, "inventory level without a resolved variant; skipping");
                    }
                }
            }
            BulkLine::Unknown { gid } => {
                self.catalog_stats.unknown += 1;
                debug!(gid, "ignoring unknown export line type");
            }
        }
    }

    pub fn finish(mut self) -> BulkCatalog {
        let mut catalog = self.catalog_stats;
        catalog.products = self
            .order
            .iter()
            .filter_map(|id| self.products.remove(id))
            .collect();
        catalog
    }
}

/// Stream-parse an export file into an assembled catalog.
pub async fn parse_export_file(
    path: &Path,
    allowed_vendors: Option<HashSet<String>>,
) -> anyhow::Result<BulkCatalog> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut assembler = BulkAssembler::new(allowed_vendors);
    while let Some(line) = lines.next_line().await? {
        assembler.push_raw(&line);
    }
    let catalog = assembler.finish();
    info!(
        path = %path.display(),
        lines = catalog.lines,
        products = catalog.products.len(),
        orphans = catalog.orphans,
        unknown = catalog.unknown,
        malformed = catalog.malformed,
        "bulk export parsed"
    );
    Ok(catalog)
}

/// Whether a previous export at `path` is fresh enough to reuse.
pub fn export_is_fresh(path: &Path, max_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age < max_age)
        .unwrap_or(false)
}

/// Stream a completed export to disk without buffering it in memory.
pub async fn download_export(
    http: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<u64, SyncError> {
    // The download URL comes out of a provider response; refuse anything
    // that doesn't even parse before handing it to the HTTP client.
    let parsed = url::Url::parse(url)
        .map_err(|e| SyncError::ProviderData(format!("bad export url: {e}")))?;
    debug!(host = parsed.host_str().unwrap_or("<none>"), "starting export download");

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::ProviderData(format!("export dir: {e}")))?;
    }
    let resp = http.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SyncError::Http {
            status: status.as_u16(),
            body: "bulk export download failed".into(),
        });
    }

    let tmp = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| SyncError::ProviderData(format!("export tmp file: {e}")))?;
    let mut written = 0u64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| SyncError::ProviderData(format!("export write: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| SyncError::ProviderData(format!("export flush: {e}")))?;
    drop(file);
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| SyncError::ProviderData(format!("export rename: {e}")))?;
    info!(bytes = written, dest = %dest.display(), "bulk export downloaded");
    Ok(written)
}

/// Terminal states of a bulk export job as Shopify reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkJobStatus {
    Running,
    Completed { url: Option<String> },
    Failed { code: String },
    Canceled,
}

pub fn job_status_of(op: &Value) -> BulkJobStatus {
    match v_str(op, "status").unwrap_or("") {
        "COMPLETED" => BulkJobStatus::Completed {
            url: v_str(op, "url").map(String::from),
        },
        "FAILED" => BulkJobStatus::Failed {
            code: v_str(op, "errorCode").unwrap_or("UNKNOWN").to_string(),
        },
        "CANCELED" => BulkJobStatus::Canceled,
        _ => BulkJobStatus::Running,
    }
}

pub fn default_export_path() -> PathBuf {
    crate::util::env::env_opt("SHOPIFY_EXPORT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("exports/shopify"))
        .join("products.ndjson")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product_line(id: u64, vendor: &str) -> String {
        json!({
            "id": format!("gid://shopify/Product/{id}"),
            "title": format!("Product {id}"),
            "vendor": vendor,
            "status": "ACTIVE"
        })
        .to_string()
    }

    fn variant_line(id: u64, parent: u64, sku: &str) -> String {
        json!({
            "id": format!("gid://shopify/ProductVariant/{id}"),
            "__parentId": format!("gid://shopify/Product/{parent}"),
            "sku": sku,
            "price": "19.99"
        })
        .to_string()
    }

    #[test]
    fn lines_classify_by_gid_type() {
        let line = classify_line(
            &serde_json::from_str(&product_line(1, "Acme")).unwrap(),
        )
        .unwrap();
        assert!(matches!(line, BulkLine::Product { .. }));

        let line = classify_line(
            &serde_json::from_str(&variant_line(10, 1, "SKU-1")).unwrap(),
        )
        .unwrap();
        match line {
            BulkLine::Variant {
                parent_id,
                sku,
                price_minor,
                ..
            } => {
                assert_eq!(parent_id, "gid://shopify/Product/1");
                assert_eq!(sku.as_deref(), Some("SKU-1"));
                assert_eq!(price_minor, Some(1999));
            }
            other => panic!("expected variant, got {other:?}"),
        }

        let line = classify_line(&json!({"id": "gid://shopify/Collection/3"})).unwrap();
        assert!(matches!(line, BulkLine::Unknown { .. }));
    }

    #[test]
    fn child_without_parent_field_is_malformed() {
        let err = classify_line(&json!({"id": "gid://shopify/ProductVariant/9"})).unwrap_err();
        assert!(matches!(err, SyncError::ProviderData(_)));
    }

    #[test]
    fn assembler_resolves_children_and_counts_orphans() {
        let mut asm = BulkAssembler::new(None);
        asm.push_raw(&product_line(1, "Acme"));
        asm.push_raw(&variant_line(10, 1, "SKU-1"));
        asm.push_raw(
            &json!({
                "id": "gid://shopify/InventoryLevel/500?inventory_item_id=1",
                "available": 7,
                "__parentId": "gid://shopify/ProductVariant/10"
            })
            .to_string(),
        );
        // Child arriving before any parent: orphan, parse continues.
        asm.push_raw(&variant_line(99, 42, "GHOST"));
        asm.push_raw(
            &json!({
                "id": "gid://shopify/ProductImage/77",
                "url": "https://cdn.example/img.png",
                "__parentId": "gid://shopify/Product/1"
            })
            .to_string(),
        );

        let catalog = asm.finish();
        assert_eq!(catalog.products.len(), 1);
        assert_eq!(catalog.orphans, 1);
        let p = &catalog.products[0];
        assert_eq!(p.variants.len(), 1);
        assert_eq!(p.variants[0].quantity, Some(7));
        assert_eq!(p.image_urls.len(), 1);
    }

    #[test]
    fn vendor_allow_list_marks_without_interrupting() {
        let allow: HashSet<String> = ["Acme".to_string()].into_iter().collect();
        let mut asm = BulkAssembler::new(Some(allow));
        asm.push_raw(&product_line(1, "Acme"));
        asm.push_raw(&product_line(2, "Dropship Co"));
        asm.push_raw(&variant_line(20, 2, "DS-1"));

        let catalog = asm.finish();
        assert_eq!(catalog.products.len(), 2);
        assert!(catalog.products[0].relevant);
        assert!(!catalog.products[1].relevant);
        // The irrelevant parent still resolved its child.
        assert_eq!(catalog.products[1].variants.len(), 1);
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let mut asm = BulkAssembler::new(None);
        asm.push_raw("not json at all");
        asm.push_raw(&product_line(1, "Acme"));
        asm.push_raw(&json!({"no_id": true}).to_string());
        let catalog = asm.finish();
        assert_eq!(catalog.malformed, 2);
        assert_eq!(catalog.products.len(), 1);
    }

    #[test]
    fn job_status_maps_terminal_states() {
        assert_eq!(
            job_status_of(&json!({"status": "COMPLETED", "url": "https://x/file"})),
            BulkJobStatus::Completed {
                url: Some("https://x/file".into())
            }
        );
        assert_eq!(
            job_status_of(&json!({"status": "FAILED", "errorCode": "ACCESS_DENIED"})),
            BulkJobStatus::Failed {
                code: "ACCESS_DENIED".into()
            }
        );
        assert_eq!(job_status_of(&json!({"status": "CANCELED"})), BulkJobStatus::Canceled);
        assert_eq!(job_status_of(&json!({"status": "RUNNING"})), BulkJobStatus::Running);
    }

    #[tokio::test]
    async fn parse_export_file_streams_lines() {
        let dir = std::env::temp_dir().join("marketsync-bulk-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("export.ndjson");
        let content = [
            product_line(1, "Acme"),
            variant_line(10, 1, "SKU-1"),
            product_line(2, "Acme"),
            variant_line(20, 2, "SKU-2"),
        ]
        .join("\n");
        tokio::fs::write(&path, content).await.unwrap();

        let catalog = parse_export_file(&path, None).await.unwrap();
        assert_eq!(catalog.lines, 4);
        assert_eq!(catalog.products.len(), 2);
        assert_eq!(catalog.products[0].variants[0].sku.as_deref(), Some("SKU-1"));

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[test]
    fn missing_file_is_not_fresh() {
        assert!(!export_is_fresh(
            Path::new("/definitely/not/here.ndjson"),
            EXPORT_MAX_AGE
        ));
    }
}
