//! Collector that turns one fetch of the usage report feed into metric families.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::family::MetricFamily;
use crate::feed::{Feed, FeedError, FeedItem};

/// Label names shared by every account family.
pub const LABEL_NAMES: &[&str] = &["uid", "nickname", "location"];

const BYTES_PER_GIB: f64 = (1u64 << 30) as f64;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Errors that fail a whole collection.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Upstream returned HTTP {status}")]
    UpstreamStatus { status: u16 },

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error("Invalid value {value:?} in field {field}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Feed contains no account rows")]
    NoAccounts,
}

impl CollectorError {
    /// Short name of the failure, free of target-derived text.
    pub fn kind(&self) -> &'static str {
        match self {
            CollectorError::Transport(e) if e.is_timeout() => "timeout",
            CollectorError::Transport(_) => "transport",
            CollectorError::UpstreamStatus { .. } => "upstream_status",
            CollectorError::Feed(_) => "feed",
            CollectorError::InvalidNumber { .. } => "invalid_number",
            CollectorError::NoAccounts => "no_accounts",
        }
    }
}

/// A source of metric families, asked once per scrape.
pub trait Collector {
    fn collect(&self) -> impl Future<Output = Result<Vec<MetricFamily>, CollectorError>> + Send;
}

/// What to do when an item lacks a field.
#[derive(Debug, Clone, Copy)]
enum Missing {
    /// Emit no sample.
    Omit,
    /// Parse this text instead.
    Default(&'static str),
}

/// Mapping from one feed field to one gauge family.
struct AccountField {
    element: &'static str,
    name: &'static str,
    help: &'static str,
    scale: f64,
    missing: Missing,
}

/// Families in exposition order.
const ACCOUNT_FIELDS: [AccountField; 7] = [
    AccountField {
        element: "quota_gb",
        name: "rsyncnet_account_quota_bytes",
        help: "Account quota",
        scale: BYTES_PER_GIB,
        missing: Missing::Omit,
    },
    AccountField {
        element: "billed_gb",
        name: "rsyncnet_account_billed_bytes",
        help: "Amount of quota-consuming data (including custom snapshots)",
        scale: BYTES_PER_GIB,
        missing: Missing::Omit,
    },
    AccountField {
        element: "dataset_bytes",
        name: "rsyncnet_account_dataset_bytes",
        help: "Amount of data consumed by dataset (excluding snapshots)",
        scale: 1.0,
        missing: Missing::Omit,
    },
    AccountField {
        element: "inodes",
        name: "rsyncnet_account_inodes_count",
        help: "Number of inodes consumed by data (excluding snapshots)",
        scale: 1.0,
        missing: Missing::Omit,
    },
    AccountField {
        element: "snap_used_free_gb",
        name: "rsyncnet_account_snapshot_used_free_bytes",
        help: "Amount of data consumed by free snapshots",
        scale: BYTES_PER_GIB,
        missing: Missing::Omit,
    },
    AccountField {
        element: "snap_used_cust_gb",
        name: "rsyncnet_account_snapshot_used_custom_bytes",
        help: "Amount of data consumed by custom snapshots",
        scale: BYTES_PER_GIB,
        // Accounts without custom snapshots leave this empty.
        missing: Missing::Default("0"),
    },
    AccountField {
        element: "usage_idle_days",
        name: "rsyncnet_account_idle_seconds",
        help: "Length of time that account has been idle",
        scale: SECONDS_PER_DAY,
        missing: Missing::Omit,
    },
];

/// Build the HTTP client used for upstream fetches.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, CollectorError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("rsyncnet-exporter/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Collects account usage from one rsync.net feed URL.
#[derive(Debug, Clone)]
pub struct AccountCollector {
    client: reqwest::Client,
    target: Url,
    require_accounts: bool,
}

impl AccountCollector {
    /// Create a collector for `target`.
    ///
    /// The target must already have passed the host check; the collector
    /// fetches whatever it is given.
    pub fn new(client: reqwest::Client, target: Url, require_accounts: bool) -> Self {
        Self {
            client,
            target,
            require_accounts,
        }
    }

    async fn fetch(&self) -> Result<String, CollectorError> {
        let response = self.client.get(self.target.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }
}

impl Collector for AccountCollector {
    async fn collect(&self) -> Result<Vec<MetricFamily>, CollectorError> {
        let body = self.fetch().await?;
        trace!(target_url = %self.target, bytes = body.len(), "Fetched usage report");

        let feed = Feed::parse(&body)?;
        account_families(&feed, self.require_accounts)
    }
}

/// Convert a parsed feed into the seven account families.
///
/// Items without a `uid` are not accounts and are skipped. All families are
/// returned even when they hold no samples.
pub fn account_families(
    feed: &Feed,
    require_accounts: bool,
) -> Result<Vec<MetricFamily>, CollectorError> {
    let mut families: Vec<MetricFamily> = ACCOUNT_FIELDS
        .iter()
        .map(|field| MetricFamily::gauge(field.name, field.help, LABEL_NAMES))
        .collect();

    let mut accounts = 0usize;
    for item in feed.items() {
        if item.non_empty("uid").is_none() {
            debug!(title = ?item.text("title"), "Skipping item");
            continue;
        }

        collect_account(item, &mut families)?;
        accounts += 1;
    }

    if accounts == 0 && require_accounts {
        return Err(CollectorError::NoAccounts);
    }

    debug!(accounts, "Collected account usage");
    Ok(families)
}

fn collect_account(item: &FeedItem, families: &mut [MetricFamily]) -> Result<(), CollectorError> {
    let label_values: Vec<String> = LABEL_NAMES
        .iter()
        .map(|name| item.text(name).unwrap_or_default().to_string())
        .collect();

    for (field, family) in ACCOUNT_FIELDS.iter().zip(families.iter_mut()) {
        let raw = match (item.non_empty(field.element), field.missing) {
            (Some(raw), _) => raw,
            (None, Missing::Default(default)) => default,
            (None, Missing::Omit) => continue,
        };

        let value: f64 = raw
            .trim()
            .parse()
            .map_err(|_| CollectorError::InvalidNumber {
                field: field.element,
                value: raw.to_string(),
            })?;

        family.add_sample(label_values.clone(), value * field.scale);
    }

    Ok(())
}
