//! Kernel packet-filter seam
//!
//! [`IptablesOps`] mirrors the subset of the `iptables` crate the firewall
//! components need. [`KernelIptables`] is the production backend and runs
//! every call on the blocking pool. Errors coming back from the crate are
//! boxed `dyn Error` values that are neither `Send` nor typed, so they are
//! flattened into [`IptablesError`] at this boundary and classified by the
//! message iptables printed.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Fragments iptables prints when the chain, target or rule is missing
const NOT_EXIST_MARKERS: &[&str] = &[
    "Bad rule (does a matching rule exist in that chain?)",
    "No chain/target/match by that name",
    "does not exist",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IptablesError {
    /// The chain or rule targeted by the call is not present
    #[error("not found: {0}")]
    NotExist(String),
    #[error("iptables command failed: {0}")]
    Command(String),
}

impl IptablesError {
    /// Classify an iptables error message
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if NOT_EXIST_MARKERS.iter().any(|m| message.contains(m)) {
            Self::NotExist(message)
        } else {
            Self::Command(message)
        }
    }

    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::NotExist(_))
    }
}

/// Chain and rule operations on the host's packet-filter tables
///
/// Rules are passed as a single whitespace-separated rule spec.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IptablesOps: Send + Sync {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, IptablesError>;

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    /// Remove every rule from a chain
    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    /// Delete an empty, unreferenced chain
    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError>;

    async fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, IptablesError>;

    async fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), IptablesError>;

    /// Insert at a 1-based position
    async fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), IptablesError>;

    async fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), IptablesError>;
}

/// Run a blocking iptables call on the blocking pool.
///
/// Each call forks `iptables --wait`, which can sit on the xtables lock.
/// Dropping the returned future stops waiting for it.
pub(crate) async fn run_blocking<T, F>(op: F) -> Result<T, IptablesError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, IptablesError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| IptablesError::Command(format!("iptables task failed: {e}")))?
}

/// Production [`IptablesOps`] backed by the `iptables` crate (IPv4 only)
pub struct KernelIptables {
    inner: Arc<iptables::IPTables>,
}

impl KernelIptables {
    pub fn new() -> Result<Self, IptablesError> {
        let inner = iptables::new(false).map_err(|e| IptablesError::from_message(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    async fn call<T, F>(&self, op: F) -> Result<T, IptablesError>
    where
        T: Send + 'static,
        F: FnOnce(&iptables::IPTables) -> Result<T, Box<dyn std::error::Error>> + Send + 'static,
    {
        let inner = self.inner.clone();
        run_blocking(move || convert(op(&inner))).await
    }
}

fn convert<T>(result: Result<T, Box<dyn std::error::Error>>) -> Result<T, IptablesError> {
    result.map_err(|e| IptablesError::from_message(e.to_string()))
}

#[async_trait]
impl IptablesOps for KernelIptables {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, IptablesError> {
        let (table, chain) = (table.to_string(), chain.to_string());
        self.call(move |ipt| ipt.chain_exists(&table, &chain)).await
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let (table, chain) = (table.to_string(), chain.to_string());
        self.call(move |ipt| ipt.new_chain(&table, &chain)).await
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let (table, chain) = (table.to_string(), chain.to_string());
        self.call(move |ipt| ipt.flush_chain(&table, &chain)).await
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), IptablesError> {
        let (table, chain) = (table.to_string(), chain.to_string());
        self.call(move |ipt| ipt.delete_chain(&table, &chain)).await
    }

    async fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool, IptablesError> {
        let (table, chain, rule) = (table.to_string(), chain.to_string(), rule.to_string());
        self.call(move |ipt| ipt.exists(&table, &chain, &rule)).await
    }

    async fn append(&self, table: &str, chain: &str, rule: &str) -> Result<(), IptablesError> {
        let (table, chain, rule) = (table.to_string(), chain.to_string(), rule.to_string());
        self.call(move |ipt| ipt.append(&table, &chain, &rule)).await
    }

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        rule: &str,
        position: i32,
    ) -> Result<(), IptablesError> {
        let (table, chain, rule) = (table.to_string(), chain.to_string(), rule.to_string());
        self.call(move |ipt| ipt.insert(&table, &chain, &rule, position))
            .await
    }

    async fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<(), IptablesError> {
        let (table, chain, rule) = (table.to_string(), chain.to_string(), rule.to_string());
        self.call(move |ipt| ipt.delete(&table, &chain, &rule)).await
    }
}
