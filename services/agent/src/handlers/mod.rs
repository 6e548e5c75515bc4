//! Agent service handlers

pub mod http;

use crate::ebpf::{interface::NetworkInterface, loader::EbpfLoader, maps::MapManager};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sipsieve_common::config::Config;
use std::sync::Arc;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AgentState {
    pub loader: Arc<RwLock<EbpfLoader>>,
    pub maps: Arc<RwLock<MapManager>>,
    pub config: Arc<RwLock<Config>>,
    pub interface: Arc<NetworkInterface>,
    pub started_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(
        loader: Arc<RwLock<EbpfLoader>>,
        maps: Arc<RwLock<MapManager>>,
        config: Arc<RwLock<Config>>,
        interface: Arc<NetworkInterface>,
    ) -> Self {
        Self {
            loader,
            maps,
            config,
            interface,
            started_at: Utc::now(),
        }
    }

    /// Ready once the classifier is attached
    pub fn is_ready(&self) -> bool {
        self.loader.read().attached().is_some()
    }
}
