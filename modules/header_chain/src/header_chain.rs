//! Cairn header chain module for Caryatid
//! Accepts proof-of-work headers from peers, keeps the most-work chain and
//! announces every change of best tip.

pub mod candidate;
pub mod header;
pub mod header_error;
pub mod oracle;
pub mod selector;
pub mod staging;
pub mod state;
pub mod stores;
pub mod sync;
pub mod work;

#[cfg(test)]
mod test_utils;

use anyhow::{bail, Result};
use caryatid_sdk::{module, Context, Module};
use cairn_common::{
    messages::{
        BestChainChangedMessage, CheckpointCommandMessage, HeadersMessage, Message,
        SyncReportMessage,
    },
    BlockHash, Network, Position,
};
use config::Config;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

pub use crate::header::{Header, HeaderStatus, RawHeader};
pub use crate::header_error::HeaderChainError;
pub use crate::oracle::{ChainUpdate, HeaderOracle};
pub use crate::stores::{fjall::FjallHeaderStore, memory::InMemoryHeaderStore, HeaderStore};
pub use crate::sync::SyncJob;
pub use crate::work::Work;

const DEFAULT_HEADERS_TOPIC: &str = "cairn.headers.available";
const DEFAULT_SYNC_TOPIC: &str = "cairn.sync.report";
const DEFAULT_CHECKPOINT_TOPIC: &str = "cairn.checkpoint.command";
const DEFAULT_PUBLISH_BEST_CHAIN_TOPIC: &str = "cairn.chain.best";
const DEFAULT_STATUS_TOPIC: &str = "cairn.chain.status";
const DEFAULT_NETWORK: &str = "mainnet";
const DEFAULT_STORE: &str = "memory";

/// Header chain module
#[module(
    message_type(Message),
    name = "header-chain",
    description = "Proof-of-work header chain"
)]
pub struct HeaderChain;

impl HeaderChain {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let headers_topic =
            config.get_string("headers-topic").unwrap_or(DEFAULT_HEADERS_TOPIC.to_string());
        info!("Creating headers subscriber on '{headers_topic}'");
        let sync_topic = config.get_string("sync-topic").unwrap_or(DEFAULT_SYNC_TOPIC.to_string());
        info!("Creating sync report subscriber on '{sync_topic}'");
        let checkpoint_topic =
            config.get_string("checkpoint-topic").unwrap_or(DEFAULT_CHECKPOINT_TOPIC.to_string());
        info!("Creating checkpoint subscriber on '{checkpoint_topic}'");
        let publish_topic = config
            .get_string("publish-best-chain-topic")
            .unwrap_or(DEFAULT_PUBLISH_BEST_CHAIN_TOPIC.to_string());
        info!("Publishing best chain changes on '{publish_topic}'");
        let status_topic =
            config.get_string("status-topic").unwrap_or(DEFAULT_STATUS_TOPIC.to_string());
        info!("Serving chain status on '{status_topic}'");

        let oracle = Arc::new(Self::build_oracle(&config)?);

        let status_oracle = oracle.clone();
        context.handle(&status_topic, move |_| {
            let status_oracle = status_oracle.clone();
            async move { Arc::new(Message::JSON(Self::status(&status_oracle))) }
        });

        let mut headers_subscription = context.subscribe(&headers_topic).await?;
        let mut sync_subscription = context.subscribe(&sync_topic).await?;
        let mut checkpoint_subscription = context.subscribe(&checkpoint_topic).await?;

        context.clone().run(async move {
            loop {
                let update = tokio::select! {
                    result = headers_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Headers message read failed");
                            return;
                        };
                        match message.as_ref() {
                            Message::Headers(headers) => {
                                let span = info_span!("header_chain", count = headers.headers.len());
                                async { Self::handle_headers(&oracle, headers) }.instrument(span).await
                            }
                            _ => {
                                error!("Unexpected message type on headers topic: {message:?}");
                                None
                            }
                        }
                    }

                    result = sync_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Sync report read failed");
                            return;
                        };
                        match message.as_ref() {
                            Message::SyncReport(report) => Self::handle_sync_report(&oracle, report),
                            _ => error!("Unexpected message type on sync topic: {message:?}"),
                        }
                        None
                    }

                    result = checkpoint_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Checkpoint command read failed");
                            return;
                        };
                        match message.as_ref() {
                            Message::Checkpoint(command) => Self::handle_checkpoint(&oracle, command),
                            _ => {
                                error!("Unexpected message type on checkpoint topic: {message:?}");
                                None
                            }
                        }
                    }
                };

                if let Some(update) = update {
                    let message = Arc::new(Message::BestChainChanged(
                        BestChainChangedMessage::from(update),
                    ));
                    context
                        .message_bus
                        .publish(&publish_topic, message)
                        .await
                        .unwrap_or_else(|e| error!("Failed to publish best chain change: {e}"));
                }
            }
        });

        Ok(())
    }

    fn build_oracle(config: &Config) -> Result<HeaderOracle> {
        let network: Network =
            config.get_string("network").unwrap_or(DEFAULT_NETWORK.to_string()).parse()?;
        info!("Network: {network}");

        let store_type = config.get_string("store").unwrap_or(DEFAULT_STORE.to_string());
        let store: Arc<dyn HeaderStore> = match store_type.as_str() {
            "memory" => Arc::new(InMemoryHeaderStore::new(network)),
            "fjall" => Arc::new(FjallHeaderStore::new(config, network)?),
            _ => bail!("Unknown store type {store_type}"),
        };

        let default_checkpoint = Self::read_default_checkpoint(config)?;
        if !default_checkpoint.is_blank() {
            info!("Default checkpoint: {default_checkpoint}");
        }

        let mut oracle = HeaderOracle::new(store, default_checkpoint)?;
        if let Ok(count) = config.get_int("recent-hashes") {
            if count > 0 {
                oracle = oracle.with_recent_hashes(count as usize);
            }
        }
        if let Ok(window) = config.get_int("prune-window") {
            if window > 0 {
                oracle = oracle.with_prune_window(window);
            }
        }
        Ok(oracle)
    }

    fn read_default_checkpoint(config: &Config) -> Result<Position> {
        let height = config.get_int("default-checkpoint-height").ok();
        let hash = config.get_string("default-checkpoint-hash").ok();
        match (height, hash) {
            (Some(height), Some(hash)) => {
                let hash: BlockHash = hash.parse()?;
                Ok(Position::new(height, hash))
            }
            (None, None) => Ok(Position::blank()),
            _ => bail!("default-checkpoint-height and default-checkpoint-hash must be set together"),
        }
    }

    fn handle_headers(oracle: &HeaderOracle, message: &HeadersMessage) -> Option<ChainUpdate> {
        match oracle.add_raw_headers(&message.headers) {
            Ok(update) => update,
            Err(HeaderChainError::InvalidHeader { reason }) => {
                warn!("Rejected headers: {reason}");
                None
            }
            Err(e) => {
                error!("Failed to add headers: {e}");
                None
            }
        }
    }

    fn handle_sync_report(oracle: &HeaderOracle, report: &SyncReportMessage) {
        match report {
            SyncReportMessage::PeerHeight(height) => {
                if oracle.update_remote_height(*height) && oracle.job_is_available() {
                    info!(
                        best = oracle.best_chain().height,
                        target = oracle.target(),
                        "Behind peers, sync required"
                    );
                }
            }
            SyncReportMessage::UnknownHash(hash) => {
                if let Err(e) = oracle.add_unknown_hash(*hash) {
                    error!("Failed to record unknown hash {hash}: {e}");
                }
            }
        }
    }

    fn handle_checkpoint(
        oracle: &HeaderOracle,
        command: &CheckpointCommandMessage,
    ) -> Option<ChainUpdate> {
        let result = match command {
            CheckpointCommandMessage::Add(position) => oracle.add_checkpoint(*position),
            CheckpointCommandMessage::Delete => oracle.delete_checkpoint(),
        };
        result.unwrap_or_else(|e| {
            warn!("Checkpoint command {command:?} refused: {e}");
            None
        })
    }

    fn status(oracle: &HeaderOracle) -> serde_json::Value {
        serde_json::json!({
            "network": oracle.network().name(),
            "best": oracle.best_chain(),
            "checkpoint": oracle.get_checkpoint(),
            "synchronized": oracle.is_synchronized(),
            "target": oracle.target(),
            "siblings": oracle.siblings().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn regtest_config() -> Config {
        Config::builder().set_default("network", "regtest").unwrap().build().unwrap()
    }

    #[test]
    fn default_checkpoint_from_config() {
        assert!(HeaderChain::read_default_checkpoint(&regtest_config()).unwrap().is_blank());

        let hash = BlockHash::new([5; 32]);
        let config = Config::builder()
            .set_default("default-checkpoint-height", 12)
            .unwrap()
            .set_default("default-checkpoint-hash", hash.to_string())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            HeaderChain::read_default_checkpoint(&config).unwrap(),
            Position::new(12, hash)
        );

        let config =
            Config::builder().set_default("default-checkpoint-height", 12).unwrap().build().unwrap();
        assert!(HeaderChain::read_default_checkpoint(&config).is_err());
    }

    #[test]
    fn unknown_store_is_refused() {
        let config = Config::builder().set_default("store", "paper").unwrap().build().unwrap();
        assert!(HeaderChain::build_oracle(&config).is_err());
    }

    #[test]
    fn headers_message_moves_tip() {
        let oracle = HeaderChain::build_oracle(&regtest_config()).unwrap();
        assert_eq!(oracle.network(), Network::Regtest);

        let chain = mine_chain(&regtest_genesis(), 3, EASY_BITS, 1);
        let message = HeadersMessage {
            headers: chain.iter().map(|h| h.encode().to_vec()).collect(),
        };
        let update = HeaderChain::handle_headers(&oracle, &message).unwrap();
        assert_eq!(update.best, Position::new(3, chain[2].hash()));

        let broken = HeadersMessage {
            headers: vec![vec![1, 2, 3]],
        };
        assert!(HeaderChain::handle_headers(&oracle, &broken).is_none());
    }

    #[test]
    fn checkpoint_commands() {
        let oracle = HeaderChain::build_oracle(&regtest_config()).unwrap();
        let chain = mine_chain(&regtest_genesis(), 4, EASY_BITS, 1);
        oracle.add_headers(chain.clone()).unwrap();

        let banned = CheckpointCommandMessage::Add(Position::new(3, BlockHash::new([1; 32])));
        let update = HeaderChain::handle_checkpoint(&oracle, &banned).unwrap();
        assert_eq!(update.best, Position::new(2, chain[1].hash()));

        // A second add is refused and changes nothing
        assert!(HeaderChain::handle_checkpoint(&oracle, &banned).is_none());

        let update =
            HeaderChain::handle_checkpoint(&oracle, &CheckpointCommandMessage::Delete).unwrap();
        assert_eq!(update.best, Position::new(4, chain[3].hash()));
    }

    #[test]
    fn sync_reports_feed_scheduler() {
        let oracle = HeaderChain::build_oracle(&regtest_config()).unwrap();
        HeaderChain::handle_sync_report(&oracle, &SyncReportMessage::PeerHeight(7));
        assert_eq!(oracle.target(), 7);
        assert!(oracle.job_is_available());

        HeaderChain::handle_sync_report(
            &oracle,
            &SyncReportMessage::UnknownHash(BlockHash::new([9; 32])),
        );
        assert!(!oracle.is_synchronized());
    }

    #[test]
    fn status_reports_tip() {
        let oracle = HeaderChain::build_oracle(&regtest_config()).unwrap();
        let status = HeaderChain::status(&oracle);
        assert_eq!(status["network"], "regtest");
        assert_eq!(status["best"]["height"], 0);
        assert_eq!(status["synchronized"], true);
    }
}
