use model::{ChunkStore, ModelError};
use replicator::{AutomatonHandle, ChunkAutomaton, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::remote;

pub struct Master {
    config: MasterConfig,
    handle: AutomatonHandle,
    automaton_task: tokio::task::JoinHandle<ChunkAutomaton>,
}

impl Master {
    pub async fn new(config: MasterConfig) -> Result<Self> {
        info!("Initializing chunk master for cell {} at {}", config.cell_tag, config.bind_address);

        let mut store = match &config.snapshot_path {
            Some(path) => model::read_snapshot(path).await?,
            None => None,
        }
        .unwrap_or_else(|| ChunkStore::new(config.cell_tag));

        if store.cell_tag() != config.cell_tag {
            return Err(MasterError::InvalidConfig(format!(
                "snapshot belongs to cell {}, configured cell is {}",
                store.cell_tag(),
                config.cell_tag
            )));
        }

        for medium in &config.media {
            match store.create_medium(&medium.name, medium.config.clone()) {
                Ok(_) | Err(ModelError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut automaton = ChunkAutomaton::new(
            store,
            (&config).into(),
            (&config).into(),
            Arc::new(SystemClock),
        );
        automaton.start_leading();
        let (handle, automaton_task) = AutomatonHandle::spawn(automaton);

        Ok(Self {
            config,
            handle,
            automaton_task,
        })
    }

    pub fn handle(&self) -> AutomatonHandle {
        self.handle.clone()
    }

    pub async fn start(self) -> Result<()> {
        info!("Starting chunk master services");

        let api_task = {
            let server = api::Server::new((&self.config).into(), self.handle.clone());
            tokio::spawn(async move { server.start().await })
        };

        let replicator_task = {
            let handle = self.handle.clone();
            let config = self.config.replicator.clone();
            let collaborators = remote::collaborators(&self.config);
            tokio::spawn(async move { handle.run_periodic(config, collaborators).await })
        };

        let snapshot_task = {
            let handle = self.handle.clone();
            let path = self.config.snapshot_path.clone();
            let period = self.config.snapshot_period_ms;
            tokio::spawn(async move { Self::snapshot_loop(handle, path, period).await })
        };

        tokio::select! {
            result = api_task => {
                error!("API server stopped: {:?}", result);
                Err(MasterError::Remote("API server failed".to_string()))
            }
            result = replicator_task => {
                error!("Chunk replicator stopped: {:?}", result);
                Err(MasterError::Replicator(replicator::ReplicatorError::Stopped))
            }
            result = snapshot_task => {
                error!("Snapshot task stopped: {:?}", result);
                Err(MasterError::InvalidConfig("snapshot task failed".to_string()))
            }
            result = self.automaton_task => {
                error!("Chunk automaton stopped (joined: {})", result.is_ok());
                Err(MasterError::Replicator(replicator::ReplicatorError::Stopped))
            }
        }
    }

    async fn snapshot_loop(handle: AutomatonHandle, path: Option<PathBuf>, period_ms: u64) -> Result<()> {
        let Some(path) = path else {
            // Nothing to persist; idle so the select above keeps running.
            std::future::pending::<()>().await;
            return Ok(());
        };

        let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(period_ms.max(1)));
        interval.tick().await;

        loop {
            interval.tick().await;
            let bytes = handle.snapshot().await?;
            if let Err(e) = write_atomically(&path, &bytes).await {
                warn!("Failed to write snapshot {}: {}", path.display(), e);
            } else {
                info!("Snapshot written: {} ({} bytes)", path.display(), bytes.len());
            }
        }
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediumDefinition;
    use model::MediumConfig;

    #[tokio::test]
    async fn test_new_master_creates_configured_media() {
        let config = MasterConfig {
            media: vec![MediumDefinition {
                name: "ssd".to_string(),
                config: MediumConfig::default(),
            }],
            ..MasterConfig::default()
        };
        let master = tokio_test::assert_ok!(Master::new(config).await);
        let media = master
            .handle()
            .execute(|automaton: &mut ChunkAutomaton| {
                automaton.store().media().iter().map(|m| m.name.clone()).collect::<Vec<_>>()
            })
            .await
            .unwrap();
        assert_eq!(media, vec!["default".to_string(), "ssd".to_string()]);

        let status = master.handle().status().await.unwrap();
        assert!(status.leading);
    }

    #[tokio::test]
    async fn test_snapshot_restores_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.snapshot");
        let config = MasterConfig {
            snapshot_path: Some(path.clone()),
            media: vec![MediumDefinition {
                name: "hdd".to_string(),
                config: MediumConfig::default(),
            }],
            ..MasterConfig::default()
        };

        let master = Master::new(config.clone()).await.unwrap();
        let bytes = master.handle().snapshot().await.unwrap();
        write_atomically(&path, &bytes).await.unwrap();

        let restored = Master::new(config).await.unwrap();
        let count = restored
            .handle()
            .execute(|automaton: &mut ChunkAutomaton| automaton.store().media().len())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_snapshot_from_another_cell_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.snapshot");
        model::write_snapshot(&path, &ChunkStore::new(model::CellTag(7))).await.unwrap();

        let config = MasterConfig {
            snapshot_path: Some(path),
            ..MasterConfig::default()
        };
        assert!(matches!(Master::new(config).await, Err(MasterError::InvalidConfig(_))));
    }
}
