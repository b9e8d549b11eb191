//! # State Store Binding
//!
//! Tracks which service a persistent volume is attached to. The data itself lives
//! in whatever backend the runtime mounts; this table only guarantees that a volume
//! has at most one owner at a time and survives its owner's restarts.
//!
//! ## Actor Layout
//!
//! The binding table is owned by a single [`VolumeStore`] task. Callers talk to it
//! through a cloneable [`VolumeStoreClient`], each request carrying a `oneshot`
//! reply channel. Requests are processed one at a time, so two services racing to
//! attach the same volume are serialized without any lock around the table.
//!
//! ```rust
//! use stackup::store::VolumeStore;
//! use stackup::{StoreError, Volume};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (store, client) = VolumeStore::new(16, [Volume::new("pgdata", "/var/lib/postgresql/data")]);
//!     tokio::spawn(store.run());
//!
//!     client.attach("pgdata".into(), "db".into()).await.unwrap();
//!     let err = client.attach("pgdata".into(), "bot".into()).await.unwrap_err();
//!     assert!(matches!(err, StoreError::VolumeAlreadyBound { .. }));
//! }
//! ```

use crate::error::StoreError;
use crate::service::{ServiceId, Volume, VolumeId};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Current binding of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    pub volume: Volume,
    pub owner: Option<ServiceId>,
    /// How many times the volume went from unbound to bound.
    pub attach_count: u64,
}

/// One-shot reply channel used by every store request.
pub type Response<T> = oneshot::Sender<Result<T, StoreError>>;

/// Messages understood by the [`VolumeStore`] task.
#[derive(Debug)]
pub enum StoreRequest {
    Register {
        volume: Volume,
        respond_to: Response<()>,
    },
    Attach {
        volume: VolumeId,
        service: ServiceId,
        respond_to: Response<bool>,
    },
    Detach {
        volume: VolumeId,
        respond_to: Response<Option<ServiceId>>,
    },
    Destroy {
        volume: VolumeId,
        respond_to: Response<()>,
    },
    Get {
        volume: VolumeId,
        respond_to: Response<Option<VolumeBinding>>,
    },
}

/// The task that owns the binding table.
pub struct VolumeStore {
    receiver: mpsc::Receiver<StoreRequest>,
    bindings: HashMap<VolumeId, VolumeBinding>,
}

impl VolumeStore {
    /// Creates the store, pre-registering `volumes`, and its client.
    ///
    /// The store does nothing until [`run`](Self::run) is spawned.
    pub fn new(
        buffer_size: usize,
        volumes: impl IntoIterator<Item = Volume>,
    ) -> (Self, VolumeStoreClient) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let bindings = volumes
            .into_iter()
            .map(|volume| (volume.id.clone(), VolumeBinding::unbound(volume)))
            .collect();
        let store = Self { receiver, bindings };
        (store, VolumeStoreClient::new(sender))
    }

    /// Processes requests until every client has been dropped.
    pub async fn run(mut self) {
        info!(volumes = self.bindings.len(), "Volume store started");

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                StoreRequest::Register { volume, respond_to } => {
                    self.register(volume);
                    let _ = respond_to.send(Ok(()));
                }
                StoreRequest::Attach {
                    volume,
                    service,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.attach(volume, service));
                }
                StoreRequest::Detach { volume, respond_to } => {
                    let _ = respond_to.send(self.detach(&volume));
                }
                StoreRequest::Destroy { volume, respond_to } => {
                    let _ = respond_to.send(self.destroy(&volume));
                }
                StoreRequest::Get { volume, respond_to } => {
                    let _ = respond_to.send(Ok(self.bindings.get(&volume).cloned()));
                }
            }
        }

        info!(volumes = self.bindings.len(), "Volume store shutdown");
    }

    fn register(&mut self, volume: Volume) {
        let id = volume.id.clone();
        if self.bindings.contains_key(&id) {
            debug!(volume = %id, "Already registered");
            return;
        }
        self.bindings.insert(id.clone(), VolumeBinding::unbound(volume));
        info!(volume = %id, "Registered");
    }

    /// Returns `true` when the volume was newly bound, `false` when it already
    /// belonged to `service`.
    fn attach(&mut self, volume: VolumeId, service: ServiceId) -> Result<bool, StoreError> {
        let binding = self
            .bindings
            .get_mut(&volume)
            .ok_or_else(|| StoreError::UnknownVolume(volume.clone()))?;

        if let Some(owner) = &binding.owner {
            if *owner == service {
                debug!(volume = %volume, %service, "Already attached");
                return Ok(false);
            }
            warn!(volume = %volume, %service, owner = %owner, "Attach rejected");
            return Err(StoreError::VolumeAlreadyBound {
                volume,
                owner: owner.clone(),
            });
        }

        binding.owner = Some(service.clone());
        binding.attach_count += 1;
        info!(volume = %volume, %service, count = binding.attach_count, "Attached");
        Ok(true)
    }

    fn detach(&mut self, volume: &VolumeId) -> Result<Option<ServiceId>, StoreError> {
        let binding = self
            .bindings
            .get_mut(volume)
            .ok_or_else(|| StoreError::UnknownVolume(volume.clone()))?;
        let previous = binding.owner.take();
        match &previous {
            Some(owner) => info!(volume = %volume, %owner, "Detached"),
            None => debug!(volume = %volume, "Detach on unbound volume"),
        }
        Ok(previous)
    }

    fn destroy(&mut self, volume: &VolumeId) -> Result<(), StoreError> {
        let owner = self
            .bindings
            .get(volume)
            .ok_or_else(|| StoreError::UnknownVolume(volume.clone()))?
            .owner
            .clone();

        if let Some(owner) = owner {
            warn!(volume = %volume, %owner, "Destroy rejected");
            return Err(StoreError::VolumeInUse {
                volume: volume.clone(),
                owner,
            });
        }

        self.bindings.remove(volume);
        info!(volume = %volume, remaining = self.bindings.len(), "Destroyed");
        Ok(())
    }
}

impl VolumeBinding {
    fn unbound(volume: Volume) -> Self {
        Self {
            volume,
            owner: None,
            attach_count: 0,
        }
    }
}

/// Cloneable handle for sending requests to a [`VolumeStore`].
#[derive(Clone)]
pub struct VolumeStoreClient {
    sender: mpsc::Sender<StoreRequest>,
}

impl VolumeStoreClient {
    pub fn new(sender: mpsc::Sender<StoreRequest>) -> Self {
        Self { sender }
    }

    /// Makes a volume known to the store. Registering an existing volume keeps its binding.
    pub async fn register(&self, volume: Volume) -> Result<(), StoreError> {
        self.request(|respond_to| StoreRequest::Register { volume, respond_to })
            .await
    }

    /// Binds `volume` to `service`.
    ///
    /// Idempotent for the current owner (returns `Ok(false)`); fails with
    /// [`StoreError::VolumeAlreadyBound`] for any other service.
    pub async fn attach(&self, volume: VolumeId, service: ServiceId) -> Result<bool, StoreError> {
        self.request(|respond_to| StoreRequest::Attach {
            volume,
            service,
            respond_to,
        })
        .await
    }

    /// Unbinds `volume`, keeping its data. Returns the previous owner.
    pub async fn detach(&self, volume: VolumeId) -> Result<Option<ServiceId>, StoreError> {
        self.request(|respond_to| StoreRequest::Detach { volume, respond_to })
            .await
    }

    /// Forgets `volume` for good. Fails with [`StoreError::VolumeInUse`] while attached.
    pub async fn destroy(&self, volume: VolumeId) -> Result<(), StoreError> {
        self.request(|respond_to| StoreRequest::Destroy { volume, respond_to })
            .await
    }

    pub async fn binding(&self, volume: VolumeId) -> Result<Option<VolumeBinding>, StoreError> {
        self.request(|respond_to| StoreRequest::Get { volume, respond_to })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Response<T>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(build(respond_to))
            .await
            .map_err(|_| StoreError::StoreClosed)?;
        response.await.map_err(|_| StoreError::StoreDropped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_store() -> VolumeStoreClient {
        let (store, client) = VolumeStore::new(8, [Volume::new("pgdata", "/var/lib/postgresql/data")]);
        tokio::spawn(store.run());
        client
    }

    #[tokio::test]
    async fn attach_is_idempotent_for_the_same_owner() {
        let client = spawn_store();

        assert!(client.attach("pgdata".into(), "db".into()).await.unwrap());
        assert!(!client.attach("pgdata".into(), "db".into()).await.unwrap());

        let binding = client.binding("pgdata".into()).await.unwrap().unwrap();
        assert_eq!(binding.owner, Some(ServiceId::new("db")));
        assert_eq!(binding.attach_count, 1);
    }

    #[tokio::test]
    async fn second_owner_is_rejected() {
        let client = spawn_store();
        client.attach("pgdata".into(), "db".into()).await.unwrap();

        let err = client.attach("pgdata".into(), "bot".into()).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::VolumeAlreadyBound {
                volume: "pgdata".into(),
                owner: "db".into(),
            }
        );
    }

    #[tokio::test]
    async fn detach_keeps_volume_and_allows_reattach() {
        let client = spawn_store();
        client.attach("pgdata".into(), "db".into()).await.unwrap();

        let previous = client.detach("pgdata".into()).await.unwrap();
        assert_eq!(previous, Some(ServiceId::new("db")));
        // Detaching again is harmless.
        assert_eq!(client.detach("pgdata".into()).await.unwrap(), None);

        assert!(client.attach("pgdata".into(), "db".into()).await.unwrap());
        let binding = client.binding("pgdata".into()).await.unwrap().unwrap();
        assert_eq!(binding.attach_count, 2);
    }

    #[tokio::test]
    async fn destroy_requires_detached_volume() {
        let client = spawn_store();
        client.attach("pgdata".into(), "db".into()).await.unwrap();

        assert!(matches!(
            client.destroy("pgdata".into()).await,
            Err(StoreError::VolumeInUse { .. })
        ));

        client.detach("pgdata".into()).await.unwrap();
        client.destroy("pgdata".into()).await.unwrap();

        assert_eq!(client.binding("pgdata".into()).await.unwrap(), None);
        assert_eq!(
            client.attach("pgdata".into(), "db".into()).await.unwrap_err(),
            StoreError::UnknownVolume("pgdata".into())
        );
    }

    #[tokio::test]
    async fn register_does_not_reset_existing_binding() {
        let client = spawn_store();
        client.attach("pgdata".into(), "db".into()).await.unwrap();

        client
            .register(Volume::new("pgdata", "/var/lib/postgresql/data"))
            .await
            .unwrap();
        let binding = client.binding("pgdata".into()).await.unwrap().unwrap();
        assert_eq!(binding.owner, Some(ServiceId::new("db")));
    }

    #[tokio::test]
    async fn closed_store_is_reported() {
        let (store, client) = VolumeStore::new(1, Vec::<Volume>::new());
        drop(store);

        assert_eq!(
            client.attach("pgdata".into(), "db".into()).await.unwrap_err(),
            StoreError::StoreClosed
        );
    }
}
