//! A Docker client that uses [`bollard`].

use bollard::secret::SystemInfo;
use thiserror::Error;

pub mod container;
pub mod images;
pub mod sync;

pub use crate::container::Container;
pub use crate::sync::FileInfo;
use crate::images::*;

/// A global error within this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// An error from [`bollard`].
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    /// An i/o error while reading or writing synced files.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An error from the file watcher.
    #[error(transparent)]
    Notify(#[from] notify::Error),
    /// A required value was missing for a builder field.
    #[error("missing required builder field `{0}`")]
    MissingBuilderField(&'static str),
    /// An error from a message.
    #[error("{0}")]
    Message(String),
}

/// A [`Result`](std::result::Result) with an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A Docker client.
#[derive(Clone, Debug)]
pub struct Docker(bollard::Docker);

impl Docker {
    /// Creates a new [`Docker`] with the specified [client](bollard::Docker).
    pub fn new(client: bollard::Docker) -> Self {
        Self(client)
    }

    /// Attempts to create a new [`Docker`] with the default socket
    /// connection.
    pub fn with_socket_defaults() -> Result<Self> {
        let client = bollard::Docker::connect_with_socket_defaults().map_err(Error::Docker)?;
        Ok(Self::new(client))
    }

    /// Attempts to create a new [`Docker`] with the default HTTP connection.
    pub fn with_http_defaults() -> Result<Self> {
        let client = bollard::Docker::connect_with_http_defaults().map_err(Error::Docker)?;
        Ok(Self::new(client))
    }

    /// Attempts to create a new [`Docker`] with the default connection
    /// details.
    pub fn with_defaults() -> Result<Self> {
        let client = bollard::Docker::connect_with_defaults().map_err(Error::Docker)?;
        Ok(Self::new(client))
    }

    /// Gets a reference to the inner [`bollard::Docker`].
    pub fn inner(&self) -> &bollard::Docker {
        &self.0
    }

    //----------------------------------------------------------------------------------
    // Images
    //----------------------------------------------------------------------------------

    /// Returns whether an image exists in the Docker daemon.
    pub async fn image_exists(&self, image: impl AsRef<str>) -> Result<bool> {
        image_exists(self, image).await
    }

    /// Pulls an image from the remote repository.
    ///
    /// Pull progress is traced for operator visibility.
    pub async fn pull_image(&self, image: impl AsRef<str>) -> Result<()> {
        pull_image(self, image).await
    }

    //----------------------------------------------------------------------------------
    // Containers
    //----------------------------------------------------------------------------------

    /// Creates a container builder.
    ///
    /// This is the typical way you will create containers.
    pub fn container_builder(&self) -> container::Builder {
        container::Builder::new(self.0.clone())
    }

    /// Creates a container from a known id.
    ///
    /// You should typically use [`Self::container_builder()`] unless you
    /// receive the container id externally (say, from an execution record).
    pub fn container_from_id(&self, id: impl Into<String>) -> Container {
        Container::new(self.0.clone(), id.into())
    }

    //----------------------------------------------------------------------------------
    // System
    //----------------------------------------------------------------------------------

    /// Gets the system information.
    pub async fn info(&self) -> Result<SystemInfo> {
        self.0.info().await.map_err(Into::into)
    }
}
