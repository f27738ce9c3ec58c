//! Containers.

mod builder;

use bollard::Docker;
use bollard::container::LogOutput;
use bollard::query_parameters::DownloadFromContainerOptions;
use bollard::query_parameters::LogsOptions;
use bollard::query_parameters::RemoveContainerOptions;
use bollard::query_parameters::StartContainerOptions;
use bollard::query_parameters::UploadToContainerOptions;
use bollard::query_parameters::WaitContainerOptions;
pub use builder::Builder;
use bytes::Bytes;
use bytes::BytesMut;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use tracing::debug;

use crate::Error;
use crate::Result;

/// A container.
pub struct Container {
    /// A reference to the [`Docker`] client that was used to create this
    /// container.
    client: Docker,

    /// The id of the container.
    id: String,
}

impl Container {
    /// Gets a new creator for a [`Container`].
    pub fn builder(client: Docker) -> Builder {
        Builder::new(client)
    }

    /// Creates a new [`Container`] if you already know the id of a
    /// container.
    ///
    /// You should typically use [`Self::builder()`] unless you receive the
    /// container id externally (say, from an execution record).
    pub fn new(client: Docker, id: String) -> Self {
        Self { client, id }
    }

    /// Gets the id of the container.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts the container.
    pub async fn start(&self) -> Result<()> {
        debug!("starting container: `{}`", self.id);
        self.client
            .start_container(&self.id, None::<StartContainerOptions>)
            .await
            .map_err(Error::Docker)
    }

    /// Follows the container's combined standard output and standard error
    /// streams.
    ///
    /// The returned stream yields raw log chunks; chunks are not guaranteed
    /// to be aligned to lines.
    pub fn follow_logs(&self) -> BoxStream<'static, Result<LogOutput>> {
        self.client
            .logs(
                &self.id,
                Some(LogsOptions {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(|result| result.map_err(Error::Docker))
            .boxed()
    }

    /// Waits for the container to exit and returns its exit status code.
    pub async fn wait(&self) -> Result<i64> {
        let mut stream = self
            .client
            .wait_container(&self.id, None::<WaitContainerOptions>);

        let mut status_code = 0;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => status_code = response.status_code,
                // A non-zero exit is reported by the daemon as a wait
                // "error" carrying the status code; it is not a transport
                // failure.
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    status_code = code
                }
                Err(e) => return Err(Error::Docker(e)),
            }
        }

        debug!("container `{}` exited with status {status_code}", self.id);
        Ok(status_code)
    }

    /// Uploads a tar archive into the container at `path`.
    pub async fn upload_tar(&self, path: impl AsRef<str>, archive: Bytes) -> Result<()> {
        self.client
            .upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: path.as_ref().to_owned(),
                    ..Default::default()
                }),
                bollard::body_full(archive),
            )
            .await
            .map_err(Error::Docker)
    }

    /// Downloads `path` from the container as a tar archive.
    pub async fn download_tar(&self, path: impl AsRef<str>) -> Result<Bytes> {
        let mut stream = self.client.download_from_container(
            &self.id,
            Some(DownloadFromContainerOptions {
                path: path.as_ref().to_owned(),
                ..Default::default()
            }),
        );

        let mut archive = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(Error::Docker)?);
        }

        Ok(archive.freeze())
    }

    /// Removes a container with the level of force specified.
    ///
    /// This is an inner function, meaning it's not public. There are two
    /// public versions made available: [`Self::remove()`] and
    /// [`Self::force_remove()`].
    async fn remove_inner(&self, force: bool) -> Result<()> {
        self.client
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(Error::Docker)?;

        Ok(())
    }

    /// Removes a container.
    ///
    /// This does not force the removal of the container. To force the
    /// container to be removed, see the [`Self::force_remove()`] method.
    pub async fn remove(&self) -> Result<()> {
        debug!("removing container: `{}`", self.id);
        self.remove_inner(false).await
    }

    /// Removes a container with force.
    ///
    /// This forces the container to be removed. To unforcefully remove the
    /// container, see the [`Self::remove()`] method.
    pub async fn force_remove(&self) -> Result<()> {
        debug!("force removing container: `{}`", self.id);
        self.remove_inner(true).await
    }
}
