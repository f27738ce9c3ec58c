//! Images.

use bollard::query_parameters::CreateImageOptions;
use tokio_stream::StreamExt as _;
use tracing::Level;
use tracing::debug;
use tracing::enabled;
use tracing::trace;

use crate::Docker;
use crate::Error;
use crate::Result;

/// Returns whether an image exists in the Docker daemon.
pub(crate) async fn image_exists(docker: &Docker, image: impl AsRef<str>) -> Result<bool> {
    let image = image.as_ref();
    debug!("checking if image exists locally: `{image}`");

    match docker.inner().inspect_image(image).await {
        Ok(_) => Ok(true),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(false),
        Err(e) => Err(Error::Docker(e)),
    }
}

/// Pulls an image from the remote repository.
///
/// Progress updates from the daemon are traced so an operator following the
/// logs can watch the pull advance.
pub(crate) async fn pull_image(docker: &Docker, image: impl AsRef<str>) -> Result<()> {
    let image = image.as_ref();
    debug!("pulling image from remote: `{image}`");

    let mut stream = docker.inner().create_image(
        Some(CreateImageOptions {
            from_image: Some(image.to_owned()),
            ..Default::default()
        }),
        None,
        None,
    );

    while let Some(result) = stream.next().await {
        let update = result.map_err(Error::Docker)?;

        if enabled!(Level::TRACE) {
            trace!(
                "pull update: {}",
                [
                    update.id.map(|id| format!("id: {id}")),
                    update.error.map(|err| format!("error: {err}")),
                    update.status.map(|status| format!("status: {status}")),
                    update.progress.map(|progress| format!("progress: {progress}")),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join("; ")
            )
        }
    }

    debug!("pulled image: `{image}`");
    Ok(())
}
