//! Make sure the worker image exists locally before creating a container.

use {
    bollard::{
        Docker, body_full,
        query_parameters::{BuildImageOptionsBuilder, CreateImageOptionsBuilder},
    },
    futures::{StreamExt, TryStreamExt},
    tracing::{debug, info, warn},
};

use crate::{
    cli::DockerCli,
    error::{Error, Result},
    spec::{PRIVILEGED_DOCKERFILE, PRIVILEGED_IMAGE},
};

/// How the image became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    Local,
    Built,
    Pulled,
}

/// Split `repo[:tag]` into repository and tag, defaulting the tag to `latest`.
/// A colon inside a registry host (`host:5000/repo`) is not a tag separator.
#[must_use]
pub fn split_reference(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

pub async fn ensure_image(docker: &Docker, cli: &DockerCli, image: &str) -> Result<ImageSource> {
    if docker.inspect_image(image).await.is_ok() {
        debug!(image, "image present locally");
        return Ok(ImageSource::Local);
    }

    if image == PRIVILEGED_IMAGE {
        build_privileged(docker, cli).await?;
        return Ok(ImageSource::Built);
    }

    let (from_image, tag) = split_reference(image);
    info!(image, "pulling worker image");
    let pulled = docker
        .create_image(
            Some(
                CreateImageOptionsBuilder::new()
                    .from_image(from_image)
                    .tag(tag)
                    .build(),
            ),
            None,
            None,
        )
        .try_collect::<Vec<_>>()
        .await;

    match pulled {
        Ok(_) => Ok(ImageSource::Pulled),
        Err(e) => {
            warn!(image, error = %e, "API pull failed, retrying through the CLI");
            cli.run_checked(&["pull", image])
                .await
                .map_err(|cli_err| Error::image_unavailable(image, format!("{e}; {cli_err}")))?;
            Ok(ImageSource::Pulled)
        },
    }
}

/// Single-entry tar archive holding the embedded Dockerfile.
fn build_context() -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(PRIVILEGED_DOCKERFILE.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, "Dockerfile", PRIVILEGED_DOCKERFILE.as_bytes())?;
    archive.into_inner()
}

/// Build the tooling image from the embedded Dockerfile through the daemon
/// API, falling back to the CLI when the API build cannot run.
async fn build_privileged(docker: &Docker, cli: &DockerCli) -> Result<()> {
    info!(tag = PRIVILEGED_IMAGE, "building privileged tooling image");
    let context = build_context().map_err(|e| Error::image_unavailable(PRIVILEGED_IMAGE, e))?;
    let options = BuildImageOptionsBuilder::new()
        .dockerfile("Dockerfile")
        .t(PRIVILEGED_IMAGE)
        .rm(true)
        .build();

    let mut progress = std::pin::pin!(docker.build_image(
        options,
        None,
        Some(body_full(bytes::Bytes::from(context))),
    ));
    let mut api_error = None;
    while let Some(item) = progress.next().await {
        match item {
            Ok(info) => {
                if let Some(message) = info.error {
                    // A failed build step, not a transport problem.
                    return Err(Error::image_unavailable(PRIVILEGED_IMAGE, message));
                }
                if let Some(line) = info.stream.as_deref().map(str::trim_end)
                    && !line.is_empty()
                {
                    debug!(tag = PRIVILEGED_IMAGE, "{line}");
                }
            },
            Err(e) => {
                api_error = Some(e);
                break;
            },
        }
    }

    if let Some(e) = api_error {
        warn!(tag = PRIVILEGED_IMAGE, error = %e, "API build failed, retrying through the CLI");
        build_with_cli(cli)
            .await
            .map_err(|cli_err| Error::image_unavailable(PRIVILEGED_IMAGE, format!("{e}; {cli_err}")))?;
    }

    info!(tag = PRIVILEGED_IMAGE, "privileged tooling image ready");
    Ok(())
}

/// The build context is a scoped temp dir removed on every exit path.
async fn build_with_cli(cli: &DockerCli) -> Result<()> {
    let context = tempfile::Builder::new()
        .prefix("turingpi-image-build-")
        .tempdir()
        .map_err(|e| Error::image_unavailable(PRIVILEGED_IMAGE, e))?;
    let dockerfile = context.path().join("Dockerfile");
    tokio::fs::write(&dockerfile, PRIVILEGED_DOCKERFILE)
        .await
        .map_err(|e| Error::image_unavailable(PRIVILEGED_IMAGE, e))?;

    let dockerfile_arg = dockerfile.display().to_string();
    let context_arg = context.path().display().to_string();
    cli.run_checked(&[
        "build",
        "-t",
        PRIVILEGED_IMAGE,
        "-f",
        dockerfile_arg.as_str(),
        context_arg.as_str(),
    ])
    .await
    .map(drop)
}
